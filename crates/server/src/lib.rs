//! Resource lifecycle orchestration for cabinet.
//!
//! This crate ties the metadata and blob stores together:
//! - Upload start, part acknowledgement, resume, completion and abort
//! - Folder creation, renames and hierarchy deletes
//! - Repository, membership and account teardown
//! - The reconciliation sweep for windows the two stores disagree in

pub mod context;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod state;
pub mod sweep;

pub use context::{RequestContext, TraceId};
pub use error::{ApiError, ApiResult, Outcome};
pub use lifecycle::uploads::UploadTicket;
pub use state::AppState;
pub use sweep::{SweepStats, run_sweep};
