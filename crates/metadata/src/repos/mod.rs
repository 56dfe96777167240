//! Repository traits for metadata operations.
//!
//! Every method is one transaction. Methods that mutate run under
//! serializable isolation and may fail with a serialization conflict; the
//! caller decides whether to re-run them. Snapshot methods run read-only.

pub mod members;
pub mod parts;
pub mod reconcile;
pub mod repositories;
pub mod resources;
pub mod users;

pub use members::{MemberRemoval, MemberRepo, MemberSnapshot};
pub use parts::PartRepo;
pub use reconcile::ReconcileRepo;
pub use repositories::RepositoryRepo;
pub use resources::{ResourceRepo, ResourceSnapshot, SubtreeSnapshot};
pub use users::{AccountRemoval, AccountSnapshot, UserRepo};
