//! Blob store backends.

pub mod filesystem;
pub mod memory;
pub mod s3;
