//! File storage for uploaded artifacts.
//!
//! Uploads land in a temp file next to their final destination and are only
//! promoted by an atomic rename once the content has been proven complete
//! and valid. The [`FileStore`] owns that lifecycle; the [`sys`] module
//! carries the thin libc layer (free space, user lookup, ownership and
//! durability syscalls) it is built on.

pub mod store;
pub mod sys;

pub use store::{FileIoError, FileStore, Owner};
