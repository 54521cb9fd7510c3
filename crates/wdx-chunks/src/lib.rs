//! Chunk accounting for resumable, out-of-order file uploads.
//!
//! An upload declares its capacity up front and then delivers byte ranges in
//! any order. The [`ChunkAccountant`] tracks which ranges have arrived and
//! proves completion, while keeping its own memory bounded so a client
//! spraying single-byte chunks cannot exhaust the process. The
//! [`ChunkCache`] keeps accountants of in-flight uploads addressable by
//! upload ID until they go idle.

mod accountant;
mod cache;

pub use accountant::{ChunkAccountant, ChunkError};
pub use cache::ChunkCache;
