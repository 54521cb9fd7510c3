//! File providers and the file-parameter handler.
//!
//! A [`FileProvider`] adapts one storage location to the upload/download
//! state machine (`prepared → created → completed → readonly`). The
//! [`FileParameterHandler`] owns up to two providers per parameter — the
//! published readonly one and an in-flight writable one — and swaps them
//! atomically when an upload finishes successfully.

pub mod handler;
pub mod provider;

pub use handler::{FileId, FileParameterHandler, ParameterId, ProviderFactory, ProviderRegistry};
pub use provider::FileProvider;
