//! Shared foundation of the parameter service workspace.
//!
//! Everything here is deliberately small and dependency-free: the status-code
//! taxonomy with its HTTP mapping, the service error type built on top of it,
//! single-shot promise/future pairs used for asynchronous registration
//! results, the injectable monotonic clock, the recognized-key settings store
//! and the artifact-name sanitization rule.

pub mod clock;
pub mod error;
pub mod future;
pub mod names;
pub mod settings;
pub mod status;

pub use clock::{Clock, SystemClock};
pub use error::{ServiceError, ServiceResult};
pub use future::{Future, Promise, promise};
pub use settings::SettingsStore;
pub use status::StatusCode;
