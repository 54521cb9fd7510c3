//! Authentication and authorization for the parameter service.
//!
//! The backend combines three collaborators: the upstream OAuth2 client
//! (password and refresh grants), the RFC-7662 introspector, and a local
//! [`TokenHandler`] that seals short-lived `wdx$` bearer tokens carrying the
//! upstream access/refresh pair. Group membership is mapped to per-feature
//! read/write permissions by the [`permissions`] module.

pub mod backend;
pub mod client;
pub mod introspect;
pub mod permissions;
pub mod token;

pub use backend::{AuthOutcome, OAuth2Backend};
pub use client::{AuthError, OAuth2Client, TokenEndpoint, TokenGrant};
pub use introspect::{IntrospectionEndpoint, Introspector, VerifyResult};
pub use permissions::{GroupSource, PermissionResolver, SystemGroups, UserPermissions};
pub use token::{TokenError, TokenHandler};
