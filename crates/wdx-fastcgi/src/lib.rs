//! FastCGI responder plumbing.
//!
//! The [`Server`] owns the listening Unix socket (freshly opened or adopted
//! from the service manager), polls it and hands accepted connections to a
//! request handler. Each connection carries one [`Request`]: a strict phase
//! machine over the FastCGI record protocol with single-shot body
//! consumption and a phased response writer.

pub mod error;
pub mod http;
pub mod record;
pub mod request;
pub mod server;

pub use error::FcgiError;
pub use http::{HttpMethod, HttpResponse, Uri};
pub use request::{ContentStream, MAX_CONTENT, Request};
pub use server::{RequestHandler, Server, ServerError, SocketOptions};
