//! HTTP surface of the chatgate chat backend.

pub mod http;
pub mod service;

pub use http::router;
pub use service::{ApiError, AppState, ClientIdentity};
