//! Upstream model provider access
//!
//! - [`retry`]: resilient HTTP calls with backoff and cancellation
//! - [`transport`]: the reqwest-backed [`HttpTransport`]
//! - [`catalog`]: known models and their capabilities
//! - [`gateway`]: chat completion requests for one turn

pub mod catalog;
pub mod gateway;
pub mod retry;
pub mod transport;

pub use catalog::{ModelCatalog, ModelInfo, ModelsConfig};
pub use gateway::{AssistantReply, ModelGateway};
pub use retry::{
    CallFailure, CallSuccess, HttpTransport, Method, RequestSpec, RetryPolicy, RetryingCaller,
    TransportError, TransportResponse,
};
pub use transport::ReqwestTransport;
