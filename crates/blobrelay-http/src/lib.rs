//! HTTP entry point for the blobrelay replication engine.
//!
//! - **Router**: `POST /v1/replicate` and `GET /health`
//! - **Handler trait**: the boundary between HTTP and the engine
//! - **Service**: hyper `Service` implementation
//! - **Response helpers**: JSON outcome and error bodies

pub mod handler;
pub mod request;
pub mod response;
pub mod router;
pub mod service;

pub use handler::ReplicationHandler;
pub use router::HttpError;
pub use service::{RelayHttpConfig, RelayHttpService};
