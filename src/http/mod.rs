//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, admin vs relay dispatch)
//!     → request.rs (request ID)
//!     → forward.rs
//!         → headers.rs (filter, compose outbound headers)
//!         → payload.rs (system prompt rewrite on the chat path)
//!         → upstream, streamed back through headers.rs response filter
//! ```

pub mod forward;
pub mod headers;
pub mod payload;
pub mod request;
pub mod server;

pub use forward::ForwardEngine;
pub use request::{RequestIdLayer, X_REQUEST_ID};
pub use server::{AppState, HttpServer};
