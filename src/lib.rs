//! A reference server for the `krpc_lite` client.
//!
//! [`TestServer`] serves the built-in `KRPC` service and a `TestService`
//! covering every wire type, typed exceptions and a stream-friendly counter.

pub mod error;
pub mod server;
pub mod service;

pub use error::{ProcedureError, ServerError};
pub use server::{ServerConfig, TestServer};

/// Install the fmt subscriber with the level named by `LOG_LEVEL`.
pub fn init_tracing() {
    let level = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();
}
