//! HTTP server for admission, health checks and metrics

pub mod shared;
pub use shared::SharedState;

pub mod http_server;
pub use http_server::{bind_listener, find_available_port, router, run_http_server};
