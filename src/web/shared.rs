//! Shared state for the HTTP handlers

use crate::config::Config;
use crate::element::WebSink;
use crate::signaling::SignalingHandler;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared state for the application
#[derive(Clone)]
pub struct SharedState {
    /// Configuration
    pub config: Arc<Config>,

    /// The sink peers are admitted into
    pub sink: Arc<WebSink>,

    /// Admission driver
    pub signaling: SignalingHandler,

    /// Server start time
    pub start_time: Instant,
}

impl SharedState {
    pub fn new(config: Config, sink: Arc<WebSink>) -> Self {
        Self {
            config: Arc::new(config),
            signaling: SignalingHandler::new(sink.clone()),
            sink,
            start_time: Instant::now(),
        }
    }

    /// Get server uptime
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Currently connected peers
    pub fn connection_count(&self) -> usize {
        self.sink.peer_count()
    }
}
