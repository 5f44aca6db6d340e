//! GStreamer integration for the sample source
//!
//! A launch-line pipeline ending in an `appsink` named `sink` produces the
//! encoded samples that are rendered into the sink.

pub mod source;

pub use source::AppSinkSource;

use std::error::Error;
use std::fmt;

/// GStreamer-related errors
#[derive(Debug)]
pub enum GstError {
    /// GStreamer initialization failed
    InitFailed(String),
    /// Pipeline creation failed
    PipelineFailed(String),
    /// State change failed
    StateChangeFailed(String),
}

impl fmt::Display for GstError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GstError::InitFailed(msg) => write!(f, "GStreamer init failed: {}", msg),
            GstError::PipelineFailed(msg) => write!(f, "Pipeline creation failed: {}", msg),
            GstError::StateChangeFailed(msg) => write!(f, "State change failed: {}", msg),
        }
    }
}

impl Error for GstError {}

/// Initialize GStreamer subsystem
pub fn init() -> Result<(), GstError> {
    gstreamer::init().map_err(|e| GstError::InitFailed(e.to_string()))
}
