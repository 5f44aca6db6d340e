//! websink - WebRTC fan-out sink
//!
//! Accepts encoded media samples from a single producer and distributes each
//! sample to every connected WebRTC peer. Peers join over an HTTP offer/answer
//! exchange and leave on their own when their connection fails or closes.

pub mod args;
pub mod config;
pub mod element;
pub mod error;
pub mod gate;
#[cfg(feature = "gst-source")]
pub mod gstreamer;
pub mod media_track;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod web;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use config::{Codec, Config, SinkSettings, StreamMode, WebRTCConfig};
pub use element::{SinkStats, WebSink};
pub use error::SinkError;
pub use gate::RenderOutcome;
pub use media_track::{DistributionTrack, FanOut, MediaSample, TrackInfo};
pub use session::{Admission, PeerId, PeerSession, PeerState, SessionRegistry};
pub use signaling::{SessionResponse, SignalingHandler};
pub use transport::{PeerConnector, PeerTransport, SdpType, SessionDescription};
