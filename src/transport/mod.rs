//! Peer transport abstraction
//!
//! The sink never talks to a WebRTC stack directly. A [`PeerConnector`]
//! builds one [`PeerTransport`] per admitted peer; the transport carries
//! the offer/answer exchange, reports connection state and accepts
//! samples for that single peer.

#[cfg(feature = "webrtc-transport")]
pub mod rtc;

use crate::error::SinkError;
use crate::media_track::{MediaSample, TrackInfo};
use crate::session::PeerState;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// SDP type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as exchanged with the browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Answer, sdp: sdp.into() }
    }
}

/// Observer invoked on every connection state transition.
///
/// Transports must not run the returned future while holding any lock of
/// their own; the observer may call [`PeerTransport::close`].
pub type StateChangeHandler = Box<dyn Fn(PeerState) -> BoxFuture<'static, ()> + Send + Sync>;

/// One negotiated connection to a single browser
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Install the connection state observer, replacing any previous one
    fn on_state_change(&self, handler: StateChangeHandler);

    async fn set_remote_description(&self, offer: SessionDescription) -> Result<(), SinkError>;

    async fn create_answer(&self) -> Result<SessionDescription, SinkError>;

    async fn set_local_description(&self, answer: SessionDescription) -> Result<(), SinkError>;

    /// Resolves once all local candidates are known
    async fn gathering_complete(&self);

    /// Local description including gathered candidates
    async fn local_description(&self) -> Option<SessionDescription>;

    /// Queue a sample for this peer. Must not block.
    fn send_sample(&self, sample: &MediaSample) -> Result<(), SinkError>;

    async fn close(&self) -> Result<(), SinkError>;
}

/// Builds transports bound to the shared distribution track
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, peer_id: &str, track: &TrackInfo) -> Result<Arc<dyn PeerTransport>, SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_description_uses_browser_field_names() {
        let json = serde_json::to_value(SessionDescription::answer("v=0")).unwrap();
        assert_eq!(json["type"], "answer");
        assert_eq!(json["sdp"], "v=0");

        let parsed: SessionDescription =
            serde_json::from_str(r#"{"type":"offer","sdp":"v=0\r\n"}"#).unwrap();
        assert_eq!(parsed.sdp_type, SdpType::Offer);
    }
}
