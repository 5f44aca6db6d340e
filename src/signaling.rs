//! Admission signaling
//!
//! One request carries one browser offer; one response carries the
//! gathered answer and the id assigned to the peer. Malformed requests are
//! rejected before any peer is built.
//!
//! ```json
//! {"offer": {"type": "offer", "sdp": "v=0..."}}
//! {"answer": {"type": "answer", "sdp": "v=0..."}, "sessionId": "...", "negotiatedCodec": "video/H264"}
//! ```

use crate::element::WebSink;
use crate::error::SinkError;
use crate::transport::{SdpType, SessionDescription};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Admission request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub offer: SessionDescription,
}

/// Admission response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub answer: SessionDescription,
    pub session_id: String,
    pub negotiated_codec: String,
}

/// Error body returned with a non-2xx status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&SinkError> for ErrorResponse {
    fn from(err: &SinkError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Parse and validate an admission request body
pub fn parse_offer(body: &[u8]) -> Result<SessionDescription, SinkError> {
    let request: SessionRequest = serde_json::from_slice(body)
        .map_err(|e| SinkError::InvalidOffer(format!("malformed request: {}", e)))?;
    validate_offer(&request.offer)?;
    Ok(request.offer)
}

fn validate_offer(offer: &SessionDescription) -> Result<(), SinkError> {
    if offer.sdp_type != SdpType::Offer {
        return Err(SinkError::InvalidOffer(format!(
            "expected type \"offer\", got {:?}",
            offer.sdp_type
        )));
    }
    let sdp = offer.sdp.trim_start();
    if sdp.is_empty() {
        return Err(SinkError::InvalidOffer("empty sdp".to_string()));
    }
    if !sdp.starts_with("v=") {
        return Err(SinkError::InvalidOffer("sdp must start with a v= line".to_string()));
    }
    Ok(())
}

/// Drives one admission per request
#[derive(Clone)]
pub struct SignalingHandler {
    sink: Arc<WebSink>,
}

impl SignalingHandler {
    pub fn new(sink: Arc<WebSink>) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &Arc<WebSink> {
        &self.sink
    }

    /// Handle a raw request body
    pub async fn handle(&self, body: &[u8]) -> Result<SessionResponse, SinkError> {
        let offer = parse_offer(body).map_err(|e| {
            debug!("Rejected admission request: {}", e);
            e
        })?;
        self.handle_offer(offer).await
    }

    /// Handle an already parsed offer
    pub async fn handle_offer(&self, offer: SessionDescription) -> Result<SessionResponse, SinkError> {
        validate_offer(&offer)?;
        let admission = self.sink.admit(offer).await.map_err(|e| {
            warn!("Session request failed: {}", e);
            e
        })?;

        let codec = self
            .sink
            .track_info()
            .map(|info| info.codec)
            .unwrap_or_else(|| self.sink.settings().codec);
        info!("Session {} established ({})", admission.peer_id, codec.name());

        Ok(SessionResponse {
            answer: admission.answer,
            session_id: admission.peer_id,
            negotiated_codec: codec.mime_type().to_string(),
        })
    }
}
