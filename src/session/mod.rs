//! Peer session management
//!
//! Manages the lifecycle of admitted peers:
//! - connection state tracking
//! - the concurrent registry of live sessions
//! - admission (offer in, answer out) with rollback

pub mod factory;
pub mod registry;

pub use factory::{Admission, PeerConnectionFactory};
pub use registry::SessionRegistry;

use crate::error::SinkError;
use crate::media_track::MediaSample;
use crate::transport::PeerTransport;
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Opaque peer identifier, unique per admission
pub type PeerId = String;

/// Connection state of one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Created, handshake not finished
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Connected and receiving samples
    Connected,
    /// Connectivity lost
    Disconnected,
    /// Failed (cannot recover)
    Failed,
    /// Closed (intentionally terminated)
    Closed,
}

impl PeerState {
    /// States after which the peer is removed from the registry
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Disconnected | PeerState::Failed | PeerState::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::New => "new",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        }
    }
}

/// A single admitted peer
pub struct PeerSession {
    id: PeerId,
    transport: Arc<dyn PeerTransport>,
    state: Mutex<PeerState>,
    closed: AtomicBool,
    created_at: Instant,
    samples_sent: AtomicU64,
}

impl PeerSession {
    pub fn new(id: PeerId, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            id,
            transport,
            state: Mutex::new(PeerState::New),
            closed: AtomicBool::new(false),
            created_at: Instant::now(),
            samples_sent: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    /// Update session state
    pub fn set_state(&self, state: PeerState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("Peer {} state change: {:?} -> {:?}", self.id, *current, state);
            *current = state;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Get session age
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn samples_sent(&self) -> u64 {
        self.samples_sent.load(Ordering::Relaxed)
    }

    /// Queue one sample on this peer's transport
    pub fn send_sample(&self, sample: &MediaSample) -> Result<(), SinkError> {
        if self.is_closed() {
            return Err(SinkError::Delivery {
                peer_id: self.id.clone(),
                reason: "session closed".to_string(),
            });
        }
        self.transport.send_sample(sample)?;
        self.samples_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Close the transport. Only the first call reaches the transport.
    pub async fn close(&self) -> Result<(), SinkError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.set_state(PeerState::Closed);
        self.transport.close().await?;
        info!(
            "Peer {} closed after {:.1}s, {} samples sent",
            self.id,
            self.age().as_secs_f64(),
            self.samples_sent()
        );
        Ok(())
    }
}
