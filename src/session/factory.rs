//! Peer admission: one remote offer in, one local answer out
//!
//! The session is registered before negotiation starts so the state
//! observer can never miss a transition. Any failure rolls the registry
//! entry back and closes the transport.

use super::{PeerId, PeerSession, PeerState, SessionRegistry};
use crate::error::SinkError;
use crate::media_track::DistributionTrack;
use crate::transport::{PeerConnector, SdpType, SessionDescription, StateChangeHandler};
use log::{debug, info, warn};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A successfully admitted peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub peer_id: PeerId,
    pub answer: SessionDescription,
}

pub struct PeerConnectionFactory {
    connector: Arc<dyn PeerConnector>,
    registry: Arc<SessionRegistry>,
    track: Arc<DistributionTrack>,
    negotiation_timeout: Option<Duration>,
}

impl PeerConnectionFactory {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        registry: Arc<SessionRegistry>,
        track: Arc<DistributionTrack>,
        negotiation_timeout: Option<Duration>,
    ) -> Self {
        Self {
            connector,
            registry,
            track,
            negotiation_timeout,
        }
    }

    /// Admit one peer.
    ///
    /// On success the registry holds the new id; on failure it does not.
    pub async fn admit(&self, offer: SessionDescription) -> Result<Admission, SinkError> {
        if offer.sdp_type != SdpType::Offer {
            return Err(SinkError::InvalidOffer(format!("expected an offer, got {:?}", offer.sdp_type)));
        }

        let peer_id = uuid::Uuid::new_v4().to_string();
        let transport = self
            .connector
            .connect(&peer_id, self.track.info())
            .await
            .map_err(|e| negotiation_error("create peer connection", e))?;

        let session = Arc::new(PeerSession::new(peer_id.clone(), transport.clone()));
        transport.on_state_change(state_observer(
            Arc::downgrade(&self.registry),
            Arc::downgrade(&session),
            peer_id.clone(),
        ));
        // Undoes the registration if this future is dropped mid-handshake
        let pending = PendingAdmission::new(self.registry.clone(), session.clone());

        if let Err(e) = self.registry.insert(peer_id.clone(), session.clone()) {
            // The id may belong to someone else; only close our own session
            pending.disarm();
            let _ = session.close().await;
            return Err(e);
        }
        debug!("Peer {} registered, negotiating", peer_id);

        let negotiation = negotiate(&session, offer);
        let result = match self.negotiation_timeout {
            Some(limit) => match tokio::time::timeout(limit, negotiation).await {
                Ok(result) => result,
                Err(_) => Err(SinkError::Negotiation(format!("timed out after {:?}", limit))),
            },
            None => negotiation.await,
        };

        match result {
            Ok(answer) if self.registry.contains(&peer_id) => {
                pending.disarm();
                info!("Admitted peer {} ({} peers)", peer_id, self.registry.count());
                Ok(Admission { peer_id, answer })
            }
            Ok(_) => {
                pending.rollback().await;
                Err(SinkError::Negotiation(format!("peer {} went away during negotiation", peer_id)))
            }
            Err(e) => {
                warn!("Admission of peer {} failed: {}", peer_id, e);
                pending.rollback().await;
                Err(e)
            }
        }
    }
}

/// Registry entry of an admission that has not answered yet.
///
/// Dropped while still armed (the admitting future was cancelled), it
/// removes the entry and closes the session on a spawned task.
struct PendingAdmission {
    registry: Arc<SessionRegistry>,
    session: Arc<PeerSession>,
    armed: bool,
}

impl PendingAdmission {
    fn new(registry: Arc<SessionRegistry>, session: Arc<PeerSession>) -> Self {
        Self {
            registry,
            session,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }

    async fn rollback(mut self) {
        self.armed = false;
        self.registry.remove(self.session.id());
        if let Err(e) = self.session.close().await {
            debug!("Closing rolled back peer {} failed: {}", self.session.id(), e);
        }
    }
}

impl Drop for PendingAdmission {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.registry.remove(self.session.id());
        warn!("Admission of peer {} was cancelled, rolling back", self.session.id());

        let session = self.session.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = session.close().await {
                        debug!("Closing cancelled peer {} failed: {}", session.id(), e);
                    }
                });
            }
            Err(_) => warn!("No runtime to close cancelled peer {}", session.id()),
        }
    }
}

async fn negotiate(session: &PeerSession, offer: SessionDescription) -> Result<SessionDescription, SinkError> {
    let transport = session.transport();
    session.set_state(PeerState::Connecting);

    transport
        .set_remote_description(offer)
        .await
        .map_err(|e| negotiation_error("set remote description", e))?;

    let answer = transport
        .create_answer()
        .await
        .map_err(|e| negotiation_error("create answer", e))?;

    transport
        .set_local_description(answer.clone())
        .await
        .map_err(|e| negotiation_error("set local description", e))?;

    transport.gathering_complete().await;

    Ok(transport.local_description().await.unwrap_or(answer))
}

fn negotiation_error(step: &str, err: SinkError) -> SinkError {
    match err {
        SinkError::Negotiation(msg) => SinkError::Negotiation(format!("{}: {}", step, msg)),
        SinkError::NotStarted => SinkError::NotStarted,
        other => SinkError::Negotiation(format!("{}: {}", step, other)),
    }
}

/// Removes the peer on terminal states and closes its transport.
///
/// Holds only weak handles: the transport owns this observer.
fn state_observer(registry: Weak<SessionRegistry>, session: Weak<PeerSession>, peer_id: PeerId) -> StateChangeHandler {
    Box::new(move |state| {
        let registry = registry.clone();
        let session = session.clone();
        let peer_id = peer_id.clone();
        Box::pin(async move {
            info!("Peer {} connection state: {}", peer_id, state.as_str());
            if let Some(session) = session.upgrade() {
                session.set_state(state);
            }
            if !state.is_terminal() {
                return;
            }
            if let Some(registry) = registry.upgrade() {
                if let Some(session) = registry.remove(&peer_id) {
                    info!("Removing peer {} after {}", peer_id, state.as_str());
                    if let Err(e) = session.close().await {
                        warn!("Failed to close peer {}: {}", peer_id, e);
                    }
                }
            }
        })
    })
}
