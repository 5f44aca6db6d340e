//! In-memory peer transport used by unit tests

use crate::error::SinkError;
use crate::media_track::{MediaSample, TrackInfo};
use crate::session::PeerState;
use crate::transport::{PeerConnector, PeerTransport, SessionDescription, StateChangeHandler};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Handshake step a spy is told to fail at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Connect,
    SetRemote,
    CreateAnswer,
    SetLocal,
}

pub struct SpyTransport {
    handler: Mutex<Option<StateChangeHandler>>,
    samples: Mutex<Vec<MediaSample>>,
    remote: Mutex<Option<SessionDescription>>,
    local: Mutex<Option<SessionDescription>>,
    closes: AtomicUsize,
    reject: AtomicBool,
    fail_at: Mutex<Option<FailAt>>,
    hold_gathering: AtomicBool,
    gathering: Notify,
}

impl SpyTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(None),
            samples: Mutex::new(Vec::new()),
            remote: Mutex::new(None),
            local: Mutex::new(None),
            closes: AtomicUsize::new(0),
            reject: AtomicBool::new(false),
            fail_at: Mutex::new(None),
            hold_gathering: AtomicBool::new(false),
            gathering: Notify::new(),
        })
    }

    pub fn reject_samples(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn samples(&self) -> Vec<MediaSample> {
        self.samples.lock().clone()
    }

    pub fn remote_offer(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn release_gathering(&self) {
        self.hold_gathering.store(false, Ordering::SeqCst);
        self.gathering.notify_one();
    }

    /// Fire the installed state observer and wait for it
    pub async fn emit(&self, state: PeerState) {
        let pending = self.handler.lock().as_ref().map(|handler| handler(state));
        if let Some(pending) = pending {
            pending.await;
        }
    }

    fn check(&self, step: FailAt) -> Result<(), SinkError> {
        if *self.fail_at.lock() == Some(step) {
            return Err(SinkError::Negotiation(format!("spy refused at {:?}", step)));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for SpyTransport {
    fn on_state_change(&self, handler: StateChangeHandler) {
        *self.handler.lock() = Some(handler);
    }

    async fn set_remote_description(&self, offer: SessionDescription) -> Result<(), SinkError> {
        self.check(FailAt::SetRemote)?;
        *self.remote.lock() = Some(offer);
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, SinkError> {
        self.check(FailAt::CreateAnswer)?;
        Ok(SessionDescription::answer("v=0\r\n"))
    }

    async fn set_local_description(&self, answer: SessionDescription) -> Result<(), SinkError> {
        self.check(FailAt::SetLocal)?;
        *self.local.lock() = Some(answer);
        Ok(())
    }

    async fn gathering_complete(&self) {
        while self.hold_gathering.load(Ordering::SeqCst) {
            self.gathering.notified().await;
        }
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone().map(|mut desc| {
            desc.sdp.push_str("a=end-of-candidates\r\n");
            desc
        })
    }

    fn send_sample(&self, sample: &MediaSample) -> Result<(), SinkError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(SinkError::Delivery {
                peer_id: "spy".to_string(),
                reason: "rejected".to_string(),
            });
        }
        self.samples.lock().push(sample.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct SpyConnector {
    peers: Mutex<Vec<Arc<SpyTransport>>>,
    fail_at: Mutex<Option<FailAt>>,
    hold_gathering: AtomicBool,
}

impl SpyConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(Vec::new()),
            fail_at: Mutex::new(None),
            hold_gathering: AtomicBool::new(false),
        })
    }

    pub fn fail_at(&self, step: Option<FailAt>) {
        *self.fail_at.lock() = step;
    }

    pub fn hold_gathering(&self, hold: bool) {
        self.hold_gathering.store(hold, Ordering::SeqCst);
    }

    pub fn peers(&self) -> Vec<Arc<SpyTransport>> {
        self.peers.lock().clone()
    }
}

#[async_trait]
impl PeerConnector for SpyConnector {
    async fn connect(&self, _peer_id: &str, _track: &TrackInfo) -> Result<Arc<dyn PeerTransport>, SinkError> {
        let fail_at = *self.fail_at.lock();
        if fail_at == Some(FailAt::Connect) {
            return Err(SinkError::Transport("spy connector refused".to_string()));
        }
        let spy = SpyTransport::new();
        *spy.fail_at.lock() = fail_at;
        spy.hold_gathering.store(self.hold_gathering.load(Ordering::SeqCst), Ordering::SeqCst);
        self.peers.lock().push(spy.clone());
        let transport: Arc<dyn PeerTransport> = spy;
        Ok(transport)
    }
}
