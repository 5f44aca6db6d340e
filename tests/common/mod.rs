//! Recording peer transport shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use websink::transport::StateChangeHandler;
use websink::{
    Codec, MediaSample, PeerConnector, PeerState, PeerTransport, SessionDescription, SinkError, SinkSettings,
    StreamMode, TrackInfo, WebSink,
};

pub struct RecordingTransport {
    pub peer_id: String,
    handler: Mutex<Option<StateChangeHandler>>,
    samples: Mutex<Vec<MediaSample>>,
    closes: AtomicUsize,
}

impl RecordingTransport {
    pub fn samples(&self) -> Vec<MediaSample> {
        self.samples.lock().clone()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Report a connection state change as the WebRTC stack would
    pub async fn emit(&self, state: PeerState) {
        let pending = self.handler.lock().as_ref().map(|handler| handler(state));
        if let Some(pending) = pending {
            pending.await;
        }
    }
}

#[async_trait]
impl PeerTransport for RecordingTransport {
    fn on_state_change(&self, handler: StateChangeHandler) {
        *self.handler.lock() = Some(handler);
    }

    async fn set_remote_description(&self, _offer: SessionDescription) -> Result<(), SinkError> {
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, SinkError> {
        Ok(SessionDescription::answer(format!("v=0\r\no=- {} 0 IN IP4 127.0.0.1\r\n", self.peer_id)))
    }

    async fn set_local_description(&self, _answer: SessionDescription) -> Result<(), SinkError> {
        Ok(())
    }

    async fn gathering_complete(&self) {
        tokio::task::yield_now().await;
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        None
    }

    fn send_sample(&self, sample: &MediaSample) -> Result<(), SinkError> {
        self.samples.lock().push(sample.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out recording transports; every `fail_every`-th connect is refused
pub struct RecordingConnector {
    peers: Mutex<Vec<Arc<RecordingTransport>>>,
    attempts: AtomicUsize,
    fail_every: usize,
}

impl RecordingConnector {
    pub fn new() -> Arc<Self> {
        Self::failing_every(0)
    }

    pub fn failing_every(fail_every: usize) -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            fail_every,
        })
    }

    pub fn peer(&self, peer_id: &str) -> Arc<RecordingTransport> {
        self.peers
            .lock()
            .iter()
            .find(|p| p.peer_id == peer_id)
            .cloned()
            .expect("unknown peer")
    }

    pub fn peers(&self) -> Vec<Arc<RecordingTransport>> {
        self.peers.lock().clone()
    }
}

#[async_trait]
impl PeerConnector for RecordingConnector {
    async fn connect(&self, peer_id: &str, _track: &TrackInfo) -> Result<Arc<dyn PeerTransport>, SinkError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_every > 0 && attempt % self.fail_every == 0 {
            return Err(SinkError::Transport(format!("refused attempt {}", attempt)));
        }
        let transport = Arc::new(RecordingTransport {
            peer_id: peer_id.to_string(),
            handler: Mutex::new(None),
            samples: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        });
        self.peers.lock().push(transport.clone());
        let transport: Arc<dyn PeerTransport> = transport;
        Ok(transport)
    }
}

pub fn sink(live: bool, connector: Arc<RecordingConnector>) -> Arc<WebSink> {
    let settings = SinkSettings {
        is_live: live,
        codec: Codec::H264,
        stream_mode: StreamMode::Sample,
        ..SinkSettings::default()
    };
    Arc::new(WebSink::new(settings, connector))
}

pub fn offer(tag: usize) -> SessionDescription {
    SessionDescription::offer(format!("v=0\r\no=- {} 0 IN IP4 0.0.0.0\r\n", tag))
}

pub fn sample(tag: u8) -> MediaSample {
    MediaSample::with_default_duration(vec![0, 0, 0, 1, tag])
}
