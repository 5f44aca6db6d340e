//! The sink element: lifecycle and the producer-facing render entry point
//!
//! A [`WebSink`] is either stopped or started. Starting creates the
//! registry, the distribution track and the render gate; stopping unlocks
//! any parked render, closes every peer and then closes the track.

use crate::config::{Codec, SinkSettings, StreamMode};
use crate::error::SinkError;
use crate::gate::{unblock_channel, RenderGate, RenderOutcome};
use crate::media_track::{DistributionTrack, MediaSample, TrackInfo};
use crate::session::{Admission, PeerConnectionFactory, PeerId, SessionRegistry};
use crate::transport::{PeerConnector, SessionDescription};
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Running {
    registry: Arc<SessionRegistry>,
    track: Arc<DistributionTrack>,
    gate: Arc<RenderGate>,
    factory: Arc<PeerConnectionFactory>,
    started_at: Instant,
}

enum ElementState {
    Stopped,
    Started(Arc<Running>),
}

/// Point-in-time counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub started: bool,
    pub peers: usize,
    pub uptime_secs: u64,
    pub samples_written: u64,
    pub samples_dropped: u64,
    pub delivery_failures: u64,
    pub admissions: u64,
    pub admission_failures: u64,
}

pub struct WebSink {
    settings: Mutex<SinkSettings>,
    connector: Arc<dyn PeerConnector>,
    state: RwLock<ElementState>,
    admissions: AtomicU64,
    admission_failures: AtomicU64,
}

impl WebSink {
    pub fn new(settings: SinkSettings, connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            settings: Mutex::new(settings),
            connector,
            state: RwLock::new(ElementState::Stopped),
            admissions: AtomicU64::new(0),
            admission_failures: AtomicU64::new(0),
        }
    }

    /// Stopped -> Started. Creates a fresh registry, track and gate.
    pub fn activate(&self) -> Result<TrackInfo, SinkError> {
        let mut state = self.state.write();
        if matches!(*state, ElementState::Started(_)) {
            return Err(SinkError::AlreadyStarted);
        }
        let settings = self.settings.lock().clone();

        let (notifier, listener) = unblock_channel();
        let registry = Arc::new(SessionRegistry::new(notifier.clone()));
        let info = TrackInfo::new(settings.codec, settings.stream_mode, settings.stream_id.clone());
        let track = Arc::new(DistributionTrack::new(info.clone(), registry.clone()));
        let gate = Arc::new(RenderGate::new(
            settings.is_live,
            settings.flush_on_unlock,
            registry.clone(),
            notifier,
            listener,
        ));
        let factory = Arc::new(PeerConnectionFactory::new(
            self.connector.clone(),
            registry.clone(),
            track.clone(),
            settings.negotiation_timeout,
        ));

        *state = ElementState::Started(Arc::new(Running {
            registry,
            track,
            gate,
            factory,
            started_at: Instant::now(),
        }));

        info!(
            "websink started: codec={} mode={:?} live={} flush_on_unlock={}",
            settings.codec.name(),
            settings.stream_mode,
            settings.is_live,
            settings.flush_on_unlock
        );
        Ok(info)
    }

    /// Started -> Stopped. Peers are closed before the track goes away.
    pub async fn deactivate(&self) -> Result<(), SinkError> {
        let previous = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, ElementState::Stopped)
        };
        let running = match previous {
            ElementState::Started(running) => running,
            ElementState::Stopped => return Err(SinkError::NotStarted),
        };

        running.gate.unlock();

        let sessions = running.registry.drain();
        info!("Stopping websink, closing {} peers", sessions.len());
        for session in sessions {
            if let Err(e) = session.close().await {
                warn!("Failed to close peer {}: {}", session.id(), e);
            }
        }

        running.track.close();
        info!("websink stopped after {:.1}s", running.started_at.elapsed().as_secs_f64());
        Ok(())
    }

    /// Producer entry point. May block in non-live mode with no peers.
    pub fn render(&self, sample: MediaSample) -> Result<RenderOutcome, SinkError> {
        let running = self.running().ok_or(SinkError::NotStarted)?;
        running.gate.render(sample, &running.track)
    }

    /// Wake a parked render; later renders return without waiting
    pub fn unlock(&self) {
        if let Some(running) = self.running() {
            running.gate.unlock();
        }
    }

    pub fn unlock_stop(&self) {
        if let Some(running) = self.running() {
            running.gate.unlock_stop();
        }
    }

    /// Admit a peer from its offer
    pub async fn admit(&self, offer: SessionDescription) -> Result<Admission, SinkError> {
        let running = self.running().ok_or(SinkError::NotStarted)?;
        match running.factory.admit(offer).await {
            Ok(admission) => {
                self.admissions.fetch_add(1, Ordering::Relaxed);
                Ok(admission)
            }
            Err(e) => {
                self.admission_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(*self.state.read(), ElementState::Started(_))
    }

    pub fn peer_count(&self) -> usize {
        self.running().map(|r| r.registry.count()).unwrap_or(0)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.running().map(|r| r.registry.ids()).unwrap_or_default()
    }

    pub fn track_info(&self) -> Option<TrackInfo> {
        self.running().map(|r| r.track.info().clone())
    }

    pub fn settings(&self) -> SinkSettings {
        self.settings.lock().clone()
    }

    pub fn set_live_mode(&self, live: bool) -> Result<(), SinkError> {
        self.update_settings("is-live", |s| s.is_live = live)
    }

    pub fn set_flush_on_unlock(&self, flush: bool) -> Result<(), SinkError> {
        self.update_settings("flush-on-unlock", |s| s.flush_on_unlock = flush)
    }

    pub fn set_stream_format(&self, codec: Codec, mode: StreamMode) -> Result<(), SinkError> {
        self.update_settings("stream format", |s| {
            s.codec = codec;
            s.stream_mode = mode;
        })
    }

    pub fn set_negotiation_timeout(&self, timeout: Option<Duration>) -> Result<(), SinkError> {
        self.update_settings("negotiation-timeout", |s| s.negotiation_timeout = timeout)
    }

    pub fn stats(&self) -> SinkStats {
        let mut stats = SinkStats {
            admissions: self.admissions.load(Ordering::Relaxed),
            admission_failures: self.admission_failures.load(Ordering::Relaxed),
            ..Default::default()
        };
        if let Some(running) = self.running() {
            stats.started = true;
            stats.peers = running.registry.count();
            stats.uptime_secs = running.started_at.elapsed().as_secs();
            stats.samples_written = running.track.samples_written();
            stats.samples_dropped = running.gate.dropped_samples();
            stats.delivery_failures = running.track.delivery_failures();
        }
        stats
    }

    fn update_settings(&self, name: &str, apply: impl FnOnce(&mut SinkSettings)) -> Result<(), SinkError> {
        let state = self.state.read();
        if matches!(*state, ElementState::Started(_)) {
            return Err(SinkError::InvalidState(format!(
                "{} cannot be changed while the sink is started",
                name
            )));
        }
        apply(&mut self.settings.lock());
        Ok(())
    }

    fn running(&self) -> Option<Arc<Running>> {
        match &*self.state.read() {
            ElementState::Started(running) => Some(running.clone()),
            ElementState::Stopped => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SpyConnector;
    use std::sync::mpsc;

    fn sink(live: bool) -> (Arc<WebSink>, Arc<SpyConnector>) {
        let connector = SpyConnector::new();
        let settings = SinkSettings { is_live: live, ..SinkSettings::default() };
        (Arc::new(WebSink::new(settings, connector.clone())), connector)
    }

    #[tokio::test]
    async fn lifecycle_transitions_are_checked() {
        let (sink, _) = sink(false);
        assert_eq!(sink.deactivate().await.unwrap_err(), SinkError::NotStarted);
        sink.activate().unwrap();
        assert_eq!(sink.activate().unwrap_err(), SinkError::AlreadyStarted);
        sink.deactivate().await.unwrap();
        assert!(!sink.is_started());
    }

    #[tokio::test]
    async fn live_mode_is_fixed_while_started() {
        let (sink, _) = sink(false);
        sink.set_live_mode(true).unwrap();
        sink.activate().unwrap();
        assert!(matches!(sink.set_live_mode(false), Err(SinkError::InvalidState(_))));
        assert!(sink.settings().is_live);
        sink.deactivate().await.unwrap();
        sink.set_live_mode(false).unwrap();
    }

    #[tokio::test]
    async fn stopped_sink_refuses_work() {
        let (sink, _) = sink(false);
        assert_eq!(
            sink.render(MediaSample::with_default_duration(vec![1])).unwrap_err(),
            SinkError::NotStarted
        );
        assert_eq!(
            sink.admit(SessionDescription::offer("v=0")).await.unwrap_err(),
            SinkError::NotStarted
        );
    }

    #[tokio::test]
    async fn deactivate_closes_every_peer() {
        let (sink, connector) = sink(true);
        sink.activate().unwrap();
        sink.admit(SessionDescription::offer("v=0")).await.unwrap();
        sink.admit(SessionDescription::offer("v=0")).await.unwrap();
        assert_eq!(sink.peer_count(), 2);

        sink.deactivate().await.unwrap();

        assert_eq!(sink.peer_count(), 0);
        for spy in connector.peers() {
            assert_eq!(spy.close_count(), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reactivation_rearms_the_gate() {
        let (sink, _) = sink(false);
        sink.activate().unwrap();
        sink.unlock();
        assert_eq!(
            sink.render(MediaSample::with_default_duration(vec![1])).unwrap(),
            RenderOutcome::Unlocked
        );
        sink.deactivate().await.unwrap();
        sink.activate().unwrap();

        let (tx, rx) = mpsc::channel();
        let producer = sink.clone();
        std::thread::spawn(move || {
            let _ = tx.send(producer.render(MediaSample::with_default_duration(vec![2])));
        });
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

        sink.deactivate().await.unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap(), RenderOutcome::Unlocked);
    }

    #[tokio::test]
    async fn stats_follow_the_running_instance() {
        let (sink, _) = sink(true);
        assert!(!sink.stats().started);
        sink.activate().unwrap();
        sink.render(MediaSample::with_default_duration(vec![1])).unwrap();
        sink.admit(SessionDescription::offer("v=0")).await.unwrap();
        sink.render(MediaSample::with_default_duration(vec![2])).unwrap();

        let stats = sink.stats();
        assert!(stats.started);
        assert_eq!(stats.peers, 1);
        assert_eq!(stats.samples_dropped, 1);
        assert_eq!(stats.samples_written, 1);
        assert_eq!(stats.admissions, 1);
    }
}
