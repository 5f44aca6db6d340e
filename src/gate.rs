//! Render gate: backpressure between the sample source and the track
//!
//! - live mode, no peers: the sample is dropped and the call returns at once
//! - non-live mode, no peers: the producer thread parks on the unblock
//!   signal until a peer is admitted or the gate is unlocked
//! - otherwise the sample goes to the distribution track

use crate::error::SinkError;
use crate::media_track::{DistributionTrack, FanOut, MediaSample};
use crate::session::SessionRegistry;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use log::{debug, info, trace};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Wake-up reasons for a parked producer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEvent {
    /// Registry size after an insert or remove
    PeersChanged(usize),
    /// Force unblock (unlock or shutdown)
    Unlock,
}

/// Sending half of the single-slot unblock signal.
///
/// Sends never block. A pending event is replaced by the newer one.
#[derive(Clone)]
pub struct UnblockNotifier {
    tx: Sender<GateEvent>,
    rx: Receiver<GateEvent>,
}

impl UnblockNotifier {
    pub fn notify(&self, event: GateEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let _ = self.rx.try_recv();
                let _ = self.tx.try_send(event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Receiving half of the unblock signal
pub struct UnblockListener {
    rx: Receiver<GateEvent>,
}

impl UnblockListener {
    /// Park until the next event. `None` once every notifier is gone.
    pub fn wait(&self) -> Option<GateEvent> {
        self.rx.recv().ok()
    }

    pub fn try_next(&self) -> Option<GateEvent> {
        self.rx.try_recv().ok()
    }
}

pub fn unblock_channel() -> (UnblockNotifier, UnblockListener) {
    let (tx, rx) = channel::bounded(1);
    (UnblockNotifier { tx, rx: rx.clone() }, UnblockListener { rx })
}

/// What happened to one rendered sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Handed to the track
    Delivered(FanOut),
    /// Live mode with no peers
    Dropped,
    /// Gate was force-unblocked while waiting; nothing delivered
    Unlocked,
}

enum Admission {
    Pass,
    Drop,
    Unlocked,
}

pub struct RenderGate {
    live_mode: bool,
    flush_on_unlock: bool,
    registry: Arc<SessionRegistry>,
    notifier: UnblockNotifier,
    listener: UnblockListener,
    unlocked: AtomicBool,
    dropped: AtomicU64,
}

impl RenderGate {
    pub fn new(
        live_mode: bool,
        flush_on_unlock: bool,
        registry: Arc<SessionRegistry>,
        notifier: UnblockNotifier,
        listener: UnblockListener,
    ) -> Self {
        Self {
            live_mode,
            flush_on_unlock,
            registry,
            notifier,
            listener,
            unlocked: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn is_live(&self) -> bool {
        self.live_mode
    }

    /// Run one sample through the gate.
    ///
    /// Blocks the calling thread in non-live mode while no peer is
    /// registered. Errors only when the track is gone.
    pub fn render(&self, sample: MediaSample, track: &DistributionTrack) -> Result<RenderOutcome, SinkError> {
        match self.admit() {
            Admission::Pass => {}
            Admission::Drop => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                trace!("Live mode with no peers, dropped sample ({} total)", dropped);
                return Ok(RenderOutcome::Dropped);
            }
            Admission::Unlocked => {
                if !self.flush_on_unlock {
                    debug!("Render unlocked with no peers, sample not delivered");
                    return Ok(RenderOutcome::Unlocked);
                }
                debug!("Render unlocked, flushing pending sample");
            }
        }

        let report = track.write_sample(&sample)?;
        Ok(RenderOutcome::Delivered(report))
    }

    fn admit(&self) -> Admission {
        let mut announced = false;
        loop {
            if self.registry.count() > 0 {
                return Admission::Pass;
            }
            if self.live_mode {
                return Admission::Drop;
            }
            if self.unlocked.load(Ordering::Acquire) {
                return Admission::Unlocked;
            }
            if !announced {
                info!("No peers connected, waiting for a client before rendering");
                announced = true;
            }
            match self.listener.wait() {
                Some(GateEvent::PeersChanged(count)) => debug!("Render gate woke up, {} peers", count),
                Some(GateEvent::Unlock) => debug!("Render gate woke up by unlock"),
                None => return Admission::Unlocked,
            }
        }
    }

    /// Wake a parked render and keep it from parking again
    pub fn unlock(&self) {
        self.unlocked.store(true, Ordering::Release);
        self.notifier.notify(GateEvent::Unlock);
    }

    /// Re-arm blocking after [`unlock`](Self::unlock)
    pub fn unlock_stop(&self) {
        self.unlocked.store(false, Ordering::Release);
        // Drop a stale Unlock so the next wait really parks
        while let Some(event) = self.listener.try_next() {
            trace!("Discarding stale gate event {:?}", event);
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked.load(Ordering::Acquire)
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Codec, StreamMode};
    use crate::media_track::TrackInfo;
    use crate::session::PeerSession;
    use crate::testing::SpyTransport;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    struct Fixture {
        gate: Arc<RenderGate>,
        track: Arc<DistributionTrack>,
        registry: Arc<SessionRegistry>,
    }

    fn fixture(live: bool, flush: bool) -> Fixture {
        let (notifier, listener) = unblock_channel();
        let registry = Arc::new(SessionRegistry::new(notifier.clone()));
        let track = Arc::new(DistributionTrack::new(
            TrackInfo::new(Codec::H264, StreamMode::Sample, "test"),
            registry.clone(),
        ));
        let gate = Arc::new(RenderGate::new(live, flush, registry.clone(), notifier, listener));
        Fixture { gate, track, registry }
    }

    fn render_in_thread(f: &Fixture) -> mpsc::Receiver<Result<RenderOutcome, SinkError>> {
        let (tx, rx) = mpsc::channel();
        let gate = f.gate.clone();
        let track = f.track.clone();
        thread::spawn(move || {
            let _ = tx.send(gate.render(MediaSample::with_default_duration(vec![7]), &track));
        });
        rx
    }

    #[test]
    fn notifier_keeps_only_the_latest_event() {
        let (notifier, listener) = unblock_channel();
        notifier.notify(GateEvent::PeersChanged(1));
        notifier.notify(GateEvent::PeersChanged(2));
        notifier.notify(GateEvent::PeersChanged(3));
        assert_eq!(listener.try_next(), Some(GateEvent::PeersChanged(3)));
        assert_eq!(listener.try_next(), None);
    }

    #[test]
    fn live_mode_drops_without_peers() {
        let f = fixture(true, false);
        let outcome = f.gate.render(MediaSample::with_default_duration(vec![1]), &f.track).unwrap();
        assert_eq!(outcome, RenderOutcome::Dropped);
        assert_eq!(f.gate.dropped_samples(), 1);
        assert_eq!(f.track.samples_written(), 0);
    }

    #[test]
    fn non_live_blocks_until_a_peer_arrives() {
        let f = fixture(false, false);
        let rx = render_in_thread(&f);
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

        let spy = SpyTransport::new();
        f.registry
            .insert("a".into(), Arc::new(PeerSession::new("a".into(), spy.clone())))
            .unwrap();

        let outcome = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(outcome, RenderOutcome::Delivered(FanOut { delivered: 1, failed: 0 }));
        assert_eq!(spy.samples().len(), 1);
    }

    #[test]
    fn unlock_releases_a_parked_render_without_delivering() {
        let f = fixture(false, false);
        let rx = render_in_thread(&f);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        f.gate.unlock();

        let outcome = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(outcome, RenderOutcome::Unlocked);
        assert_eq!(f.track.samples_written(), 0);
    }

    #[test]
    fn flush_on_unlock_hands_the_sample_to_the_track() {
        let f = fixture(false, true);
        f.gate.unlock();
        let outcome = f.gate.render(MediaSample::with_default_duration(vec![1]), &f.track).unwrap();
        assert_eq!(outcome, RenderOutcome::Delivered(FanOut::default()));
        assert_eq!(f.track.samples_written(), 1);
    }

    #[test]
    fn unlock_stop_rearms_blocking() {
        let f = fixture(false, false);
        f.gate.unlock();
        assert_eq!(
            f.gate.render(MediaSample::with_default_duration(vec![1]), &f.track).unwrap(),
            RenderOutcome::Unlocked
        );

        assert!(f.gate.is_unlocked());
        f.gate.unlock_stop();
        assert!(!f.gate.is_unlocked());
        let rx = render_in_thread(&f);
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

        f.gate.unlock();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap(), RenderOutcome::Unlocked);
    }

    #[test]
    fn peers_present_means_unlock_is_ignored() {
        let f = fixture(false, false);
        let spy = SpyTransport::new();
        f.registry
            .insert("a".into(), Arc::new(PeerSession::new("a".into(), spy.clone())))
            .unwrap();
        f.gate.unlock();
        let outcome = f.gate.render(MediaSample::with_default_duration(vec![1]), &f.track).unwrap();
        assert!(matches!(outcome, RenderOutcome::Delivered(_)));
    }
}
