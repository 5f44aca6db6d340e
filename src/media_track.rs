//! Distribution track: the single encoded stream every peer receives
//!
//! One [`DistributionTrack`] exists per started sink. Writing a sample hands
//! the same immutable buffer to every peer in the registry's current
//! snapshot. A peer that refuses the sample is logged and skipped.

use crate::config::{Codec, StreamMode};
use crate::error::SinkError;
use crate::session::SessionRegistry;
use bytes::Bytes;
use log::{info, trace, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Duration assumed when upstream does not carry one (30 fps)
pub const DEFAULT_SAMPLE_DURATION: Duration = Duration::from_nanos(33_333_333);

/// One encoded media chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSample {
    pub data: Bytes,
    pub duration: Duration,
}

impl MediaSample {
    pub fn new(data: impl Into<Bytes>, duration: Duration) -> Self {
        Self { data: data.into(), duration }
    }

    /// Sample with the 30 fps default duration
    pub fn with_default_duration(data: impl Into<Bytes>) -> Self {
        Self::new(data, DEFAULT_SAMPLE_DURATION)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Static description of the track, fixed at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub codec: Codec,
    pub mode: StreamMode,
    pub track_id: String,
    pub stream_id: String,
}

impl TrackInfo {
    pub fn new(codec: Codec, mode: StreamMode, stream_id: impl Into<String>) -> Self {
        let kind = if codec.is_audio() { "audio" } else { "video" };
        Self {
            codec,
            mode,
            track_id: format!("{}-{}", kind, uuid::Uuid::new_v4()),
            stream_id: stream_id.into(),
        }
    }
}

/// Result of one fan-out pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub failed: usize,
}

pub struct DistributionTrack {
    info: TrackInfo,
    registry: Arc<SessionRegistry>,
    closed: AtomicBool,
    samples_written: AtomicU64,
    delivery_failures: AtomicU64,
    malformed: AtomicU64,
}

impl DistributionTrack {
    pub fn new(info: TrackInfo, registry: Arc<SessionRegistry>) -> Self {
        info!(
            "Distribution track {} created ({}, {:?} mode)",
            info.track_id,
            info.codec.name(),
            info.mode
        );
        Self {
            info,
            registry,
            closed: AtomicBool::new(false),
            samples_written: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    /// Hand `sample` to every currently registered peer.
    ///
    /// Fails only when the track itself is gone. Per-peer failures are
    /// counted in the returned [`FanOut`].
    pub fn write_sample(&self, sample: &MediaSample) -> Result<FanOut, SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::TrackClosed);
        }

        if self.info.mode == StreamMode::Rtp && rtp_util::header_length(&sample.data).is_none() {
            let count = self.malformed.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "Skipping malformed RTP packet ({} bytes, {}), {} so far",
                sample.len(),
                rtp_util::describe(&sample.data),
                count
            );
            return Ok(FanOut::default());
        }

        let mut report = FanOut::default();
        for session in self.registry.snapshot() {
            match session.send_sample(sample) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!("{}", e);
                }
            }
        }

        if report.failed > 0 {
            self.delivery_failures.fetch_add(report.failed as u64, Ordering::Relaxed);
        }
        let count = self.samples_written.fetch_add(1, Ordering::Relaxed) + 1;
        if (count <= 3 || count % 3000 == 0) && self.info.mode == StreamMode::Rtp {
            info!(
                "Track {} wrote RTP packet #{} ({}) to {} peers",
                self.info.track_id,
                count,
                rtp_util::describe(&sample.data),
                report.delivered
            );
        } else if count <= 3 || count % 3000 == 0 {
            info!(
                "Track {} wrote sample #{} ({} bytes) to {} peers",
                self.info.track_id,
                count,
                sample.len(),
                report.delivered
            );
        } else {
            trace!("Sample #{} fanned out: {:?}", count, report);
        }

        Ok(report)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(
                "Distribution track {} closed after {} samples",
                self.info.track_id,
                self.samples_written()
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written.load(Ordering::Relaxed)
    }

    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    pub fn malformed_packets(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

/// RTP header helpers for packet-mode samples
pub mod rtp_util {
    /// Extract sequence number from RTP packet
    pub fn get_sequence(packet: &[u8]) -> Option<u16> {
        if packet.len() < 4 {
            return None;
        }
        Some(u16::from_be_bytes([packet[2], packet[3]]))
    }

    /// Extract timestamp from RTP packet
    pub fn get_timestamp(packet: &[u8]) -> Option<u32> {
        if packet.len() < 8 {
            return None;
        }
        Some(u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]))
    }

    /// Extract payload type from RTP packet
    pub fn get_payload_type(packet: &[u8]) -> Option<u8> {
        if packet.len() < 2 {
            return None;
        }
        Some(packet[1] & 0x7F)
    }

    /// `pt=96 seq=1 ts=0` for logs, `?` where the packet is too short
    pub fn describe(packet: &[u8]) -> String {
        fn field<T: std::fmt::Display>(value: Option<T>) -> String {
            value.map(|v| v.to_string()).unwrap_or_else(|| "?".to_string())
        }
        format!(
            "pt={} seq={} ts={}",
            field(get_payload_type(packet)),
            field(get_sequence(packet)),
            field(get_timestamp(packet))
        )
    }

    /// Get RTP header length (including CSRCs and extension).
    ///
    /// `None` for anything that is not a complete version 2 header.
    pub fn header_length(packet: &[u8]) -> Option<usize> {
        if packet.len() < 12 || packet[0] >> 6 != 2 {
            return None;
        }

        let cc = (packet[0] & 0x0F) as usize;
        let mut len = 12 + cc * 4;

        if (packet[0] & 0x10) != 0 {
            if packet.len() < len + 4 {
                return None;
            }
            let ext_len = u16::from_be_bytes([packet[len + 2], packet[len + 3]]) as usize;
            len += 4 + ext_len * 4;
        }

        if packet.len() < len {
            return None;
        }
        Some(len)
    }
}
