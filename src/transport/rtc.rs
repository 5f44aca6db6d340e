//! webrtc-rs backed peer transport
//!
//! Every admitted peer gets its own RTCPeerConnection with one local track
//! bound to the shared track description. Samples are queued on a bounded
//! per-peer channel and written by a dedicated task, so a slow peer only
//! ever fills its own queue.

use super::{PeerConnector, PeerTransport, SdpType, SessionDescription, StateChangeHandler};
use crate::config::{Codec, IceServerConfig, StreamMode, WebRTCConfig};
use crate::error::SinkError;
use crate::media_track::{MediaSample, TrackInfo};
use crate::session::PeerState;
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::util::Unmarshal;

/// Upper bound on waiting for a writer stuck inside a track write
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

impl From<RTCPeerConnectionState> for PeerState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => PeerState::New,
            RTCPeerConnectionState::Connecting => PeerState::Connecting,
            RTCPeerConnectionState::Connected => PeerState::Connected,
            RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
            RTCPeerConnectionState::Failed => PeerState::Failed,
            RTCPeerConnectionState::Closed => PeerState::Closed,
            _ => PeerState::New,
        }
    }
}

/// Creates one RTCPeerConnection per admitted peer
pub struct RtcPeerConnector {
    config: WebRTCConfig,
}

impl RtcPeerConnector {
    pub fn new(config: WebRTCConfig) -> Self {
        Self { config }
    }

    /// Create a new PeerConnection with the configured settings
    async fn create_peer_connection(&self, codec: Codec) -> Result<Arc<RTCPeerConnection>, SinkError> {
        let mut setting_engine = SettingEngine::default();

        if !self.config.nat1to1_ips.is_empty() {
            setting_engine.set_nat_1to1_ips(self.config.nat1to1_ips.clone(), RTCIceCandidateType::Host);
        }

        if let Some([start, end]) = self.config.ephemeral_udp_port_range {
            let ephemeral = EphemeralUDP::new(start, end)
                .map_err(|e| SinkError::Transport(format!("Invalid ICE UDP port range: {}", e)))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }

        let mut media_engine = MediaEngine::default();
        let kind = if codec.is_audio() { RTPCodecType::Audio } else { RTPCodecType::Video };
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: codec_capability(codec),
                    payload_type: codec.rtp_payload_type(),
                    ..Default::default()
                },
                kind,
            )
            .map_err(|e| SinkError::Transport(format!("Failed to register {}: {}", codec.name(), e)))?;

        // Interceptors for RTCP feedback
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| SinkError::Transport(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let ice_servers = build_ice_servers(&self.config)
            .into_iter()
            .map(|server| RTCIceServer {
                urls: server.urls,
                username: server.username.unwrap_or_default(),
                credential: server.credential.unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| SinkError::Transport(format!("Failed to create peer connection: {}", e)))?;

        Ok(Arc::new(peer_connection))
    }
}

#[async_trait]
impl PeerConnector for RtcPeerConnector {
    async fn connect(&self, peer_id: &str, track: &TrackInfo) -> Result<Arc<dyn PeerTransport>, SinkError> {
        let transport: Arc<dyn PeerTransport> = self.open(peer_id, track).await?;
        Ok(transport)
    }
}

impl RtcPeerConnector {
    async fn open(&self, peer_id: &str, track: &TrackInfo) -> Result<Arc<RtcPeerTransport>, SinkError> {
        let peer_connection = self.create_peer_connection(track.codec).await?;

        let capability = codec_capability(track.codec);
        let writer = match track.mode {
            StreamMode::Sample => TrackWriter::Sample(Arc::new(TrackLocalStaticSample::new(
                capability,
                track.track_id.clone(),
                track.stream_id.clone(),
            ))),
            StreamMode::Rtp => TrackWriter::Rtp(Arc::new(TrackLocalStaticRTP::new(
                capability,
                track.track_id.clone(),
                track.stream_id.clone(),
            ))),
        };

        let rtp_sender = match peer_connection.add_track(writer.as_track_local()).await {
            Ok(sender) => sender,
            Err(e) => {
                let _ = peer_connection.close().await;
                return Err(SinkError::Transport(format!("Failed to add track: {}", e)));
            }
        };

        // Drain RTCP so the interceptors keep running; ends once the
        // connection is closed and reads start failing
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtp_sender.read(&mut buf).await.is_ok() {}
        });

        let (tx, rx) = mpsc::channel(self.config.outbound_queue_depth.max(1));
        let writer = tokio::spawn(write_loop(peer_id.to_string(), writer, rx));

        debug!("Created peer connection for {} ({})", peer_id, track.codec.mime_type());

        Ok(Arc::new(RtcPeerTransport {
            peer_id: peer_id.to_string(),
            peer_connection,
            outbound: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
            gathering: tokio::sync::Mutex::new(None),
        }))
    }
}

#[derive(Clone)]
enum TrackWriter {
    Sample(Arc<TrackLocalStaticSample>),
    Rtp(Arc<TrackLocalStaticRTP>),
}

impl TrackWriter {
    fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        match self {
            TrackWriter::Sample(track) => track.clone() as Arc<dyn TrackLocal + Send + Sync>,
            TrackWriter::Rtp(track) => track.clone() as Arc<dyn TrackLocal + Send + Sync>,
        }
    }

    async fn write(&self, sample: &MediaSample) -> Result<(), String> {
        match self {
            TrackWriter::Sample(track) => track
                .write_sample(&Sample {
                    data: sample.data.clone(),
                    duration: sample.duration,
                    ..Default::default()
                })
                .await
                .map_err(|e| e.to_string()),
            TrackWriter::Rtp(track) => {
                let mut raw = sample.data.clone();
                let packet = Packet::unmarshal(&mut raw).map_err(|e| e.to_string())?;
                track.write_rtp(&packet).await.map(|_| ()).map_err(|e| e.to_string())
            }
        }
    }
}

async fn write_loop(peer_id: String, writer: TrackWriter, mut rx: mpsc::Receiver<MediaSample>) {
    let mut written: u64 = 0;
    while let Some(sample) = rx.recv().await {
        match writer.write(&sample).await {
            Ok(()) => {
                written += 1;
                if written == 1 {
                    info!("Peer {} sent first sample ({} bytes)", peer_id, sample.len());
                }
            }
            Err(e) => debug!("Peer {} write failed: {}", peer_id, e),
        }
    }
    debug!("Peer {} writer stopped after {} samples", peer_id, written);
}

impl RtcPeerTransport {
    /// Whether the per-peer writer task is still alive
    pub fn writer_running(&self) -> bool {
        self.writer.lock().as_ref().map_or(false, |writer| !writer.is_finished())
    }
}

pub struct RtcPeerTransport {
    peer_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    outbound: Mutex<Option<mpsc::Sender<MediaSample>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    gathering: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    fn on_state_change(&self, handler: StateChangeHandler) {
        // webrtc-rs awaits its callback inline; the observer may close this
        // connection, so it runs on its own task, one transition at a time.
        let (tx, mut rx) = mpsc::unbounded_channel::<PeerState>();
        tokio::spawn(async move {
            while let Some(state) = rx.recv().await {
                handler(state).await;
            }
        });

        self.peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let _ = tx.send(PeerState::from(state));
            Box::pin(async {})
        }));
    }

    async fn set_remote_description(&self, offer: SessionDescription) -> Result<(), SinkError> {
        let offer = to_rtc(offer)?;
        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| SinkError::Negotiation(format!("Failed to set remote description: {}", e)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, SinkError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| SinkError::Negotiation(format!("Failed to create answer: {}", e)))?;
        Ok(from_rtc(answer))
    }

    async fn set_local_description(&self, answer: SessionDescription) -> Result<(), SinkError> {
        let answer = to_rtc(answer)?;
        // The promise must exist before gathering starts
        let promise = self.peer_connection.gathering_complete_promise().await;
        *self.gathering.lock().await = Some(promise);

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| SinkError::Negotiation(format!("Failed to set local description: {}", e)))
    }

    async fn gathering_complete(&self) {
        let promise = self.gathering.lock().await.take();
        if let Some(mut promise) = promise {
            let _ = promise.recv().await;
            debug!("Peer {} finished ICE gathering", self.peer_id);
        }
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.peer_connection.local_description().await.map(from_rtc)
    }

    fn send_sample(&self, sample: &MediaSample) -> Result<(), SinkError> {
        let outbound = self.outbound.lock();
        let reason = match outbound.as_ref() {
            None => "transport closed",
            Some(tx) => match tx.try_send(sample.clone()) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(_)) => "outbound queue full",
                Err(TrySendError::Closed(_)) => "writer stopped",
            },
        };
        Err(SinkError::Delivery {
            peer_id: self.peer_id.clone(),
            reason: reason.to_string(),
        })
    }

    async fn close(&self) -> Result<(), SinkError> {
        // Dropping the only sender ends write_loop once the queue is empty
        self.outbound.lock().take();
        let result = self
            .peer_connection
            .close()
            .await
            .map_err(|e| SinkError::Transport(format!("Failed to close connection: {}", e)));

        let writer = self.writer.lock().take();
        if let Some(mut writer) = writer {
            let _ = tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, &mut writer).await;
            *self.writer.lock() = Some(writer);
        }
        if self.writer_running() {
            debug!("Peer {} writer did not stop in time", self.peer_id);
        }
        result
    }
}

fn codec_capability(codec: Codec) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: codec.mime_type().to_string(),
        clock_rate: codec.clock_rate(),
        channels: codec.channels(),
        sdp_fmtp_line: codec.sdp_fmtp_line().to_string(),
        rtcp_feedback: vec![],
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, SinkError> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        other => {
            return Err(SinkError::Negotiation(format!("Unsupported description type {:?}", other)));
        }
    };
    parsed.map_err(|e| SinkError::Negotiation(format!("Invalid SDP: {}", e)))
}

fn from_rtc(desc: RTCSessionDescription) -> SessionDescription {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => SdpType::Answer,
    };
    SessionDescription { sdp_type, sdp: desc.sdp }
}

/// STUN server first, then any configured extra ICE servers
fn build_ice_servers(config: &WebRTCConfig) -> Vec<IceServerConfig> {
    let mut servers = Vec::new();

    let stun = config.stun_server.trim();
    if !stun.is_empty() {
        servers.push(IceServerConfig {
            urls: vec![stun.to_string()],
            username: None,
            credential: None,
        });
    }

    servers.extend(config.ice_servers.iter().cloned());
    servers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_from_rtc_state() {
        assert_eq!(PeerState::from(RTCPeerConnectionState::Connected), PeerState::Connected);
        assert_eq!(PeerState::from(RTCPeerConnectionState::Failed), PeerState::Failed);
        assert_eq!(PeerState::from(RTCPeerConnectionState::Unspecified), PeerState::New);
    }

    #[test]
    fn stun_server_comes_first() {
        let mut config = WebRTCConfig::default();
        config.ice_servers.push(IceServerConfig {
            urls: vec!["turn:turn.example.org:3478".to_string()],
            username: Some("u".to_string()),
            credential: Some("p".to_string()),
        });
        let servers = build_ice_servers(&config);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302".to_string()]);
        assert_eq!(servers[1].username.as_deref(), Some("u"));
    }

    #[test]
    fn empty_stun_server_is_skipped() {
        let config = WebRTCConfig {
            stun_server: String::new(),
            ..WebRTCConfig::default()
        };
        assert!(build_ice_servers(&config).is_empty());
    }

    #[test]
    fn rollback_descriptions_are_refused() {
        let desc = SessionDescription { sdp_type: SdpType::Rollback, sdp: String::new() };
        assert!(matches!(to_rtc(desc), Err(SinkError::Negotiation(_))));
    }

    #[tokio::test]
    async fn connector_builds_a_transport_per_peer() {
        let connector = RtcPeerConnector::new(WebRTCConfig {
            stun_server: String::new(),
            ..WebRTCConfig::default()
        });
        let info = TrackInfo::new(Codec::H264, StreamMode::Sample, "test");
        let transport = connector.open("peer-1", &info).await.unwrap();
        transport.send_sample(&MediaSample::with_default_duration(vec![0, 0, 0, 1])).unwrap();
        assert!(transport.writer_running());
        transport.close().await.unwrap();
        assert!(!transport.writer_running());
        assert!(transport.send_sample(&MediaSample::with_default_duration(vec![1])).is_err());
    }
}
