//! Configuration management for websink

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Codec carried by the distribution track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    H264,
    H265,
    VP8,
    VP9,
    Opus,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::H265 => "h265",
            Codec::VP8 => "vp8",
            Codec::VP9 => "vp9",
            Codec::Opus => "opus",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Codec::H264 => "video/H264",
            Codec::H265 => "video/H265",
            Codec::VP8 => "video/VP8",
            Codec::VP9 => "video/VP9",
            Codec::Opus => "audio/opus",
        }
    }

    /// Human-readable codec name
    pub fn name(&self) -> &'static str {
        match self {
            Codec::H264 => "H.264",
            Codec::H265 => "H.265/HEVC",
            Codec::VP8 => "VP8",
            Codec::VP9 => "VP9",
            Codec::Opus => "Opus",
        }
    }

    pub fn rtp_payload_type(&self) -> u8 {
        match self {
            Codec::H264 => 96,
            Codec::VP8 => 97,
            Codec::VP9 => 98,
            Codec::H265 => 99,
            Codec::Opus => 111,
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, Codec::Opus)
    }

    pub fn clock_rate(&self) -> u32 {
        if self.is_audio() { 48_000 } else { 90_000 }
    }

    pub fn channels(&self) -> u16 {
        if self.is_audio() { 2 } else { 0 }
    }

    pub fn sdp_fmtp_line(&self) -> &'static str {
        match self {
            Codec::H264 => "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
            Codec::VP9 => "profile-id=0",
            Codec::Opus => "minptime=10;useinbandfec=1",
            Codec::H265 | Codec::VP8 => "",
        }
    }

    /// Map GStreamer caps to a codec and stream mode.
    ///
    /// `encoding_name` is only consulted for `application/x-rtp`.
    pub fn from_caps_name(name: &str, encoding_name: Option<&str>) -> Option<(Codec, StreamMode)> {
        match name {
            "video/x-h264" => Some((Codec::H264, StreamMode::Sample)),
            "video/x-h265" => Some((Codec::H265, StreamMode::Sample)),
            "video/x-vp8" => Some((Codec::VP8, StreamMode::Sample)),
            "video/x-vp9" => Some((Codec::VP9, StreamMode::Sample)),
            "audio/x-opus" => Some((Codec::Opus, StreamMode::Sample)),
            "application/x-rtp" => {
                let codec = match encoding_name?.to_ascii_uppercase().as_str() {
                    "H264" => Codec::H264,
                    "H265" => Codec::H265,
                    "VP8" => Codec::VP8,
                    "VP9" => Codec::VP9,
                    "OPUS" => Codec::Opus,
                    _ => return None,
                };
                Some((codec, StreamMode::Rtp))
            }
            _ => None,
        }
    }
}

impl std::str::FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h264" => Ok(Codec::H264),
            "h265" | "hevc" => Ok(Codec::H265),
            "vp8" => Ok(Codec::VP8),
            "vp9" => Ok(Codec::VP9),
            "opus" => Ok(Codec::Opus),
            other => Err(format!("unknown codec: {}", other)),
        }
    }
}

/// How upstream samples are framed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Whole encoded access units, written with a duration
    #[default]
    Sample,
    /// Already packetized RTP packets
    Rtp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP configuration
    #[serde(default)]
    pub http: HttpConfig,

    /// WebRTC configuration
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Sink behaviour
    #[serde(default)]
    pub sink: SinkConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// HTTP bind address
    pub host: String,

    /// Signaling port, 0 picks any free port
    pub port: u16,

    /// Probe the following ports when `port` is taken
    pub auto_port: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8091,
            auto_port: true,
        }
    }
}

/// ICE server entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// WebRTC transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// STUN server URL, empty for none
    #[serde(default = "default_stun_server")]
    pub stun_server: String,

    /// Additional ICE servers (TURN etc.)
    #[serde(default)]
    pub ice_servers: Vec<IceServerConfig>,

    /// Restrict ICE host candidates to this UDP port range
    #[serde(default)]
    pub ephemeral_udp_port_range: Option<[u16; 2]>,

    /// Public IPs advertised as host candidates
    #[serde(default)]
    pub nat1to1_ips: Vec<String>,

    /// Samples buffered per peer before delivery errors are reported
    #[serde(default = "default_outbound_queue_depth")]
    pub outbound_queue_depth: usize,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            stun_server: default_stun_server(),
            ice_servers: Vec::new(),
            ephemeral_udp_port_range: None,
            nat1to1_ips: Vec::new(),
            outbound_queue_depth: default_outbound_queue_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Drop samples instead of blocking when no peer is connected
    #[serde(default)]
    pub is_live: bool,

    /// Deliver the pending sample when a blocked render is unlocked
    #[serde(default)]
    pub flush_on_unlock: bool,

    #[serde(default)]
    pub codec: Codec,

    #[serde(default)]
    pub stream_mode: StreamMode,

    /// Upper bound on one admission handshake, 0 waits forever
    #[serde(default)]
    pub negotiation_timeout_ms: u64,

    /// Media stream id shared by every peer's track
    #[serde(default = "default_stream_id")]
    pub stream_id: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            is_live: false,
            flush_on_unlock: false,
            codec: Codec::H264,
            stream_mode: StreamMode::Sample,
            negotiation_timeout_ms: 0,
            stream_id: default_stream_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            webrtc: WebRTCConfig::default(),
            sink: SinkConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.http.host.trim().is_empty() {
            return Err("HTTP host must not be empty".into());
        }

        let stun = self.webrtc.stun_server.trim();
        if !stun.is_empty() && !stun.starts_with("stun:") && !stun.starts_with("stuns:") {
            return Err("WebRTC stun_server must use the stun: or stuns: scheme".into());
        }

        for server in &self.webrtc.ice_servers {
            if server.urls.is_empty() {
                return Err("WebRTC ice_servers entries need at least one url".into());
            }
            for url in &server.urls {
                let known = ["stun:", "stuns:", "turn:", "turns:"];
                if !known.iter().any(|scheme| url.starts_with(scheme)) {
                    return Err(format!("Unsupported ICE server url: {}", url).into());
                }
            }
        }

        if let Some([start, end]) = self.webrtc.ephemeral_udp_port_range {
            if start == 0 || start > end {
                return Err("WebRTC ephemeral_udp_port_range must be a non-empty range of non-zero ports".into());
            }
        }

        if self.webrtc.outbound_queue_depth == 0 {
            return Err("WebRTC outbound_queue_depth must be non-zero".into());
        }

        if self.sink.stream_id.trim().is_empty() {
            return Err("Sink stream_id must not be empty".into());
        }

        Ok(())
    }
}

/// Element-level settings, fixed while the sink is started
#[derive(Debug, Clone, PartialEq)]
pub struct SinkSettings {
    pub is_live: bool,
    pub flush_on_unlock: bool,
    pub codec: Codec,
    pub stream_mode: StreamMode,
    pub negotiation_timeout: Option<Duration>,
    pub stream_id: String,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self::from(&SinkConfig::default())
    }
}

impl From<&SinkConfig> for SinkSettings {
    fn from(config: &SinkConfig) -> Self {
        Self {
            is_live: config.is_live,
            flush_on_unlock: config.flush_on_unlock,
            codec: config.codec,
            stream_mode: config.stream_mode,
            negotiation_timeout: match config.negotiation_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            stream_id: config.stream_id.clone(),
        }
    }
}

impl From<&Config> for SinkSettings {
    fn from(config: &Config) -> Self {
        Self::from(&config.sink)
    }
}


fn default_stun_server() -> String {
    "stun:stun.l.google.com:19302".to_string()
}

fn default_outbound_queue_depth() -> usize { 64 }

fn default_stream_id() -> String {
    "websink".to_string()
}
