use clap::Parser;
use std::path::PathBuf;

use crate::config::{self, Codec, Config};

#[derive(Parser, Debug)]
#[command(name = "websink")]
#[command(version)]
#[command(about = "WebRTC fan-out sink for encoded media", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/websink.toml")]
    pub config: PathBuf,

    /// HTTP port for the admission endpoint (0 picks any free port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// STUN server URL, empty to disable
    #[arg(long)]
    pub stun_server: Option<String>,

    /// Drop samples while no peer is connected instead of blocking
    #[arg(long, action)]
    pub live: bool,

    /// Codec of the incoming samples (h264, h265, vp8, vp9, opus)
    #[arg(long)]
    pub codec: Option<Codec>,

    /// GStreamer launch line ending in `appsink name=sink`
    #[arg(long)]
    pub pipeline: Option<String>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Apply command line overrides on top of the file configuration
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.http.port = port;
        }
        if let Some(ref stun) = self.stun_server {
            config.webrtc.stun_server = stun.clone();
        }
        if self.live {
            config.sink.is_live = true;
        }
        if let Some(codec) = self.codec {
            config.sink.codec = codec;
        }
    }
}
