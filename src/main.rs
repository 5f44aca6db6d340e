//! websink - Main entry point
//!
//! Runs a GStreamer pipeline into the sink and serves the HTTP admission
//! endpoint that browsers use to join.

use clap::Parser;
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio::task;
use websink::args::Args;
use websink::config::{Config, SinkSettings};
use websink::gstreamer::{self, AppSinkSource};
use websink::transport::rtc::RtcPeerConnector;
use websink::web::{self, SharedState};
use websink::WebSink;

const DEFAULT_PIPELINE: &str =
    "videotestsrc is-live=true ! video/x-raw,width=1280,height=720,framerate=30/1 ! \
     x264enc tune=zerolatency speed-preset=ultrafast key-int-max=60 ! \
     video/x-h264,stream-format=byte-stream,profile=constrained-baseline ! appsink name=sink";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let loaded = args.load_config();

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = match (&loaded, args.verbose) {
        (_, true) => "debug".to_string(),
        (Ok(cfg), false) => cfg.logging.level.clone(),
        (Err(_), false) => "info".to_string(),
    };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("WEBSINK_LOG").unwrap_or(log_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("websink v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match loaded {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };
    args.apply_overrides(&mut config);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    if let Err(e) = gstreamer::init() {
        error!("Failed to initialize GStreamer: {}", e);
        return Err(e.into());
    }

    let connector = Arc::new(RtcPeerConnector::new(config.webrtc.clone()));
    let sink = Arc::new(WebSink::new(SinkSettings::from(&config), connector));
    let track = sink.activate()?;
    info!("Distribution track {} ({})", track.track_id, track.codec.mime_type());

    let state = Arc::new(SharedState::new(config, sink.clone()));
    let (listener, port) = web::bind_listener(&state).await?;
    info!("Accepting peers on port {}", port);

    let mut http_handle = task::spawn(web::run_http_server(listener, state.clone()));

    let launch = args.pipeline.clone().unwrap_or_else(|| DEFAULT_PIPELINE.to_string());
    let source = AppSinkSource::new(&launch)?;
    source.start()?;

    let running = Arc::new(AtomicBool::new(true));
    let source_running = running.clone();
    let source_sink = sink.clone();
    let mut source_handle = task::spawn_blocking(move || source.run(&source_sink, &source_running));

    // Wait for shutdown signal
    let shutdown = async {
        let _ = signal::ctrl_c().await;
        info!("Shutdown signal received");
    };

    tokio::select! {
        _ = shutdown => {
            info!("Initiating graceful shutdown...");
        }
        result = &mut source_handle => {
            log_blocking_task_result("Source pipeline", result);
        }
        result = &mut http_handle => {
            match result {
                Ok(Err(e)) => error!("HTTP server error: {}", e),
                Ok(Ok(())) => warn!("HTTP server stopped unexpectedly"),
                Err(e) => error!("HTTP server join error: {}", e),
            }
        }
    }

    // Cleanup
    running.store(false, Ordering::Release);

    info!("Stopping all tasks...");

    // Unlocks a render parked on an empty registry and closes every peer
    if let Err(e) = sink.deactivate().await {
        warn!("Sink was already stopped: {}", e);
    }

    if !source_handle.is_finished() {
        if let Err(e) = source_handle.await {
            error!("Source pipeline join error: {}", e);
        }
    }

    if !http_handle.is_finished() {
        http_handle.abort();
        let _ = http_handle.await;
    }

    info!("websink stopped");

    Ok(())
}

fn log_blocking_task_result(task: &str, result: Result<Result<(), String>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => warn!("{} stopped unexpectedly", task),
        Ok(Err(err)) => error!("{} failed: {}", task, err),
        Err(err) => error!("{} join error: {}", task, err),
    }
}
