//! Appsink-driven sample source
//!
//! Pulls encoded buffers from the pipeline's appsink on a dedicated thread
//! and renders each one into the sink. The thread may park inside
//! `render` while no peer is connected.

use super::GstError;
use crate::config::Codec;
use crate::element::WebSink;
use crate::gate::RenderOutcome;
use crate::media_track::{MediaSample, DEFAULT_SAMPLE_DURATION};
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Name the appsink must carry in the launch line
pub const APPSINK_NAME: &str = "sink";

/// Poll interval used to notice shutdown while the pipeline is idle
const PULL_TIMEOUT_MS: u64 = 100;

pub struct AppSinkSource {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    samples: AtomicU64,
}

impl AppSinkSource {
    /// Build the pipeline from a launch line such as
    /// `videotestsrc is-live=true ! x264enc tune=zerolatency ! appsink name=sink`
    pub fn new(launch: &str) -> Result<Self, GstError> {
        gst::init().map_err(|e| GstError::InitFailed(e.to_string()))?;

        let pipeline = gst::parse::launch(launch)
            .map_err(|e| GstError::PipelineFailed(format!("Invalid launch line: {}", e)))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| GstError::PipelineFailed("Launch line did not produce a pipeline".to_string()))?;

        let appsink = pipeline
            .by_name(APPSINK_NAME)
            .ok_or_else(|| GstError::PipelineFailed(format!("No element named \"{}\"", APPSINK_NAME)))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| GstError::PipelineFailed(format!("\"{}\" is not an appsink", APPSINK_NAME)))?;
        appsink.set_property("sync", false);

        Ok(Self {
            pipeline,
            appsink,
            samples: AtomicU64::new(0),
        })
    }

    /// Start the pipeline
    pub fn start(&self) -> Result<(), GstError> {
        info!("Starting GStreamer source pipeline");
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| GstError::StateChangeFailed(format!("Failed to start: {:?}", e)))?;
        Ok(())
    }

    /// Stop the pipeline
    pub fn stop(&self) -> Result<(), GstError> {
        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| GstError::StateChangeFailed(format!("Failed to stop: {:?}", e)))?;
        Ok(())
    }

    pub fn sample_count(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// Feed samples into `sink` until EOS, shutdown or a fatal render error
    pub fn run(&self, sink: &WebSink, running: &AtomicBool) -> Result<(), String> {
        let mut caps_checked = false;

        while running.load(Ordering::Acquire) {
            let sample = match self.appsink.try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS)) {
                Some(sample) => sample,
                None => {
                    if self.appsink.is_eos() {
                        info!("Source pipeline reached EOS after {} samples", self.sample_count());
                        return Ok(());
                    }
                    continue;
                }
            };

            if !caps_checked {
                caps_checked = true;
                check_caps(&sample, sink.settings().codec);
            }

            let buffer = match sample.buffer() {
                Some(buffer) => buffer,
                None => continue,
            };
            let duration = buffer
                .duration()
                .map(|d| Duration::from_nanos(d.nseconds()))
                .unwrap_or(DEFAULT_SAMPLE_DURATION);
            let data = {
                let map = buffer
                    .map_readable()
                    .map_err(|e| format!("Failed to map buffer: {}", e))?;
                Bytes::copy_from_slice(map.as_slice())
            };

            match sink.render(MediaSample::new(data, duration)) {
                Ok(RenderOutcome::Unlocked) => debug!("Render unlocked, sample discarded"),
                Ok(_) => {
                    self.samples.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => return Err(format!("Render failed: {}", e)),
            }
        }

        Ok(())
    }
}

fn check_caps(sample: &gst::Sample, expected: Codec) {
    let detected = sample.caps().and_then(|caps| caps.structure(0)).and_then(|s| {
        let encoding = s.get::<String>("encoding-name").ok();
        Codec::from_caps_name(s.name().as_str(), encoding.as_deref())
    });
    match detected {
        Some((codec, mode)) if codec == expected => {
            info!("Source caps: {} in {:?} mode", codec.name(), mode)
        }
        Some((codec, _)) => warn!(
            "Source produces {} but the sink is configured for {}",
            codec.name(),
            expected.name()
        ),
        None => warn!("Could not detect codec from source caps"),
    }
}

impl Drop for AppSinkSource {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
