//! GStreamer-backed stream decoder.
//!
//! Pipeline: `uridecodebin ! videoconvert ! video/x-raw,format=BGR ! appsink`.
//! The appsink keeps a short queue and never drops, so every decoded frame
//! reaches the pacer. Timestamps come from buffer PTS.

use anyhow::{Context, Result};
use gstreamer::prelude::*;
use std::time::Duration;

use super::{SourceConfig, SourceInfo};
use crate::error::PipelineError;
use crate::frame::{ColorSpace, RawFrame};

const PREROLL_TIMEOUT: Duration = Duration::from_secs(10);

pub(super) struct GstreamerSource {
    info: SourceInfo,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_timeout: Duration,
}

impl GstreamerSource {
    pub(super) fn open(config: &SourceConfig) -> Result<Self, PipelineError> {
        let mut source = Self::build(config)
            .map_err(|err| PipelineError::unavailable(&config.uri, format!("{:#}", err)))?;
        source.preroll(config)?;
        Ok(source)
    }

    fn build(config: &SourceConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "uridecodebin uri={} ! videoconvert ! video/x-raw,format=BGR ! \
             appsink name=appsink sync=false max-buffers=4 drop=false",
            launch_quote(&config.uri)
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build stream pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("stream pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "BGR")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_drop(false);
        appsink.set_sync(false);

        let frame_timeout = config.stall_timeout();

        Ok(Self {
            info: SourceInfo {
                uri: config.uri.clone(),
                width: 0,
                height: 0,
                frame_rate: config.frame_rate as f64,
                has_video: false,
                backend: "gstreamer",
            },
            pipeline,
            appsink,
            frame_timeout,
        })
    }

    /// Start playback and wait until caps are negotiated, so a missing video
    /// track is reported at open time.
    fn preroll(&mut self, config: &SourceConfig) -> Result<(), PipelineError> {
        let unavailable = |reason: String| PipelineError::unavailable(&config.uri, reason);

        self.pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| unavailable(format!("set pipeline to Playing: {}", e)))?;
        let (result, _, _) = self
            .pipeline
            .state(gstreamer::ClockTime::from_mseconds(PREROLL_TIMEOUT.as_millis() as u64));
        if let Err(e) = result {
            self.close();
            return Err(unavailable(format!("pipeline failed to start: {}", e)));
        }
        if let Err(err) = self.poll_bus() {
            self.close();
            return Err(unavailable(err.to_string()));
        }

        let caps = self
            .appsink
            .static_pad("sink")
            .and_then(|pad| pad.current_caps());
        match caps.and_then(|caps| gstreamer_video::VideoInfo::from_caps(&caps).ok()) {
            Some(video) => {
                self.info.width = video.width();
                self.info.height = video.height();
                let fps = video.fps();
                if fps.denom() != 0 && fps.numer() != 0 {
                    self.info.frame_rate = fps.numer() as f64 / fps.denom() as f64;
                }
                self.info.has_video = true;
                Ok(())
            }
            None => {
                self.close();
                Err(unavailable("stream has no video track".to_string()))
            }
        }
    }

    pub(super) fn info(&self) -> SourceInfo {
        self.info.clone()
    }

    pub(super) fn next_frame(&mut self) -> Result<RawFrame, PipelineError> {
        self.poll_bus()?;

        let timeout = gstreamer::ClockTime::from_mseconds(self.frame_timeout.as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            if self.appsink.is_eos() {
                return Err(PipelineError::StreamEnded);
            }
            return Err(PipelineError::decode("stream stalled"));
        };
        sample_to_frame(&sample)
    }

    pub(super) fn close(&mut self) {
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("failed to stop stream pipeline: {}", e);
        }
    }

    fn poll_bus(&mut self) -> Result<(), PipelineError> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(PipelineError::decode(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    )));
                }
                MessageView::Eos(..) => return Err(PipelineError::StreamEnded),
                _ => {}
            }
        }
        Ok(())
    }
}

fn sample_to_frame(sample: &gstreamer::Sample) -> Result<RawFrame, PipelineError> {
    let buffer = sample
        .buffer()
        .ok_or_else(|| PipelineError::decode("sample missing buffer"))?;
    let caps = sample
        .caps()
        .ok_or_else(|| PipelineError::decode("sample missing caps"))?;
    let info = gstreamer_video::VideoInfo::from_caps(caps)
        .map_err(|e| PipelineError::decode(format!("parse caps as video info: {}", e)))?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;
    let timestamp_us = buffer.pts().map(|pts| pts.useconds()).unwrap_or_default();

    let map = buffer
        .map_readable()
        .map_err(|e| PipelineError::decode(format!("map buffer: {}", e)))?;
    let data = map.as_slice();

    if stride == row_bytes {
        let pixels = data
            .get(..row_bytes * height as usize)
            .ok_or_else(|| PipelineError::decode("buffer is shorter than its caps"))?
            .to_vec();
        return RawFrame::new(pixels, ColorSpace::Bgr, width, height, timestamp_us);
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .ok_or_else(|| PipelineError::decode("buffer row is out of bounds"))?,
        );
    }
    RawFrame::new(pixels, ColorSpace::Bgr, width, height, timestamp_us)
}

/// Quote a property value for `gst_parse_launch`, so spaces and `!` in a
/// uri stay part of the value.
fn launch_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        if ch == '"' || ch == '\\' {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_is_quoted_for_the_launch_line() {
        assert_eq!(
            launch_quote("rtsp://cam/stream"),
            r#""rtsp://cam/stream""#
        );
        assert_eq!(
            launch_quote("file:///videos/front door!.mp4"),
            r#""file:///videos/front door!.mp4""#
        );
        assert_eq!(
            launch_quote(r#"http://cam/a"b\c"#),
            r#""http://cam/a\"b\\c""#
        );
    }
}
