//! Frame sources.
//!
//! A `FrameSource` wraps a decoder and hands out `RawFrame`s one at a time,
//! in non-decreasing source-timestamp order. `StreamSource` picks a decoding
//! backend from the stream uri:
//!
//! - `stub://...`: synthetic frames, always available (tests, demos)
//! - FFmpeg (feature: stream-ffmpeg): http, rtsp, files, anything libavformat opens
//! - GStreamer (feature: stream-gstreamer): anything `uridecodebin` opens
//!
//! Streams are opened read-only. Sources never retry; a failed `start()` is
//! reported as `SourceUnavailable` and the caller decides what to do.

#[cfg(feature = "stream-ffmpeg")]
mod ffmpeg_stream;
#[cfg(feature = "stream-gstreamer")]
mod gstreamer_stream;
mod synthetic;

use std::time::Duration;

use crate::error::PipelineError;
use crate::frame::{ColorSpace, RawFrame};

#[cfg(feature = "stream-ffmpeg")]
use self::ffmpeg_stream::FfmpegSource;
#[cfg(feature = "stream-gstreamer")]
use self::gstreamer_stream::GstreamerSource;
use self::synthetic::SyntheticSource;

/// Decoder contract consumed by the acquisition loop.
pub trait FrameSource: Send {
    /// Open the stream. Fails with `SourceUnavailable` when the uri cannot
    /// be opened or carries no video.
    fn start(&mut self) -> Result<(), PipelineError>;

    /// Block until the next frame is decoded.
    ///
    /// Fails with `StreamEnded` at end of stream and `DecodeError` for
    /// anything else, including a timestamp lower than the previous one.
    fn grab(&mut self) -> Result<RawFrame, PipelineError>;

    /// Close the stream. Safe to call repeatedly, or without `start()`.
    fn release(&mut self);

    /// Stream properties, once started.
    fn info(&self) -> Option<SourceInfo> {
        None
    }
}

const MIN_STALL_TIMEOUT: Duration = Duration::from_millis(500);

/// Configuration for a stream source.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// Stream uri (e.g., "http://192.168.1.20:2222", "rtsp://cam/stream", "stub://demo").
    pub uri: String,
    /// Frame width (synthetic sources only; decoders report their own).
    pub width: u32,
    /// Frame height (synthetic sources only).
    pub height: u32,
    /// Nominal frame rate. Synthetic sources stamp frames at this cadence;
    /// decoders use it to size their stall timeouts.
    pub frame_rate: u32,
    /// End the synthetic stream after this many frames.
    pub frame_limit: Option<u64>,
    /// Extra random spacing added to synthetic timestamps, up to this many us.
    pub jitter_us: u64,
    /// Layout of synthetic frames.
    pub pixel_format: ColorSpace,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            uri: "stub://camera".to_string(),
            width: 640,
            height: 480,
            frame_rate: 30,
            frame_limit: None,
            jitter_us: 0,
            pixel_format: ColorSpace::Bgr,
        }
    }
}

impl SourceConfig {
    pub(crate) fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.frame_rate.max(1) as u64)
    }

    /// Longest a decoder may block waiting for the next frame before the
    /// stream counts as stalled.
    pub(crate) fn stall_timeout(&self) -> Duration {
        (self.frame_interval() * 4).max(MIN_STALL_TIMEOUT)
    }
}

/// What the opened stream reports about itself.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceInfo {
    pub uri: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub has_video: bool,
    pub backend: &'static str,
}

// ----------------------------------------------------------------------------
// StreamSource
// ----------------------------------------------------------------------------

/// The stock `FrameSource`: a backend chosen by uri plus the timestamp
/// ordering check shared by all backends.
pub struct StreamSource {
    config: SourceConfig,
    backend: Option<Backend>,
    info: Option<SourceInfo>,
    order: TimestampGuard,
    frame_count: u64,
}

enum Backend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "stream-ffmpeg")]
    Ffmpeg(FfmpegSource),
    #[cfg(feature = "stream-gstreamer")]
    Gstreamer(GstreamerSource),
}

impl Backend {
    fn open(config: &SourceConfig) -> Result<(Self, SourceInfo), PipelineError> {
        if config.uri.starts_with("stub://") {
            let source = SyntheticSource::new(config.clone())?;
            let info = source.info();
            return Ok((Backend::Synthetic(source), info));
        }
        #[cfg(feature = "stream-ffmpeg")]
        {
            let source = FfmpegSource::open(config)?;
            let info = source.info();
            Ok((Backend::Ffmpeg(source), info))
        }
        #[cfg(all(not(feature = "stream-ffmpeg"), feature = "stream-gstreamer"))]
        {
            let source = GstreamerSource::open(config)?;
            let info = source.info();
            Ok((Backend::Gstreamer(source), info))
        }
        #[cfg(not(any(feature = "stream-ffmpeg", feature = "stream-gstreamer")))]
        {
            Err(PipelineError::unavailable(
                &config.uri,
                "no decoder backend built in (enable stream-ffmpeg or stream-gstreamer)",
            ))
        }
    }

    fn next_frame(&mut self) -> Result<RawFrame, PipelineError> {
        match self {
            Backend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "stream-ffmpeg")]
            Backend::Ffmpeg(source) => source.next_frame(),
            #[cfg(feature = "stream-gstreamer")]
            Backend::Gstreamer(source) => source.next_frame(),
        }
    }

    fn close(&mut self) {
        match self {
            Backend::Synthetic(_) => {}
            #[cfg(feature = "stream-ffmpeg")]
            Backend::Ffmpeg(_) => {}
            #[cfg(feature = "stream-gstreamer")]
            Backend::Gstreamer(source) => source.close(),
        }
    }
}

impl StreamSource {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            backend: None,
            info: None,
            order: TimestampGuard::default(),
            frame_count: 0,
        }
    }
}

impl FrameSource for StreamSource {
    fn start(&mut self) -> Result<(), PipelineError> {
        self.release();
        let (backend, info) = Backend::open(&self.config)?;
        log::info!(
            "source {} opened via {}: {}x{} @ {:.2} fps, has video: {}",
            info.uri,
            info.backend,
            info.width,
            info.height,
            info.frame_rate,
            info.has_video
        );
        self.backend = Some(backend);
        self.info = Some(info);
        self.order = TimestampGuard::default();
        self.frame_count = 0;
        Ok(())
    }

    fn grab(&mut self) -> Result<RawFrame, PipelineError> {
        let Some(backend) = self.backend.as_mut() else {
            return Err(PipelineError::decode("source not started"));
        };
        let frame = backend.next_frame()?;
        self.order.admit(frame.source_timestamp_us())?;
        self.frame_count += 1;
        Ok(frame)
    }

    fn release(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.close();
            log::info!(
                "source {} released after {} frames",
                self.config.uri,
                self.frame_count
            );
        }
    }

    fn info(&self) -> Option<SourceInfo> {
        self.info.clone()
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        self.release();
    }
}

// ----------------------------------------------------------------------------
// Ordering
// ----------------------------------------------------------------------------

/// Rejects timestamps lower than the last admitted one. Equal is fine.
#[derive(Clone, Debug, Default)]
pub(crate) struct TimestampGuard {
    last_us: Option<u64>,
}

impl TimestampGuard {
    pub(crate) fn admit(&mut self, timestamp_us: u64) -> Result<(), PipelineError> {
        if let Some(last_us) = self.last_us {
            if timestamp_us < last_us {
                return Err(PipelineError::decode(format!(
                    "source timestamp decreased from {}us to {}us",
                    last_us, timestamp_us
                )));
            }
        }
        self.last_us = Some(timestamp_us);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn stub_config() -> SourceConfig {
        SourceConfig {
            uri: "stub://test".to_string(),
            width: 64,
            height: 48,
            frame_rate: 25,
            frame_limit: Some(3),
            ..SourceConfig::default()
        }
    }

    #[test]
    fn stub_source_produces_ordered_frames_then_ends() -> Result<()> {
        let mut source = StreamSource::new(stub_config());
        source.start()?;

        let mut previous = None;
        for _ in 0..3 {
            let frame = source.grab()?;
            assert_eq!(frame.width(), 64);
            assert_eq!(frame.height(), 48);
            if let Some(prev) = previous {
                assert_eq!(frame.source_timestamp_us() - prev, 40_000);
            }
            previous = Some(frame.source_timestamp_us());
        }
        assert_eq!(source.grab().unwrap_err(), PipelineError::StreamEnded);
        Ok(())
    }

    #[test]
    fn grab_before_start_is_a_decode_error() {
        let mut source = StreamSource::new(stub_config());
        assert!(matches!(
            source.grab(),
            Err(PipelineError::DecodeError(_))
        ));
    }

    #[test]
    fn release_is_idempotent() -> Result<()> {
        let mut never_started = StreamSource::new(stub_config());
        never_started.release();
        never_started.release();

        let mut source = StreamSource::new(stub_config());
        source.start()?;
        source.release();
        source.release();
        assert!(matches!(
            source.grab(),
            Err(PipelineError::DecodeError(_))
        ));
        Ok(())
    }

    #[test]
    fn info_is_reported_after_start() -> Result<()> {
        let mut source = StreamSource::new(stub_config());
        assert!(source.info().is_none());
        source.start()?;
        let info = source.info().expect("info after start");
        assert_eq!(info.uri, "stub://test");
        assert_eq!(info.backend, "synthetic");
        assert!(info.has_video);
        Ok(())
    }

    #[cfg(not(any(feature = "stream-ffmpeg", feature = "stream-gstreamer")))]
    #[test]
    fn network_uri_without_backend_is_unavailable() {
        let mut source = StreamSource::new(SourceConfig {
            uri: "http://192.168.178.111:2222".to_string(),
            ..SourceConfig::default()
        });
        assert!(matches!(
            source.start(),
            Err(PipelineError::SourceUnavailable { .. })
        ));
    }

    #[test]
    fn stall_timeout_scales_with_frame_interval() {
        let fast = SourceConfig {
            frame_rate: 30,
            ..SourceConfig::default()
        };
        assert_eq!(fast.stall_timeout(), Duration::from_millis(500));

        let slow = SourceConfig {
            frame_rate: 1,
            ..SourceConfig::default()
        };
        assert_eq!(slow.stall_timeout(), Duration::from_secs(4));
    }

    #[test]
    fn timestamp_guard_allows_duplicates_but_not_regressions() {
        let mut guard = TimestampGuard::default();
        assert!(guard.admit(100).is_ok());
        assert!(guard.admit(100).is_ok());
        assert!(guard.admit(250).is_ok());
        assert!(matches!(
            guard.admit(249),
            Err(PipelineError::DecodeError(_))
        ));
    }
}
