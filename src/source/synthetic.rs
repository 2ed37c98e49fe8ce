//! Synthetic source for `stub://` uris.
//!
//! Frames are generated as fast as they are grabbed, but stamped at the
//! configured cadence, so a consumer sees a decoder that runs ahead of the
//! source clock. Optional jitter makes the cadence irregular.

use rand::Rng;

use super::{SourceConfig, SourceInfo};
use crate::error::PipelineError;
use crate::frame::{ColorSpace, RawFrame};

pub(super) struct SyntheticSource {
    config: SourceConfig,
    frame_count: u64,
    next_timestamp_us: u64,
    /// Simulated scene state, bumped now and then so consecutive frames differ.
    scene_state: u8,
}

impl SyntheticSource {
    pub(super) fn new(config: SourceConfig) -> Result<Self, PipelineError> {
        if config.pixel_format.buffer_len(config.width, config.height).is_none()
            || config.width == 0
            || config.height == 0
        {
            return Err(PipelineError::unavailable(
                &config.uri,
                format!(
                    "cannot synthesize {}x{} {} frames",
                    config.width, config.height, config.pixel_format
                ),
            ));
        }
        Ok(Self {
            config,
            frame_count: 0,
            next_timestamp_us: 0,
            scene_state: 0,
        })
    }

    pub(super) fn info(&self) -> SourceInfo {
        SourceInfo {
            uri: self.config.uri.clone(),
            width: self.config.width,
            height: self.config.height,
            frame_rate: self.config.frame_rate as f64,
            has_video: true,
            backend: "synthetic",
        }
    }

    pub(super) fn next_frame(&mut self) -> Result<RawFrame, PipelineError> {
        if let Some(limit) = self.config.frame_limit {
            if self.frame_count >= limit {
                return Err(PipelineError::StreamEnded);
            }
        }
        self.frame_count += 1;

        let timestamp_us = self.next_timestamp_us;
        let mut step_us = self.config.frame_interval().as_micros() as u64;
        if self.config.jitter_us > 0 {
            step_us += rand::thread_rng().gen_range(0..=self.config.jitter_us);
        }
        self.next_timestamp_us = timestamp_us.saturating_add(step_us);

        let pixels = self.generate_synthetic_pixels();
        RawFrame::new(
            pixels,
            self.config.pixel_format,
            self.config.width,
            self.config.height,
            timestamp_us,
        )
    }

    /// Fill a buffer with a moving diagonal pattern in the configured layout.
    fn generate_synthetic_pixels(&mut self) -> Vec<u8> {
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let len = self
            .config
            .pixel_format
            .buffer_len(self.config.width, self.config.height)
            .unwrap_or_default();
        let mut pixels = vec![0u8; len];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        if self.config.pixel_format == ColorSpace::Bgra {
            for alpha in pixels.iter_mut().skip(3).step_by(4) {
                *alpha = u8::MAX;
            }
        }
        pixels
    }
}
