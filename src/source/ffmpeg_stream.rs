//! FFmpeg-backed stream decoder.
//!
//! Opens any uri libavformat understands, decodes the best video stream and
//! stamps each frame with its presentation time in microseconds. Decoders
//! that already emit NV12 have their planes copied out as-is; every other
//! pixel format is scaled to BGR24.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use std::time::Duration;

use super::{SourceConfig, SourceInfo};
use crate::error::PipelineError;
use crate::frame::{ColorSpace, RawFrame};

pub(super) struct FfmpegSource {
    info: SourceInfo,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    time_base: ffmpeg::Rational,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: Option<ffmpeg::software::scaling::Context>,
    read_timeout: Duration,
    eof_sent: bool,
}

impl FfmpegSource {
    pub(super) fn open(config: &SourceConfig) -> Result<Self, PipelineError> {
        Self::open_inner(config)
            .map_err(|err| PipelineError::unavailable(&config.uri, format!("{:#}", err)))
    }

    fn open_inner(config: &SourceConfig) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        ffmpeg::format::network::init();

        let input = ffmpeg::format::input_with_dictionary(&config.uri, io_options(config))
            .with_context(|| format!("failed to open '{}' with ffmpeg", config.uri))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow::anyhow!("stream has no video track"))?;
        let stream_index = input_stream.index();
        let time_base = input_stream.time_base();
        let rate = input_stream.avg_frame_rate();
        let frame_rate = if rate.denominator() != 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            config.frame_rate as f64
        };

        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let passthrough_nv12 = decoder.format() == ffmpeg::format::Pixel::NV12
            && decoder.width() % 2 == 0
            && decoder.height() % 2 == 0;
        let scaler = if passthrough_nv12 {
            None
        } else {
            Some(
                ffmpeg::software::scaling::context::Context::get(
                    decoder.format(),
                    decoder.width(),
                    decoder.height(),
                    ffmpeg::format::Pixel::BGR24,
                    decoder.width(),
                    decoder.height(),
                    ffmpeg::software::scaling::flag::Flags::BILINEAR,
                )
                .context("create ffmpeg scaler")?,
            )
        };

        let info = SourceInfo {
            uri: config.uri.clone(),
            width: decoder.width(),
            height: decoder.height(),
            frame_rate,
            has_video: true,
            backend: "ffmpeg",
        };

        Ok(Self {
            info,
            input,
            stream_index,
            time_base,
            decoder,
            scaler,
            read_timeout: config.stall_timeout(),
            eof_sent: false,
        })
    }

    pub(super) fn info(&self) -> SourceInfo {
        self.info.clone()
    }

    pub(super) fn next_frame(&mut self) -> Result<RawFrame, PipelineError> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return self.to_raw_frame(&decoded);
            }
            if self.eof_sent {
                return Err(PipelineError::StreamEnded);
            }

            // Read packets directly: `Input::packets()` retries failed reads
            // forever, which would turn a read timeout into a hang.
            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if packet.stream() != self.stream_index {
                        continue;
                    }
                    self.decoder
                        .send_packet(&packet)
                        .map_err(|e| PipelineError::decode(format!("send packet: {}", e)))?;
                }
                Err(ffmpeg::Error::Eof) => {
                    // Flush whatever the decoder still holds, then report the end.
                    self.decoder
                        .send_eof()
                        .map_err(|e| PipelineError::decode(format!("flush decoder: {}", e)))?;
                    self.eof_sent = true;
                }
                Err(e) => {
                    return Err(PipelineError::decode(format!(
                        "read packet: {} (read timeout {:?})",
                        e, self.read_timeout
                    )));
                }
            }
        }
    }

    fn to_raw_frame(&mut self, decoded: &ffmpeg::frame::Video) -> Result<RawFrame, PipelineError> {
        let timestamp_us = self.timestamp_us(decoded.timestamp().or(decoded.pts()));
        let width = decoded.width();
        let height = decoded.height();

        let Some(scaler) = self.scaler.as_mut() else {
            let mut pixels = copy_plane(decoded, 0, width as usize, height as usize)?;
            pixels.extend(copy_plane(decoded, 1, width as usize, height as usize / 2)?);
            return RawFrame::new(pixels, ColorSpace::Nv12, width, height, timestamp_us);
        };

        let mut bgr = ffmpeg::frame::Video::empty();
        scaler
            .run(decoded, &mut bgr)
            .map_err(|e| PipelineError::decode(format!("scale frame to BGR: {}", e)))?;
        let pixels = copy_plane(&bgr, 0, width as usize * 3, height as usize)?;
        RawFrame::new(pixels, ColorSpace::Bgr, width, height, timestamp_us)
    }

    fn timestamp_us(&self, pts: Option<i64>) -> u64 {
        let Some(pts) = pts else {
            return 0;
        };
        let num = self.time_base.numerator() as i128;
        let den = self.time_base.denominator().max(1) as i128;
        (pts as i128 * num * 1_000_000 / den).max(0) as u64
    }
}

/// Protocol options bounding every blocking read by the stall timeout.
///
/// `rw_timeout` covers the generic protocol layer (http, tcp, files);
/// `timeout` is the RTSP demuxer's socket I/O timeout. Both are in
/// microseconds.
fn io_options(config: &SourceConfig) -> ffmpeg::Dictionary<'static> {
    let micros = config.stall_timeout().as_micros().to_string();
    let mut options = ffmpeg::Dictionary::new();
    options.set("rw_timeout", &micros);
    if config.uri.starts_with("rtsp://") || config.uri.starts_with("rtsps://") {
        options.set("timeout", &micros);
    }
    options
}

/// Copy `rows` rows of `row_bytes` each out of a possibly padded plane.
fn copy_plane(
    frame: &ffmpeg::frame::Video,
    plane: usize,
    row_bytes: usize,
    rows: usize,
) -> Result<Vec<u8>, PipelineError> {
    let stride = frame.stride(plane);
    let data = frame.data(plane);

    if stride == row_bytes {
        return data
            .get(..row_bytes * rows)
            .map(|bytes| bytes.to_vec())
            .ok_or_else(|| PipelineError::decode("ffmpeg plane is shorter than expected"));
    }

    let mut pixels = Vec::with_capacity(row_bytes * rows);
    for row in 0..rows {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .ok_or_else(|| PipelineError::decode("ffmpeg frame row is out of bounds"))?,
        );
    }
    Ok(pixels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_are_bounded_by_the_stall_timeout() {
        let config = SourceConfig {
            uri: "http://192.168.178.111:2222".to_string(),
            frame_rate: 25,
            ..SourceConfig::default()
        };
        let options = io_options(&config);
        assert_eq!(options.get("rw_timeout"), Some("500000"));
        assert_eq!(options.get("timeout"), None);
    }

    #[test]
    fn rtsp_gets_a_socket_timeout_too() {
        let config = SourceConfig {
            uri: "rtsp://camera/stream".to_string(),
            frame_rate: 2,
            ..SourceConfig::default()
        };
        let options = io_options(&config);
        assert_eq!(options.get("rw_timeout"), Some("2000000"));
        assert_eq!(options.get("timeout"), Some("2000000"));
    }
}
