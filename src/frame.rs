//! Decoded frames and color-tagged images.
//!
//! - `RawFrame`: one decoded picture plus its source timestamp. Produced by a
//!   `FrameSource`, owned by exactly one pipeline stage at a time.
//! - `ColorTaggedImage`: a pixel buffer annotated with the `ColorSpace` its
//!   bytes are laid out in.
//!
//! Both types validate the buffer length against the tag on construction and
//! never expose a way to swap the bytes or the tag independently. Whatever
//! holds one of these can rely on the layout matching the tag.

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Channel layout of a pixel buffer.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpace {
    /// One byte per pixel, luma only.
    Gray,
    /// Three bytes per pixel, blue first.
    Bgr,
    /// Four bytes per pixel, blue first, alpha last. This is the display layout.
    Bgra,
    /// Planar 4:2:0: a full luma plane followed by an interleaved UV plane at
    /// half resolution. Only ever produced by decoders.
    Nv12,
}

impl ColorSpace {
    /// Buffer length for a `width` x `height` image in this layout.
    ///
    /// Returns `None` on overflow, or for NV12 with odd dimensions.
    pub fn buffer_len(self, width: u32, height: u32) -> Option<usize> {
        let pixels = (width as usize).checked_mul(height as usize)?;
        match self {
            ColorSpace::Gray => Some(pixels),
            ColorSpace::Bgr => pixels.checked_mul(3),
            ColorSpace::Bgra => pixels.checked_mul(4),
            ColorSpace::Nv12 => {
                if width % 2 != 0 || height % 2 != 0 {
                    return None;
                }
                pixels.checked_add(pixels / 2)
            }
        }
    }

    /// True for layouts a display sink can be handed directly.
    pub fn is_display_space(self) -> bool {
        !matches!(self, ColorSpace::Nv12)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColorSpace::Gray => "gray",
            ColorSpace::Bgr => "bgr",
            ColorSpace::Bgra => "bgra",
            ColorSpace::Nv12 => "nv12",
        }
    }
}

impl fmt::Display for ColorSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColorSpace {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gray" | "grey" => Ok(ColorSpace::Gray),
            "bgr" => Ok(ColorSpace::Bgr),
            "bgra" => Ok(ColorSpace::Bgra),
            "nv12" => Ok(ColorSpace::Nv12),
            other => Err(anyhow::anyhow!("unknown color space '{}'", other)),
        }
    }
}

fn check_layout(
    data: &[u8],
    space: ColorSpace,
    width: u32,
    height: u32,
) -> Result<(), PipelineError> {
    let expected = space.buffer_len(width, height).ok_or_else(|| {
        PipelineError::decode(format!(
            "{} frame dimensions {}x{} are not representable",
            space, width, height
        ))
    })?;
    if data.len() != expected {
        return Err(PipelineError::decode(format!(
            "{} frame length mismatch: expected {}, got {}",
            space,
            expected,
            data.len()
        )));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// RawFrame
// ----------------------------------------------------------------------------

/// A decoded frame as delivered by a `FrameSource`.
///
/// Not `Clone`: a frame moves from stage to stage and is never shared.
pub struct RawFrame {
    image: ColorTaggedImage,
    source_timestamp_us: u64,
}

impl RawFrame {
    pub fn new(
        data: Vec<u8>,
        space: ColorSpace,
        width: u32,
        height: u32,
        source_timestamp_us: u64,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            image: ColorTaggedImage::new(data, space, width, height)?,
            source_timestamp_us,
        })
    }

    /// Timestamp embedded by the source, in microseconds.
    pub fn source_timestamp_us(&self) -> u64 {
        self.source_timestamp_us
    }

    pub fn width(&self) -> u32 {
        self.image.width
    }

    pub fn height(&self) -> u32 {
        self.image.height
    }

    pub fn color_space(&self) -> ColorSpace {
        self.image.space
    }

    pub fn image(&self) -> &ColorTaggedImage {
        &self.image
    }

    /// Hand the pixels to the next stage, keeping the timestamp.
    pub fn into_parts(self) -> (ColorTaggedImage, u64) {
        (self.image, self.source_timestamp_us)
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("space", &self.image.space)
            .field("width", &self.image.width)
            .field("height", &self.image.height)
            .field("source_timestamp_us", &self.source_timestamp_us)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// ColorTaggedImage
// ----------------------------------------------------------------------------

/// Pixel buffer whose byte layout always matches its `ColorSpace` tag.
///
/// The fields are private; the only way to build one is through a
/// constructor that checks the length against the tag.
///
/// ```compile_fail
/// use stream_pacer::{ColorSpace, ColorTaggedImage};
///
/// let image = ColorTaggedImage {
///     data: vec![0u8; 3],
///     space: ColorSpace::Bgra,
///     width: 1,
///     height: 1,
/// };
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct ColorTaggedImage {
    data: Vec<u8>,
    space: ColorSpace,
    width: u32,
    height: u32,
}

impl ColorTaggedImage {
    pub fn new(
        data: Vec<u8>,
        space: ColorSpace,
        width: u32,
        height: u32,
    ) -> Result<Self, PipelineError> {
        check_layout(&data, space, width, height)?;
        Ok(Self {
            data,
            space,
            width,
            height,
        })
    }

    /// Built by the converter, which sizes its output from the tag itself.
    pub(crate) fn from_converted(
        data: Vec<u8>,
        space: ColorSpace,
        width: u32,
        height: u32,
    ) -> Self {
        debug_assert_eq!(Some(data.len()), space.buffer_len(width, height));
        Self {
            data,
            space,
            width,
            height,
        }
    }

    pub fn space(&self) -> ColorSpace {
        self.space
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Bytes per row (NV12 reports the luma row).
    pub fn stride(&self) -> usize {
        let depth = match self.space {
            ColorSpace::Gray | ColorSpace::Nv12 => 1,
            ColorSpace::Bgr => 3,
            ColorSpace::Bgra => 4,
        };
        self.width as usize * depth
    }
}

impl fmt::Debug for ColorTaggedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColorTaggedImage")
            .field("space", &self.space)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}
