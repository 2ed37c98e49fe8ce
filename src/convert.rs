//! Color conversion between pixel layouts.
//!
//! Conversions are pure: the output depends only on the input bytes and the
//! target space. Supported:
//!
//! | from \ to | GRAY | BGR | BGRA | NV12 |
//! |-----------|------|-----|------|------|
//! | GRAY      | =    | yes | yes  | no   |
//! | BGR       | yes  | =   | yes  | no   |
//! | BGRA      | yes  | yes | =    | no   |
//! | NV12      | yes  | yes | yes  | =    |
//!
//! NV12 is a decoder output layout; nothing encodes back into it.

use crate::error::PipelineError;
use crate::frame::{ColorSpace, ColorTaggedImage};

// BT.601 luma weights in 8.8 fixed point. They sum to 256 so a pixel with
// equal channels maps back to exactly that value.
const LUMA_B: u32 = 29;
const LUMA_G: u32 = 150;
const LUMA_R: u32 = 77;

/// Convert `image` into `target`, returning a new buffer.
pub fn convert(
    image: &ColorTaggedImage,
    target: ColorSpace,
) -> Result<ColorTaggedImage, PipelineError> {
    if image.space() == target {
        return Ok(image.clone());
    }
    convert_pixels(image, target)
}

/// Same as [`convert`], but hands the input back untouched when it is
/// already in `target`.
pub fn convert_owned(
    image: ColorTaggedImage,
    target: ColorSpace,
) -> Result<ColorTaggedImage, PipelineError> {
    if image.space() == target {
        return Ok(image);
    }
    convert_pixels(&image, target)
}

fn convert_pixels(
    image: &ColorTaggedImage,
    target: ColorSpace,
) -> Result<ColorTaggedImage, PipelineError> {
    let src = image.as_bytes();
    let (width, height) = (image.width(), image.height());
    let data = match (image.space(), target) {
        (ColorSpace::Gray, ColorSpace::Bgr) => gray_to_bgr(src),
        (ColorSpace::Gray, ColorSpace::Bgra) => gray_to_bgra(src),
        (ColorSpace::Bgr, ColorSpace::Bgra) => bgr_to_bgra(src),
        (ColorSpace::Bgr, ColorSpace::Gray) => packed_to_gray(src, 3),
        (ColorSpace::Bgra, ColorSpace::Bgr) => bgra_to_bgr(src),
        (ColorSpace::Bgra, ColorSpace::Gray) => packed_to_gray(src, 4),
        (ColorSpace::Nv12, ColorSpace::Gray) => {
            let luma = width as usize * height as usize;
            src[..luma].to_vec()
        }
        (ColorSpace::Nv12, ColorSpace::Bgr) => nv12_to_packed(src, width, height, 3),
        (ColorSpace::Nv12, ColorSpace::Bgra) => nv12_to_packed(src, width, height, 4),
        (from, to) => return Err(PipelineError::UnsupportedConversion { from, to }),
    };
    Ok(ColorTaggedImage::from_converted(data, target, width, height))
}

fn gray_to_bgr(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() * 3);
    for &y in src {
        out.extend_from_slice(&[y, y, y]);
    }
    out
}

fn gray_to_bgra(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() * 4);
    for &y in src {
        out.extend_from_slice(&[y, y, y, u8::MAX]);
    }
    out
}

fn bgr_to_bgra(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() / 3 * 4);
    for px in src.chunks_exact(3) {
        out.extend_from_slice(&[px[0], px[1], px[2], u8::MAX]);
    }
    out
}

fn bgra_to_bgr(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() / 4 * 3);
    for px in src.chunks_exact(4) {
        out.extend_from_slice(&px[..3]);
    }
    out
}

fn packed_to_gray(src: &[u8], depth: usize) -> Vec<u8> {
    src.chunks_exact(depth)
        .map(|px| luma(px[0], px[1], px[2]))
        .collect()
}

fn luma(b: u8, g: u8, r: u8) -> u8 {
    ((LUMA_B * b as u32 + LUMA_G * g as u32 + LUMA_R * r as u32 + 128) >> 8) as u8
}

fn nv12_to_packed(src: &[u8], width: u32, height: u32, depth: usize) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = w * h;

    let mut out = vec![u8::MAX; y_plane * depth];
    for j in 0..h {
        for i in 0..w {
            let y = src[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = src[uv_index] as f32 - 128.0;
            let v = src[uv_index + 1] as f32 - 128.0;

            let r = y + 1.402_f32 * v;
            let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
            let b = y + 1.772_f32 * u;

            let offset = (j * w + i) * depth;
            out[offset] = clamp_to_u8(b);
            out[offset + 1] = clamp_to_u8(g);
            out[offset + 2] = clamp_to_u8(r);
        }
    }
    out
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn gray_ramp(width: u32, height: u32) -> Result<ColorTaggedImage> {
        let data = (0..width * height).map(|i| (i * 37 % 256) as u8).collect();
        Ok(ColorTaggedImage::new(data, ColorSpace::Gray, width, height)?)
    }

    #[test]
    fn gray_replicates_into_every_bgr_channel() -> Result<()> {
        let gray = gray_ramp(5, 3)?;
        let bgr = convert(&gray, ColorSpace::Bgr)?;

        assert_eq!(bgr.space(), ColorSpace::Bgr);
        for (px, &y) in bgr.as_bytes().chunks_exact(3).zip(gray.as_bytes()) {
            assert_eq!(px, &[y, y, y]);
        }
        Ok(())
    }

    #[test]
    fn gray_bgr_gray_round_trip_is_exact() -> Result<()> {
        let all_values: Vec<u8> = (0..=255).collect();
        let gray = ColorTaggedImage::new(all_values, ColorSpace::Gray, 16, 16)?;

        let bgr = convert(&gray, ColorSpace::Bgr)?;
        let back = convert(&bgr, ColorSpace::Gray)?;

        assert_eq!(back, gray);
        Ok(())
    }

    #[test]
    fn bgr_to_bgra_adds_opaque_alpha() -> Result<()> {
        let bgr = ColorTaggedImage::new(vec![1, 2, 3, 4, 5, 6], ColorSpace::Bgr, 2, 1)?;
        let bgra = convert(&bgr, ColorSpace::Bgra)?;
        assert_eq!(bgra.as_bytes(), &[1, 2, 3, 255, 4, 5, 6, 255]);

        let bgr_again = convert(&bgra, ColorSpace::Bgr)?;
        assert_eq!(bgr_again, bgr);
        Ok(())
    }

    #[test]
    fn identity_is_a_no_op() -> Result<()> {
        let bgr = ColorTaggedImage::new(vec![9, 8, 7], ColorSpace::Bgr, 1, 1)?;
        assert_eq!(convert(&bgr, ColorSpace::Bgr)?, bgr);
        assert_eq!(convert_owned(bgr.clone(), ColorSpace::Bgr)?, bgr);
        Ok(())
    }

    #[test]
    fn conversion_is_deterministic() -> Result<()> {
        let gray = gray_ramp(8, 4)?;
        assert_eq!(
            convert(&gray, ColorSpace::Bgra)?,
            convert(&gray, ColorSpace::Bgra)?
        );
        Ok(())
    }

    #[test]
    fn nv12_neutral_chroma_produces_gray() -> Result<()> {
        let nv12 = [vec![128u8; 4], vec![128u8; 2]].concat();
        let image = ColorTaggedImage::new(nv12, ColorSpace::Nv12, 2, 2)?;

        let bgr = convert(&image, ColorSpace::Bgr)?;
        assert_eq!(bgr.as_bytes(), &[128u8; 12]);

        let bgra = convert(&image, ColorSpace::Bgra)?;
        assert_eq!(&bgra.as_bytes()[..4], &[128, 128, 128, 255]);

        let gray = convert(&image, ColorSpace::Gray)?;
        assert_eq!(gray.as_bytes(), &[128u8; 4]);
        Ok(())
    }

    #[test]
    fn encoding_into_nv12_is_rejected() -> Result<()> {
        let bgr = ColorTaggedImage::new(vec![0u8; 12], ColorSpace::Bgr, 2, 2)?;
        let err = convert(&bgr, ColorSpace::Nv12).unwrap_err();
        assert_eq!(
            err,
            PipelineError::UnsupportedConversion {
                from: ColorSpace::Bgr,
                to: ColorSpace::Nv12,
            }
        );
        Ok(())
    }
}
