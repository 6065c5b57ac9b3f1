//! preprocess — rasterize a source image into the letterboxed model input
//!
//! The canvas is filled with neutral gray (114, the Ultralytics convention),
//! the source is scaled uniformly into the letterbox draw region with
//! high-quality resampling, and the result is packed as a planar CHW float
//! tensor normalized to [0,1]. No cropping ever happens; aspect ratio is
//! preserved by construction of the letterbox.

use anyhow::{ensure, Context, Result};
use fast_image_resize as fr;

use crate::geometry::{Letterbox, Size};

/// Neutral pad value, already normalized.
const PAD_GRAY: f32 = 114.0 / 255.0;

/// A packed RGB24 pixel buffer, row-major. This is the streaming input type;
/// camera glue producing frames owns the buffer.
#[derive(Debug, Clone)]
pub struct RgbFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Reusable preprocessing context — keeps the resizer and the intermediate
/// scaled buffer alive across calls to avoid per-frame allocations.
pub struct Preprocessor {
    resizer: fr::Resizer,
    scaled_buf: Vec<u8>,
}

impl Preprocessor {
    pub fn new() -> Self {
        Self {
            resizer: fr::Resizer::new(),
            scaled_buf: Vec::new(),
        }
    }

    /// Letterbox `data` (RGB24, `width`×`height`) into a planar CHW f32
    /// tensor of side `input_size`, returning the tensor and the letterbox
    /// used (needed later to map boxes back).
    pub fn run(
        &mut self,
        width: u32,
        height: u32,
        data: &[u8],
        input_size: u32,
    ) -> Result<(Vec<f32>, Letterbox)> {
        ensure!(width > 0 && height > 0, "source has zero dimension");
        ensure!(
            data.len() == (width as usize) * (height as usize) * 3,
            "pixel buffer length {} does not match {}x{} RGB24",
            data.len(),
            width,
            height
        );

        let lb = Letterbox::new(
            input_size as f32,
            Size::new(width as f32, height as f32),
        );

        let side = input_size as usize;
        let scaled_w = (lb.draw_rect.w.round() as u32).clamp(1, input_size);
        let scaled_h = (lb.draw_rect.h.round() as u32).clamp(1, input_size);
        // Integer paste offsets; the fractional pad stays in the letterbox
        // for the inverse mapping.
        let x0 = (lb.pad_x.round() as usize).min(side - scaled_w as usize);
        let y0 = (lb.pad_y.round() as usize).min(side - scaled_h as usize);

        // SIMD resize into the draw region's dimensions.
        let src = fr::images::ImageRef::new(width, height, data, fr::PixelType::U8x3)
            .context("failed to create resize source")?;

        let scaled_len = (scaled_w * scaled_h * 3) as usize;
        if self.scaled_buf.len() != scaled_len {
            self.scaled_buf.resize(scaled_len, 0);
        }
        let mut dst = fr::images::Image::from_vec_u8(
            scaled_w,
            scaled_h,
            std::mem::take(&mut self.scaled_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Lanczos3));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("letterbox resize failed")?;
        self.scaled_buf = dst.into_vec();
        let scaled = &self.scaled_buf;

        // Gray canvas, then paint the scaled image into each channel plane.
        let plane = side * side;
        let mut tensor = vec![PAD_GRAY; 3 * plane];
        let (r_plane, gb) = tensor.split_at_mut(plane);
        let (g_plane, b_plane) = gb.split_at_mut(plane);

        let sw = scaled_w as usize;
        for row in 0..scaled_h as usize {
            let canvas_row = (y0 + row) * side + x0;
            let src_row = row * sw * 3;
            for col in 0..sw {
                let px = src_row + col * 3;
                let out = canvas_row + col;
                r_plane[out] = scaled[px] as f32 / 255.0;
                g_plane[out] = scaled[px + 1] as f32 / 255.0;
                b_plane[out] = scaled[px + 2] as f32 / 255.0;
            }
        }

        Ok((tensor, lb))
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f32 = 2.0 / 255.0;

    fn solid_frame(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..width * height {
            data.extend_from_slice(&rgb);
        }
        data
    }

    #[test]
    fn square_source_fills_canvas_without_padding() {
        let mut pre = Preprocessor::new();
        let data = solid_frame(2, 2, [255, 0, 0]);
        let (tensor, lb) = pre.run(2, 2, &data, 4).unwrap();

        assert!((lb.scale - 2.0).abs() < 1e-6);
        let plane = 16;
        // Uniform red everywhere: R plane ≈ 1, G/B planes ≈ 0.
        for i in 0..plane {
            assert!((tensor[i] - 1.0).abs() <= TOL);
            assert!(tensor[plane + i].abs() <= TOL);
            assert!(tensor[2 * plane + i].abs() <= TOL);
        }
    }

    #[test]
    fn wide_source_pads_top_and_bottom_with_gray() {
        let mut pre = Preprocessor::new();
        let data = solid_frame(2, 1, [0, 0, 255]);
        let (tensor, lb) = pre.run(2, 1, &data, 4).unwrap();

        // scale 2 → scaled 4×2, vertical pad of 1 on each side.
        assert!((lb.pad_y - 1.0).abs() < 1e-6);
        let plane = 16;
        let b_plane = &tensor[2 * plane..3 * plane];
        let r_plane = &tensor[..plane];
        for col in 0..4 {
            // Pad rows stay gray in every channel.
            assert!((r_plane[col] - PAD_GRAY).abs() <= TOL);
            assert!((b_plane[col] - PAD_GRAY).abs() <= TOL);
            assert!((b_plane[3 * 4 + col] - PAD_GRAY).abs() <= TOL);
            // Image rows carry the source color.
            assert!((b_plane[4 + col] - 1.0).abs() <= TOL);
            assert!(r_plane[4 + col].abs() <= TOL);
        }
    }

    #[test]
    fn mismatched_buffer_length_is_rejected() {
        let mut pre = Preprocessor::new();
        assert!(pre.run(2, 2, &[0u8; 5], 4).is_err());
        assert!(pre.run(0, 2, &[], 4).is_err());
    }
}
