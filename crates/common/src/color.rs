//! Pixel formats of decoded frames.

use serde::{Deserialize, Serialize};

/// Pixel layout of a decoded frame in CPU memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 4 channels, 8 bits each, interleaved.
    Rgba8,
    /// 3 channels, 8 bits each, interleaved.
    Rgb8,
    /// Single 8-bit luma channel.
    Gray8,
    /// NV12: Y plane + interleaved UV at half resolution.
    Nv12,
    /// YUV 4:2:0 planar: Y, U and V planes, chroma at half resolution.
    Yuv420p,
}

impl PixelFormat {
    /// Number of planes a frame of this format carries.
    pub fn plane_count(self) -> usize {
        match self {
            Self::Rgba8 | Self::Rgb8 | Self::Gray8 => 1,
            Self::Nv12 => 2,
            Self::Yuv420p => 3,
        }
    }

    pub fn is_planar(self) -> bool {
        matches!(self, Self::Nv12 | Self::Yuv420p)
    }

    /// Width in bytes and height in rows of plane `plane` for a `width`x`height` frame.
    ///
    /// Returns `None` if `plane` is out of range for this format.
    pub fn plane_extent(self, plane: usize, width: u32, height: u32) -> Option<(usize, usize)> {
        let w = width as usize;
        let h = height as usize;
        let half_w = w.div_ceil(2);
        let half_h = h.div_ceil(2);
        match (self, plane) {
            (Self::Rgba8, 0) => Some((w * 4, h)),
            (Self::Rgb8, 0) => Some((w * 3, h)),
            (Self::Gray8, 0) => Some((w, h)),
            (Self::Nv12, 0) | (Self::Yuv420p, 0) => Some((w, h)),
            (Self::Nv12, 1) => Some((half_w * 2, half_h)),
            (Self::Yuv420p, 1) | (Self::Yuv420p, 2) => Some((half_w, half_h)),
            _ => None,
        }
    }

    /// Size in bytes of a tightly packed frame (no row padding).
    pub fn packed_size(self, width: u32, height: u32) -> usize {
        (0..self.plane_count())
            .filter_map(|p| self.plane_extent(p, width, height))
            .map(|(row, rows)| row * rows)
            .sum()
    }
}
