//! Pixel conversion collaborators: decoded frame → caller-owned buffer.
//!
//! The decode loop never writes pixels itself. Once the target frame is
//! found, it hands the frame to a [`PixelConverter`] together with the
//! caller's output slice.
//!
//! Two converters are provided:
//!
//! - [`PackedCopy`] copies every plane in the frame's native layout, dropping
//!   row padding (`stride > row width`).
//! - [`YuvToRgba`] converts NV12 and YUV 4:2:0 planar frames to RGBA8 with the
//!   **BT.709** matrix in 10-bit fixed point; RGBA8 and Gray8 frames are
//!   expanded or copied to RGBA8 as well.
//!
//! ```text
//! R = 1.164 * (Y - 16) + 1.793 * (V - 128)
//! G = 1.164 * (Y - 16) - 0.213 * (U - 128) - 0.533 * (V - 128)
//! B = 1.164 * (Y - 16) + 2.112 * (U - 128)
//! ```

use se_common::{ConvertError, DecodedFrame, PixelFormat, Resolution};

/// Writes a decoded frame into a caller-provided buffer.
pub trait PixelConverter: Send + Sync {
    /// Bytes needed to hold a `resolution` frame decoded as `format`.
    fn output_len_for(
        &self,
        resolution: Resolution,
        format: PixelFormat,
    ) -> Result<usize, ConvertError>;

    /// Bytes [`convert`](Self::convert) writes for `frame`.
    fn output_len(&self, frame: &DecodedFrame) -> Result<usize, ConvertError> {
        self.output_len_for(frame.resolution, frame.format)
    }

    /// Convert `frame` into the first `output_len(frame)` bytes of `out`.
    fn convert(&self, frame: &DecodedFrame, out: &mut [u8]) -> Result<(), ConvertError>;
}

// ---------------------------------------------------------------------------
// Plane access
// ---------------------------------------------------------------------------

/// Validated view of one plane: rows of `row_bytes` visible bytes, `stride`
/// bytes apart.
#[derive(Clone, Copy)]
struct PlaneView<'a> {
    data: &'a [u8],
    stride: usize,
    row_bytes: usize,
    rows: usize,
}

impl<'a> PlaneView<'a> {
    fn of(frame: &'a DecodedFrame, index: usize) -> Result<Self, ConvertError> {
        let (row_bytes, rows) = frame
            .plane_extent(index)
            .ok_or(ConvertError::PlaneMissing { plane: index })?;
        let plane = frame
            .planes
            .get(index)
            .ok_or(ConvertError::PlaneMissing { plane: index })?;
        let stride = plane.stride.max(row_bytes);
        // The last row does not need its padding.
        let needed = if rows == 0 {
            0
        } else {
            stride * (rows - 1) + row_bytes
        };
        if plane.data.len() < needed {
            return Err(ConvertError::PlaneTooSmall {
                plane: index,
                needed,
                got: plane.data.len(),
            });
        }
        Ok(Self {
            data: &plane.data,
            stride,
            row_bytes,
            rows,
        })
    }

    #[inline(always)]
    fn row(&self, row: usize) -> &'a [u8] {
        let start = row * self.stride;
        &self.data[start..start + self.row_bytes]
    }
}

fn check_dimensions(resolution: Resolution) -> Result<(), ConvertError> {
    if resolution.is_empty() {
        return Err(ConvertError::InvalidDimensions {
            width: resolution.width,
            height: resolution.height,
        });
    }
    Ok(())
}

fn check_output(needed: usize, out: &[u8]) -> Result<(), ConvertError> {
    if out.len() < needed {
        return Err(ConvertError::OutputTooSmall {
            needed,
            got: out.len(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// PackedCopy
// ---------------------------------------------------------------------------

/// Copies every plane of a frame, in plane order, without row padding.
#[derive(Clone, Copy, Debug, Default)]
pub struct PackedCopy;

impl PixelConverter for PackedCopy {
    fn output_len_for(
        &self,
        resolution: Resolution,
        format: PixelFormat,
    ) -> Result<usize, ConvertError> {
        check_dimensions(resolution)?;
        Ok(format.packed_size(resolution.width, resolution.height))
    }

    fn convert(&self, frame: &DecodedFrame, out: &mut [u8]) -> Result<(), ConvertError> {
        let needed = self.output_len(frame)?;
        check_output(needed, out)?;

        let mut offset = 0;
        for index in 0..frame.format.plane_count() {
            let plane = PlaneView::of(frame, index)?;
            for row in 0..plane.rows {
                out[offset..offset + plane.row_bytes].copy_from_slice(plane.row(row));
                offset += plane.row_bytes;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// YuvToRgba
// ---------------------------------------------------------------------------

// 10 bits of fractional precision (multiply by 1024).
const Y_SCALE: i32 = 1192; // 1.164 * 1024
const V_TO_R: i32 = 1836; // 1.793 * 1024
const U_TO_G: i32 = 218; // 0.213 * 1024
const V_TO_G: i32 = 546; // 0.533 * 1024
const U_TO_B: i32 = 2163; // 2.112 * 1024

#[inline(always)]
fn clamp_u8(val: i32) -> u8 {
    val.clamp(0, 255) as u8
}

#[inline(always)]
fn bt709(y: u8, u: u8, v: u8) -> [u8; 4] {
    let y = Y_SCALE * (y as i32 - 16);
    let u = u as i32 - 128;
    let v = v as i32 - 128;
    [
        clamp_u8((y + V_TO_R * v + 512) >> 10),
        clamp_u8((y - U_TO_G * u - V_TO_G * v + 512) >> 10),
        clamp_u8((y + U_TO_B * u + 512) >> 10),
        255,
    ]
}

/// Converts decoded frames to RGBA8 (BT.709, limited range).
#[derive(Clone, Copy, Debug, Default)]
pub struct YuvToRgba;

impl YuvToRgba {
    /// Shared 4:2:0 loop; `chroma(row, col)` returns the (U, V) pair covering
    /// luma pixel (`row`, `col`).
    fn convert_420(
        luma: PlaneView<'_>,
        width: usize,
        out: &mut [u8],
        chroma: impl Fn(usize, usize) -> (u8, u8),
    ) {
        for row in 0..luma.rows {
            let y_row = luma.row(row);
            let out_row = &mut out[row * width * 4..(row + 1) * width * 4];
            for col in 0..width {
                let (u, v) = chroma(row, col);
                out_row[col * 4..col * 4 + 4].copy_from_slice(&bt709(y_row[col], u, v));
            }
        }
    }
}

impl PixelConverter for YuvToRgba {
    fn output_len_for(
        &self,
        resolution: Resolution,
        format: PixelFormat,
    ) -> Result<usize, ConvertError> {
        check_dimensions(resolution)?;
        match format {
            PixelFormat::Rgba8 | PixelFormat::Gray8 | PixelFormat::Nv12 | PixelFormat::Yuv420p => {
                Ok(resolution.rgba_byte_size())
            }
            PixelFormat::Rgb8 => Err(ConvertError::UnsupportedFormat(format)),
        }
    }

    fn convert(&self, frame: &DecodedFrame, out: &mut [u8]) -> Result<(), ConvertError> {
        let needed = self.output_len(frame)?;
        check_output(needed, out)?;
        let width = frame.resolution.width as usize;

        match frame.format {
            PixelFormat::Rgba8 => PackedCopy.convert(frame, out),
            PixelFormat::Gray8 => {
                let plane = PlaneView::of(frame, 0)?;
                for row in 0..plane.rows {
                    for (col, &g) in plane.row(row).iter().enumerate() {
                        let i = (row * width + col) * 4;
                        out[i..i + 4].copy_from_slice(&[g, g, g, 255]);
                    }
                }
                Ok(())
            }
            PixelFormat::Nv12 => {
                let luma = PlaneView::of(frame, 0)?;
                let uv = PlaneView::of(frame, 1)?;
                Self::convert_420(luma, width, out, |row, col| {
                    let uv_row = uv.row(row / 2);
                    let c = (col / 2) * 2;
                    (uv_row[c], uv_row[c + 1])
                });
                Ok(())
            }
            PixelFormat::Yuv420p => {
                let luma = PlaneView::of(frame, 0)?;
                let u = PlaneView::of(frame, 1)?;
                let v = PlaneView::of(frame, 2)?;
                Self::convert_420(luma, width, out, |row, col| {
                    (u.row(row / 2)[col / 2], v.row(row / 2)[col / 2])
                });
                Ok(())
            }
            PixelFormat::Rgb8 => Err(ConvertError::UnsupportedFormat(PixelFormat::Rgb8)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use se_common::Plane;

    fn frame(format: PixelFormat, width: u32, height: u32, planes: Vec<Plane>) -> DecodedFrame {
        DecodedFrame {
            pts: Some(0),
            pkt_dts: Some(0),
            resolution: Resolution::new(width, height),
            format,
            planes,
        }
    }

    fn uniform_nv12(width: u32, height: u32, y: u8, u: u8, v: u8) -> DecodedFrame {
        let w = width as usize;
        let ch = (height as usize).div_ceil(2);
        let cw = (width as usize).div_ceil(2);
        let uv: Vec<u8> = std::iter::repeat_n([u, v], cw * ch).flatten().collect();
        frame(
            PixelFormat::Nv12,
            width,
            height,
            vec![
                Plane {
                    data: vec![y; w * height as usize],
                    stride: w,
                },
                Plane {
                    data: uv,
                    stride: cw * 2,
                },
            ],
        )
    }

    fn reference_bt709(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
        let yf = y as f64;
        let uf = u as f64;
        let vf = v as f64;
        let r = 1.164 * (yf - 16.0) + 1.793 * (vf - 128.0);
        let g = 1.164 * (yf - 16.0) - 0.213 * (uf - 128.0) - 0.533 * (vf - 128.0);
        let b = 1.164 * (yf - 16.0) + 2.112 * (uf - 128.0);
        (
            r.round().clamp(0.0, 255.0) as u8,
            g.round().clamp(0.0, 255.0) as u8,
            b.round().clamp(0.0, 255.0) as u8,
        )
    }

    #[test]
    fn black_and_white_frames() {
        let mut out = vec![0u8; 32];
        YuvToRgba
            .convert(&uniform_nv12(4, 2, 16, 128, 128), &mut out)
            .unwrap();
        for px in out.chunks_exact(4) {
            assert!(px[0] <= 2 && px[1] <= 2 && px[2] <= 2);
            assert_eq!(px[3], 255);
        }

        YuvToRgba
            .convert(&uniform_nv12(4, 2, 235, 128, 128), &mut out)
            .unwrap();
        for px in out.chunks_exact(4) {
            assert!(px[0] >= 250 && px[1] >= 250 && px[2] >= 250);
        }
    }

    #[test]
    fn matches_floating_point_reference() {
        let (r, g, b) = reference_bt709(180, 100, 200);
        let mut out = vec![0u8; 32];
        YuvToRgba
            .convert(&uniform_nv12(4, 2, 180, 100, 200), &mut out)
            .unwrap();
        assert!((out[0] as i32 - r as i32).abs() <= 2);
        assert!((out[1] as i32 - g as i32).abs() <= 2);
        assert!((out[2] as i32 - b as i32).abs() <= 2);
    }

    #[test]
    fn odd_dimensions_round_chroma_up() {
        let f = uniform_nv12(5, 3, 128, 64, 200);
        let mut out = vec![0u8; YuvToRgba.output_len(&f).unwrap()];
        assert_eq!(out.len(), 5 * 3 * 4);
        YuvToRgba.convert(&f, &mut out).unwrap();
        let first = &out[0..4];
        assert!(out.chunks_exact(4).all(|px| px == first));
    }

    #[test]
    fn planar_matches_semi_planar() {
        let nv12 = uniform_nv12(4, 4, 90, 70, 180);
        let yuv = frame(
            PixelFormat::Yuv420p,
            4,
            4,
            vec![
                Plane {
                    data: vec![90; 16],
                    stride: 4,
                },
                Plane {
                    data: vec![70; 4],
                    stride: 2,
                },
                Plane {
                    data: vec![180; 4],
                    stride: 2,
                },
            ],
        );
        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        YuvToRgba.convert(&nv12, &mut a).unwrap();
        YuvToRgba.convert(&yuv, &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn packed_copy_drops_row_padding() {
        let f = frame(
            PixelFormat::Gray8,
            3,
            2,
            vec![Plane {
                data: vec![1, 2, 3, 0xEE, 4, 5, 6],
                stride: 4,
            }],
        );
        let mut out = vec![0u8; 6];
        PackedCopy.convert(&f, &mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn output_too_small_is_reported() {
        let f = uniform_nv12(4, 2, 16, 128, 128);
        let mut out = vec![0u8; 8];
        assert_eq!(
            YuvToRgba.convert(&f, &mut out),
            Err(ConvertError::OutputTooSmall { needed: 32, got: 8 })
        );
    }

    #[test]
    fn short_or_missing_planes_are_rejected() {
        let mut f = uniform_nv12(4, 2, 16, 128, 128);
        f.planes[1].data.truncate(2);
        let mut out = vec![0u8; 32];
        assert!(matches!(
            YuvToRgba.convert(&f, &mut out),
            Err(ConvertError::PlaneTooSmall { plane: 1, .. })
        ));
        f.planes.pop();
        assert_eq!(
            YuvToRgba.convert(&f, &mut out),
            Err(ConvertError::PlaneMissing { plane: 1 })
        );
    }

    #[test]
    fn invalid_dimensions_and_formats() {
        let empty = frame(PixelFormat::Nv12, 0, 0, Vec::new());
        assert!(matches!(
            YuvToRgba.output_len(&empty),
            Err(ConvertError::InvalidDimensions { .. })
        ));
        assert_eq!(
            YuvToRgba.output_len_for(Resolution::new(2, 2), PixelFormat::Rgb8),
            Err(ConvertError::UnsupportedFormat(PixelFormat::Rgb8))
        );
    }
}
