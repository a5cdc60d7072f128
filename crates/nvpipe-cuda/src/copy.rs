//! Per-plane strided copy plans.
//!
//! Texture memory, decoder surfaces and encoder input surfaces each lay out
//! planes with their own row alignment.  These functions compute where each
//! plane starts and which pitch applies on both sides; the bridge and the
//! elements then issue one 2D copy per entry.

use nvpipe_core::error::{CodecError, Result};
use nvpipe_core::types::{PixelFormat, round_up};

/// One plane of a 2D copy, as offsets into the source and destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaneCopy {
    pub plane: usize,
    pub src_offset: usize,
    pub src_pitch: usize,
    pub dst_offset: usize,
    pub dst_pitch: usize,
    pub width_bytes: usize,
    pub height: usize,
}

/// Stride of `plane` inside a scratch buffer whose luma pitch is `pitch`.
#[inline]
pub fn scratch_stride(format: PixelFormat, plane: usize, pitch: usize) -> usize {
    if plane > 0 && format.has_half_pitch_chroma() {
        pitch / 2
    } else {
        pitch
    }
}

/// Bytes of scratch memory needed to hold every plane of a frame.
pub fn scratch_height(format: PixelFormat, height: usize) -> usize {
    (0..format.n_planes())
        .map(|p| format.plane_height(p, height))
        .sum()
}

/// Texture planes (one buffer each) into a contiguous scratch buffer.
///
/// `src_strides` are the texture plane strides; each plane starts at
/// offset 0 of its own buffer.  Scratch planes follow one another.
pub fn encode_scratch_plan(
    format: PixelFormat,
    width: usize,
    height: usize,
    src_strides: &[usize],
    scratch_pitch: usize,
) -> Vec<PlaneCopy> {
    let mut dst_offset = 0;
    (0..format.n_planes())
        .map(|plane| {
            let dst_pitch = scratch_stride(format, plane, scratch_pitch);
            let plane_height = format.plane_height(plane, height);
            let copy = PlaneCopy {
                plane,
                src_offset: 0,
                src_pitch: src_strides
                    .get(plane)
                    .copied()
                    .unwrap_or_else(|| format.default_stride(plane, width)),
                dst_offset,
                dst_pitch,
                width_bytes: format.plane_width_bytes(plane, width),
                height: plane_height,
            };
            dst_offset += dst_pitch * plane_height;
            copy
        })
        .collect()
}

/// Decoded surface (planes stacked at `pitch * height`) into separate
/// destination planes with strides `dst_strides`.
pub fn decode_surface_plan(
    format: PixelFormat,
    width: usize,
    height: usize,
    surface_pitch: usize,
    dst_strides: &[usize],
) -> Vec<PlaneCopy> {
    (0..format.n_planes())
        .map(|plane| PlaneCopy {
            plane,
            src_offset: plane * surface_pitch * height,
            src_pitch: surface_pitch,
            dst_offset: 0,
            dst_pitch: dst_strides
                .get(plane)
                .copied()
                .unwrap_or_else(|| format.default_stride(plane, width)),
            width_bytes: format.plane_width_bytes(plane, width),
            height: format.plane_height(plane, height),
        })
        .collect()
}

/// Host frame planes into a locked encoder input surface of `pitch`.
///
/// Chroma planes start below a luma area padded to 32 rows.  I420/YV12
/// chroma uses half the pitch and the V plane follows the U plane.
pub fn input_surface_plan(
    format: PixelFormat,
    width: usize,
    height: usize,
    src_strides: &[usize],
    pitch: usize,
) -> Vec<PlaneCopy> {
    let padded = round_up(height, 32);
    (0..format.n_planes())
        .map(|plane| {
            let dst_offset = match (format, plane) {
                (_, 0) => 0,
                (PixelFormat::I420 | PixelFormat::Yv12, 1) => padded * pitch,
                (PixelFormat::I420 | PixelFormat::Yv12, _) => {
                    padded * pitch + (padded / 2) * (pitch / 2)
                }
                (_, k) => k * padded * pitch,
            };
            PlaneCopy {
                plane,
                src_offset: 0,
                src_pitch: src_strides
                    .get(plane)
                    .copied()
                    .unwrap_or_else(|| format.default_stride(plane, width)),
                dst_offset,
                dst_pitch: scratch_stride(format, plane, pitch),
                width_bytes: format.plane_width_bytes(plane, width),
                height: format.plane_height(plane, height),
            }
        })
        .collect()
}

/// Bytes an input surface of `pitch` must hold for `input_surface_plan`.
pub fn input_surface_size(format: PixelFormat, height: usize, pitch: usize) -> usize {
    let padded = round_up(height, 32);
    match format.n_planes() {
        1 => padded * pitch,
        _ if format.has_half_pitch_chroma() => padded * pitch + padded * (pitch / 2),
        n => n * padded * pitch,
    }
}

/// Row-by-row copy of one planned plane between host slices.
///
/// Fails without writing anything when either slice is shorter than the
/// plan requires.
pub fn copy_plane_host(src: &[u8], dst: &mut [u8], copy: &PlaneCopy) -> Result<()> {
    if copy.height == 0 || copy.width_bytes == 0 {
        return Ok(());
    }
    let last = copy.height - 1;
    let src_need = copy.src_offset + last * copy.src_pitch + copy.width_bytes;
    if src_need > src.len() {
        return Err(CodecError::BufferTooSmall {
            need: src_need,
            have: src.len(),
        });
    }
    let dst_need = copy.dst_offset + last * copy.dst_pitch + copy.width_bytes;
    if dst_need > dst.len() {
        return Err(CodecError::BufferTooSmall {
            need: dst_need,
            have: dst.len(),
        });
    }
    for row in 0..copy.height {
        let s = copy.src_offset + row * copy.src_pitch;
        let d = copy.dst_offset + row * copy.dst_pitch;
        dst[d..d + copy.width_bytes].copy_from_slice(&src[s..s + copy.width_bytes]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_scratch_planes_follow_each_other() {
        let plan = encode_scratch_plan(PixelFormat::Nv12, 64, 48, &[64, 64], 512);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].dst_offset, 0);
        assert_eq!(plan[1].dst_offset, 512 * 48);
        assert_eq!(plan[1].height, 24);
        assert_eq!(plan[1].width_bytes, 64);
    }

    #[test]
    fn i420_scratch_chroma_uses_half_pitch() {
        let plan = encode_scratch_plan(PixelFormat::I420, 64, 48, &[64, 32, 32], 512);
        assert_eq!(plan[1].dst_pitch, 256);
        assert_eq!(plan[2].dst_offset, 512 * 48 + 256 * 24);
        assert_eq!(plan[2].width_bytes, 32);
    }

    #[test]
    fn decode_surface_planes_stack_at_pitch_times_height() {
        let plan = decode_surface_plan(PixelFormat::Nv12, 64, 64, 256, &[64, 64]);
        assert_eq!(plan[0].src_offset, 0);
        assert_eq!(plan[1].src_offset, 256 * 64);
        assert_eq!(plan[1].height, 32);
        assert_eq!(plan[1].dst_pitch, 64);
    }

    #[test]
    fn input_surface_offsets() {
        let nv12 = input_surface_plan(PixelFormat::Nv12, 64, 50, &[], 128);
        assert_eq!(nv12[1].dst_offset, 64 * 128);

        let i420 = input_surface_plan(PixelFormat::I420, 64, 50, &[], 128);
        assert_eq!(i420[1].dst_offset, 64 * 128);
        assert_eq!(i420[2].dst_offset, 64 * 128 + 32 * 64);
        assert_eq!(i420[2].dst_pitch, 64);

        let y444 = input_surface_plan(PixelFormat::Y444, 64, 50, &[], 128);
        assert_eq!(y444[2].dst_offset, 2 * 64 * 128);
        assert_eq!(input_surface_size(PixelFormat::Y444, 50, 128), 3 * 64 * 128);
    }

    #[test]
    fn host_plane_copy_respects_pitches() {
        let src: Vec<u8> = (0..16).collect();
        let mut dst = vec![0u8; 24];
        let copy = PlaneCopy {
            plane: 0,
            src_offset: 0,
            src_pitch: 4,
            dst_offset: 0,
            dst_pitch: 6,
            width_bytes: 4,
            height: 4,
        };
        copy_plane_host(&src, &mut dst, &copy).unwrap();
        assert_eq!(&dst[0..4], &[0, 1, 2, 3]);
        assert_eq!(&dst[6..10], &[4, 5, 6, 7]);
        assert_eq!(dst[4], 0);
    }

    #[test]
    fn host_plane_copy_rejects_short_slices() {
        let copy = PlaneCopy {
            plane: 0,
            src_offset: 0,
            src_pitch: 4,
            dst_offset: 0,
            dst_pitch: 6,
            width_bytes: 4,
            height: 4,
        };
        let mut dst = vec![0u8; 24];
        let err = copy_plane_host(&[1u8; 15], &mut dst, &copy).unwrap_err();
        assert!(matches!(err, CodecError::BufferTooSmall { need: 16, have: 15 }));
        assert!(dst.iter().all(|&b| b == 0));

        let mut small = vec![0u8; 20];
        let err = copy_plane_host(&[1u8; 16], &mut small, &copy).unwrap_err();
        assert!(matches!(err, CodecError::BufferTooSmall { need: 22, have: 20 }));
    }
}
