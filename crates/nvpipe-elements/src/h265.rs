//! H.265 encoder variant.

use nvpipe_core::codec_traits::{
    DownstreamConstraints, EncodeConfig, EncodeSession, HwProfile, PictureParams, SeiPayload,
    VuiParams,
};
use nvpipe_core::error::{CodecError, Result};
use nvpipe_core::types::{
    CodecId, ColorRange, CompressedCaps, ContentLightLevel, MasteringDisplayInfo, PixelFormat,
    VideoInfo,
};
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::encoder::{CodecVariant, Encoder};

pub type H265Encoder = Encoder<H265>;

pub const SEI_MASTERING_DISPLAY: u32 = 137;
pub const SEI_CONTENT_LIGHT_LEVEL: u32 = 144;

/// VUI video_format "unspecified".
const VIDEO_FORMAT_UNSPECIFIED: u32 = 5;

const CHROMA_SCALE: f64 = 50_000.0;
const LUMA_SCALE: f64 = 10_000.0;

/// H.265 hooks: profile from downstream, 4:4:4 and 10-bit handling, VUI
/// colour description and HDR SEI.
#[derive(Default)]
pub struct H265 {
    sei: Mutex<Vec<SeiPayload>>,
}

impl H265 {
    pub fn new() -> Self {
        Self::default()
    }

    /// SEI messages attached to every picture of the current stream.
    pub fn sei_payloads(&self) -> Vec<SeiPayload> {
        self.sei.lock().clone()
    }
}

/// Hardware profile for a downstream profile name.
pub fn profile_from_caps(profile: &str) -> Option<HwProfile> {
    if profile == "main" {
        Some(HwProfile::HevcMain)
    } else if profile.starts_with("main-10") {
        Some(HwProfile::HevcMain10)
    } else if profile.starts_with("main-444") {
        Some(HwProfile::HevcFrext)
    } else {
        None
    }
}

/// `"4.1"` → 123.  Level idc is 30 times the level number.
pub fn level_idc(level: &str) -> Option<u32> {
    let (major, minor) = match level.split_once('.') {
        Some((major, minor)) => (major.parse::<u32>().ok()?, minor.parse::<u32>().ok()?),
        None => (level.parse::<u32>().ok()?, 0),
    };
    if minor > 9 {
        return None;
    }
    Some(major * 30 + minor * 3)
}

pub fn level_name(idc: u8) -> String {
    let major = idc / 30;
    match (idc % 30) / 3 {
        0 => major.to_string(),
        minor => format!("{major}.{minor}"),
    }
}

fn scale(value: f64, factor: f64) -> f64 {
    (value * factor).round()
}

/// Mastering display colour volume SEI body (24 bytes, big-endian).
///
/// Primaries are written green, blue, red.
pub fn mastering_display_sei(info: &MasteringDisplayInfo) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    for primary in [info.green, info.blue, info.red] {
        out.extend_from_slice(&(scale(primary.x, CHROMA_SCALE) as u16).to_be_bytes());
        out.extend_from_slice(&(scale(primary.y, CHROMA_SCALE) as u16).to_be_bytes());
    }
    out.extend_from_slice(&(scale(info.white_point.x, CHROMA_SCALE) as u16).to_be_bytes());
    out.extend_from_slice(&(scale(info.white_point.y, CHROMA_SCALE) as u16).to_be_bytes());
    out.extend_from_slice(&(scale(info.max_luminance, LUMA_SCALE) as u32).to_be_bytes());
    out.extend_from_slice(&(scale(info.min_luminance, LUMA_SCALE) as u32).to_be_bytes());
    out
}

/// Content light level SEI body (4 bytes, big-endian).
pub fn content_light_level_sei(cll: &ContentLightLevel) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    out.extend_from_slice(&(cll.max_cll as u16).to_be_bytes());
    out.extend_from_slice(&(cll.max_fall as u16).to_be_bytes());
    out
}

/// Profile, tier and level from the profile_tier_level structure of a
/// VPS payload (NAL header and identifier already skipped).
pub fn profile_tier_level(ptl: &[u8]) -> Option<(&'static str, &'static str, String)> {
    if ptl.len() < 12 {
        return None;
    }
    let profile = match ptl[0] & 0x1f {
        1 => "main",
        2 => "main-10",
        3 => "main-still-picture",
        4 => "main-444",
        _ => return None,
    };
    let tier = if ptl[0] & 0x20 != 0 { "high" } else { "main" };
    Some((profile, tier, level_name(ptl[11])))
}

impl CodecVariant for H265 {
    const CODEC: CodecId = CodecId::H265;

    fn set_encoder_config(
        &self,
        info: &VideoInfo,
        downstream: &DownstreamConstraints,
        config: &mut EncodeConfig,
    ) -> Result<()> {
        let mut profile = HwProfile::Auto;
        if let Some(name) = downstream.profiles.first() {
            profile = profile_from_caps(name).ok_or_else(|| {
                CodecError::NotNegotiated(format!("unsupported h265 profile {name}"))
            })?;
        }
        let level = match &downstream.level {
            Some(level) => level_idc(level).ok_or_else(|| {
                CodecError::NotNegotiated(format!("invalid h265 level {level}"))
            })?,
            None => 0,
        };

        config.profile = profile;
        config.codec.level = level;
        config.codec.idr_period = config.gop_length;
        config.codec.chroma_format_idc = 1;
        match info.format {
            PixelFormat::Y444 | PixelFormat::Y444_16 => {
                debug!("have Y444 input, setting config accordingly");
                config.profile = HwProfile::HevcFrext;
                config.codec.chroma_format_idc = 3;
                if info.format == PixelFormat::Y444_16 {
                    config.codec.bit_depth_minus8 = 2;
                }
            }
            PixelFormat::P010 => {
                config.profile = HwProfile::HevcMain10;
                config.codec.bit_depth_minus8 = 2;
            }
            _ => {}
        }
        config.codec.output_aud = true;
        let colorimetry = info.colorimetry;
        config.codec.vui = Some(VuiParams {
            video_format: VIDEO_FORMAT_UNSPECIFIED,
            full_range: colorimetry.range == ColorRange::Full,
            colour_primaries: colorimetry.primaries.to_iso(),
            transfer_characteristics: colorimetry.transfer.to_iso(),
            matrix_coefficients: colorimetry.matrix.to_iso(),
        });

        let mut sei = Vec::new();
        if let Some(mdi) = &info.hdr.mastering_display {
            debug!("apply mastering display info");
            sei.push(SeiPayload {
                payload_type: SEI_MASTERING_DISPLAY,
                data: mastering_display_sei(mdi),
            });
        }
        if let Some(cll) = &info.hdr.content_light_level {
            debug!(max_cll = cll.max_cll, max_fall = cll.max_fall, "apply content light level");
            sei.push(SeiPayload {
                payload_type: SEI_CONTENT_LIGHT_LEVEL,
                data: content_light_level_sei(cll),
            });
        }
        *self.sei.lock() = sei;
        Ok(())
    }

    fn set_picture_params(&self, _info: &VideoInfo, params: &mut PictureParams) {
        let sei = self.sei.lock();
        if !sei.is_empty() {
            trace!(n = sei.len(), "attaching sei");
            params.sei.extend(sei.iter().cloned());
        }
    }

    fn output_caps(&self, session: &dyn EncodeSession, info: &VideoInfo) -> Result<CompressedCaps> {
        let seq = session.sequence_params()?;
        if seq.len() < 8 {
            return Err(CodecError::Encode(
                "sequence parameters returned incomplete data".into(),
            ));
        }
        // 4-byte start code, 2-byte NAL header.
        let (profile, tier, level) = profile_tier_level(&seq[6..])
            .ok_or_else(|| CodecError::Encode("unparsable profile_tier_level".into()))?;

        let mut caps = CompressedCaps::new(CodecId::H265, info.width, info.height)
            .with_framerate(info.fps_n, info.fps_d);
        caps.par_n = info.par_n;
        caps.par_d = info.par_d;
        caps.interlace = info.interlace;
        caps.stream_format = Some("byte-stream".into());
        caps.alignment = Some("au".into());
        caps.profile = Some(profile.into());
        caps.tier = Some(tier.into());
        caps.level = Some(level);
        info!(caps = %caps.to_caps_string(), "h265 output caps");
        Ok(caps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvpipe_core::types::Chromaticity;

    #[test]
    fn downstream_profiles_map_to_hw_profiles() {
        assert_eq!(profile_from_caps("main"), Some(HwProfile::HevcMain));
        assert_eq!(profile_from_caps("main-10"), Some(HwProfile::HevcMain10));
        assert_eq!(profile_from_caps("main-444-10"), Some(HwProfile::HevcFrext));
        assert_eq!(profile_from_caps("main-12"), None);
    }

    #[test]
    fn level_names_and_idcs_agree() {
        assert_eq!(level_idc("4.1"), Some(123));
        assert_eq!(level_idc("5"), Some(150));
        assert_eq!(level_name(123), "4.1");
        assert_eq!(level_name(93), "3.1");
        assert_eq!(level_name(120), "4");
        assert_eq!(level_idc("x"), None);
    }

    #[test]
    fn mastering_display_is_gbr_big_endian() {
        let info = MasteringDisplayInfo {
            red: Chromaticity { x: 0.708, y: 0.292 },
            green: Chromaticity { x: 0.170, y: 0.797 },
            blue: Chromaticity { x: 0.131, y: 0.046 },
            white_point: Chromaticity { x: 0.3127, y: 0.3290 },
            max_luminance: 1000.0,
            min_luminance: 0.0001,
        };
        let sei = mastering_display_sei(&info);
        assert_eq!(sei.len(), 24);
        // green x = 8500
        assert_eq!(&sei[0..2], &8500u16.to_be_bytes());
        // green y = 39850
        assert_eq!(&sei[2..4], &39850u16.to_be_bytes());
        // red x = 35400
        assert_eq!(&sei[8..10], &35400u16.to_be_bytes());
        assert_eq!(&sei[12..14], &15635u16.to_be_bytes());
        assert_eq!(&sei[16..20], &10_000_000u32.to_be_bytes());
        assert_eq!(&sei[20..24], &1u32.to_be_bytes());
    }

    #[test]
    fn content_light_level_truncates_to_u16() {
        let sei = content_light_level_sei(&ContentLightLevel {
            max_cll: 1000.0,
            max_fall: 400.5,
        });
        assert_eq!(sei, vec![0x03, 0xe8, 0x01, 0x90]);
    }

    #[test]
    fn ptl_parsing() {
        let mut ptl = [0u8; 12];
        ptl[0] = 0x02;
        ptl[11] = 153;
        assert_eq!(
            profile_tier_level(&ptl),
            Some(("main-10", "main", "5.1".to_string()))
        );
        ptl[0] = 0x21;
        assert_eq!(profile_tier_level(&ptl).map(|p| p.1), Some("high"));
        assert_eq!(profile_tier_level(&ptl[..8]), None);
    }

    #[test]
    fn y444_forces_frext() {
        let variant = H265::new();
        let info = VideoInfo::new(PixelFormat::Y444_16, 64, 64);
        let mut config = EncodeConfig {
            profile: HwProfile::Auto,
            gop_length: 30,
            frame_interval_p: 1,
            field_mode: Default::default(),
            rc: nvpipe_core::codec_traits::RcParams {
                mode: nvpipe_core::codec_traits::HwRcMode::Vbr,
                average_bitrate: 0,
                max_bitrate: 0,
                const_qp: Default::default(),
                min_qp: None,
                max_qp: None,
            },
            codec: Default::default(),
        };
        variant
            .set_encoder_config(&info, &DownstreamConstraints::default(), &mut config)
            .unwrap();
        assert_eq!(config.profile, HwProfile::HevcFrext);
        assert_eq!(config.codec.chroma_format_idc, 3);
        assert_eq!(config.codec.bit_depth_minus8, 2);
        assert_eq!(config.codec.idr_period, 30);
        assert!(config.codec.output_aud);
        assert_eq!(config.codec.vui.map(|v| v.video_format), Some(5));
        assert!(variant.sei_payloads().is_empty());
    }
}
