//! H.264 encoder variant.

use nvpipe_core::codec_traits::{DownstreamConstraints, EncodeConfig, EncodeSession, HwProfile};
use nvpipe_core::error::{CodecError, Result};
use nvpipe_core::types::{CodecId, CompressedCaps, PixelFormat, VideoInfo};
use tracing::{debug, info};

use crate::encoder::{CodecVariant, Encoder};

pub type H264Encoder = Encoder<H264>;

/// H.264 hooks: profile and level from downstream, 4:4:4 input.
#[derive(Clone, Copy, Debug, Default)]
pub struct H264;

pub fn profile_from_caps(profile: &str) -> Option<HwProfile> {
    match profile {
        "baseline" | "constrained-baseline" => Some(HwProfile::H264Baseline),
        "main" => Some(HwProfile::H264Main),
        // No dedicated 10-bit profile on the encoder; high carries it.
        "high" | "high-10" => Some(HwProfile::H264High),
        "high-4:4:4" => Some(HwProfile::H264High444),
        _ => None,
    }
}

/// `"4.1"` → 41, `"1b"` → 9.
pub fn level_idc(level: &str) -> Option<u32> {
    if level == "1b" {
        return Some(9);
    }
    let (major, minor) = match level.split_once('.') {
        Some((major, minor)) => (major.parse::<u32>().ok()?, minor.parse::<u32>().ok()?),
        None => (level.parse::<u32>().ok()?, 0),
    };
    (minor <= 9).then_some(major * 10 + minor)
}

/// Profile name from SPS profile_idc and constraint flags.
pub fn profile_name(profile_idc: u8, constraints: u8) -> Option<&'static str> {
    Some(match profile_idc {
        66 if constraints & 0x40 != 0 => "constrained-baseline",
        66 => "baseline",
        77 => "main",
        88 => "extended",
        100 => "high",
        110 => "high-10",
        122 => "high-4:2:2",
        244 => "high-4:4:4",
        _ => return None,
    })
}

pub fn level_name(level_idc: u8, profile_idc: u8, constraints: u8) -> String {
    // Level 1b is signalled as 11 with constraint_set3 in baseline/main.
    if level_idc == 9 || (level_idc == 11 && constraints & 0x10 != 0 && matches!(profile_idc, 66 | 77)) {
        return "1b".into();
    }
    match level_idc % 10 {
        0 => (level_idc / 10).to_string(),
        minor => format!("{}.{minor}", level_idc / 10),
    }
}

impl CodecVariant for H264 {
    const CODEC: CodecId = CodecId::H264;

    fn set_encoder_config(
        &self,
        info: &VideoInfo,
        downstream: &DownstreamConstraints,
        config: &mut EncodeConfig,
    ) -> Result<()> {
        config.profile = match downstream.profiles.first() {
            Some(name) => profile_from_caps(name).ok_or_else(|| {
                CodecError::NotNegotiated(format!("unsupported h264 profile {name}"))
            })?,
            None => HwProfile::Auto,
        };
        config.codec.level = match &downstream.level {
            Some(level) => level_idc(level).ok_or_else(|| {
                CodecError::NotNegotiated(format!("invalid h264 level {level}"))
            })?,
            None => 0,
        };
        config.codec.idr_period = config.gop_length;
        config.codec.chroma_format_idc = 1;
        if info.format == PixelFormat::Y444 {
            debug!("have Y444 input, setting config accordingly");
            config.profile = HwProfile::H264High444;
            config.codec.chroma_format_idc = 3;
        }
        config.codec.output_aud = true;
        Ok(())
    }

    fn output_caps(&self, session: &dyn EncodeSession, info: &VideoInfo) -> Result<CompressedCaps> {
        let seq = session.sequence_params()?;
        // start code, NAL header, profile_idc, constraint flags, level_idc
        if seq.len() < 8 {
            return Err(CodecError::Encode(
                "sequence parameters returned incomplete data".into(),
            ));
        }
        let (profile_idc, constraints, level) = (seq[5], seq[6], seq[7]);

        let mut caps = CompressedCaps::new(CodecId::H264, info.width, info.height)
            .with_framerate(info.fps_n, info.fps_d);
        caps.par_n = info.par_n;
        caps.par_d = info.par_d;
        caps.interlace = info.interlace;
        caps.stream_format = Some("byte-stream".into());
        caps.alignment = Some("au".into());
        caps.profile = profile_name(profile_idc, constraints).map(String::from);
        caps.level = Some(level_name(level, profile_idc, constraints));
        info!(caps = %caps.to_caps_string(), "h264 output caps");
        Ok(caps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_from_downstream() {
        assert_eq!(profile_from_caps("constrained-baseline"), Some(HwProfile::H264Baseline));
        assert_eq!(profile_from_caps("high-4:4:4"), Some(HwProfile::H264High444));
        assert_eq!(profile_from_caps("high-4:2:2"), None);
    }

    #[test]
    fn sps_profile_and_level_names() {
        assert_eq!(profile_name(66, 0x40), Some("constrained-baseline"));
        assert_eq!(profile_name(100, 0), Some("high"));
        assert_eq!(level_name(31, 100, 0), "3.1");
        assert_eq!(level_name(40, 100, 0), "4");
        assert_eq!(level_name(11, 66, 0x10), "1b");
        assert_eq!(level_idc("1b"), Some(9));
        assert_eq!(level_idc("5.1"), Some(51));
    }
}
