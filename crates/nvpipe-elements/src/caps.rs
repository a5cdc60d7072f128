//! Encoder capability discovery and input format negotiation.

use nvpipe_core::codec_traits::{EncodeSession, HwPreset, HwProfile};
use nvpipe_core::error::{CodecError, Result};
use nvpipe_core::types::{CodecId, InterlaceMode, PixelFormat};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// Highest chroma index and bit depth downstream profiles ask for.
///
/// Chroma: 0 = 4:2:0, 1 = 4:2:2, 2 = 4:4:4.  Bit depth as
/// `bit_depth - 8`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProfileCeiling {
    pub chroma: u32,
    pub bit_depth_minus8: u32,
}

impl ProfileCeiling {
    /// Raise the ceiling for one profile name.
    pub fn observe(&mut self, profile: &str) {
        if profile.contains("-444") || profile.contains("-4:4:4") {
            self.chroma = 2;
        } else if (profile.contains("-4:2:2") || profile.contains("-422")) && self.chroma < 1 {
            self.chroma = 1;
        }

        if profile.contains("-12") {
            self.bit_depth_minus8 = 4;
        } else if profile.contains("-10") && self.bit_depth_minus8 < 2 {
            self.bit_depth_minus8 = 2;
        }
    }

    /// Ceiling over `profiles`, `None` when the list is empty.
    pub fn from_profiles<S: AsRef<str>>(profiles: &[S]) -> Option<Self> {
        if profiles.is_empty() {
            return None;
        }
        let mut ceiling = Self::default();
        for p in profiles {
            ceiling.observe(p.as_ref());
        }
        Some(ceiling)
    }

    pub fn admits(&self, format: PixelFormat) -> bool {
        match format {
            // 8-bit 4:2:0 and RGB are encoded as 4:2:0.
            PixelFormat::Nv12
            | PixelFormat::Yv12
            | PixelFormat::I420
            | PixelFormat::Bgra
            | PixelFormat::Rgba => true,
            PixelFormat::Y444 => self.chroma >= 2,
            PixelFormat::P010
            | PixelFormat::Bgr10a2
            | PixelFormat::Rgb10a2
            | PixelFormat::Y444_16 => self.bit_depth_minus8 >= 2,
            PixelFormat::P016 => false,
        }
    }
}

/// Input formats acceptable for the downstream `profiles`.
///
/// Without profiles, or when no supported format fits the ceiling, every
/// supported format is offered.
pub fn filter_input_formats<S: AsRef<str>>(
    supported: &[PixelFormat],
    profiles: &[S],
) -> Vec<PixelFormat> {
    let Some(ceiling) = ProfileCeiling::from_profiles(profiles) else {
        return supported.to_vec();
    };
    trace!(
        max_chroma = ceiling.chroma,
        max_bit_depth = ceiling.bit_depth_minus8 + 8,
        "downstream profile ceiling"
    );
    let filtered: Vec<_> = supported
        .iter()
        .copied()
        .filter(|f| ceiling.admits(*f))
        .collect();
    if filtered.is_empty() {
        warn!("cannot find matching input format");
        return supported.to_vec();
    }
    filtered
}

/// What one encoder session offers for one codec.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderCapabilities {
    pub codec: CodecId,
    pub input_formats: Vec<PixelFormat>,
    pub interlace_modes: Vec<InterlaceMode>,
    pub profiles: Vec<HwProfile>,
    pub presets: Vec<HwPreset>,
}

impl EncoderCapabilities {
    /// Query an open session.  Fails when the codec takes no input format.
    pub fn probe(session: &dyn EncodeSession, codec: CodecId) -> Result<Self> {
        if !session.codecs()?.contains(&codec) {
            return Err(CodecError::UnsupportedFormat(format!(
                "encoder has no {codec:?} support"
            )));
        }
        let input_formats = session.input_formats(codec)?;
        if input_formats.is_empty() {
            return Err(CodecError::UnsupportedFormat(format!(
                "no supported input formats for {codec:?}"
            )));
        }
        let mut interlace_modes = vec![InterlaceMode::Progressive];
        if session.supports_field_encoding(codec)? {
            interlace_modes.extend([InterlaceMode::Interleaved, InterlaceMode::Mixed]);
        }
        let caps = Self {
            codec,
            input_formats,
            interlace_modes,
            profiles: session.profiles(codec)?,
            presets: session.presets(codec)?,
        };
        debug!(
            ?codec,
            formats = caps.input_formats.len(),
            interlaced = caps.interlace_modes.len() > 1,
            "encoder capabilities"
        );
        Ok(caps)
    }

    /// Sink formats for the given downstream profiles.
    pub fn sink_formats<S: AsRef<str>>(&self, downstream_profiles: &[S]) -> Vec<PixelFormat> {
        filter_input_formats(&self.input_formats, downstream_profiles)
    }

    pub fn accepts_interlace(&self, mode: InterlaceMode) -> bool {
        self.interlace_modes.contains(&mode)
    }

    /// Caps-style description of the sink side, for inspection.
    pub fn sink_caps_string(&self) -> String {
        let formats: Vec<_> = self.input_formats.iter().map(|f| f.caps_name()).collect();
        let modes: Vec<_> = self.interlace_modes.iter().map(|m| m.caps_name()).collect();
        format!(
            "video/x-raw, format={{ {} }}, interlace-mode={{ {} }}",
            formats.join(", "),
            modes.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_INPUTS: [PixelFormat; 9] = [
        PixelFormat::Nv12,
        PixelFormat::Yv12,
        PixelFormat::I420,
        PixelFormat::Bgra,
        PixelFormat::Rgba,
        PixelFormat::Y444,
        PixelFormat::P010,
        PixelFormat::Y444_16,
        PixelFormat::Bgr10a2,
    ];

    #[test]
    fn main_profile_keeps_8bit_420_and_rgb() {
        let formats = filter_input_formats(&ALL_INPUTS, &["main"]);
        assert_eq!(
            formats,
            vec![
                PixelFormat::Nv12,
                PixelFormat::Yv12,
                PixelFormat::I420,
                PixelFormat::Bgra,
                PixelFormat::Rgba
            ]
        );
    }

    #[test]
    fn main_444_admits_y444_but_not_high_depth() {
        let formats = filter_input_formats(&ALL_INPUTS, &["main-444"]);
        assert!(formats.contains(&PixelFormat::Y444));
        assert!(!formats.contains(&PixelFormat::P010));
    }

    #[test]
    fn main_10_admits_high_depth() {
        let formats = filter_input_formats(&ALL_INPUTS, &["main", "main-10"]);
        assert!(formats.contains(&PixelFormat::P010));
        assert!(formats.contains(&PixelFormat::Y444_16));
        assert!(!formats.contains(&PixelFormat::Y444));
    }

    #[test]
    fn ceiling_only_rises() {
        let c = ProfileCeiling::from_profiles(&["high-4:4:4", "main-422-10"]).unwrap();
        assert_eq!(c.chroma, 2);
        assert_eq!(c.bit_depth_minus8, 2);
        let c = ProfileCeiling::from_profiles(&["main-12", "main-10"]).unwrap();
        assert_eq!(c.bit_depth_minus8, 4);
    }

    #[test]
    fn no_profile_or_no_match_returns_everything() {
        let none: [&str; 0] = [];
        assert_eq!(filter_input_formats(&ALL_INPUTS, &none), ALL_INPUTS.to_vec());
        let only_444 = [PixelFormat::Y444];
        assert_eq!(filter_input_formats(&only_444, &["main"]), vec![PixelFormat::Y444]);
    }
}
