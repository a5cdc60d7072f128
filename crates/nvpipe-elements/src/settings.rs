//! Element properties.
//!
//! Encoder settings can change while streaming.  Setters go through
//! [`EncoderProperties`], which raises the reconfiguration flag whenever a
//! value actually changes; the streaming thread consumes the flag at the
//! next frame.

use std::sync::atomic::{AtomicBool, Ordering};

use nvpipe_core::codec_traits::{HwPreset, HwRcMode, ParserParams};
use nvpipe_core::error::{CodecError, Result};
use nvpipe_core::pool::PoolSizing;
use nvpipe_core::types::{CodecId, SECOND};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Upper bound of the `bitrate` property, kbit/s.
pub const MAX_BITRATE_KBPS: u32 = 2_000 * 1024;
pub const MAX_QP: i32 = 51;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    #[default]
    Default,
    Hp,
    Hq,
    LowLatency,
    LowLatencyHq,
    LowLatencyHp,
    Lossless,
    LosslessHp,
}

impl Preset {
    pub const ALL: [Preset; 8] = [
        Self::Default,
        Self::Hp,
        Self::Hq,
        Self::LowLatency,
        Self::LowLatencyHq,
        Self::LowLatencyHp,
        Self::Lossless,
        Self::LosslessHp,
    ];

    pub const fn nick(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Hp => "hp",
            Self::Hq => "hq",
            Self::LowLatency => "low-latency",
            Self::LowLatencyHq => "low-latency-hq",
            Self::LowLatencyHp => "low-latency-hp",
            Self::Lossless => "lossless",
            Self::LosslessHp => "lossless-hp",
        }
    }

    pub fn from_nick(nick: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.nick() == nick)
    }

    /// Hardware preset for this property value.
    ///
    /// `low-latency-hp` has always selected the low-latency high-quality
    /// preset; `correct` opts into the low-latency high-performance one.
    pub fn hw_preset(self, correct: bool) -> HwPreset {
        match self {
            Self::Default => HwPreset::Default,
            Self::Hp => HwPreset::Hp,
            Self::Hq => HwPreset::Hq,
            Self::LowLatency => HwPreset::LowLatencyDefault,
            Self::LowLatencyHq => HwPreset::LowLatencyHq,
            Self::LowLatencyHp if correct => HwPreset::LowLatencyHp,
            Self::LowLatencyHp => {
                warn!(
                    "preset low-latency-hp selects the low-latency-hq hardware preset; \
                     set correct_low_latency_hp_preset to use low-latency-hp"
                );
                HwPreset::LowLatencyHq
            }
            Self::Lossless => HwPreset::LosslessDefault,
            Self::LosslessHp => HwPreset::LosslessHp,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RateControl {
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "constqp")]
    ConstQp,
    #[serde(rename = "cbr")]
    Cbr,
    #[serde(rename = "vbr")]
    Vbr,
    #[serde(rename = "vbr-minqp")]
    VbrMinQp,
}

impl RateControl {
    pub const fn nick(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::ConstQp => "constqp",
            Self::Cbr => "cbr",
            Self::Vbr => "vbr",
            Self::VbrMinQp => "vbr-minqp",
        }
    }

    /// `None` keeps the preset's rate control untouched.
    pub const fn hw_mode(self) -> Option<HwRcMode> {
        match self {
            Self::Default => None,
            Self::ConstQp => Some(HwRcMode::ConstQp),
            Self::Cbr => Some(HwRcMode::Cbr),
            Self::Vbr => Some(HwRcMode::Vbr),
            Self::VbrMinQp => Some(HwRcMode::VbrMinQp),
        }
    }
}

/// Encoder property values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    pub preset: Preset,
    pub rc_mode: RateControl,
    /// -1 = preset.
    pub qp_min: i32,
    pub qp_max: i32,
    pub qp_const: i32,
    /// Frames between keyframes; -1 = infinite, 0 = preset.
    pub gop_size: i32,
    /// kbit/s, 0 = preset.
    pub bitrate: u32,
    pub correct_low_latency_hp_preset: bool,
    pub pool: PoolSizing,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            preset: Preset::Default,
            rc_mode: RateControl::Default,
            qp_min: -1,
            qp_max: -1,
            qp_const: -1,
            gop_size: 75,
            bitrate: 0,
            correct_low_latency_hp_preset: false,
            pool: PoolSizing::default(),
        }
    }
}

fn check_qp(name: &str, qp: i32) -> Result<()> {
    if !(-1..=MAX_QP).contains(&qp) {
        return Err(CodecError::Config(format!(
            "{name} {qp} out of range -1..={MAX_QP}"
        )));
    }
    Ok(())
}

fn check_gop(gop: i32) -> Result<()> {
    if gop < -1 {
        return Err(CodecError::Config(format!("gop-size {gop} below -1")));
    }
    Ok(())
}

fn check_bitrate(bitrate: u32) -> Result<()> {
    if bitrate > MAX_BITRATE_KBPS {
        return Err(CodecError::Config(format!(
            "bitrate {bitrate} above {MAX_BITRATE_KBPS}"
        )));
    }
    Ok(())
}

impl EncoderSettings {
    pub fn validate(&self) -> Result<()> {
        check_qp("qp-min", self.qp_min)?;
        check_qp("qp-max", self.qp_max)?;
        check_qp("qp-const", self.qp_const)?;
        check_gop(self.gop_size)?;
        check_bitrate(self.bitrate)?;
        if self.pool.large_frame_buffers == 0 || self.pool.small_frame_buffers == 0 {
            return Err(CodecError::Config("pool sizes must be non-zero".into()));
        }
        Ok(())
    }

    pub fn hw_preset(&self) -> HwPreset {
        self.preset.hw_preset(self.correct_low_latency_hp_preset)
    }
}

/// Settings shared between the application and the streaming thread.
pub struct EncoderProperties {
    settings: Mutex<EncoderSettings>,
    reconfig: AtomicBool,
}

impl Default for EncoderProperties {
    fn default() -> Self {
        Self::new(EncoderSettings::default())
    }
}

macro_rules! setter {
    ($(#[$meta:meta])* $name:ident, $field:ident, $ty:ty, $check:expr) => {
        $(#[$meta])*
        pub fn $name(&self, value: $ty) -> Result<()> {
            $check(value)?;
            self.update(|s| {
                if s.$field == value {
                    false
                } else {
                    s.$field = value;
                    true
                }
            });
            Ok(())
        }
    };
}

impl EncoderProperties {
    pub fn new(settings: EncoderSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
            reconfig: AtomicBool::new(false),
        }
    }

    /// Current values.
    pub fn snapshot(&self) -> EncoderSettings {
        *self.settings.lock()
    }

    /// Replace every value at once.
    pub fn replace(&self, settings: EncoderSettings) -> Result<()> {
        settings.validate()?;
        self.update(|s| {
            let changed = *s != settings;
            *s = settings;
            changed
        });
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut EncoderSettings) -> bool) {
        let changed = f(&mut self.settings.lock());
        if changed {
            debug!("encoder property changed, reconfiguration scheduled");
            self.schedule_reconfig();
        }
    }

    pub fn set_preset(&self, preset: Preset) {
        self.update(|s| std::mem::replace(&mut s.preset, preset) != preset);
    }

    pub fn set_rc_mode(&self, rc_mode: RateControl) {
        self.update(|s| std::mem::replace(&mut s.rc_mode, rc_mode) != rc_mode);
    }

    setter!(set_qp_min, qp_min, i32, |v| check_qp("qp-min", v));
    setter!(set_qp_max, qp_max, i32, |v| check_qp("qp-max", v));
    setter!(set_qp_const, qp_const, i32, |v| check_qp("qp-const", v));
    setter!(
        /// -1 disables periodic keyframes, 0 keeps the preset's interval.
        set_gop_size,
        gop_size,
        i32,
        check_gop
    );
    setter!(
        /// kbit/s.
        set_bitrate,
        bitrate,
        u32,
        check_bitrate
    );

    pub fn set_correct_low_latency_hp_preset(&self, correct: bool) {
        self.update(|s| {
            std::mem::replace(&mut s.correct_low_latency_hp_preset, correct) != correct
        });
    }

    pub fn schedule_reconfig(&self) {
        self.reconfig.store(true, Ordering::SeqCst);
    }

    /// Consume a pending reconfiguration request.
    pub fn take_reconfig(&self) -> bool {
        self.reconfig.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn clear_reconfig(&self) {
        self.reconfig.store(false, Ordering::SeqCst);
    }

    pub fn reconfig_pending(&self) -> bool {
        self.reconfig.load(Ordering::SeqCst)
    }
}

/// Decoder construction parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderSettings {
    pub device_ordinal: u32,
    pub num_decode_surfaces: u32,
    pub num_output_surfaces: u32,
    pub error_threshold: u32,
    pub max_display_delay: u32,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            device_ordinal: 0,
            num_decode_surfaces: 20,
            num_output_surfaces: 1,
            error_threshold: 100,
            max_display_delay: 0,
        }
    }
}

impl DecoderSettings {
    pub fn validate(&self) -> Result<()> {
        if self.num_decode_surfaces == 0 || self.num_output_surfaces == 0 {
            return Err(CodecError::Config(
                "decoder needs at least one decode and one output surface".into(),
            ));
        }
        if self.error_threshold > 100 {
            return Err(CodecError::Config(format!(
                "error threshold {} above 100%",
                self.error_threshold
            )));
        }
        Ok(())
    }

    pub fn parser_params(&self, codec: CodecId) -> ParserParams {
        ParserParams {
            codec,
            max_decode_surfaces: self.num_decode_surfaces,
            clock_rate: SECOND as u32,
            error_threshold: self.error_threshold,
            max_display_delay: self.max_display_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_property_defaults() {
        let s = EncoderSettings::default();
        assert_eq!(s.gop_size, 75);
        assert_eq!((s.qp_min, s.qp_max, s.qp_const), (-1, -1, -1));
        assert_eq!(s.bitrate, 0);
        assert_eq!(s.preset, Preset::Default);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn setter_raises_flag_only_on_change() {
        let props = EncoderProperties::default();
        props.set_gop_size(75).unwrap();
        assert!(!props.take_reconfig());
        props.set_gop_size(30).unwrap();
        assert!(props.take_reconfig());
        assert!(!props.take_reconfig());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let props = EncoderProperties::default();
        assert!(matches!(props.set_qp_const(52), Err(CodecError::Config(_))));
        assert!(props.set_gop_size(-2).is_err());
        assert!(props.set_bitrate(MAX_BITRATE_KBPS + 1).is_err());
        assert!(!props.reconfig_pending());
        assert!(props.set_bitrate(MAX_BITRATE_KBPS).is_ok());
        assert!(props.reconfig_pending());
    }

    #[test]
    fn low_latency_hp_keeps_legacy_mapping_unless_corrected() {
        assert_eq!(Preset::LowLatencyHp.hw_preset(false), HwPreset::LowLatencyHq);
        assert_eq!(Preset::LowLatencyHp.hw_preset(true), HwPreset::LowLatencyHp);
        assert_eq!(Preset::LowLatency.hw_preset(false), HwPreset::LowLatencyDefault);
    }

    #[test]
    fn nicks_round_trip() {
        for p in Preset::ALL {
            assert_eq!(Preset::from_nick(p.nick()), Some(p));
        }
        assert_eq!(RateControl::VbrMinQp.nick(), "vbr-minqp");
        assert_eq!(RateControl::Default.hw_mode(), None);
    }

    #[test]
    fn settings_load_from_partial_json() {
        let s: EncoderSettings =
            serde_json::from_str(r#"{"preset":"low-latency-hp","rc_mode":"cbr","bitrate":4000}"#)
                .unwrap();
        assert_eq!(s.preset, Preset::LowLatencyHp);
        assert_eq!(s.rc_mode, RateControl::Cbr);
        assert_eq!(s.bitrate, 4000);
        assert_eq!(s.gop_size, 75);
        assert_eq!(s.pool, PoolSizing::default());

        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(serde_json::from_str::<EncoderSettings>(&json).unwrap(), s);

        let d: DecoderSettings = serde_json::from_str(r#"{"max_display_delay":2}"#).unwrap();
        assert_eq!(d.max_display_delay, 2);
        assert_eq!(d.num_decode_surfaces, 20);
    }

    #[test]
    fn parser_params_use_nanosecond_clock() {
        let p = DecoderSettings::default().parser_params(CodecId::H264);
        assert_eq!(p.clock_rate, 1_000_000_000);
        assert_eq!(p.max_decode_surfaces, 20);
        assert_eq!(p.error_threshold, 100);
    }
}
