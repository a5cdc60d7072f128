//! NVENC encode session.
//!
//! [`NvEncodeSession`] implements [`EncodeSession`] on top of the encode API
//! function list.  The session never pushes the CUDA context itself: the
//! element brackets session open, resource registration and mapping with a
//! [`nvpipe_core::context::ContextGuard`].
//!
//! Bitstream locking is safe to call from the drain thread concurrently with
//! submissions; the encoder handle is read atomically and the driver
//! serialises per-buffer access.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use nvpipe_core::codec_traits::{
    CodecConfig, DevicePtr, EncodeConfig, EncodeSession, FieldMode, HwHandle, HwPreset, HwProfile,
    HwRcMode, InitParams, InputBufferDesc, LockedBitstream, PictureParams, PictureStruct,
    PictureType, Qp, RcParams, SubmitStatus, VuiParams,
};
use nvpipe_core::error::{CodecError, Result};
use nvpipe_core::types::{CodecId, PixelFormat};
use nvpipe_cuda::CudaContext;
use nvpipe_cuda::copy::input_surface_size;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::sys::{self, GUID, NV_ENC_BUFFER_FORMAT, check_nvenc, entry, zeroed};

// ─── Lookup tables ───────────────────────────────────────────────────────

const PRESETS: [(HwPreset, GUID); 8] = [
    (HwPreset::Default, sys::NV_ENC_PRESET_DEFAULT_GUID),
    (HwPreset::Hp, sys::NV_ENC_PRESET_HP_GUID),
    (HwPreset::Hq, sys::NV_ENC_PRESET_HQ_GUID),
    (HwPreset::LowLatencyDefault, sys::NV_ENC_PRESET_LOW_LATENCY_DEFAULT_GUID),
    (HwPreset::LowLatencyHq, sys::NV_ENC_PRESET_LOW_LATENCY_HQ_GUID),
    (HwPreset::LowLatencyHp, sys::NV_ENC_PRESET_LOW_LATENCY_HP_GUID),
    (HwPreset::LosslessDefault, sys::NV_ENC_PRESET_LOSSLESS_DEFAULT_GUID),
    (HwPreset::LosslessHp, sys::NV_ENC_PRESET_LOSSLESS_HP_GUID),
];

const PROFILES: [(HwProfile, GUID); 8] = [
    (HwProfile::Auto, sys::NV_ENC_CODEC_PROFILE_AUTOSELECT_GUID),
    (HwProfile::H264Baseline, sys::NV_ENC_H264_PROFILE_BASELINE_GUID),
    (HwProfile::H264Main, sys::NV_ENC_H264_PROFILE_MAIN_GUID),
    (HwProfile::H264High, sys::NV_ENC_H264_PROFILE_HIGH_GUID),
    (HwProfile::H264High444, sys::NV_ENC_H264_PROFILE_HIGH_444_GUID),
    (HwProfile::HevcMain, sys::NV_ENC_HEVC_PROFILE_MAIN_GUID),
    (HwProfile::HevcMain10, sys::NV_ENC_HEVC_PROFILE_MAIN10_GUID),
    (HwProfile::HevcFrext, sys::NV_ENC_HEVC_PROFILE_FREXT_GUID),
];

const FORMATS: [(PixelFormat, NV_ENC_BUFFER_FORMAT); 10] = [
    (PixelFormat::Nv12, sys::NV_ENC_BUFFER_FORMAT_NV12),
    (PixelFormat::Yv12, sys::NV_ENC_BUFFER_FORMAT_YV12),
    (PixelFormat::I420, sys::NV_ENC_BUFFER_FORMAT_IYUV),
    (PixelFormat::Y444, sys::NV_ENC_BUFFER_FORMAT_YUV444),
    (PixelFormat::P010, sys::NV_ENC_BUFFER_FORMAT_YUV420_10BIT),
    (PixelFormat::Y444_16, sys::NV_ENC_BUFFER_FORMAT_YUV444_10BIT),
    (PixelFormat::Bgra, sys::NV_ENC_BUFFER_FORMAT_ARGB),
    (PixelFormat::Rgba, sys::NV_ENC_BUFFER_FORMAT_ABGR),
    (PixelFormat::Bgr10a2, sys::NV_ENC_BUFFER_FORMAT_ARGB10),
    (PixelFormat::Rgb10a2, sys::NV_ENC_BUFFER_FORMAT_ABGR10),
];

pub fn codec_guid(codec: CodecId) -> Result<GUID> {
    match codec {
        CodecId::H264 => Ok(sys::NV_ENC_CODEC_H264_GUID),
        CodecId::H265 => Ok(sys::NV_ENC_CODEC_HEVC_GUID),
        other => Err(CodecError::UnsupportedFormat(format!(
            "NVENC cannot encode {}",
            other.media_type()
        ))),
    }
}

fn codec_from_guid(guid: &GUID) -> Option<CodecId> {
    if *guid == sys::NV_ENC_CODEC_H264_GUID {
        Some(CodecId::H264)
    } else if *guid == sys::NV_ENC_CODEC_HEVC_GUID {
        Some(CodecId::H265)
    } else {
        None
    }
}

/// GUID the driver is asked for when `preset` is selected.
pub fn preset_guid(preset: HwPreset) -> GUID {
    PRESETS
        .iter()
        .find(|(p, _)| *p == preset)
        .map(|(_, g)| *g)
        .unwrap_or(sys::NV_ENC_PRESET_DEFAULT_GUID)
}

fn preset_from_guid(guid: &GUID) -> Option<HwPreset> {
    PRESETS.iter().find(|(_, g)| g == guid).map(|(p, _)| *p)
}

pub fn profile_guid(profile: HwProfile) -> GUID {
    PROFILES
        .iter()
        .find(|(p, _)| *p == profile)
        .map(|(_, g)| *g)
        .unwrap_or(sys::NV_ENC_CODEC_PROFILE_AUTOSELECT_GUID)
}

fn profile_from_guid(guid: &GUID) -> Option<HwProfile> {
    PROFILES.iter().find(|(_, g)| g == guid).map(|(p, _)| *p)
}

pub fn buffer_format(format: PixelFormat) -> Result<NV_ENC_BUFFER_FORMAT> {
    FORMATS
        .iter()
        .find(|(f, _)| *f == format)
        .map(|(_, b)| *b)
        .ok_or_else(|| CodecError::UnsupportedFormat(format!("{format:?} is not an NVENC input")))
}

fn format_from_buffer(format: NV_ENC_BUFFER_FORMAT) -> Option<PixelFormat> {
    FORMATS.iter().find(|(_, b)| *b == format).map(|(f, _)| *f)
}

fn picture_type(raw: u32) -> PictureType {
    match raw {
        sys::NV_ENC_PIC_TYPE_P => PictureType::P,
        sys::NV_ENC_PIC_TYPE_B => PictureType::B,
        sys::NV_ENC_PIC_TYPE_I => PictureType::I,
        sys::NV_ENC_PIC_TYPE_IDR => PictureType::Idr,
        sys::NV_ENC_PIC_TYPE_BI => PictureType::Bi,
        sys::NV_ENC_PIC_TYPE_SKIPPED => PictureType::Skipped,
        _ => PictureType::Unknown,
    }
}

fn rc_mode(mode: HwRcMode) -> sys::NV_ENC_PARAMS_RC_MODE {
    match mode {
        HwRcMode::ConstQp => sys::NV_ENC_PARAMS_RC_CONSTQP,
        HwRcMode::Vbr => sys::NV_ENC_PARAMS_RC_VBR,
        HwRcMode::Cbr => sys::NV_ENC_PARAMS_RC_CBR,
        HwRcMode::VbrMinQp => sys::NV_ENC_PARAMS_RC_VBR_MINQP,
    }
}

fn rc_mode_from_raw(raw: sys::NV_ENC_PARAMS_RC_MODE) -> HwRcMode {
    match raw {
        sys::NV_ENC_PARAMS_RC_CONSTQP => HwRcMode::ConstQp,
        sys::NV_ENC_PARAMS_RC_CBR => HwRcMode::Cbr,
        sys::NV_ENC_PARAMS_RC_VBR_MINQP => HwRcMode::VbrMinQp,
        _ => HwRcMode::Vbr,
    }
}

fn qp_to_raw(qp: Qp) -> sys::NV_ENC_QP {
    sys::NV_ENC_QP {
        qpInterP: qp.inter_p,
        qpInterB: qp.inter_b,
        qpIntra: qp.intra,
    }
}

fn qp_from_raw(qp: &sys::NV_ENC_QP) -> Qp {
    Qp {
        inter_p: qp.qpInterP,
        inter_b: qp.qpInterB,
        intra: qp.qpIntra,
    }
}

fn apply_vui(raw: &mut sys::NV_ENC_VUI_PARAMETERS, vui: &VuiParams) {
    raw.videoSignalTypePresentFlag = 1;
    raw.videoFormat = vui.video_format;
    raw.videoFullRangeFlag = u32::from(vui.full_range);
    raw.colourDescriptionPresentFlag = 1;
    raw.colourPrimaries = vui.colour_primaries;
    raw.transferCharacteristics = vui.transfer_characteristics;
    raw.colourMatrix = vui.matrix_coefficients;
}

/// Overwrite the driver's preset configuration with `config`.
fn apply_config(raw: &mut sys::NV_ENC_CONFIG, codec: CodecId, config: &EncodeConfig) {
    raw.version = sys::NV_ENC_CONFIG_VER;
    raw.profileGUID = profile_guid(config.profile);
    raw.gopLength = config.gop_length;
    raw.frameIntervalP = config.frame_interval_p;
    raw.frameFieldMode = match config.field_mode {
        FieldMode::Frame => sys::NV_ENC_PARAMS_FRAME_FIELD_MODE_FRAME,
        FieldMode::Field => sys::NV_ENC_PARAMS_FRAME_FIELD_MODE_FIELD,
    };

    let rc = &mut raw.rcParams;
    rc.rateControlMode = rc_mode(config.rc.mode);
    rc.averageBitRate = config.rc.average_bitrate;
    rc.maxBitRate = config.rc.max_bitrate;
    rc.constQP = qp_to_raw(config.rc.const_qp);
    rc.flags &= !(sys::NV_ENC_RC_FLAG_ENABLE_MIN_QP | sys::NV_ENC_RC_FLAG_ENABLE_MAX_QP);
    if let Some(min) = config.rc.min_qp {
        rc.flags |= sys::NV_ENC_RC_FLAG_ENABLE_MIN_QP;
        rc.minQP = qp_to_raw(min);
    }
    if let Some(max) = config.rc.max_qp {
        rc.flags |= sys::NV_ENC_RC_FLAG_ENABLE_MAX_QP;
        rc.maxQP = qp_to_raw(max);
    }

    let c = &config.codec;
    match codec {
        CodecId::H264 => {
            // SAFETY: the union holds the H.264 member for an H.264 session.
            let h264 = unsafe { &mut raw.encodeCodecConfig.h264Config };
            h264.level = c.level;
            h264.idrPeriod = c.idr_period;
            h264.chromaFormatIDC = c.chroma_format_idc;
            if c.output_aud {
                h264.flags |= sys::NV_ENC_H264_FLAG_OUTPUT_AUD;
            } else {
                h264.flags &= !sys::NV_ENC_H264_FLAG_OUTPUT_AUD;
            }
            if let Some(vui) = &c.vui {
                apply_vui(&mut h264.h264VUIParameters, vui);
            }
        }
        _ => {
            // SAFETY: the union holds the HEVC member for an H.265 session.
            let hevc = unsafe { &mut raw.encodeCodecConfig.hevcConfig };
            hevc.level = c.level;
            hevc.idrPeriod = c.idr_period;
            let mut flags = hevc.flags
                & !(sys::NV_ENC_HEVC_FLAG_OUTPUT_AUD
                    | sys::NV_ENC_HEVC_CHROMA_FORMAT_MASK
                    | sys::NV_ENC_HEVC_BIT_DEPTH_MASK);
            if c.output_aud {
                flags |= sys::NV_ENC_HEVC_FLAG_OUTPUT_AUD;
            }
            flags |= (c.chroma_format_idc << sys::NV_ENC_HEVC_CHROMA_FORMAT_SHIFT)
                & sys::NV_ENC_HEVC_CHROMA_FORMAT_MASK;
            flags |= (c.bit_depth_minus8 << sys::NV_ENC_HEVC_BIT_DEPTH_SHIFT)
                & sys::NV_ENC_HEVC_BIT_DEPTH_MASK;
            hevc.flags = flags;
            if let Some(vui) = &c.vui {
                apply_vui(&mut hevc.hevcVUIParameters, vui);
            }
        }
    }
}

fn config_from_raw(raw: &sys::NV_ENC_CONFIG, codec: CodecId) -> EncodeConfig {
    let rc = &raw.rcParams;
    let codec_config = match codec {
        CodecId::H264 => {
            // SAFETY: H.264 preset configs populate the H.264 member.
            let h264 = unsafe { &raw.encodeCodecConfig.h264Config };
            CodecConfig {
                level: h264.level,
                idr_period: h264.idrPeriod,
                chroma_format_idc: h264.chromaFormatIDC,
                bit_depth_minus8: 0,
                output_aud: h264.flags & sys::NV_ENC_H264_FLAG_OUTPUT_AUD != 0,
                vui: None,
            }
        }
        _ => {
            // SAFETY: HEVC preset configs populate the HEVC member.
            let hevc = unsafe { &raw.encodeCodecConfig.hevcConfig };
            CodecConfig {
                level: hevc.level,
                idr_period: hevc.idrPeriod,
                chroma_format_idc: (hevc.flags & sys::NV_ENC_HEVC_CHROMA_FORMAT_MASK)
                    >> sys::NV_ENC_HEVC_CHROMA_FORMAT_SHIFT,
                bit_depth_minus8: (hevc.flags & sys::NV_ENC_HEVC_BIT_DEPTH_MASK)
                    >> sys::NV_ENC_HEVC_BIT_DEPTH_SHIFT,
                output_aud: hevc.flags & sys::NV_ENC_HEVC_FLAG_OUTPUT_AUD != 0,
                vui: None,
            }
        }
    };
    EncodeConfig {
        profile: profile_from_guid(&raw.profileGUID).unwrap_or(HwProfile::Auto),
        gop_length: raw.gopLength,
        frame_interval_p: raw.frameIntervalP,
        field_mode: if raw.frameFieldMode == sys::NV_ENC_PARAMS_FRAME_FIELD_MODE_FIELD {
            FieldMode::Field
        } else {
            FieldMode::Frame
        },
        rc: RcParams {
            mode: rc_mode_from_raw(rc.rateControlMode),
            average_bitrate: rc.averageBitRate,
            max_bitrate: rc.maxBitRate,
            const_qp: qp_from_raw(&rc.constQP),
            min_qp: (rc.flags & sys::NV_ENC_RC_FLAG_ENABLE_MIN_QP != 0)
                .then(|| qp_from_raw(&rc.minQP)),
            max_qp: (rc.flags & sys::NV_ENC_RC_FLAG_ENABLE_MAX_QP != 0)
                .then(|| qp_from_raw(&rc.maxQP)),
        },
        codec: codec_config,
    }
}

#[inline]
fn handle(ptr: *mut c_void) -> HwHandle {
    HwHandle(ptr as usize)
}

#[inline]
fn raw_ptr(handle: HwHandle) -> *mut c_void {
    handle.0 as *mut c_void
}

// ─── Session ─────────────────────────────────────────────────────────────

/// One NVENC session bound to a CUDA context.
pub struct NvEncodeSession {
    api: &'static sys::NV_ENCODE_API_FUNCTION_LIST,
    encoder: AtomicUsize,
    /// Codec picked at `initialize`, needed to address the picture-param union.
    codec: Mutex<Option<CodecId>>,
    input_buffers: Mutex<HashMap<HwHandle, InputBufferDesc>>,
    _ctx: Arc<CudaContext>,
}

impl NvEncodeSession {
    /// Open a session on `ctx`.  The context must be current.
    pub fn open(ctx: Arc<CudaContext>) -> Result<Self> {
        let library = sys::nvenc()?;
        let api = &library.api;
        // SAFETY: plain data, fully initialised below.
        let mut params: sys::NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS = unsafe { zeroed() };
        params.version = sys::NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS_VER;
        params.deviceType = sys::NV_ENC_DEVICE_TYPE_CUDA;
        params.device = ctx.raw();
        params.apiVersion = sys::NVENCAPI_VERSION;

        let open = entry(api.nvEncOpenEncodeSessionEx, "nvEncOpenEncodeSessionEx")?;
        let mut encoder: *mut c_void = ptr::null_mut();
        // SAFETY: params are valid and versioned; `encoder` is an out pointer.
        let status = unsafe { open(&mut params, &mut encoder) };
        check_nvenc(status, "nvEncOpenEncodeSessionEx")
            .map_err(|e| CodecError::SessionOpen(e.to_string()))?;
        info!(ordinal = ctx.ordinal(), "NVENC session opened");
        Ok(Self {
            api,
            encoder: AtomicUsize::new(encoder as usize),
            codec: Mutex::new(None),
            input_buffers: Mutex::new(HashMap::new()),
            _ctx: ctx,
        })
    }

    fn encoder(&self) -> Result<*mut c_void> {
        match self.encoder.load(Ordering::Acquire) {
            0 => Err(CodecError::InvalidState {
                expected: "open session",
                actual: "destroyed",
            }),
            ptr => Ok(ptr as *mut c_void),
        }
    }

    fn guid_list(
        &self,
        count_fn: impl FnOnce(*mut c_void, *mut u32) -> sys::NVENCSTATUS,
        list_fn: impl FnOnce(*mut c_void, *mut GUID, u32, *mut u32) -> sys::NVENCSTATUS,
        call: &'static str,
    ) -> Result<Vec<GUID>> {
        let encoder = self.encoder()?;
        let mut count = 0u32;
        check_nvenc(count_fn(encoder, &mut count), call)?;
        let mut guids = vec![GUID::NULL; count as usize];
        let mut written = 0u32;
        check_nvenc(
            list_fn(encoder, guids.as_mut_ptr(), count, &mut written),
            call,
        )?;
        guids.truncate(written as usize);
        Ok(guids)
    }

    fn raw_preset_config(&self, codec: CodecId, preset: HwPreset) -> Result<sys::NV_ENC_CONFIG> {
        let encoder = self.encoder()?;
        let get = entry(self.api.nvEncGetEncodePresetConfig, "nvEncGetEncodePresetConfig")?;
        // SAFETY: plain data.
        let mut preset_config: Box<sys::NV_ENC_PRESET_CONFIG> = Box::new(unsafe { zeroed() });
        preset_config.version = sys::NV_ENC_PRESET_CONFIG_VER;
        preset_config.presetCfg.version = sys::NV_ENC_CONFIG_VER;
        // SAFETY: versioned out struct.
        let status = unsafe {
            get(
                encoder,
                codec_guid(codec)?,
                preset_guid(preset),
                &mut *preset_config,
            )
        };
        check_nvenc(status, "nvEncGetEncodePresetConfig")?;
        Ok(preset_config.presetCfg)
    }

    fn init_params(
        &self,
        params: &InitParams,
        config: &mut sys::NV_ENC_CONFIG,
    ) -> Result<sys::NV_ENC_INITIALIZE_PARAMS> {
        // SAFETY: plain data.
        let mut init: sys::NV_ENC_INITIALIZE_PARAMS = unsafe { zeroed() };
        init.version = sys::NV_ENC_INITIALIZE_PARAMS_VER;
        init.encodeGUID = codec_guid(params.codec)?;
        init.presetGUID = preset_guid(params.preset);
        init.encodeWidth = params.width;
        init.encodeHeight = params.height;
        init.darWidth = params.dar_width;
        init.darHeight = params.dar_height;
        init.frameRateNum = params.fps_n;
        init.frameRateDen = params.fps_d;
        init.enableEncodeAsync = 0;
        init.enablePTD = u32::from(params.enable_ptd);
        init.maxEncodeWidth = params.max_width;
        init.maxEncodeHeight = params.max_height;
        apply_config(config, params.codec, &params.config);
        init.encodeConfig = config;
        Ok(init)
    }
}

// SAFETY: the encoder handle is an opaque driver object that NVENC allows
// to be used from several threads (submission and bitstream locking).
unsafe impl Send for NvEncodeSession {}
unsafe impl Sync for NvEncodeSession {}

impl EncodeSession for NvEncodeSession {
    fn codecs(&self) -> Result<Vec<CodecId>> {
        let count = entry(self.api.nvEncGetEncodeGUIDCount, "nvEncGetEncodeGUIDCount")?;
        let list = entry(self.api.nvEncGetEncodeGUIDs, "nvEncGetEncodeGUIDs")?;
        let guids = self.guid_list(
            // SAFETY: out pointers are valid for the call.
            |enc, n| unsafe { count(enc, n) },
            |enc, out, cap, n| unsafe { list(enc, out, cap, n) },
            "nvEncGetEncodeGUIDs",
        )?;
        Ok(guids.iter().filter_map(codec_from_guid).collect())
    }

    fn presets(&self, codec: CodecId) -> Result<Vec<HwPreset>> {
        let codec_guid = codec_guid(codec)?;
        let count = entry(self.api.nvEncGetEncodePresetCount, "nvEncGetEncodePresetCount")?;
        let list = entry(self.api.nvEncGetEncodePresetGUIDs, "nvEncGetEncodePresetGUIDs")?;
        let guids = self.guid_list(
            // SAFETY: out pointers are valid for the call.
            |enc, n| unsafe { count(enc, codec_guid, n) },
            |enc, out, cap, n| unsafe { list(enc, codec_guid, out, cap, n) },
            "nvEncGetEncodePresetGUIDs",
        )?;
        Ok(guids.iter().filter_map(preset_from_guid).collect())
    }

    fn input_formats(&self, codec: CodecId) -> Result<Vec<PixelFormat>> {
        let encoder = self.encoder()?;
        let codec_guid = codec_guid(codec)?;
        let count_fn = entry(self.api.nvEncGetInputFormatCount, "nvEncGetInputFormatCount")?;
        let list_fn = entry(self.api.nvEncGetInputFormats, "nvEncGetInputFormats")?;
        let mut count = 0u32;
        // SAFETY: out pointer valid.
        check_nvenc(
            unsafe { count_fn(encoder, codec_guid, &mut count) },
            "nvEncGetInputFormatCount",
        )?;
        let mut formats = vec![sys::NV_ENC_BUFFER_FORMAT_UNDEFINED; count as usize];
        let mut written = 0u32;
        // SAFETY: `formats` holds `count` entries.
        check_nvenc(
            unsafe { list_fn(encoder, codec_guid, formats.as_mut_ptr(), count, &mut written) },
            "nvEncGetInputFormats",
        )?;
        formats.truncate(written as usize);
        let mut out: Vec<PixelFormat> = formats.into_iter().filter_map(format_from_buffer).collect();
        out.dedup();
        trace!(?codec, ?out, "NVENC input formats");
        Ok(out)
    }

    fn profiles(&self, codec: CodecId) -> Result<Vec<HwProfile>> {
        let codec_guid = codec_guid(codec)?;
        let count = entry(
            self.api.nvEncGetEncodeProfileGUIDCount,
            "nvEncGetEncodeProfileGUIDCount",
        )?;
        let list = entry(self.api.nvEncGetEncodeProfileGUIDs, "nvEncGetEncodeProfileGUIDs")?;
        let guids = self.guid_list(
            // SAFETY: out pointers are valid for the call.
            |enc, n| unsafe { count(enc, codec_guid, n) },
            |enc, out, cap, n| unsafe { list(enc, codec_guid, out, cap, n) },
            "nvEncGetEncodeProfileGUIDs",
        )?;
        Ok(guids.iter().filter_map(profile_from_guid).collect())
    }

    fn supports_field_encoding(&self, codec: CodecId) -> Result<bool> {
        let encoder = self.encoder()?;
        let caps_fn = entry(self.api.nvEncGetEncodeCaps, "nvEncGetEncodeCaps")?;
        // SAFETY: plain data.
        let mut param: sys::NV_ENC_CAPS_PARAM = unsafe { zeroed() };
        param.version = sys::NV_ENC_CAPS_PARAM_VER;
        param.capsToQuery = sys::NV_ENC_CAPS_SUPPORT_FIELD_ENCODING;
        let mut value = 0;
        // SAFETY: versioned param and valid out pointer.
        check_nvenc(
            unsafe { caps_fn(encoder, codec_guid(codec)?, &mut param, &mut value) },
            "nvEncGetEncodeCaps",
        )?;
        Ok(value > 0)
    }

    fn preset_config(&self, codec: CodecId, preset: HwPreset) -> Result<EncodeConfig> {
        let raw = self.raw_preset_config(codec, preset)?;
        Ok(config_from_raw(&raw, codec))
    }

    fn initialize(&self, params: &InitParams) -> Result<()> {
        let encoder = self.encoder()?;
        let init_fn = entry(self.api.nvEncInitializeEncoder, "nvEncInitializeEncoder")?;
        let mut config = Box::new(self.raw_preset_config(params.codec, params.preset)?);
        let mut init = self.init_params(params, &mut config)?;
        // SAFETY: `init` points at `config`, which outlives the call.
        check_nvenc(unsafe { init_fn(encoder, &mut init) }, "nvEncInitializeEncoder")?;
        *self.codec.lock() = Some(params.codec);
        info!(
            codec = ?params.codec,
            width = params.width,
            height = params.height,
            preset = ?params.preset,
            "NVENC initialised"
        );
        Ok(())
    }

    fn reconfigure(&self, params: &InitParams, reset_encoder: bool, force_idr: bool) -> Result<()> {
        let encoder = self.encoder()?;
        let reconf_fn = entry(self.api.nvEncReconfigureEncoder, "nvEncReconfigureEncoder")?;
        let mut config = Box::new(self.raw_preset_config(params.codec, params.preset)?);
        let init = self.init_params(params, &mut config)?;
        // SAFETY: plain data.
        let mut reconf: Box<sys::NV_ENC_RECONFIGURE_PARAMS> = Box::new(unsafe { zeroed() });
        reconf.version = sys::NV_ENC_RECONFIGURE_PARAMS_VER;
        reconf.reInitEncodeParams = init;
        if reset_encoder {
            reconf.flags |= sys::NV_ENC_RECONFIGURE_FLAG_RESET_ENCODER;
        }
        if force_idr {
            reconf.flags |= sys::NV_ENC_RECONFIGURE_FLAG_FORCE_IDR;
        }
        // SAFETY: `reconf` points at `config`, both outlive the call.
        check_nvenc(
            unsafe { reconf_fn(encoder, &mut *reconf) },
            "nvEncReconfigureEncoder",
        )?;
        debug!(reset_encoder, force_idr, "NVENC reconfigured");
        Ok(())
    }

    fn create_input_buffer(&self, desc: &InputBufferDesc) -> Result<HwHandle> {
        let encoder = self.encoder()?;
        let create = entry(self.api.nvEncCreateInputBuffer, "nvEncCreateInputBuffer")?;
        // SAFETY: plain data.
        let mut params: sys::NV_ENC_CREATE_INPUT_BUFFER = unsafe { zeroed() };
        params.version = sys::NV_ENC_CREATE_INPUT_BUFFER_VER;
        params.width = desc.width;
        params.height = desc.height;
        params.memoryHeap = sys::NV_ENC_MEMORY_HEAP_AUTOSELECT;
        params.bufferFmt = buffer_format(desc.format)?;
        // SAFETY: versioned params.
        check_nvenc(unsafe { create(encoder, &mut params) }, "nvEncCreateInputBuffer")?;
        let buffer = handle(params.inputBuffer);
        self.input_buffers.lock().insert(buffer, *desc);
        Ok(buffer)
    }

    fn destroy_input_buffer(&self, buffer: HwHandle) -> Result<()> {
        let encoder = self.encoder()?;
        let destroy = entry(self.api.nvEncDestroyInputBuffer, "nvEncDestroyInputBuffer")?;
        self.input_buffers.lock().remove(&buffer);
        // SAFETY: the buffer came from `create_input_buffer`.
        check_nvenc(
            unsafe { destroy(encoder, raw_ptr(buffer)) },
            "nvEncDestroyInputBuffer",
        )
    }

    fn write_input_buffer(
        &self,
        buffer: HwHandle,
        write: &mut dyn FnMut(&mut [u8], usize) -> Result<()>,
    ) -> Result<()> {
        let encoder = self.encoder()?;
        let desc = self
            .input_buffers
            .lock()
            .get(&buffer)
            .copied()
            .ok_or_else(|| CodecError::InvariantViolation(format!("unknown input buffer {buffer:?}")))?;
        let lock = entry(self.api.nvEncLockInputBuffer, "nvEncLockInputBuffer")?;
        let unlock = entry(self.api.nvEncUnlockInputBuffer, "nvEncUnlockInputBuffer")?;

        // SAFETY: plain data.
        let mut params: sys::NV_ENC_LOCK_INPUT_BUFFER = unsafe { zeroed() };
        params.version = sys::NV_ENC_LOCK_INPUT_BUFFER_VER;
        params.inputBuffer = raw_ptr(buffer);
        // SAFETY: versioned params on a live input buffer.
        check_nvenc(unsafe { lock(encoder, &mut params) }, "nvEncLockInputBuffer")?;

        let pitch = params.pitch as usize;
        let len = input_surface_size(desc.format, desc.height as usize, pitch);
        // SAFETY: a locked input surface spans at least `len` bytes for its
        // allocation size and format.
        let bytes = unsafe { std::slice::from_raw_parts_mut(params.bufferDataPtr.cast::<u8>(), len) };
        let written = write(bytes, pitch);

        // SAFETY: the buffer was locked above.
        let unlocked = check_nvenc(
            unsafe { unlock(encoder, raw_ptr(buffer)) },
            "nvEncUnlockInputBuffer",
        );
        written.and(unlocked)
    }

    fn register_device_buffer(
        &self,
        ptr: DevicePtr,
        pitch: usize,
        desc: &InputBufferDesc,
    ) -> Result<HwHandle> {
        let encoder = self.encoder()?;
        let register = entry(self.api.nvEncRegisterResource, "nvEncRegisterResource")?;
        // SAFETY: plain data.
        let mut params: sys::NV_ENC_REGISTER_RESOURCE = unsafe { zeroed() };
        params.version = sys::NV_ENC_REGISTER_RESOURCE_VER;
        params.resourceType = sys::NV_ENC_INPUT_RESOURCE_TYPE_CUDADEVICEPTR;
        params.width = desc.width;
        params.height = desc.height;
        params.pitch = pitch as u32;
        params.resourceToRegister = ptr as *mut c_void;
        params.bufferFormat = buffer_format(desc.format)?;
        // SAFETY: `ptr` is a device allocation of the session's context.
        check_nvenc(unsafe { register(encoder, &mut params) }, "nvEncRegisterResource")?;
        Ok(handle(params.registeredResource))
    }

    fn unregister_resource(&self, resource: HwHandle) -> Result<()> {
        let encoder = self.encoder()?;
        let unregister = entry(self.api.nvEncUnregisterResource, "nvEncUnregisterResource")?;
        // SAFETY: the resource came from `register_device_buffer`.
        check_nvenc(
            unsafe { unregister(encoder, raw_ptr(resource)) },
            "nvEncUnregisterResource",
        )
    }

    fn map_resource(&self, resource: HwHandle) -> Result<HwHandle> {
        let encoder = self.encoder()?;
        let map = entry(self.api.nvEncMapInputResource, "nvEncMapInputResource")?;
        // SAFETY: plain data.
        let mut params: sys::NV_ENC_MAP_INPUT_RESOURCE = unsafe { zeroed() };
        params.version = sys::NV_ENC_MAP_INPUT_RESOURCE_VER;
        params.registeredResource = raw_ptr(resource);
        // SAFETY: versioned params on a registered resource.
        check_nvenc(unsafe { map(encoder, &mut params) }, "nvEncMapInputResource")?;
        Ok(handle(params.mappedResource))
    }

    fn unmap_resource(&self, mapped: HwHandle) -> Result<()> {
        let encoder = self.encoder()?;
        let unmap = entry(self.api.nvEncUnmapInputResource, "nvEncUnmapInputResource")?;
        // SAFETY: the handle came from `map_resource`.
        check_nvenc(
            unsafe { unmap(encoder, raw_ptr(mapped)) },
            "nvEncUnmapInputResource",
        )
    }

    fn create_bitstream_buffer(&self, size: usize) -> Result<HwHandle> {
        let encoder = self.encoder()?;
        let create = entry(self.api.nvEncCreateBitstreamBuffer, "nvEncCreateBitstreamBuffer")?;
        // SAFETY: plain data.
        let mut params: sys::NV_ENC_CREATE_BITSTREAM_BUFFER = unsafe { zeroed() };
        params.version = sys::NV_ENC_CREATE_BITSTREAM_BUFFER_VER;
        params.size = size as u32;
        params.memoryHeap = sys::NV_ENC_MEMORY_HEAP_AUTOSELECT;
        // SAFETY: versioned params.
        check_nvenc(
            unsafe { create(encoder, &mut params) },
            "nvEncCreateBitstreamBuffer",
        )?;
        Ok(handle(params.bitstreamBuffer))
    }

    fn destroy_bitstream_buffer(&self, buffer: HwHandle) -> Result<()> {
        let encoder = self.encoder()?;
        let destroy = entry(self.api.nvEncDestroyBitstreamBuffer, "nvEncDestroyBitstreamBuffer")?;
        // SAFETY: the buffer came from `create_bitstream_buffer`.
        check_nvenc(
            unsafe { destroy(encoder, raw_ptr(buffer)) },
            "nvEncDestroyBitstreamBuffer",
        )
    }

    fn encode_picture(&self, params: &PictureParams) -> Result<SubmitStatus> {
        let encoder = self.encoder()?;
        let encode = entry(self.api.nvEncEncodePicture, "nvEncEncodePicture")?;
        let codec = (*self.codec.lock()).ok_or(CodecError::InvalidState {
            expected: "initialised session",
            actual: "uninitialised",
        })?;

        // The driver only reads the payloads during the call.
        let mut sei: Vec<sys::NV_ENC_SEI_PAYLOAD> = params
            .sei
            .iter()
            .map(|p| sys::NV_ENC_SEI_PAYLOAD {
                payloadSize: p.data.len() as u32,
                payloadType: p.payload_type,
                payload: p.data.as_ptr().cast_mut(),
            })
            .collect();

        // SAFETY: plain data.
        let mut pic: Box<sys::NV_ENC_PIC_PARAMS> = Box::new(unsafe { zeroed() });
        pic.version = sys::NV_ENC_PIC_PARAMS_VER;
        pic.inputWidth = params.width;
        pic.inputHeight = params.height;
        pic.inputPitch = params.pitch;
        pic.inputBuffer = raw_ptr(params.input);
        pic.outputBitstream = raw_ptr(params.output);
        pic.bufferFmt = buffer_format(params.format)?;
        pic.frameIdx = params.frame_idx;
        pic.inputTimeStamp = params.pts;
        pic.inputDuration = params.duration;
        pic.pictureStruct = match params.picture_struct {
            PictureStruct::Frame => sys::NV_ENC_PIC_STRUCT_FRAME,
            PictureStruct::FieldTopBottom => sys::NV_ENC_PIC_STRUCT_FIELD_TOP_BOTTOM,
            PictureStruct::FieldBottomTop => sys::NV_ENC_PIC_STRUCT_FIELD_BOTTOM_TOP,
        };
        if params.force_idr {
            pic.encodePicFlags |= sys::NV_ENC_PIC_FLAG_FORCEIDR | sys::NV_ENC_PIC_FLAG_OUTPUT_SPSPPS;
        }
        if !sei.is_empty() {
            pic.codecPicParams = match codec {
                CodecId::H264 => {
                    // SAFETY: plain data.
                    let mut h264: sys::NV_ENC_PIC_PARAMS_H264 = unsafe { zeroed() };
                    h264.seiPayloadArrayCnt = sei.len() as u32;
                    h264.seiPayloadArray = sei.as_mut_ptr();
                    sys::NV_ENC_CODEC_PIC_PARAMS { h264PicParams: h264 }
                }
                _ => {
                    // SAFETY: plain data.
                    let mut hevc: sys::NV_ENC_PIC_PARAMS_HEVC = unsafe { zeroed() };
                    hevc.seiPayloadArrayCnt = sei.len() as u32;
                    hevc.seiPayloadArray = sei.as_mut_ptr();
                    sys::NV_ENC_CODEC_PIC_PARAMS { hevcPicParams: hevc }
                }
            };
        }

        // SAFETY: all handles belong to this session; `sei` outlives the call.
        let status = unsafe { encode(encoder, &mut *pic) };
        match status {
            sys::NV_ENC_SUCCESS => Ok(SubmitStatus::Accepted),
            sys::NV_ENC_ERR_NEED_MORE_INPUT => Ok(SubmitStatus::NeedMoreInput),
            other => check_nvenc(other, "nvEncEncodePicture").map(|()| SubmitStatus::Accepted),
        }
    }

    fn send_eos(&self) -> Result<()> {
        let encoder = self.encoder()?;
        let encode = entry(self.api.nvEncEncodePicture, "nvEncEncodePicture")?;
        // SAFETY: plain data.
        let mut pic: Box<sys::NV_ENC_PIC_PARAMS> = Box::new(unsafe { zeroed() });
        pic.version = sys::NV_ENC_PIC_PARAMS_VER;
        pic.encodePicFlags = sys::NV_ENC_PIC_FLAG_EOS;
        // SAFETY: an EOS picture carries no buffers.
        check_nvenc(unsafe { encode(encoder, &mut *pic) }, "nvEncEncodePicture(EOS)")
    }

    fn lock_bitstream(&self, buffer: HwHandle, wait: bool) -> Result<LockedBitstream> {
        let encoder = self.encoder()?;
        let lock = entry(self.api.nvEncLockBitstream, "nvEncLockBitstream")?;
        // SAFETY: plain data.
        let mut params: Box<sys::NV_ENC_LOCK_BITSTREAM> = Box::new(unsafe { zeroed() });
        params.version = sys::NV_ENC_LOCK_BITSTREAM_VER;
        params.outputBitstream = raw_ptr(buffer);
        if !wait {
            params.flags |= sys::NV_ENC_LOCK_BITSTREAM_FLAG_DO_NOT_WAIT;
        }
        // SAFETY: versioned params on a submitted bitstream buffer.
        check_nvenc(unsafe { lock(encoder, &mut *params) }, "nvEncLockBitstream")?;
        let len = params.bitstreamSizeInBytes as usize;
        let data = if len == 0 || params.bitstreamBufferPtr.is_null() {
            Vec::new()
        } else {
            // SAFETY: the locked buffer holds `len` valid bytes until unlock.
            unsafe { std::slice::from_raw_parts(params.bitstreamBufferPtr.cast::<u8>(), len) }
                .to_vec()
        };
        Ok(LockedBitstream {
            data,
            picture_type: picture_type(params.pictureType),
            pts: params.outputTimeStamp,
        })
    }

    fn unlock_bitstream(&self, buffer: HwHandle) -> Result<()> {
        let encoder = self.encoder()?;
        let unlock = entry(self.api.nvEncUnlockBitstream, "nvEncUnlockBitstream")?;
        // SAFETY: the buffer was locked by `lock_bitstream`.
        check_nvenc(
            unsafe { unlock(encoder, raw_ptr(buffer)) },
            "nvEncUnlockBitstream",
        )
    }

    fn sequence_params(&self) -> Result<Vec<u8>> {
        let encoder = self.encoder()?;
        let get = entry(self.api.nvEncGetSequenceParams, "nvEncGetSequenceParams")?;
        let mut buffer = vec![0u8; 1024];
        let mut size = 0u32;
        // SAFETY: plain data.
        let mut payload: sys::NV_ENC_SEQUENCE_PARAM_PAYLOAD = unsafe { zeroed() };
        payload.version = sys::NV_ENC_SEQUENCE_PARAM_PAYLOAD_VER;
        payload.inBufferSize = buffer.len() as u32;
        payload.spsppsBuffer = buffer.as_mut_ptr().cast();
        payload.outSPSPPSPayloadSize = &mut size;
        // SAFETY: `buffer` and `size` outlive the call.
        check_nvenc(unsafe { get(encoder, &mut payload) }, "nvEncGetSequenceParams")?;
        buffer.truncate(size as usize);
        Ok(buffer)
    }

    fn destroy(&self) -> Result<()> {
        let encoder = self.encoder.swap(0, Ordering::AcqRel);
        if encoder == 0 {
            return Ok(());
        }
        let destroy = entry(self.api.nvEncDestroyEncoder, "nvEncDestroyEncoder")?;
        let leaked = self.input_buffers.lock().len();
        if leaked > 0 {
            warn!(leaked, "destroying NVENC session with live input buffers");
        }
        // SAFETY: the handle was swapped out, no further calls can use it.
        check_nvenc(
            unsafe { destroy(encoder as *mut c_void) },
            "nvEncDestroyEncoder",
        )?;
        info!("NVENC session destroyed");
        Ok(())
    }
}

impl Drop for NvEncodeSession {
    fn drop(&mut self) {
        if let Err(e) = EncodeSession::destroy(self) {
            warn!(%e, "NVENC session teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_preset_has_its_own_guid() {
        assert_eq!(
            preset_guid(HwPreset::LowLatencyHp),
            sys::NV_ENC_PRESET_LOW_LATENCY_HP_GUID
        );
        assert_eq!(
            preset_guid(HwPreset::LowLatencyHq),
            sys::NV_ENC_PRESET_LOW_LATENCY_HQ_GUID
        );
        for (preset, guid) in PRESETS {
            assert_eq!(preset_from_guid(&guid), Some(preset));
        }
    }

    #[test]
    fn buffer_formats_round_trip() {
        for (format, raw) in FORMATS {
            assert_eq!(buffer_format(format).ok(), Some(raw));
            assert_eq!(format_from_buffer(raw), Some(format));
        }
        assert!(buffer_format(PixelFormat::P016).is_err());
    }

    #[test]
    fn hevc_flags_pack_chroma_and_depth() {
        // SAFETY: zero is valid for the config struct.
        let mut raw: sys::NV_ENC_CONFIG = unsafe { zeroed() };
        let config = EncodeConfig {
            profile: HwProfile::HevcFrext,
            gop_length: 30,
            frame_interval_p: 1,
            field_mode: FieldMode::Frame,
            rc: RcParams {
                mode: HwRcMode::Cbr,
                average_bitrate: 4_000_000,
                max_bitrate: 0,
                const_qp: Qp::uniform(20),
                min_qp: Some(Qp::uniform(10)),
                max_qp: None,
            },
            codec: CodecConfig {
                level: 0,
                idr_period: 30,
                chroma_format_idc: 3,
                bit_depth_minus8: 2,
                output_aud: true,
                vui: None,
            },
        };
        apply_config(&mut raw, CodecId::H265, &config);
        let back = config_from_raw(&raw, CodecId::H265);
        assert_eq!(back, config);
    }

    #[test]
    fn unknown_codecs_are_rejected() {
        assert!(codec_guid(CodecId::Vp9).is_err());
        assert_eq!(codec_from_guid(&sys::NV_ENC_CODEC_HEVC_GUID), Some(CodecId::H265));
    }
}
