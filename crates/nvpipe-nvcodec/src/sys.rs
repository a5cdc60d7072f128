//! Raw FFI bindings to NVIDIA Video Codec SDK (nvcuvid + nvEncodeAPI).
//!
//! Covers the subset used by [`crate::nvenc`] and [`crate::nvdec`].  Struct
//! layouts follow the Video Codec SDK 9.0 headers, the last API revision
//! that still accepts the legacy preset GUIDs.
//!
//! # Loading
//!
//! Both libraries are opened at runtime with `libloading` and cached per
//! process; nothing is linked at build time.
//!
//! # Safety
//!
//! Every function pointer here is a raw driver entry point.  The safe
//! wrappers in `nvenc.rs` and `nvdec.rs` own the handles and enforce the
//! call ordering the driver expects.

#![allow(non_camel_case_types, non_snake_case, dead_code)]

use std::ffi::{c_int, c_short, c_uint, c_ulong, c_void};
use std::sync::OnceLock;

use libloading::Library;
use nvpipe_core::error::{CodecError, Result};
use nvpipe_cuda::sys::{open_first, symbol};
use tracing::debug;

pub use nvpipe_cuda::sys::{CUcontext, CUdeviceptr, CUresult, CUstream, CUDA_SUCCESS};

// ═══════════════════════════════════════════════════════════════════════════
//  NVDEC: cuviddec.h / nvcuvid.h
// ═══════════════════════════════════════════════════════════════════════════

/// Opaque decoder handle.
pub type CUvideodecoder = *mut c_void;

/// Opaque parser handle.
pub type CUvideoparser = *mut c_void;

/// Parser timestamp (in `ulClockRate` units).
pub type CUvideotimestamp = i64;

// ─── Enums ───────────────────────────────────────────────────────────────

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum cudaVideoCodec {
    MPEG1 = 0,
    MPEG2 = 1,
    MPEG4 = 2,
    VC1 = 3,
    H264 = 4,
    JPEG = 5,
    H264_SVC = 6,
    H264_MVC = 7,
    HEVC = 8,
    VP8 = 9,
    VP9 = 10,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum cudaVideoSurfaceFormat {
    NV12 = 0,
    P016 = 1,
    YUV444 = 2,
    YUV444_16Bit = 3,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum cudaVideoChromaFormat {
    Monochrome = 0,
    YUV420 = 1,
    YUV422 = 2,
    YUV444 = 3,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum cudaVideoDeinterlaceMode {
    Weave = 0,
    Bob = 1,
    Adaptive = 2,
}

/// `cudaVideoCreateFlags`.
pub const CUDA_VIDEO_CREATE_DEFAULT: c_ulong = 0;
pub const CUDA_VIDEO_CREATE_PREFER_CUDA: c_ulong = 1;
pub const CUDA_VIDEO_CREATE_PREFER_DXVA: c_ulong = 2;
pub const CUDA_VIDEO_CREATE_PREFER_CUVID: c_ulong = 4;

// ─── Structs ─────────────────────────────────────────────────────────────

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CUVIDRECT {
    pub left: c_short,
    pub top: c_short,
    pub right: c_short,
    pub bottom: c_short,
}

/// `CUVIDDECODECREATEINFO`.
#[repr(C)]
pub struct CUVIDDECODECREATEINFO {
    pub ulWidth: c_ulong,
    pub ulHeight: c_ulong,
    pub ulNumDecodeSurfaces: c_ulong,
    pub CodecType: cudaVideoCodec,
    pub ChromaFormat: cudaVideoChromaFormat,
    pub ulCreationFlags: c_ulong,
    pub bitDepthMinus8: c_ulong,
    pub ulIntraDecodeOnly: c_ulong,
    pub ulMaxWidth: c_ulong,
    pub ulMaxHeight: c_ulong,
    pub Reserved1: c_ulong,
    pub display_area: CUVIDRECT,
    pub OutputFormat: cudaVideoSurfaceFormat,
    pub DeinterlaceMode: cudaVideoDeinterlaceMode,
    pub ulTargetWidth: c_ulong,
    pub ulTargetHeight: c_ulong,
    pub ulNumOutputSurfaces: c_ulong,
    pub vidLock: *mut c_void,
    pub target_rect: CUVIDRECT,
    pub Reserved2: [c_ulong; 5],
}

/// `CUVIDPICPARAMS`: only the leading fields are read here; the
/// codec-specific tail is filled by the parser and passed through.
#[repr(C)]
pub struct CUVIDPICPARAMS {
    pub PicWidthInMbs: c_int,
    pub FrameHeightInMbs: c_int,
    pub CurrPicIdx: c_int,
    pub field_pic_flag: c_int,
    pub bottom_field_flag: c_int,
    pub second_field: c_int,
    pub nBitstreamDataLen: c_uint,
    pub pBitstreamData: *const u8,
    pub nNumSlices: c_uint,
    pub pSliceDataOffsets: *const c_uint,
    pub ref_pic_flag: c_int,
    pub intra_pic_flag: c_int,
    pub Reserved: [c_uint; 30],
    pub CodecSpecific: [u8; 1024],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CUVIDFRAMERATE {
    pub numerator: c_uint,
    pub denominator: c_uint,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CUVIDDISPLAYAREA {
    pub left: c_int,
    pub top: c_int,
    pub right: c_int,
    pub bottom: c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CUVIDASPECTRATIO {
    pub x: c_int,
    pub y: c_int,
}

/// `video_signal_description`; byte 0 packs `video_format:3`,
/// `video_full_range_flag:1` and four reserved bits.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CUVIDSIGNALDESCRIPTION {
    pub flags: u8,
    pub color_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
}

impl CUVIDSIGNALDESCRIPTION {
    pub fn video_format(&self) -> u8 {
        self.flags & 0x7
    }

    pub fn video_full_range_flag(&self) -> bool {
        self.flags & 0x8 != 0
    }
}

/// `CUVIDEOFORMAT`, delivered to the sequence callback.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct CUVIDEOFORMAT {
    pub codec: cudaVideoCodec,
    pub frame_rate: CUVIDFRAMERATE,
    pub progressive_sequence: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub min_num_decode_surfaces: u8,
    pub coded_width: c_uint,
    pub coded_height: c_uint,
    pub display_area: CUVIDDISPLAYAREA,
    pub chroma_format: cudaVideoChromaFormat,
    pub bitrate: c_uint,
    pub display_aspect_ratio: CUVIDASPECTRATIO,
    pub video_signal_description: CUVIDSIGNALDESCRIPTION,
    pub seqhdr_data_length: c_uint,
}

/// `CUVIDPARSERDISPINFO`, delivered to the display callback.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct CUVIDPARSERDISPINFO {
    pub picture_index: c_int,
    pub progressive_frame: c_int,
    pub top_field_first: c_int,
    pub repeat_first_field: c_int,
    pub timestamp: CUvideotimestamp,
}

pub type PFNVIDSEQUENCECALLBACK =
    Option<unsafe extern "C" fn(user: *mut c_void, format: *mut CUVIDEOFORMAT) -> c_int>;
pub type PFNVIDDECODECALLBACK =
    Option<unsafe extern "C" fn(user: *mut c_void, params: *mut CUVIDPICPARAMS) -> c_int>;
pub type PFNVIDDISPLAYCALLBACK =
    Option<unsafe extern "C" fn(user: *mut c_void, info: *mut CUVIDPARSERDISPINFO) -> c_int>;

/// `CUVIDPARSERPARAMS`.
#[repr(C)]
pub struct CUVIDPARSERPARAMS {
    pub CodecType: cudaVideoCodec,
    pub ulMaxNumDecodeSurfaces: c_uint,
    pub ulClockRate: c_uint,
    pub ulErrorThreshold: c_uint,
    pub ulMaxDisplayDelay: c_uint,
    pub uReserved1: [c_uint; 5],
    pub pUserData: *mut c_void,
    pub pfnSequenceCallback: PFNVIDSEQUENCECALLBACK,
    pub pfnDecodePicture: PFNVIDDECODECALLBACK,
    pub pfnDisplayPicture: PFNVIDDISPLAYCALLBACK,
    pub pvReserved2: [*mut c_void; 7],
    pub pExtVideoInfo: *mut c_void,
}

/// `CUvideopacketflags`.
pub const CUVID_PKT_ENDOFSTREAM: c_ulong = 0x01;
pub const CUVID_PKT_TIMESTAMP: c_ulong = 0x02;
pub const CUVID_PKT_DISCONTINUITY: c_ulong = 0x04;
pub const CUVID_PKT_ENDOFPICTURE: c_ulong = 0x08;

/// `CUVIDSOURCEDATAPACKET`.
#[repr(C)]
pub struct CUVIDSOURCEDATAPACKET {
    pub flags: c_ulong,
    pub payload_size: c_ulong,
    pub payload: *const u8,
    pub timestamp: CUvideotimestamp,
}

/// `CUVIDPROCPARAMS`.
#[repr(C)]
pub struct CUVIDPROCPARAMS {
    pub progressive_frame: c_int,
    pub second_field: c_int,
    pub top_field_first: c_int,
    pub unpaired_field: c_int,
    pub reserved_flags: c_uint,
    pub reserved_zero: c_uint,
    pub raw_input_dptr: u64,
    pub raw_input_pitch: c_uint,
    pub raw_input_format: c_uint,
    pub raw_output_dptr: u64,
    pub raw_output_pitch: c_uint,
    pub Reserved1: c_uint,
    pub output_stream: CUstream,
    pub Reserved: [c_uint; 46],
    pub Reserved2: [*mut c_void; 2],
}

/// `CUVIDDECODECAPS`.
#[repr(C)]
pub struct CUVIDDECODECAPS {
    pub eCodecType: cudaVideoCodec,
    pub eChromaFormat: cudaVideoChromaFormat,
    pub nBitDepthMinus8: c_uint,
    pub reserved1: [c_uint; 3],
    pub bIsSupported: u8,
    pub reserved2: u8,
    pub nOutputFormatMask: u16,
    pub nMaxWidth: c_uint,
    pub nMaxHeight: c_uint,
    pub nMaxMBCount: c_uint,
    pub nMinWidth: u16,
    pub nMinHeight: u16,
    pub reserved3: [c_uint; 11],
}

// ═══════════════════════════════════════════════════════════════════════════
//  NVDEC LIBRARY
// ═══════════════════════════════════════════════════════════════════════════

/// Resolved nvcuvid entry points.
pub struct NvcuvidLibrary {
    _lib: Library,

    pub cuvidCreateVideoParser:
        unsafe extern "C" fn(*mut CUvideoparser, *mut CUVIDPARSERPARAMS) -> CUresult,
    pub cuvidParseVideoData:
        unsafe extern "C" fn(CUvideoparser, *mut CUVIDSOURCEDATAPACKET) -> CUresult,
    pub cuvidDestroyVideoParser: unsafe extern "C" fn(CUvideoparser) -> CUresult,

    pub cuvidCreateDecoder:
        unsafe extern "C" fn(*mut CUvideodecoder, *mut CUVIDDECODECREATEINFO) -> CUresult,
    pub cuvidDestroyDecoder: unsafe extern "C" fn(CUvideodecoder) -> CUresult,
    pub cuvidDecodePicture: unsafe extern "C" fn(CUvideodecoder, *mut CUVIDPICPARAMS) -> CUresult,
    pub cuvidMapVideoFrame: unsafe extern "C" fn(
        CUvideodecoder,
        c_int,
        *mut CUdeviceptr,
        *mut c_uint,
        *mut CUVIDPROCPARAMS,
    ) -> CUresult,
    pub cuvidUnmapVideoFrame: unsafe extern "C" fn(CUvideodecoder, CUdeviceptr) -> CUresult,

    /// Missing from drivers older than the 9.0 SDK.
    pub cuvidGetDecoderCaps: Option<unsafe extern "C" fn(*mut CUVIDDECODECAPS) -> CUresult>,
}

// SAFETY: function pointers only; `_lib` keeps them valid.
unsafe impl Send for NvcuvidLibrary {}
unsafe impl Sync for NvcuvidLibrary {}

static NVCUVID: OnceLock<std::result::Result<NvcuvidLibrary, String>> = OnceLock::new();

fn load_nvcuvid() -> std::result::Result<NvcuvidLibrary, String> {
    let candidates: &[&'static str] = if cfg!(target_os = "windows") {
        &["nvcuvid.dll"]
    } else {
        &["libnvcuvid.so.1", "libnvcuvid.so"]
    };
    let lib = open_first(candidates)?;
    // SAFETY: signatures match nvcuvid.h/cuviddec.h; the 64-bit map entry
    // points are the ones the unsuffixed macros resolve to on 64-bit hosts.
    let library = unsafe {
        NvcuvidLibrary {
            cuvidCreateVideoParser: symbol(&lib, "cuvidCreateVideoParser")?,
            cuvidParseVideoData: symbol(&lib, "cuvidParseVideoData")?,
            cuvidDestroyVideoParser: symbol(&lib, "cuvidDestroyVideoParser")?,
            cuvidCreateDecoder: symbol(&lib, "cuvidCreateDecoder")?,
            cuvidDestroyDecoder: symbol(&lib, "cuvidDestroyDecoder")?,
            cuvidDecodePicture: symbol(&lib, "cuvidDecodePicture")?,
            cuvidMapVideoFrame: symbol(&lib, "cuvidMapVideoFrame64")?,
            cuvidUnmapVideoFrame: symbol(&lib, "cuvidUnmapVideoFrame64")?,
            cuvidGetDecoderCaps: symbol(&lib, "cuvidGetDecoderCaps").ok(),
            _lib: lib,
        }
    };
    debug!(
        caps_query = library.cuvidGetDecoderCaps.is_some(),
        "nvcuvid resolved"
    );
    Ok(library)
}

/// The process-wide nvcuvid table, loading it on first use.
pub fn nvcuvid() -> Result<&'static NvcuvidLibrary> {
    NVCUVID
        .get_or_init(load_nvcuvid)
        .as_ref()
        .map_err(|reason| CodecError::LibraryLoad {
            library: "libnvcuvid".into(),
            reason: reason.clone(),
        })
}

// ═══════════════════════════════════════════════════════════════════════════
//  NVENC: nvEncodeAPI.h
// ═══════════════════════════════════════════════════════════════════════════

pub type NVENCSTATUS = c_int;

pub const NV_ENC_SUCCESS: NVENCSTATUS = 0;
pub const NV_ENC_ERR_NO_ENCODE_DEVICE: NVENCSTATUS = 1;
pub const NV_ENC_ERR_UNSUPPORTED_DEVICE: NVENCSTATUS = 2;
pub const NV_ENC_ERR_INVALID_ENCODERDEVICE: NVENCSTATUS = 3;
pub const NV_ENC_ERR_INVALID_DEVICE: NVENCSTATUS = 4;
pub const NV_ENC_ERR_DEVICE_NOT_EXIST: NVENCSTATUS = 5;
pub const NV_ENC_ERR_INVALID_PTR: NVENCSTATUS = 6;
pub const NV_ENC_ERR_INVALID_EVENT: NVENCSTATUS = 7;
pub const NV_ENC_ERR_INVALID_PARAM: NVENCSTATUS = 8;
pub const NV_ENC_ERR_INVALID_CALL: NVENCSTATUS = 9;
pub const NV_ENC_ERR_OUT_OF_MEMORY: NVENCSTATUS = 10;
pub const NV_ENC_ERR_ENCODER_NOT_INITIALIZED: NVENCSTATUS = 11;
pub const NV_ENC_ERR_UNSUPPORTED_PARAM: NVENCSTATUS = 12;
pub const NV_ENC_ERR_LOCK_BUSY: NVENCSTATUS = 13;
pub const NV_ENC_ERR_NOT_ENOUGH_BUFFER: NVENCSTATUS = 14;
pub const NV_ENC_ERR_INVALID_VERSION: NVENCSTATUS = 15;
pub const NV_ENC_ERR_MAP_FAILED: NVENCSTATUS = 16;
pub const NV_ENC_ERR_NEED_MORE_INPUT: NVENCSTATUS = 17;
pub const NV_ENC_ERR_ENCODER_BUSY: NVENCSTATUS = 18;
pub const NV_ENC_ERR_EVENT_NOT_REGISTERD: NVENCSTATUS = 19;
pub const NV_ENC_ERR_GENERIC: NVENCSTATUS = 20;
pub const NV_ENC_ERR_INCOMPATIBLE_CLIENT_KEY: NVENCSTATUS = 21;
pub const NV_ENC_ERR_UNIMPLEMENTED: NVENCSTATUS = 22;
pub const NV_ENC_ERR_RESOURCE_REGISTER_FAILED: NVENCSTATUS = 23;
pub const NV_ENC_ERR_RESOURCE_NOT_REGISTERED: NVENCSTATUS = 24;
pub const NV_ENC_ERR_RESOURCE_NOT_MAPPED: NVENCSTATUS = 25;

// ─── Versioning ──────────────────────────────────────────────────────────

pub const NVENCAPI_MAJOR_VERSION: u32 = 9;
pub const NVENCAPI_MINOR_VERSION: u32 = 0;
pub const NVENCAPI_VERSION: u32 = NVENCAPI_MAJOR_VERSION | (NVENCAPI_MINOR_VERSION << 24);

/// `NVENCAPI_STRUCT_VERSION(ver)`.
pub const fn nvenc_struct_version(ver: u32) -> u32 {
    NVENCAPI_VERSION | (ver << 16) | (0x7 << 28)
}

pub const NV_ENCODE_API_FUNCTION_LIST_VER: u32 = nvenc_struct_version(2);
pub const NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS_VER: u32 = nvenc_struct_version(1);
pub const NV_ENC_CAPS_PARAM_VER: u32 = nvenc_struct_version(1);
pub const NV_ENC_RC_PARAMS_VER: u32 = nvenc_struct_version(1);
pub const NV_ENC_CONFIG_VER: u32 = nvenc_struct_version(7) | (1 << 31);
pub const NV_ENC_PRESET_CONFIG_VER: u32 = nvenc_struct_version(4) | (1 << 31);
pub const NV_ENC_INITIALIZE_PARAMS_VER: u32 = nvenc_struct_version(5) | (1 << 31);
pub const NV_ENC_RECONFIGURE_PARAMS_VER: u32 = nvenc_struct_version(1) | (1 << 31);
pub const NV_ENC_CREATE_INPUT_BUFFER_VER: u32 = nvenc_struct_version(1);
pub const NV_ENC_LOCK_INPUT_BUFFER_VER: u32 = nvenc_struct_version(1);
pub const NV_ENC_CREATE_BITSTREAM_BUFFER_VER: u32 = nvenc_struct_version(1);
pub const NV_ENC_LOCK_BITSTREAM_VER: u32 = nvenc_struct_version(1);
pub const NV_ENC_REGISTER_RESOURCE_VER: u32 = nvenc_struct_version(3);
pub const NV_ENC_MAP_INPUT_RESOURCE_VER: u32 = nvenc_struct_version(4);
pub const NV_ENC_PIC_PARAMS_VER: u32 = nvenc_struct_version(4) | (1 << 31);
pub const NV_ENC_SEQUENCE_PARAM_PAYLOAD_VER: u32 = nvenc_struct_version(1);

// ─── GUIDs ───────────────────────────────────────────────────────────────

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct GUID {
    pub Data1: u32,
    pub Data2: u16,
    pub Data3: u16,
    pub Data4: [u8; 8],
}

impl GUID {
    pub const NULL: Self = Self {
        Data1: 0,
        Data2: 0,
        Data3: 0,
        Data4: [0; 8],
    };
}

pub const NV_ENC_CODEC_H264_GUID: GUID = GUID {
    Data1: 0x6bc8_2762,
    Data2: 0x4e63,
    Data3: 0x4ca4,
    Data4: [0xaa, 0x85, 0x1e, 0x50, 0xf3, 0x21, 0xf6, 0xbf],
};

pub const NV_ENC_CODEC_HEVC_GUID: GUID = GUID {
    Data1: 0x790c_dc88,
    Data2: 0x4522,
    Data3: 0x4d7b,
    Data4: [0x94, 0x25, 0xbd, 0xa9, 0x97, 0x5f, 0x76, 0x03],
};

pub const NV_ENC_PRESET_DEFAULT_GUID: GUID = GUID {
    Data1: 0xb2df_b705,
    Data2: 0x4ebd,
    Data3: 0x4c49,
    Data4: [0x9b, 0x5f, 0x24, 0xa7, 0x77, 0xd3, 0xe5, 0x87],
};

pub const NV_ENC_PRESET_HP_GUID: GUID = GUID {
    Data1: 0x60e4_c59f,
    Data2: 0xe846,
    Data3: 0x4484,
    Data4: [0xa5, 0x6d, 0xcd, 0x45, 0xbe, 0x9f, 0xdd, 0xf6],
};

pub const NV_ENC_PRESET_HQ_GUID: GUID = GUID {
    Data1: 0x34db_a71d,
    Data2: 0xa77b,
    Data3: 0x4b8f,
    Data4: [0x9c, 0x3e, 0xb6, 0xd5, 0xda, 0x24, 0xc0, 0x12],
};

pub const NV_ENC_PRESET_LOW_LATENCY_DEFAULT_GUID: GUID = GUID {
    Data1: 0x49df_21c5,
    Data2: 0x6dfa,
    Data3: 0x4feb,
    Data4: [0x97, 0x87, 0x6a, 0xcc, 0x9e, 0xff, 0xb7, 0x26],
};

pub const NV_ENC_PRESET_LOW_LATENCY_HQ_GUID: GUID = GUID {
    Data1: 0xc5f7_33b9,
    Data2: 0xea97,
    Data3: 0x4cf9,
    Data4: [0xbe, 0xc2, 0xbf, 0x78, 0xa7, 0x4f, 0xd1, 0x05],
};

pub const NV_ENC_PRESET_LOW_LATENCY_HP_GUID: GUID = GUID {
    Data1: 0x6708_2a44,
    Data2: 0x4bad,
    Data3: 0x48fa,
    Data4: [0x98, 0xea, 0x93, 0x05, 0x6d, 0x15, 0x0a, 0x58],
};

pub const NV_ENC_PRESET_LOSSLESS_DEFAULT_GUID: GUID = GUID {
    Data1: 0xd5bf_b716,
    Data2: 0xc604,
    Data3: 0x44e7,
    Data4: [0x9b, 0xb8, 0xde, 0xa5, 0x51, 0x0f, 0xc3, 0xac],
};

pub const NV_ENC_PRESET_LOSSLESS_HP_GUID: GUID = GUID {
    Data1: 0x1499_98e7,
    Data2: 0x2364,
    Data3: 0x411d,
    Data4: [0x82, 0xef, 0x17, 0x98, 0x88, 0x09, 0x34, 0x09],
};

pub const NV_ENC_CODEC_PROFILE_AUTOSELECT_GUID: GUID = GUID {
    Data1: 0xbfd6_f8e7,
    Data2: 0x233c,
    Data3: 0x4341,
    Data4: [0x8b, 0x3e, 0x48, 0x18, 0x52, 0x38, 0x03, 0xf4],
};

pub const NV_ENC_H264_PROFILE_BASELINE_GUID: GUID = GUID {
    Data1: 0x0727_bcaa,
    Data2: 0x78c4,
    Data3: 0x4c83,
    Data4: [0x8c, 0x2f, 0xef, 0x3d, 0xff, 0x26, 0x7c, 0x6a],
};

pub const NV_ENC_H264_PROFILE_MAIN_GUID: GUID = GUID {
    Data1: 0x60b5_c1d4,
    Data2: 0x67fe,
    Data3: 0x4790,
    Data4: [0x94, 0xd5, 0xc4, 0x72, 0x6d, 0x7b, 0x6e, 0x6d],
};

pub const NV_ENC_H264_PROFILE_HIGH_GUID: GUID = GUID {
    Data1: 0xe7cb_c309,
    Data2: 0x4f7a,
    Data3: 0x4b89,
    Data4: [0xaf, 0x2a, 0xd5, 0x37, 0xc9, 0x2b, 0xe3, 0x10],
};

pub const NV_ENC_H264_PROFILE_HIGH_444_GUID: GUID = GUID {
    Data1: 0x7ac6_63cb,
    Data2: 0xa598,
    Data3: 0x4960,
    Data4: [0xb8, 0x44, 0x33, 0x9b, 0x26, 0x1a, 0x7d, 0x52],
};

pub const NV_ENC_HEVC_PROFILE_MAIN_GUID: GUID = GUID {
    Data1: 0xb514_c39a,
    Data2: 0xb55b,
    Data3: 0x40fa,
    Data4: [0x87, 0x8f, 0xf1, 0x25, 0x3b, 0x4d, 0xfd, 0xec],
};

pub const NV_ENC_HEVC_PROFILE_MAIN10_GUID: GUID = GUID {
    Data1: 0xfa4d_2b6c,
    Data2: 0x3a5b,
    Data3: 0x411a,
    Data4: [0x80, 0x18, 0x0a, 0x3f, 0x5e, 0x3c, 0x9b, 0xe5],
};

pub const NV_ENC_HEVC_PROFILE_FREXT_GUID: GUID = GUID {
    Data1: 0x51ec_32b5,
    Data2: 0x1b4c,
    Data3: 0x453c,
    Data4: [0x9c, 0xbd, 0xb6, 0x16, 0xbd, 0x62, 0x13, 0x41],
};

// ─── Enums (as constants; several are bit masks) ─────────────────────────

/// `NV_ENC_BUFFER_FORMAT`.
pub type NV_ENC_BUFFER_FORMAT = c_uint;
pub const NV_ENC_BUFFER_FORMAT_UNDEFINED: NV_ENC_BUFFER_FORMAT = 0x0;
pub const NV_ENC_BUFFER_FORMAT_NV12: NV_ENC_BUFFER_FORMAT = 0x1;
pub const NV_ENC_BUFFER_FORMAT_YV12: NV_ENC_BUFFER_FORMAT = 0x10;
pub const NV_ENC_BUFFER_FORMAT_IYUV: NV_ENC_BUFFER_FORMAT = 0x100;
pub const NV_ENC_BUFFER_FORMAT_YUV444: NV_ENC_BUFFER_FORMAT = 0x1000;
pub const NV_ENC_BUFFER_FORMAT_YUV420_10BIT: NV_ENC_BUFFER_FORMAT = 0x10000;
pub const NV_ENC_BUFFER_FORMAT_YUV444_10BIT: NV_ENC_BUFFER_FORMAT = 0x100000;
pub const NV_ENC_BUFFER_FORMAT_ARGB: NV_ENC_BUFFER_FORMAT = 0x1000000;
pub const NV_ENC_BUFFER_FORMAT_ARGB10: NV_ENC_BUFFER_FORMAT = 0x2000000;
pub const NV_ENC_BUFFER_FORMAT_AYUV: NV_ENC_BUFFER_FORMAT = 0x4000000;
pub const NV_ENC_BUFFER_FORMAT_ABGR: NV_ENC_BUFFER_FORMAT = 0x10000000;
pub const NV_ENC_BUFFER_FORMAT_ABGR10: NV_ENC_BUFFER_FORMAT = 0x20000000;

/// `NV_ENC_PARAMS_RC_MODE`.
pub type NV_ENC_PARAMS_RC_MODE = c_uint;
pub const NV_ENC_PARAMS_RC_CONSTQP: NV_ENC_PARAMS_RC_MODE = 0x0;
pub const NV_ENC_PARAMS_RC_VBR: NV_ENC_PARAMS_RC_MODE = 0x1;
pub const NV_ENC_PARAMS_RC_CBR: NV_ENC_PARAMS_RC_MODE = 0x2;
pub const NV_ENC_PARAMS_RC_VBR_MINQP: NV_ENC_PARAMS_RC_MODE = 0x4;

/// `NV_ENC_PARAMS_FRAME_FIELD_MODE`.
pub const NV_ENC_PARAMS_FRAME_FIELD_MODE_FRAME: c_uint = 0x01;
pub const NV_ENC_PARAMS_FRAME_FIELD_MODE_FIELD: c_uint = 0x02;

/// `NV_ENC_PIC_STRUCT`.
pub const NV_ENC_PIC_STRUCT_FRAME: c_uint = 0x01;
pub const NV_ENC_PIC_STRUCT_FIELD_TOP_BOTTOM: c_uint = 0x02;
pub const NV_ENC_PIC_STRUCT_FIELD_BOTTOM_TOP: c_uint = 0x03;

/// `NV_ENC_PIC_TYPE`.
pub const NV_ENC_PIC_TYPE_P: c_uint = 0x0;
pub const NV_ENC_PIC_TYPE_B: c_uint = 0x01;
pub const NV_ENC_PIC_TYPE_I: c_uint = 0x02;
pub const NV_ENC_PIC_TYPE_IDR: c_uint = 0x03;
pub const NV_ENC_PIC_TYPE_BI: c_uint = 0x04;
pub const NV_ENC_PIC_TYPE_SKIPPED: c_uint = 0x05;

/// `NV_ENC_PIC_FLAGS`.
pub const NV_ENC_PIC_FLAG_FORCEINTRA: c_uint = 0x1;
pub const NV_ENC_PIC_FLAG_FORCEIDR: c_uint = 0x2;
pub const NV_ENC_PIC_FLAG_OUTPUT_SPSPPS: c_uint = 0x4;
pub const NV_ENC_PIC_FLAG_EOS: c_uint = 0x8;

pub const NV_ENC_MEMORY_HEAP_AUTOSELECT: c_uint = 0;
pub const NV_ENC_DEVICE_TYPE_CUDA: c_uint = 0x1;
pub const NV_ENC_INPUT_RESOURCE_TYPE_CUDADEVICEPTR: c_uint = 0x1;

/// `NV_ENC_CAPS` values queried here.
pub const NV_ENC_CAPS_SUPPORT_FIELD_ENCODING: c_uint = 2;
pub const NV_ENC_CAPS_WIDTH_MAX: c_uint = 16;
pub const NV_ENC_CAPS_HEIGHT_MAX: c_uint = 17;

// ─── Configuration structs ───────────────────────────────────────────────

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct NV_ENC_QP {
    pub qpInterP: u32,
    pub qpInterB: u32,
    pub qpIntra: u32,
}

/// `NV_ENC_RC_PARAMS`.  `flags` packs `enableMinQP:1`, `enableMaxQP:1`,
/// `enableInitialRCQP:1`, `enableAQ:1` and later single-bit switches.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NV_ENC_RC_PARAMS {
    pub version: u32,
    pub rateControlMode: NV_ENC_PARAMS_RC_MODE,
    pub constQP: NV_ENC_QP,
    pub averageBitRate: u32,
    pub maxBitRate: u32,
    pub vbvBufferSize: u32,
    pub vbvInitialDelay: u32,
    pub flags: u32,
    pub minQP: NV_ENC_QP,
    pub maxQP: NV_ENC_QP,
    pub initialRCQP: NV_ENC_QP,
    pub temporallayerIdxMask: u32,
    pub temporalLayerQP: [u8; 8],
    pub targetQuality: u8,
    pub targetQualityLSB: u8,
    pub lookaheadDepth: u16,
    pub reserved1: u32,
    pub qpMapMode: u32,
    pub reserved: [u32; 7],
}

pub const NV_ENC_RC_FLAG_ENABLE_MIN_QP: u32 = 1 << 0;
pub const NV_ENC_RC_FLAG_ENABLE_MAX_QP: u32 = 1 << 1;

/// `NV_ENC_CONFIG_H264_VUI_PARAMETERS` / `NV_ENC_CONFIG_HEVC_VUI_PARAMETERS`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct NV_ENC_VUI_PARAMETERS {
    pub overscanInfoPresentFlag: u32,
    pub overscanInfo: u32,
    pub videoSignalTypePresentFlag: u32,
    pub videoFormat: u32,
    pub videoFullRangeFlag: u32,
    pub colourDescriptionPresentFlag: u32,
    pub colourPrimaries: u32,
    pub transferCharacteristics: u32,
    pub colourMatrix: u32,
    pub chromaSampleLocationFlag: u32,
    pub chromaSampleLocationTop: u32,
    pub chromaSampleLocationBot: u32,
    pub bitstreamRestrictionFlag: u32,
    pub reserved: [u32; 15],
}

/// `NV_ENC_CONFIG_H264`.  `flags` bit 6 is `outputAUD`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NV_ENC_CONFIG_H264 {
    pub flags: u32,
    pub level: u32,
    pub idrPeriod: u32,
    pub separateColourPlaneFlag: u32,
    pub disableDeblockingFilterIDC: u32,
    pub numTemporalLayers: u32,
    pub spsId: u32,
    pub ppsId: u32,
    pub adaptiveTransformMode: u32,
    pub fmoMode: u32,
    pub bdirectMode: u32,
    pub entropyCodingMode: u32,
    pub stereoMode: u32,
    pub intraRefreshPeriod: u32,
    pub intraRefreshCnt: u32,
    pub maxNumRefFrames: u32,
    pub sliceMode: u32,
    pub sliceModeData: u32,
    pub h264VUIParameters: NV_ENC_VUI_PARAMETERS,
    pub ltrNumFrames: u32,
    pub ltrTrustMode: u32,
    pub chromaFormatIDC: u32,
    pub maxTemporalLayers: u32,
    pub useBFramesAsRef: u32,
    pub reserved1: [u32; 269],
    pub reserved2: [*mut c_void; 64],
}

pub const NV_ENC_H264_FLAG_OUTPUT_AUD: u32 = 1 << 6;

/// `NV_ENC_CONFIG_HEVC`.  `flags` bit 4 is `outputAUD`, bits 9..11 are
/// `chromaFormatIDC` and bits 11..14 `pixelBitDepthMinus8`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NV_ENC_CONFIG_HEVC {
    pub level: u32,
    pub tier: u32,
    pub minCUSize: u32,
    pub maxCUSize: u32,
    pub flags: u32,
    pub idrPeriod: u32,
    pub intraRefreshPeriod: u32,
    pub intraRefreshCnt: u32,
    pub maxNumRefFramesInDPB: u32,
    pub ltrNumFrames: u32,
    pub vpsId: u32,
    pub spsId: u32,
    pub ppsId: u32,
    pub sliceMode: u32,
    pub sliceModeData: u32,
    pub maxTemporalLayersMinus1: u32,
    pub hevcVUIParameters: NV_ENC_VUI_PARAMETERS,
    pub ltrTrustMode: u32,
    pub useBFramesAsRef: u32,
    pub reserved1: [u32; 216],
    pub reserved2: [*mut c_void; 64],
}

pub const NV_ENC_HEVC_FLAG_OUTPUT_AUD: u32 = 1 << 4;
pub const NV_ENC_HEVC_CHROMA_FORMAT_SHIFT: u32 = 9;
pub const NV_ENC_HEVC_CHROMA_FORMAT_MASK: u32 = 0x3 << NV_ENC_HEVC_CHROMA_FORMAT_SHIFT;
pub const NV_ENC_HEVC_BIT_DEPTH_SHIFT: u32 = 11;
pub const NV_ENC_HEVC_BIT_DEPTH_MASK: u32 = 0x7 << NV_ENC_HEVC_BIT_DEPTH_SHIFT;

/// `NV_ENC_CODEC_CONFIG`.
#[repr(C)]
#[derive(Clone, Copy)]
pub union NV_ENC_CODEC_CONFIG {
    pub h264Config: NV_ENC_CONFIG_H264,
    pub hevcConfig: NV_ENC_CONFIG_HEVC,
    pub reserved: [u32; 320],
}

/// `NV_ENC_CONFIG`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NV_ENC_CONFIG {
    pub version: u32,
    pub profileGUID: GUID,
    pub gopLength: u32,
    pub frameIntervalP: i32,
    pub monoChromeEncoding: u32,
    pub frameFieldMode: u32,
    pub mvPrecision: u32,
    pub rcParams: NV_ENC_RC_PARAMS,
    pub encodeCodecConfig: NV_ENC_CODEC_CONFIG,
    pub reserved: [u32; 278],
    pub reserved2: [*mut c_void; 64],
}

/// `NV_ENC_PRESET_CONFIG`.
#[repr(C)]
pub struct NV_ENC_PRESET_CONFIG {
    pub version: u32,
    pub presetCfg: NV_ENC_CONFIG,
    pub reserved1: [u32; 255],
    pub reserved2: [*mut c_void; 64],
}

/// `NV_ENC_INITIALIZE_PARAMS`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NV_ENC_INITIALIZE_PARAMS {
    pub version: u32,
    pub encodeGUID: GUID,
    pub presetGUID: GUID,
    pub encodeWidth: u32,
    pub encodeHeight: u32,
    pub darWidth: u32,
    pub darHeight: u32,
    pub frameRateNum: u32,
    pub frameRateDen: u32,
    pub enableEncodeAsync: u32,
    pub enablePTD: u32,
    pub flags: u32,
    pub privDataSize: u32,
    pub privData: *mut c_void,
    pub encodeConfig: *mut NV_ENC_CONFIG,
    pub maxEncodeWidth: u32,
    pub maxEncodeHeight: u32,
    pub maxMEHintCountsPerBlock: [u32; 4],
    pub reserved: [u32; 285],
    pub reserved2: [*mut c_void; 64],
}

/// `NV_ENC_RECONFIGURE_PARAMS`.  `flags` bit 0 is `resetEncoder`, bit 1
/// is `forceIDR`.
#[repr(C)]
pub struct NV_ENC_RECONFIGURE_PARAMS {
    pub version: u32,
    pub reInitEncodeParams: NV_ENC_INITIALIZE_PARAMS,
    pub flags: u32,
}

pub const NV_ENC_RECONFIGURE_FLAG_RESET_ENCODER: u32 = 1 << 0;
pub const NV_ENC_RECONFIGURE_FLAG_FORCE_IDR: u32 = 1 << 1;

// ─── Session, buffer and picture structs ─────────────────────────────────

/// `NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS`.
#[repr(C)]
pub struct NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS {
    pub version: u32,
    pub deviceType: c_uint,
    pub device: *mut c_void,
    pub reserved: *mut c_void,
    pub apiVersion: u32,
    pub reserved1: [u32; 253],
    pub reserved2: [*mut c_void; 64],
}

/// `NV_ENC_CAPS_PARAM`.
#[repr(C)]
pub struct NV_ENC_CAPS_PARAM {
    pub version: u32,
    pub capsToQuery: c_uint,
    pub reserved: [u32; 62],
}

/// `NV_ENC_CREATE_INPUT_BUFFER`.
#[repr(C)]
pub struct NV_ENC_CREATE_INPUT_BUFFER {
    pub version: u32,
    pub width: u32,
    pub height: u32,
    pub memoryHeap: c_uint,
    pub bufferFmt: NV_ENC_BUFFER_FORMAT,
    pub reserved: u32,
    pub inputBuffer: *mut c_void,
    pub pSysMemBuffer: *mut c_void,
    pub reserved1: [u32; 57],
    pub reserved2: [*mut c_void; 63],
}

/// `NV_ENC_LOCK_INPUT_BUFFER`.
#[repr(C)]
pub struct NV_ENC_LOCK_INPUT_BUFFER {
    pub version: u32,
    pub flags: u32,
    pub inputBuffer: *mut c_void,
    pub bufferDataPtr: *mut c_void,
    pub pitch: u32,
    pub reserved1: [u32; 251],
    pub reserved2: [*mut c_void; 64],
}

/// `NV_ENC_CREATE_BITSTREAM_BUFFER`.
#[repr(C)]
pub struct NV_ENC_CREATE_BITSTREAM_BUFFER {
    pub version: u32,
    pub size: u32,
    pub memoryHeap: c_uint,
    pub reserved: u32,
    pub bitstreamBuffer: *mut c_void,
    pub bitstreamBufferPtr: *mut c_void,
    pub reserved1: [u32; 58],
    pub reserved2: [*mut c_void; 64],
}

/// `NV_ENC_LOCK_BITSTREAM`.  `flags` bit 0 is `doNotWait`.
#[repr(C)]
pub struct NV_ENC_LOCK_BITSTREAM {
    pub version: u32,
    pub flags: u32,
    pub outputBitstream: *mut c_void,
    pub sliceOffsets: *mut u32,
    pub frameIdx: u32,
    pub hwEncodeStatus: u32,
    pub numSlices: u32,
    pub bitstreamSizeInBytes: u32,
    pub outputTimeStamp: u64,
    pub outputDuration: u64,
    pub bitstreamBufferPtr: *mut c_void,
    pub pictureType: c_uint,
    pub pictureStruct: c_uint,
    pub frameAvgQP: u32,
    pub frameSatd: u32,
    pub ltrFrameIdx: u32,
    pub ltrFrameBitmap: u32,
    pub reserved: [u32; 13],
    pub intraMBCount: u32,
    pub interMBCount: u32,
    pub averageMVX: i32,
    pub averageMVY: i32,
    pub reserved1: [u32; 219],
    pub reserved2: [*mut c_void; 64],
}

pub const NV_ENC_LOCK_BITSTREAM_FLAG_DO_NOT_WAIT: u32 = 1 << 0;

/// `NV_ENC_REGISTER_RESOURCE`.
#[repr(C)]
pub struct NV_ENC_REGISTER_RESOURCE {
    pub version: u32,
    pub resourceType: c_uint,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub subResourceIndex: u32,
    pub resourceToRegister: *mut c_void,
    pub registeredResource: *mut c_void,
    pub bufferFormat: NV_ENC_BUFFER_FORMAT,
    pub reserved1: [u32; 248],
    pub reserved2: [*mut c_void; 62],
}

/// `NV_ENC_MAP_INPUT_RESOURCE`.
#[repr(C)]
pub struct NV_ENC_MAP_INPUT_RESOURCE {
    pub version: u32,
    pub subResourceIndex: u32,
    pub inputResource: *mut c_void,
    pub registeredResource: *mut c_void,
    pub mappedResource: *mut c_void,
    pub mappedBufferFmt: NV_ENC_BUFFER_FORMAT,
    pub reserved1: [u32; 251],
    pub reserved2: [*mut c_void; 63],
}

/// `NV_ENC_SEI_PAYLOAD`.
#[repr(C)]
pub struct NV_ENC_SEI_PAYLOAD {
    pub payloadSize: u32,
    pub payloadType: u32,
    pub payload: *mut u8,
}

/// `NV_ENC_PIC_PARAMS_H264`, up to the SEI fields.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NV_ENC_PIC_PARAMS_H264 {
    pub displayPOCSyntax: u32,
    pub reserved3: u32,
    pub refPicFlag: u32,
    pub colourPlaneId: u32,
    pub forceIntraRefreshWithFrameCnt: u32,
    pub flags: u32,
    pub sliceTypeData: *mut u8,
    pub sliceTypeArrayCnt: u32,
    pub seiPayloadArrayCnt: u32,
    pub seiPayloadArray: *mut NV_ENC_SEI_PAYLOAD,
}

/// `NV_ENC_PIC_PARAMS_HEVC`, up to the SEI fields.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NV_ENC_PIC_PARAMS_HEVC {
    pub displayPOCSyntax: u32,
    pub refPicFlag: u32,
    pub temporalId: u32,
    pub forceIntraRefreshWithFrameCnt: u32,
    pub flags: u32,
    pub sliceTypeData: *mut u8,
    pub sliceTypeArrayCnt: u32,
    pub sliceMode: u32,
    pub sliceModeData: u32,
    pub ltrMarkFrameIdx: u32,
    pub ltrUseFrameBitmap: u32,
    pub ltrUsageMode: u32,
    pub seiPayloadArrayCnt: u32,
    pub reserved: u32,
    pub seiPayloadArray: *mut NV_ENC_SEI_PAYLOAD,
}

/// `NV_ENC_CODEC_PIC_PARAMS`.
#[repr(C)]
#[derive(Clone, Copy)]
pub union NV_ENC_CODEC_PIC_PARAMS {
    pub h264PicParams: NV_ENC_PIC_PARAMS_H264,
    pub hevcPicParams: NV_ENC_PIC_PARAMS_HEVC,
    pub reserved: [u32; 256],
}

/// `NV_ENC_PIC_PARAMS`.
#[repr(C)]
pub struct NV_ENC_PIC_PARAMS {
    pub version: u32,
    pub inputWidth: u32,
    pub inputHeight: u32,
    pub inputPitch: u32,
    pub encodePicFlags: u32,
    pub frameIdx: u32,
    pub inputTimeStamp: u64,
    pub inputDuration: u64,
    pub inputBuffer: *mut c_void,
    pub outputBitstream: *mut c_void,
    pub completionEvent: *mut c_void,
    pub bufferFmt: NV_ENC_BUFFER_FORMAT,
    pub pictureStruct: c_uint,
    pub pictureType: c_uint,
    pub codecPicParams: NV_ENC_CODEC_PIC_PARAMS,
    pub meHintCountsPerBlock: [u32; 4],
    pub meExternalHints: *mut c_void,
    pub reserved1: [u32; 6],
    pub reserved2: [*mut c_void; 2],
    pub qpDeltaMap: *mut i8,
    pub qpDeltaMapSize: u32,
    pub reservedBitFields: u32,
    pub meHintRefPicDist: [u16; 2],
    pub reserved3: [u32; 286],
    pub reserved4: [*mut c_void; 60],
}

/// `NV_ENC_SEQUENCE_PARAM_PAYLOAD`.
#[repr(C)]
pub struct NV_ENC_SEQUENCE_PARAM_PAYLOAD {
    pub version: u32,
    pub inBufferSize: u32,
    pub spsId: u32,
    pub ppsId: u32,
    pub spsppsBuffer: *mut c_void,
    pub outSPSPPSPayloadSize: *mut u32,
    pub reserved: [u32; 250],
    pub reserved2: [*mut c_void; 64],
}

/// Zero-initialise an FFI struct.
///
/// # Safety
/// All-zero must be a valid bit pattern for `T` (true for every struct in
/// this module: integers, raw pointers, `Option<fn>` and unions of those).
#[inline]
pub unsafe fn zeroed<T>() -> T {
    // SAFETY: forwarded to the caller.
    unsafe { std::mem::zeroed() }
}

// ─── Function list ───────────────────────────────────────────────────────

type EncFn<A> = Option<unsafe extern "C" fn(*mut c_void, A) -> NVENCSTATUS>;

/// `NV_ENCODE_API_FUNCTION_LIST`.
#[repr(C)]
pub struct NV_ENCODE_API_FUNCTION_LIST {
    pub version: u32,
    pub reserved: u32,
    pub nvEncOpenEncodeSession: *const c_void,
    pub nvEncGetEncodeGUIDCount: Option<unsafe extern "C" fn(*mut c_void, *mut u32) -> NVENCSTATUS>,
    pub nvEncGetEncodeProfileGUIDCount:
        Option<unsafe extern "C" fn(*mut c_void, GUID, *mut u32) -> NVENCSTATUS>,
    pub nvEncGetEncodeProfileGUIDs:
        Option<unsafe extern "C" fn(*mut c_void, GUID, *mut GUID, u32, *mut u32) -> NVENCSTATUS>,
    pub nvEncGetEncodeGUIDs:
        Option<unsafe extern "C" fn(*mut c_void, *mut GUID, u32, *mut u32) -> NVENCSTATUS>,
    pub nvEncGetInputFormatCount:
        Option<unsafe extern "C" fn(*mut c_void, GUID, *mut u32) -> NVENCSTATUS>,
    pub nvEncGetInputFormats: Option<
        unsafe extern "C" fn(
            *mut c_void,
            GUID,
            *mut NV_ENC_BUFFER_FORMAT,
            u32,
            *mut u32,
        ) -> NVENCSTATUS,
    >,
    pub nvEncGetEncodeCaps: Option<
        unsafe extern "C" fn(*mut c_void, GUID, *mut NV_ENC_CAPS_PARAM, *mut c_int) -> NVENCSTATUS,
    >,
    pub nvEncGetEncodePresetCount:
        Option<unsafe extern "C" fn(*mut c_void, GUID, *mut u32) -> NVENCSTATUS>,
    pub nvEncGetEncodePresetGUIDs:
        Option<unsafe extern "C" fn(*mut c_void, GUID, *mut GUID, u32, *mut u32) -> NVENCSTATUS>,
    pub nvEncGetEncodePresetConfig: Option<
        unsafe extern "C" fn(*mut c_void, GUID, GUID, *mut NV_ENC_PRESET_CONFIG) -> NVENCSTATUS,
    >,
    pub nvEncInitializeEncoder: EncFn<*mut NV_ENC_INITIALIZE_PARAMS>,
    pub nvEncCreateInputBuffer: EncFn<*mut NV_ENC_CREATE_INPUT_BUFFER>,
    pub nvEncDestroyInputBuffer: EncFn<*mut c_void>,
    pub nvEncCreateBitstreamBuffer: EncFn<*mut NV_ENC_CREATE_BITSTREAM_BUFFER>,
    pub nvEncDestroyBitstreamBuffer: EncFn<*mut c_void>,
    pub nvEncEncodePicture: EncFn<*mut NV_ENC_PIC_PARAMS>,
    pub nvEncLockBitstream: EncFn<*mut NV_ENC_LOCK_BITSTREAM>,
    pub nvEncUnlockBitstream: EncFn<*mut c_void>,
    pub nvEncLockInputBuffer: EncFn<*mut NV_ENC_LOCK_INPUT_BUFFER>,
    pub nvEncUnlockInputBuffer: EncFn<*mut c_void>,
    pub nvEncGetEncodeStats: *const c_void,
    pub nvEncGetSequenceParams: EncFn<*mut NV_ENC_SEQUENCE_PARAM_PAYLOAD>,
    pub nvEncRegisterAsyncEvent: *const c_void,
    pub nvEncUnregisterAsyncEvent: *const c_void,
    pub nvEncMapInputResource: EncFn<*mut NV_ENC_MAP_INPUT_RESOURCE>,
    pub nvEncUnmapInputResource: EncFn<*mut c_void>,
    pub nvEncDestroyEncoder: Option<unsafe extern "C" fn(*mut c_void) -> NVENCSTATUS>,
    pub nvEncInvalidateRefFrames: *const c_void,
    pub nvEncOpenEncodeSessionEx: Option<
        unsafe extern "C" fn(
            *mut NV_ENC_OPEN_ENCODE_SESSION_EX_PARAMS,
            *mut *mut c_void,
        ) -> NVENCSTATUS,
    >,
    pub nvEncRegisterResource: EncFn<*mut NV_ENC_REGISTER_RESOURCE>,
    pub nvEncUnregisterResource: EncFn<*mut c_void>,
    pub nvEncReconfigureEncoder: EncFn<*mut NV_ENC_RECONFIGURE_PARAMS>,
    pub reserved1: *const c_void,
    pub nvEncCreateMVBuffer: *const c_void,
    pub nvEncDestroyMVBuffer: *const c_void,
    pub nvEncRunMotionEstimationOnly: *const c_void,
    pub reserved2: [*const c_void; 281],
}

// ═══════════════════════════════════════════════════════════════════════════
//  NVENC LIBRARY
// ═══════════════════════════════════════════════════════════════════════════

/// The encode library with its populated function list.
pub struct NvEncodeLibrary {
    _lib: Library,
    pub api: NV_ENCODE_API_FUNCTION_LIST,
}

// SAFETY: function pointers only; `_lib` keeps them valid.
unsafe impl Send for NvEncodeLibrary {}
unsafe impl Sync for NvEncodeLibrary {}

static NVENC: OnceLock<std::result::Result<NvEncodeLibrary, String>> = OnceLock::new();

type CreateInstanceFn =
    unsafe extern "C" fn(*mut NV_ENCODE_API_FUNCTION_LIST) -> NVENCSTATUS;

fn load_nvenc() -> std::result::Result<NvEncodeLibrary, String> {
    let candidates: &[&'static str] = if cfg!(target_os = "windows") {
        &["nvEncodeAPI64.dll", "nvEncodeAPI.dll"]
    } else {
        &["libnvidia-encode.so.1", "libnvidia-encode.so"]
    };
    let lib = open_first(candidates)?;
    // SAFETY: signature matches nvEncodeAPI.h.
    let create: CreateInstanceFn = unsafe { symbol(&lib, "NvEncodeAPICreateInstance")? };

    // SAFETY: the function list is plain data; the driver fills it in.
    let mut api: NV_ENCODE_API_FUNCTION_LIST = unsafe { zeroed() };
    api.version = NV_ENCODE_API_FUNCTION_LIST_VER;
    // SAFETY: `api` is a valid, versioned function list.
    let status = unsafe { create(&mut api) };
    if status != NV_ENC_SUCCESS {
        return Err(format!(
            "NvEncodeAPICreateInstance: {} ({status})",
            nvenc_status_name(status)
        ));
    }
    if api.nvEncOpenEncodeSessionEx.is_none() {
        return Err("NvEncodeAPICreateInstance returned an empty function list".into());
    }
    debug!(api_version = NVENCAPI_VERSION, "NVENC function list populated");
    Ok(NvEncodeLibrary { _lib: lib, api })
}

/// The process-wide encode API, loading it on first use.
pub fn nvenc() -> Result<&'static NvEncodeLibrary> {
    NVENC
        .get_or_init(load_nvenc)
        .as_ref()
        .map_err(|reason| CodecError::LibraryLoad {
            library: "libnvidia-encode".into(),
            reason: reason.clone(),
        })
}

/// Unwrap an optional function-list entry.
#[inline]
pub fn entry<F>(f: Option<F>, name: &'static str) -> Result<F> {
    f.ok_or_else(|| CodecError::Encode(format!("{name} missing from NVENC function list")))
}

// ═══════════════════════════════════════════════════════════════════════════
//  ERROR HELPERS
// ═══════════════════════════════════════════════════════════════════════════

/// Map an `NVENCSTATUS` to `Result`.
#[inline]
pub fn check_nvenc(status: NVENCSTATUS, call: &'static str) -> Result<()> {
    if status == NV_ENC_SUCCESS {
        Ok(())
    } else {
        Err(CodecError::Encode(format!(
            "{call}: {} ({status})",
            nvenc_status_name(status)
        )))
    }
}

/// Map a `CUresult` from nvcuvid to `Result`.
#[inline]
pub fn check_cuvid(rc: CUresult, call: &'static str) -> Result<()> {
    if rc == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(CodecError::Decode(format!(
            "{call}: {} ({rc})",
            nvpipe_cuda::sys::cu_result_name(rc)
        )))
    }
}

/// Human-readable NVENC status names for diagnostics.
#[inline]
pub const fn nvenc_status_name(status: NVENCSTATUS) -> &'static str {
    match status {
        NV_ENC_SUCCESS => "NV_ENC_SUCCESS",
        NV_ENC_ERR_NO_ENCODE_DEVICE => "NV_ENC_ERR_NO_ENCODE_DEVICE",
        NV_ENC_ERR_UNSUPPORTED_DEVICE => "NV_ENC_ERR_UNSUPPORTED_DEVICE",
        NV_ENC_ERR_INVALID_ENCODERDEVICE => "NV_ENC_ERR_INVALID_ENCODERDEVICE",
        NV_ENC_ERR_INVALID_DEVICE => "NV_ENC_ERR_INVALID_DEVICE",
        NV_ENC_ERR_DEVICE_NOT_EXIST => "NV_ENC_ERR_DEVICE_NOT_EXIST",
        NV_ENC_ERR_INVALID_PTR => "NV_ENC_ERR_INVALID_PTR",
        NV_ENC_ERR_INVALID_EVENT => "NV_ENC_ERR_INVALID_EVENT",
        NV_ENC_ERR_INVALID_PARAM => "NV_ENC_ERR_INVALID_PARAM",
        NV_ENC_ERR_INVALID_CALL => "NV_ENC_ERR_INVALID_CALL",
        NV_ENC_ERR_OUT_OF_MEMORY => "NV_ENC_ERR_OUT_OF_MEMORY",
        NV_ENC_ERR_ENCODER_NOT_INITIALIZED => "NV_ENC_ERR_ENCODER_NOT_INITIALIZED",
        NV_ENC_ERR_UNSUPPORTED_PARAM => "NV_ENC_ERR_UNSUPPORTED_PARAM",
        NV_ENC_ERR_LOCK_BUSY => "NV_ENC_ERR_LOCK_BUSY",
        NV_ENC_ERR_NOT_ENOUGH_BUFFER => "NV_ENC_ERR_NOT_ENOUGH_BUFFER",
        NV_ENC_ERR_INVALID_VERSION => "NV_ENC_ERR_INVALID_VERSION",
        NV_ENC_ERR_MAP_FAILED => "NV_ENC_ERR_MAP_FAILED",
        NV_ENC_ERR_NEED_MORE_INPUT => "NV_ENC_ERR_NEED_MORE_INPUT",
        NV_ENC_ERR_ENCODER_BUSY => "NV_ENC_ERR_ENCODER_BUSY",
        NV_ENC_ERR_EVENT_NOT_REGISTERD => "NV_ENC_ERR_EVENT_NOT_REGISTERD",
        NV_ENC_ERR_GENERIC => "NV_ENC_ERR_GENERIC",
        NV_ENC_ERR_INCOMPATIBLE_CLIENT_KEY => "NV_ENC_ERR_INCOMPATIBLE_CLIENT_KEY",
        NV_ENC_ERR_UNIMPLEMENTED => "NV_ENC_ERR_UNIMPLEMENTED",
        NV_ENC_ERR_RESOURCE_REGISTER_FAILED => "NV_ENC_ERR_RESOURCE_REGISTER_FAILED",
        NV_ENC_ERR_RESOURCE_NOT_REGISTERED => "NV_ENC_ERR_RESOURCE_NOT_REGISTERED",
        NV_ENC_ERR_RESOURCE_NOT_MAPPED => "NV_ENC_ERR_RESOURCE_NOT_MAPPED",
        _ => "NV_ENC_ERR_UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_versions_carry_api_version() {
        assert_eq!(NV_ENC_CONFIG_VER & 0xffff, NVENCAPI_VERSION & 0xffff);
        assert_eq!((NV_ENC_PIC_PARAMS_VER >> 16) & 0xf, 4);
        assert_ne!(NV_ENC_INITIALIZE_PARAMS_VER & (1 << 31), 0);
        assert_eq!(NV_ENC_LOCK_BITSTREAM_VER & (1 << 31), 0);
    }

    #[test]
    fn status_names() {
        assert_eq!(
            nvenc_status_name(NV_ENC_ERR_NEED_MORE_INPUT),
            "NV_ENC_ERR_NEED_MORE_INPUT"
        );
        assert_eq!(nvenc_status_name(999), "NV_ENC_ERR_UNKNOWN");
        assert!(check_nvenc(NV_ENC_SUCCESS, "x").is_ok());
        assert!(matches!(
            check_nvenc(NV_ENC_ERR_GENERIC, "nvEncEncodePicture"),
            Err(CodecError::Encode(_))
        ));
    }

    #[test]
    fn signal_description_bitfield() {
        let desc = CUVIDSIGNALDESCRIPTION {
            flags: 0b1101,
            ..Default::default()
        };
        assert_eq!(desc.video_format(), 5);
        assert!(desc.video_full_range_flag());
    }

    #[test]
    fn preset_guids_are_distinct() {
        let all = [
            NV_ENC_PRESET_DEFAULT_GUID,
            NV_ENC_PRESET_HP_GUID,
            NV_ENC_PRESET_HQ_GUID,
            NV_ENC_PRESET_LOW_LATENCY_DEFAULT_GUID,
            NV_ENC_PRESET_LOW_LATENCY_HQ_GUID,
            NV_ENC_PRESET_LOW_LATENCY_HP_GUID,
            NV_ENC_PRESET_LOSSLESS_DEFAULT_GUID,
            NV_ENC_PRESET_LOSSLESS_HP_GUID,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
