//! NVDEC bitstream parser and decoder.
//!
//! The parser delivers its three callbacks synchronously from inside
//! `cuvidParseVideoData`.  [`CuvidParser::parse`] installs the caller's
//! [`ParserCallbacks`] in a heap slot for exactly the duration of that call,
//! so the trampolines never see a dangling receiver.

use std::ffi::{c_int, c_void};
use std::ptr;
use std::sync::Arc;

use nvpipe_core::codec_traits::{
    BitstreamParser, DecodePicture, DecoderCaps, DecoderCapsQuery, DecoderParams, DeinterlaceMode,
    DisplayArea, DisplayInfo, HwDecoder, MappedSurface, ParserCallbacks, ParserPacket,
    ParserParams, ProcParams, SequenceInfo, SurfaceFormat,
};
use nvpipe_core::error::{CodecError, Result};
use nvpipe_core::types::{ChromaFormat, CodecId};
use nvpipe_cuda::CudaContext;
use tracing::{debug, trace, warn};

use crate::sys::{
    self, CUVIDDECODECREATEINFO, CUVIDEOFORMAT, CUVIDPARSERDISPINFO, CUVIDPARSERPARAMS,
    CUVIDPICPARAMS, CUVIDPROCPARAMS, CUVIDRECT, CUVIDSOURCEDATAPACKET, check_cuvid,
    cudaVideoChromaFormat, cudaVideoCodec, cudaVideoDeinterlaceMode, cudaVideoSurfaceFormat,
    zeroed,
};

// ─── Enum mapping ────────────────────────────────────────────────────────

pub fn cuvid_codec(codec: CodecId) -> cudaVideoCodec {
    match codec {
        CodecId::Mpeg1 => cudaVideoCodec::MPEG1,
        CodecId::Mpeg2 => cudaVideoCodec::MPEG2,
        CodecId::Mpeg4 => cudaVideoCodec::MPEG4,
        CodecId::H264 => cudaVideoCodec::H264,
        CodecId::Jpeg => cudaVideoCodec::JPEG,
        CodecId::H265 => cudaVideoCodec::HEVC,
        CodecId::Vp8 => cudaVideoCodec::VP8,
        CodecId::Vp9 => cudaVideoCodec::VP9,
    }
}

fn codec_from_cuvid(codec: cudaVideoCodec, fallback: CodecId) -> CodecId {
    match codec {
        cudaVideoCodec::MPEG1 => CodecId::Mpeg1,
        cudaVideoCodec::MPEG2 => CodecId::Mpeg2,
        cudaVideoCodec::MPEG4 => CodecId::Mpeg4,
        cudaVideoCodec::H264 => CodecId::H264,
        cudaVideoCodec::JPEG => CodecId::Jpeg,
        cudaVideoCodec::HEVC => CodecId::H265,
        cudaVideoCodec::VP8 => CodecId::Vp8,
        cudaVideoCodec::VP9 => CodecId::Vp9,
        _ => fallback,
    }
}

fn cuvid_chroma(chroma: ChromaFormat) -> Result<cudaVideoChromaFormat> {
    match chroma {
        ChromaFormat::Monochrome => Ok(cudaVideoChromaFormat::Monochrome),
        ChromaFormat::Yuv420 => Ok(cudaVideoChromaFormat::YUV420),
        ChromaFormat::Yuv422 => Ok(cudaVideoChromaFormat::YUV422),
        ChromaFormat::Yuv444 => Ok(cudaVideoChromaFormat::YUV444),
        ChromaFormat::Rgb => Err(CodecError::UnsupportedFormat(
            "NVDEC has no RGB chroma format".into(),
        )),
    }
}

fn chroma_from_cuvid(chroma: cudaVideoChromaFormat) -> ChromaFormat {
    match chroma {
        cudaVideoChromaFormat::Monochrome => ChromaFormat::Monochrome,
        cudaVideoChromaFormat::YUV420 => ChromaFormat::Yuv420,
        cudaVideoChromaFormat::YUV422 => ChromaFormat::Yuv422,
        cudaVideoChromaFormat::YUV444 => ChromaFormat::Yuv444,
    }
}

fn cuvid_surface(format: SurfaceFormat) -> cudaVideoSurfaceFormat {
    match format {
        SurfaceFormat::Nv12 => cudaVideoSurfaceFormat::NV12,
        SurfaceFormat::P016 => cudaVideoSurfaceFormat::P016,
        SurfaceFormat::Yuv444 => cudaVideoSurfaceFormat::YUV444,
        SurfaceFormat::Yuv444_16 => cudaVideoSurfaceFormat::YUV444_16Bit,
    }
}

/// Decode output formats set in `nOutputFormatMask`.
fn surface_formats_from_mask(mask: u16) -> Vec<SurfaceFormat> {
    [
        (cudaVideoSurfaceFormat::NV12, SurfaceFormat::Nv12),
        (cudaVideoSurfaceFormat::P016, SurfaceFormat::P016),
        (cudaVideoSurfaceFormat::YUV444, SurfaceFormat::Yuv444),
        (cudaVideoSurfaceFormat::YUV444_16Bit, SurfaceFormat::Yuv444_16),
    ]
    .into_iter()
    .filter(|(raw, _)| mask & (1 << *raw as u16) != 0)
    .map(|(_, format)| format)
    .collect()
}

fn sequence_info(format: &CUVIDEOFORMAT, fallback: CodecId) -> SequenceInfo {
    let signal = &format.video_signal_description;
    SequenceInfo {
        codec: codec_from_cuvid(format.codec, fallback),
        coded_width: format.coded_width,
        coded_height: format.coded_height,
        display_area: DisplayArea {
            left: format.display_area.left,
            top: format.display_area.top,
            right: format.display_area.right,
            bottom: format.display_area.bottom,
        },
        chroma: chroma_from_cuvid(format.chroma_format),
        bit_depth_luma_minus8: u32::from(format.bit_depth_luma_minus8),
        frame_rate_num: format.frame_rate.numerator,
        frame_rate_den: format.frame_rate.denominator,
        progressive: format.progressive_sequence != 0,
        min_decode_surfaces: u32::from(format.min_num_decode_surfaces),
        video_full_range: signal.video_full_range_flag(),
        color_primaries: u32::from(signal.color_primaries),
        transfer_characteristics: u32::from(signal.transfer_characteristics),
        matrix_coefficients: u32::from(signal.matrix_coefficients),
    }
}

// ─── Parser ──────────────────────────────────────────────────────────────

/// Backend payload of a [`DecodePicture`]: the parser's picture parameters,
/// valid only during the decode callback.
#[derive(Clone, Copy, Debug)]
pub struct PicParamsPtr(pub *mut CUVIDPICPARAMS);

type CallbackPtr = *mut (dyn ParserCallbacks + 'static);

struct CallbackSlot {
    callbacks: Option<CallbackPtr>,
    error: Option<CodecError>,
    codec: CodecId,
}

impl CallbackSlot {
    /// Run `f` on the installed receiver. Returns the parser's status code.
    fn deliver(&mut self, f: impl FnOnce(&mut dyn ParserCallbacks) -> Result<()>) -> c_int {
        if self.error.is_some() {
            return 0;
        }
        let Some(callbacks) = self.callbacks else {
            warn!("parser callback outside of parse()");
            return 0;
        };
        // SAFETY: the pointer is installed by `parse` for the duration of
        // the driver call that is invoking us.
        match f(unsafe { &mut *callbacks }) {
            Ok(()) => 1,
            Err(e) => {
                self.error = Some(e);
                0
            }
        }
    }
}

unsafe extern "C" fn on_sequence(user: *mut c_void, format: *mut CUVIDEOFORMAT) -> c_int {
    // SAFETY: `user` is the slot registered in `CuvidParser::new`, `format`
    // is valid for this callback.
    let (slot, format) = unsafe { (&mut *user.cast::<CallbackSlot>(), &*format) };
    let info = sequence_info(format, slot.codec);
    slot.deliver(|cb| cb.on_sequence(&info))
}

unsafe extern "C" fn on_decode(user: *mut c_void, params: *mut CUVIDPICPARAMS) -> c_int {
    // SAFETY: as above.
    let slot = unsafe { &mut *user.cast::<CallbackSlot>() };
    // SAFETY: `params` is valid for this callback.
    let picture_index = unsafe { (*params).CurrPicIdx };
    let payload = PicParamsPtr(params);
    slot.deliver(|cb| {
        cb.on_decode(&DecodePicture {
            picture_index,
            params: &payload,
        })
    })
}

unsafe extern "C" fn on_display(user: *mut c_void, info: *mut CUVIDPARSERDISPINFO) -> c_int {
    // SAFETY: as above.
    let slot = unsafe { &mut *user.cast::<CallbackSlot>() };
    if info.is_null() {
        // End of stream marker.
        return 1;
    }
    // SAFETY: non-null and valid for this callback.
    let info = unsafe { &*info };
    let display = DisplayInfo {
        picture_index: info.picture_index,
        progressive_frame: info.progressive_frame != 0,
        top_field_first: info.top_field_first != 0,
        repeat_first_field: info.repeat_first_field,
        timestamp: info.timestamp.max(0) as u64,
    };
    slot.deliver(|cb| cb.on_display(&display))
}

/// `cuvidCreateVideoParser` handle with its callback slot.
pub struct CuvidParser {
    parser: sys::CUvideoparser,
    slot: *mut CallbackSlot,
}

// SAFETY: the parser is only driven through `&mut self`.
unsafe impl Send for CuvidParser {}

impl CuvidParser {
    pub fn new(params: &ParserParams) -> Result<Self> {
        let lib = sys::nvcuvid()?;
        let slot = Box::into_raw(Box::new(CallbackSlot {
            callbacks: None,
            error: None,
            codec: params.codec,
        }));
        let mut raw = CUVIDPARSERPARAMS {
            CodecType: cuvid_codec(params.codec),
            ulMaxNumDecodeSurfaces: params.max_decode_surfaces,
            ulClockRate: params.clock_rate,
            ulErrorThreshold: params.error_threshold,
            ulMaxDisplayDelay: params.max_display_delay,
            uReserved1: [0; 5],
            pUserData: slot.cast(),
            pfnSequenceCallback: Some(on_sequence),
            pfnDecodePicture: Some(on_decode),
            pfnDisplayPicture: Some(on_display),
            pvReserved2: [ptr::null_mut(); 7],
            pExtVideoInfo: ptr::null_mut(),
        };
        let mut parser: sys::CUvideoparser = ptr::null_mut();
        // SAFETY: `raw` is fully initialised; `slot` stays alive until drop.
        let rc = unsafe { (lib.cuvidCreateVideoParser)(&mut parser, &mut raw) };
        if let Err(e) = check_cuvid(rc, "cuvidCreateVideoParser") {
            // SAFETY: never handed out, the parser was not created.
            drop(unsafe { Box::from_raw(slot) });
            return Err(e);
        }
        debug!(codec = ?params.codec, "NVDEC parser created");
        Ok(Self { parser, slot })
    }
}

impl BitstreamParser for CuvidParser {
    fn parse(
        &mut self,
        packet: &ParserPacket<'_>,
        callbacks: &mut dyn ParserCallbacks,
    ) -> Result<()> {
        let lib = sys::nvcuvid()?;
        let mut flags = 0;
        if packet.timestamp.is_some() {
            flags |= sys::CUVID_PKT_TIMESTAMP;
        }
        if packet.discont {
            flags |= sys::CUVID_PKT_DISCONTINUITY;
        }
        if packet.end_of_stream {
            flags |= sys::CUVID_PKT_ENDOFSTREAM;
        }
        let mut raw = CUVIDSOURCEDATAPACKET {
            flags,
            payload_size: packet.data.len() as _,
            payload: if packet.data.is_empty() {
                ptr::null()
            } else {
                packet.data.as_ptr()
            },
            timestamp: packet.timestamp.unwrap_or(0) as i64,
        };

        let erased: *mut (dyn ParserCallbacks + '_) = callbacks;
        // SAFETY: the receiver is removed again before this function
        // returns, so the erased lifetime is never observed past the borrow.
        let erased: CallbackPtr = unsafe { std::mem::transmute(erased) };
        // SAFETY: the slot is owned by `self` and not aliased during parse.
        unsafe {
            (*self.slot).callbacks = Some(erased);
            (*self.slot).error = None;
        }
        // SAFETY: packet payload outlives the call; callbacks run on this thread.
        let rc = unsafe { (lib.cuvidParseVideoData)(self.parser, &mut raw) };
        // SAFETY: as above.
        let error = unsafe {
            (*self.slot).callbacks = None;
            (*self.slot).error.take()
        };
        trace!(len = packet.data.len(), rc, "parsed packet");
        if let Some(e) = error {
            return Err(e);
        }
        check_cuvid(rc, "cuvidParseVideoData")
    }
}

impl Drop for CuvidParser {
    fn drop(&mut self) {
        if let Ok(lib) = sys::nvcuvid() {
            if !self.parser.is_null() {
                // SAFETY: the parser is owned and no parse is in flight.
                let rc = unsafe { (lib.cuvidDestroyVideoParser)(self.parser) };
                if let Err(e) = check_cuvid(rc, "cuvidDestroyVideoParser") {
                    warn!(%e, "parser teardown failed");
                }
            }
        }
        // SAFETY: allocated in `new`, released exactly once here.
        drop(unsafe { Box::from_raw(self.slot) });
    }
}

// ─── Decoder ─────────────────────────────────────────────────────────────

fn short(v: i32) -> i16 {
    v.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// `cuvidCreateDecoder` handle.
pub struct CuvidDecoder {
    decoder: sys::CUvideodecoder,
    ctx: Arc<CudaContext>,
}

// SAFETY: decoder calls happen with the owning context pushed on the
// calling thread; the handle itself is thread agnostic.
unsafe impl Send for CuvidDecoder {}

impl CuvidDecoder {
    /// Create a decoder.  The context must be current.
    pub fn new(ctx: Arc<CudaContext>, params: &DecoderParams) -> Result<Self> {
        let lib = sys::nvcuvid()?;
        let mut info = CUVIDDECODECREATEINFO {
            ulWidth: params.coded_width as _,
            ulHeight: params.coded_height as _,
            ulNumDecodeSurfaces: params.num_decode_surfaces as _,
            CodecType: cuvid_codec(params.codec),
            ChromaFormat: cuvid_chroma(params.chroma)?,
            ulCreationFlags: sys::CUDA_VIDEO_CREATE_PREFER_CUVID,
            bitDepthMinus8: params.bit_depth_minus8 as _,
            ulIntraDecodeOnly: 0,
            ulMaxWidth: params.coded_width as _,
            ulMaxHeight: params.coded_height as _,
            Reserved1: 0,
            display_area: CUVIDRECT {
                left: short(params.display_area.left),
                top: short(params.display_area.top),
                right: short(params.display_area.right),
                bottom: short(params.display_area.bottom),
            },
            OutputFormat: cuvid_surface(params.output_format),
            DeinterlaceMode: match params.deinterlace {
                DeinterlaceMode::Weave => cudaVideoDeinterlaceMode::Weave,
                DeinterlaceMode::Bob => cudaVideoDeinterlaceMode::Bob,
                DeinterlaceMode::Adaptive => cudaVideoDeinterlaceMode::Adaptive,
            },
            ulTargetWidth: params.target_width as _,
            ulTargetHeight: params.target_height as _,
            ulNumOutputSurfaces: params.num_output_surfaces as _,
            vidLock: ptr::null_mut(),
            target_rect: CUVIDRECT::default(),
            Reserved2: [0; 5],
        };
        let mut decoder: sys::CUvideodecoder = ptr::null_mut();
        // SAFETY: `info` is fully initialised; the context is current.
        check_cuvid(
            unsafe { (lib.cuvidCreateDecoder)(&mut decoder, &mut info) },
            "cuvidCreateDecoder",
        )?;
        debug!(
            codec = ?params.codec,
            width = params.coded_width,
            height = params.coded_height,
            surfaces = params.num_decode_surfaces,
            "NVDEC decoder created"
        );
        Ok(Self { decoder, ctx })
    }
}

impl HwDecoder for CuvidDecoder {
    fn decode_picture(&mut self, picture: &DecodePicture<'_>) -> Result<()> {
        let lib = sys::nvcuvid()?;
        let Some(PicParamsPtr(params)) = picture.params.downcast_ref::<PicParamsPtr>().copied()
        else {
            return Err(CodecError::InvariantViolation(
                "decode picture did not come from the NVDEC parser".into(),
            ));
        };
        // SAFETY: `params` is valid for the enclosing decode callback.
        check_cuvid(
            unsafe { (lib.cuvidDecodePicture)(self.decoder, params) },
            "cuvidDecodePicture",
        )
    }

    fn map_frame(&mut self, picture_index: i32, params: &ProcParams) -> Result<MappedSurface> {
        let lib = sys::nvcuvid()?;
        // SAFETY: plain data.
        let mut proc_params: CUVIDPROCPARAMS = unsafe { zeroed() };
        proc_params.progressive_frame = c_int::from(params.progressive_frame);
        proc_params.top_field_first = c_int::from(params.top_field_first);
        proc_params.second_field = params.second_field;
        proc_params.unpaired_field = c_int::from(params.unpaired_field);
        proc_params.output_stream = params.stream.0 as sys::CUstream;
        let mut ptr: sys::CUdeviceptr = 0;
        let mut pitch = 0u32;
        // SAFETY: out pointers are valid; the picture index came from the parser.
        check_cuvid(
            unsafe {
                (lib.cuvidMapVideoFrame)(
                    self.decoder,
                    picture_index,
                    &mut ptr,
                    &mut pitch,
                    &mut proc_params,
                )
            },
            "cuvidMapVideoFrame",
        )?;
        Ok(MappedSurface {
            ptr,
            pitch: pitch as usize,
        })
    }

    fn unmap_frame(&mut self, surface: MappedSurface) -> Result<()> {
        let lib = sys::nvcuvid()?;
        // SAFETY: the surface came from `map_frame`.
        check_cuvid(
            unsafe { (lib.cuvidUnmapVideoFrame)(self.decoder, surface.ptr) },
            "cuvidUnmapVideoFrame",
        )
    }
}

impl Drop for CuvidDecoder {
    fn drop(&mut self) {
        let Ok(lib) = sys::nvcuvid() else {
            return;
        };
        if let Err(e) = self.ctx.push() {
            warn!(%e, "cannot push context to destroy decoder");
            return;
        }
        // SAFETY: owned handle, context current.
        let rc = unsafe { (lib.cuvidDestroyDecoder)(self.decoder) };
        if let Err(e) = check_cuvid(rc, "cuvidDestroyDecoder") {
            warn!(%e, "decoder teardown failed");
        }
        if let Err(e) = self.ctx.pop() {
            warn!(%e, "context pop after decoder teardown failed");
        }
    }
}

/// Query decode capabilities.  `Ok(None)` on drivers without the query.
pub fn decoder_caps(ctx: &CudaContext, query: &DecoderCapsQuery) -> Result<Option<DecoderCaps>> {
    let lib = sys::nvcuvid()?;
    let Some(get_caps) = lib.cuvidGetDecoderCaps else {
        return Ok(None);
    };
    let chroma = match cuvid_chroma(query.chroma) {
        Ok(c) => c,
        Err(_) => return Ok(Some(unsupported_caps())),
    };
    // SAFETY: plain data with valid zero enum values, overwritten below.
    let mut caps: sys::CUVIDDECODECAPS = unsafe { zeroed() };
    caps.eCodecType = cuvid_codec(query.codec);
    caps.eChromaFormat = chroma;
    caps.nBitDepthMinus8 = query.bit_depth_minus8;

    ctx.push()?;
    // SAFETY: `caps` is initialised and the context is current.
    let rc = unsafe { get_caps(&mut caps) };
    ctx.pop()?;
    check_cuvid(rc, "cuvidGetDecoderCaps")?;

    Ok(Some(DecoderCaps {
        supported: caps.bIsSupported != 0,
        min_width: u32::from(caps.nMinWidth),
        min_height: u32::from(caps.nMinHeight),
        max_width: caps.nMaxWidth,
        max_height: caps.nMaxHeight,
        output_formats: surface_formats_from_mask(caps.nOutputFormatMask),
    }))
}

fn unsupported_caps() -> DecoderCaps {
    DecoderCaps {
        supported: false,
        min_width: 0,
        min_height: 0,
        max_width: 0,
        max_height: 0,
        output_formats: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_mask_bits_follow_surface_enum() {
        assert_eq!(surface_formats_from_mask(0b0001), vec![SurfaceFormat::Nv12]);
        assert_eq!(
            surface_formats_from_mask(0b1010),
            vec![SurfaceFormat::P016, SurfaceFormat::Yuv444_16]
        );
        assert!(surface_formats_from_mask(0).is_empty());
    }

    #[test]
    fn codec_mapping_is_symmetric() {
        for codec in CodecId::DECODABLE {
            assert_eq!(codec_from_cuvid(cuvid_codec(codec), CodecId::H264), codec);
        }
    }

    #[test]
    fn rgb_chroma_is_not_decodable() {
        assert!(cuvid_chroma(ChromaFormat::Rgb).is_err());
        assert_eq!(chroma_from_cuvid(cudaVideoChromaFormat::YUV444), ChromaFormat::Yuv444);
    }

    #[test]
    fn sequence_info_reads_signal_description() {
        let format = CUVIDEOFORMAT {
            codec: cudaVideoCodec::HEVC,
            frame_rate: sys::CUVIDFRAMERATE {
                numerator: 30000,
                denominator: 1001,
            },
            progressive_sequence: 1,
            bit_depth_luma_minus8: 2,
            bit_depth_chroma_minus8: 2,
            min_num_decode_surfaces: 9,
            coded_width: 1920,
            coded_height: 1088,
            display_area: sys::CUVIDDISPLAYAREA {
                left: 0,
                top: 0,
                right: 1920,
                bottom: 1080,
            },
            chroma_format: cudaVideoChromaFormat::YUV420,
            bitrate: 0,
            display_aspect_ratio: sys::CUVIDASPECTRATIO { x: 16, y: 9 },
            video_signal_description: sys::CUVIDSIGNALDESCRIPTION {
                flags: 0x8 | 5,
                color_primaries: 9,
                transfer_characteristics: 16,
                matrix_coefficients: 9,
            },
            seqhdr_data_length: 0,
        };
        let info = sequence_info(&format, CodecId::H264);
        assert_eq!(info.codec, CodecId::H265);
        assert_eq!(info.display_area.height(), 1080);
        assert_eq!(info.bit_depth_luma_minus8, 2);
        assert!(info.video_full_range);
        assert_eq!(info.transfer_characteristics, 16);
        assert_eq!(info.min_decode_surfaces, 9);
    }
}
