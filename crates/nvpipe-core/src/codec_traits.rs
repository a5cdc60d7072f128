//! Codec capability ports.
//!
//! The element state machines in `nvpipe-elements` talk to the hardware
//! only through these traits.  `nvpipe-nvcodec` implements them on top of
//! NVENC/NVDEC; `nvpipe-elements::loopback` implements them in software so
//! the buffer lifecycle can be tested without a GPU.

use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, FlowError, Result};
use crate::types::{
    AccessUnit, ChromaFormat, CodecId, CompressedCaps, DecodedFrame, ExternalMemory, MemoryKind,
    PixelFormat, TextureFrame, VideoInfo,
};

// ─── Handles ─────────────────────────────────────────────────────────────

/// Device virtual address.
pub type DevicePtr = u64;

/// Command stream handle. `DEFAULT` is the device's null stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub usize);

impl StreamHandle {
    pub const DEFAULT: Self = Self(0);

    pub fn is_default(self) -> bool {
        self.0 == 0
    }
}

/// Opaque hardware object: input surface, bitstream buffer, registered or
/// mapped resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HwHandle(pub usize);

/// Pitched device allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PitchedAlloc {
    pub ptr: DevicePtr,
    pub pitch: usize,
}

// ─── Platform and device ─────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub ordinal: u32,
    pub name: String,
    pub total_mem_bytes: u64,
}

/// Entry point of a codec backend.
pub trait CodecPlatform: Send + Sync {
    /// Short backend identifier for logs and inspection.
    fn backend_name(&self) -> &'static str;
    fn device_count(&self) -> Result<u32>;
    fn device_info(&self, ordinal: u32) -> Result<DeviceInfo>;
    fn open_device(&self, ordinal: u32) -> Result<Arc<dyn GpuDevice>>;
}

/// Source of a 2D copy.
pub enum CopySrc<'a> {
    Host(&'a [u8]),
    Device(DevicePtr),
}

/// Destination of a 2D copy.
pub enum CopyDst<'a> {
    Host(&'a mut [u8]),
    Device(DevicePtr),
}

/// Strided 2D copy of `height` rows of `width_bytes` each.
pub struct Copy2d<'a> {
    pub src: CopySrc<'a>,
    pub src_pitch: usize,
    pub dst: CopyDst<'a>,
    pub dst_pitch: usize,
    pub width_bytes: usize,
    pub height: usize,
}

impl Copy2d<'_> {
    /// Bytes a linear buffer needs to hold this copy with `pitch`.
    pub fn span(&self, pitch: usize) -> usize {
        if self.height == 0 {
            0
        } else {
            (self.height - 1) * pitch + self.width_bytes
        }
    }

    /// Reject copies that overrun host slices or have pitch < width.
    pub fn validate(&self) -> Result<()> {
        if self.src_pitch < self.width_bytes || self.dst_pitch < self.width_bytes {
            return Err(CodecError::InvariantViolation(format!(
                "copy pitch smaller than row: src {} dst {} width {}",
                self.src_pitch, self.dst_pitch, self.width_bytes
            )));
        }
        if let CopySrc::Host(src) = &self.src {
            let need = self.span(self.src_pitch);
            if src.len() < need {
                return Err(CodecError::BufferTooSmall {
                    need,
                    have: src.len(),
                });
            }
        }
        if let CopyDst::Host(dst) = &self.dst {
            let need = self.span(self.dst_pitch);
            if dst.len() < need {
                return Err(CodecError::BufferTooSmall {
                    need,
                    have: dst.len(),
                });
            }
        }
        Ok(())
    }
}

/// One GPU with its own context.
///
/// Context "current" state is per thread: every hardware call must be
/// bracketed by `push_context`/`pop_context` on the calling thread
/// (see [`crate::context::ContextGuard`]).
pub trait GpuDevice: Send + Sync {
    fn ordinal(&self) -> u32;
    fn push_context(&self) -> Result<()>;
    fn pop_context(&self) -> Result<()>;
    fn create_stream(&self) -> Result<StreamHandle>;
    fn destroy_stream(&self, stream: StreamHandle) -> Result<()>;
    fn synchronize(&self, stream: StreamHandle) -> Result<()>;
    fn alloc_pitched(&self, width_bytes: usize, height: usize) -> Result<PitchedAlloc>;
    fn free(&self, ptr: DevicePtr) -> Result<()>;
    fn copy_2d(&self, copy: Copy2d<'_>, stream: StreamHandle) -> Result<()>;

    fn open_encode_session(&self) -> Result<Arc<dyn EncodeSession>>;
    fn create_parser(&self, params: &ParserParams) -> Result<Box<dyn BitstreamParser>>;
    fn create_decoder(&self, params: &DecoderParams) -> Result<Box<dyn HwDecoder>>;
    /// `Ok(None)` when the driver has no capability query.
    fn decoder_caps(&self, query: &DecoderCapsQuery) -> Result<Option<DecoderCaps>>;
}

// ─── Encode session ──────────────────────────────────────────────────────

/// Hardware preset identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HwPreset {
    Default,
    Hp,
    Hq,
    LowLatencyDefault,
    LowLatencyHq,
    LowLatencyHp,
    LosslessDefault,
    LosslessHp,
}

/// Hardware rate-control loops.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HwRcMode {
    ConstQp,
    Vbr,
    Cbr,
    VbrMinQp,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qp {
    pub inter_p: u32,
    pub inter_b: u32,
    pub intra: u32,
}

impl Qp {
    pub fn uniform(qp: u32) -> Self {
        Self {
            inter_p: qp,
            inter_b: qp,
            intra: qp,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RcParams {
    pub mode: HwRcMode,
    /// bits/s, 0 = preset.
    pub average_bitrate: u32,
    pub max_bitrate: u32,
    pub const_qp: Qp,
    pub min_qp: Option<Qp>,
    pub max_qp: Option<Qp>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HwProfile {
    Auto,
    H264Baseline,
    H264Main,
    H264High,
    H264High444,
    HevcMain,
    HevcMain10,
    HevcFrext,
}

impl HwProfile {
    /// Caps profile strings this hardware profile can produce.
    pub fn caps_names(self) -> &'static [&'static str] {
        match self {
            Self::Auto => &[],
            Self::H264Baseline => &["baseline", "constrained-baseline"],
            Self::H264Main => &["main"],
            Self::H264High => &["high"],
            Self::H264High444 => &["high-4:4:4"],
            Self::HevcMain => &["main"],
            Self::HevcMain10 => &["main-10"],
            Self::HevcFrext => &["main-444", "main-444-10"],
        }
    }
}

/// `gop_length` value meaning "no periodic keyframes".
pub const INFINITE_GOP: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldMode {
    #[default]
    Frame,
    Field,
}

/// Video usability information written into the sequence header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VuiParams {
    pub video_format: u32,
    pub full_range: bool,
    pub colour_primaries: u32,
    pub transfer_characteristics: u32,
    pub matrix_coefficients: u32,
}

/// Codec-specific part of the encoder configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Level idc, 0 = autoselect.
    pub level: u32,
    pub idr_period: u32,
    pub chroma_format_idc: u32,
    pub bit_depth_minus8: u32,
    pub output_aud: bool,
    pub vui: Option<VuiParams>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeConfig {
    pub profile: HwProfile,
    pub gop_length: u32,
    pub frame_interval_p: i32,
    pub field_mode: FieldMode,
    pub rc: RcParams,
    pub codec: CodecConfig,
}

impl EncodeConfig {
    pub fn has_infinite_gop(&self) -> bool {
        self.gop_length == INFINITE_GOP
    }
}

/// Session initialisation parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitParams {
    pub codec: CodecId,
    pub preset: HwPreset,
    pub width: u32,
    pub height: u32,
    /// 0 = not locked (reconfigure keeps the values from initialisation).
    pub max_width: u32,
    pub max_height: u32,
    pub dar_width: u32,
    pub dar_height: u32,
    pub fps_n: u32,
    pub fps_d: u32,
    /// Let the hardware decide picture types.
    pub enable_ptd: bool,
    pub config: EncodeConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputBufferDesc {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Raw SEI message attached to every submitted picture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeiPayload {
    pub payload_type: u32,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PictureStruct {
    #[default]
    Frame,
    FieldTopBottom,
    FieldBottomTop,
}

/// Parameters of one picture submission.
#[derive(Clone, Debug)]
pub struct PictureParams {
    pub input: HwHandle,
    pub output: HwHandle,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub format: PixelFormat,
    pub picture_struct: PictureStruct,
    pub frame_idx: u32,
    pub pts: u64,
    pub duration: u64,
    pub force_idr: bool,
    pub sei: Vec<SeiPayload>,
}

/// Outcome of a picture submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitStatus {
    /// Output will be ready in the submitted bitstream buffer.
    Accepted,
    /// Picture was buffered internally; output surfaces later.
    NeedMoreInput,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PictureType {
    P,
    B,
    I,
    Idr,
    Bi,
    Skipped,
    Unknown,
}

impl PictureType {
    /// Decodable without prior pictures.
    pub fn is_sync_point(self) -> bool {
        matches!(self, Self::I | Self::Idr)
    }
}

/// Bytes read out of a completed bitstream buffer.
#[derive(Clone, Debug)]
pub struct LockedBitstream {
    pub data: Vec<u8>,
    pub picture_type: PictureType,
    pub pts: u64,
}

/// One open hardware encoder session.
///
/// Shared between the submitting thread and the drain thread; the drain
/// thread only calls `lock_bitstream`/`unlock_bitstream`/`unmap_resource`.
pub trait EncodeSession: Send + Sync {
    fn codecs(&self) -> Result<Vec<CodecId>>;
    fn presets(&self, codec: CodecId) -> Result<Vec<HwPreset>>;
    fn input_formats(&self, codec: CodecId) -> Result<Vec<PixelFormat>>;
    fn profiles(&self, codec: CodecId) -> Result<Vec<HwProfile>>;
    fn supports_field_encoding(&self, codec: CodecId) -> Result<bool>;
    fn preset_config(&self, codec: CodecId, preset: HwPreset) -> Result<EncodeConfig>;

    fn initialize(&self, params: &InitParams) -> Result<()>;
    fn reconfigure(&self, params: &InitParams, reset_encoder: bool, force_idr: bool)
    -> Result<()>;

    fn create_input_buffer(&self, desc: &InputBufferDesc) -> Result<HwHandle>;
    fn destroy_input_buffer(&self, buffer: HwHandle) -> Result<()>;
    /// Lock `buffer`, hand its bytes and row pitch to `write`, unlock.
    fn write_input_buffer(
        &self,
        buffer: HwHandle,
        write: &mut dyn FnMut(&mut [u8], usize) -> Result<()>,
    ) -> Result<()>;

    fn register_device_buffer(
        &self,
        ptr: DevicePtr,
        pitch: usize,
        desc: &InputBufferDesc,
    ) -> Result<HwHandle>;
    fn unregister_resource(&self, resource: HwHandle) -> Result<()>;
    fn map_resource(&self, resource: HwHandle) -> Result<HwHandle>;
    fn unmap_resource(&self, mapped: HwHandle) -> Result<()>;

    fn create_bitstream_buffer(&self, size: usize) -> Result<HwHandle>;
    fn destroy_bitstream_buffer(&self, buffer: HwHandle) -> Result<()>;

    fn encode_picture(&self, params: &PictureParams) -> Result<SubmitStatus>;
    /// Submit an end-of-stream picture, flushing buffered pictures.
    fn send_eos(&self) -> Result<()>;
    /// Read a completed bitstream; with `wait` blocks until it is ready.
    fn lock_bitstream(&self, buffer: HwHandle, wait: bool) -> Result<LockedBitstream>;
    fn unlock_bitstream(&self, buffer: HwHandle) -> Result<()>;

    /// Sequence header (SPS/PPS, plus VPS for H.265) of the current config.
    fn sequence_params(&self) -> Result<Vec<u8>>;
    fn destroy(&self) -> Result<()>;
}

// ─── Parser and decoder ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParserParams {
    pub codec: CodecId,
    pub max_decode_surfaces: u32,
    /// Timestamp units per second.
    pub clock_rate: u32,
    pub error_threshold: u32,
    pub max_display_delay: u32,
}

/// Packet handed to [`BitstreamParser::parse`].
#[derive(Clone, Copy, Debug)]
pub struct ParserPacket<'a> {
    pub data: &'a [u8],
    pub timestamp: Option<u64>,
    pub discont: bool,
    pub end_of_stream: bool,
}

impl ParserPacket<'static> {
    /// Empty packet that flushes every pending display callback.
    pub fn eos() -> Self {
        Self {
            data: &[],
            timestamp: None,
            discont: false,
            end_of_stream: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DisplayArea {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl DisplayArea {
    pub fn width(&self) -> u32 {
        (self.right - self.left).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.bottom - self.top).max(0) as u32
    }
}

/// Stream format reported by the sequence callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequenceInfo {
    pub codec: CodecId,
    pub coded_width: u32,
    pub coded_height: u32,
    pub display_area: DisplayArea,
    pub chroma: ChromaFormat,
    pub bit_depth_luma_minus8: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    pub progressive: bool,
    pub min_decode_surfaces: u32,
    pub video_full_range: bool,
    pub color_primaries: u32,
    pub transfer_characteristics: u32,
    pub matrix_coefficients: u32,
}

/// Picture ready to be submitted to the decode engine.
///
/// `params` is backend specific and passed through to
/// [`HwDecoder::decode_picture`] untouched.
pub struct DecodePicture<'a> {
    pub picture_index: i32,
    pub params: &'a dyn Any,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisplayInfo {
    pub picture_index: i32,
    pub progressive_frame: bool,
    pub top_field_first: bool,
    /// -1 for a single unpaired field.
    pub repeat_first_field: i32,
    pub timestamp: u64,
}

/// Receiver of parser callbacks.
///
/// All three are invoked synchronously, in order, on the thread that called
/// [`BitstreamParser::parse`].  Returning an error stops callback delivery
/// for the current `parse` call.
pub trait ParserCallbacks {
    fn on_sequence(&mut self, sequence: &SequenceInfo) -> Result<()>;
    fn on_decode(&mut self, picture: &DecodePicture<'_>) -> Result<()>;
    fn on_display(&mut self, display: &DisplayInfo) -> Result<()>;
}

pub trait BitstreamParser: Send {
    fn parse(&mut self, packet: &ParserPacket<'_>, callbacks: &mut dyn ParserCallbacks)
    -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SurfaceFormat {
    Nv12,
    P016,
    Yuv444,
    Yuv444_16,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeinterlaceMode {
    #[default]
    Weave,
    Bob,
    Adaptive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecoderParams {
    pub codec: CodecId,
    pub coded_width: u32,
    pub coded_height: u32,
    pub chroma: ChromaFormat,
    pub bit_depth_minus8: u32,
    pub num_decode_surfaces: u32,
    pub num_output_surfaces: u32,
    pub output_format: SurfaceFormat,
    pub deinterlace: DeinterlaceMode,
    pub target_width: u32,
    pub target_height: u32,
    pub display_area: DisplayArea,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcParams {
    pub progressive_frame: bool,
    pub top_field_first: bool,
    pub second_field: i32,
    pub unpaired_field: bool,
    pub stream: StreamHandle,
}

/// Decoded surface mapped into device memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappedSurface {
    pub ptr: DevicePtr,
    pub pitch: usize,
}

pub trait HwDecoder: Send {
    fn decode_picture(&mut self, picture: &DecodePicture<'_>) -> Result<()>;
    fn map_frame(&mut self, picture_index: i32, params: &ProcParams) -> Result<MappedSurface>;
    fn unmap_frame(&mut self, surface: MappedSurface) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecoderCapsQuery {
    pub codec: CodecId,
    pub chroma: ChromaFormat,
    pub bit_depth_minus8: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderCaps {
    pub supported: bool,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub output_formats: Vec<SurfaceFormat>,
}

// ─── Texture interop ─────────────────────────────────────────────────────

/// Device-side registration of an external buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GraphicsResource(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapAccess {
    ReadOnly,
    WriteDiscard,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappedPointer {
    pub ptr: DevicePtr,
    pub size: usize,
}

/// External memory mapping service.
///
/// Lives on the thread that owns the texture API context and is only ever
/// called from tasks posted to [`TextureContext::post`]; it is deliberately
/// not `Send`.
pub trait GraphicsInterop {
    fn register(&mut self, memory: &ExternalMemory) -> Result<GraphicsResource>;
    fn unregister(&mut self, resource: GraphicsResource) -> Result<()>;
    fn map(
        &mut self,
        resource: GraphicsResource,
        access: MapAccess,
        stream: StreamHandle,
    ) -> Result<MappedPointer>;
    fn unmap(&mut self, resource: GraphicsResource, stream: StreamHandle) -> Result<()>;
}

/// Work item executed on the texture thread.
pub type TextureTask = Box<dyn FnOnce(&mut dyn GraphicsInterop) + Send>;

/// Thread-affine texture API context.
pub trait TextureContext: Send + Sync {
    /// Queue `task` on the owning thread.  Fails if the thread is gone.
    fn post(&self, task: TextureTask) -> Result<()>;
    /// Whether the context can back frames with pixel buffers.
    fn supports_pixel_buffers(&self) -> bool;
    /// Allocate one pixel buffer per plane for a frame of `info`.
    fn allocate_frame(&self, info: &VideoInfo) -> Result<TextureFrame>;
}

// ─── Downstream consumers ────────────────────────────────────────────────

/// Constraints downstream places on the encoded stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DownstreamConstraints {
    /// Accepted profile names; empty means any.
    pub profiles: Vec<String>,
    pub level: Option<String>,
}

/// Consumer of encoded access units.
pub trait EncodedSink: Send {
    fn constraints(&self) -> DownstreamConstraints {
        DownstreamConstraints::default()
    }
    fn set_output_caps(&mut self, caps: &CompressedCaps) -> std::result::Result<(), FlowError>;
    fn push(&mut self, unit: AccessUnit) -> std::result::Result<(), FlowError>;
}

/// Consumer of decoded frames.
pub trait DecodedSink: Send {
    /// Memory domains downstream accepts, in preference order.
    fn allowed_memory(&self) -> Vec<MemoryKind> {
        vec![MemoryKind::System]
    }
    fn texture_context(&self) -> Option<Arc<dyn TextureContext>> {
        None
    }
    fn negotiate(&mut self, info: &VideoInfo, memory: MemoryKind)
    -> std::result::Result<(), FlowError>;
    fn push(&mut self, frame: DecodedFrame) -> std::result::Result<(), FlowError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_validation_catches_short_host_buffers() {
        let src = vec![0u8; 100];
        let copy = Copy2d {
            src: CopySrc::Host(&src),
            src_pitch: 16,
            dst: CopyDst::Device(0x1000),
            dst_pitch: 32,
            width_bytes: 16,
            height: 8,
        };
        assert!(matches!(
            copy.validate(),
            Err(CodecError::BufferTooSmall { need: 128, have: 100 })
        ));
    }

    #[test]
    fn copy_validation_rejects_narrow_pitch() {
        let copy = Copy2d {
            src: CopySrc::Device(0x1000),
            src_pitch: 8,
            dst: CopyDst::Device(0x2000),
            dst_pitch: 32,
            width_bytes: 16,
            height: 1,
        };
        assert!(copy.validate().is_err());
    }

    #[test]
    fn last_row_does_not_need_full_pitch() {
        let src = vec![0u8; 3 * 32 + 16];
        let copy = Copy2d {
            src: CopySrc::Host(&src),
            src_pitch: 32,
            dst: CopyDst::Device(0x1000),
            dst_pitch: 32,
            width_bytes: 16,
            height: 4,
        };
        assert!(copy.validate().is_ok());
    }

    #[test]
    fn sync_point_picture_types() {
        assert!(PictureType::Idr.is_sync_point());
        assert!(PictureType::I.is_sync_point());
        assert!(!PictureType::P.is_sync_point());
    }

    #[test]
    fn display_area_size() {
        let area = DisplayArea {
            left: 0,
            top: 0,
            right: 64,
            bottom: 48,
        };
        assert_eq!((area.width(), area.height()), (64, 48));
    }
}
