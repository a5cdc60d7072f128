//! Software codec platform.
//!
//! Implements every Codec Capability port in host memory so the element
//! state machines run without a GPU: a device heap standing in for device
//! memory, an encode session that turns each picture into a
//! self-describing access unit, a parser that splits those units again and
//! drives the sequence/decode/display callbacks, and a texture backend
//! whose pixel buffers live in the device heap.
//!
//! Access unit layout (big-endian):
//!
//! ```text
//! "NVLB" ver codec ptype flags  w:u16 h:u16 fmt  fps_n:u32 fps_d:u32
//! pts:u64 idx:u32 range prim xfer matrix  n_sei payload_len:u32 fnv:u32
//! { sei_type:u8 len:u16 data }*  planes (tightly packed)
//! ```

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use nvpipe_core::codec_traits::{
    BitstreamParser, CodecPlatform, Copy2d, CopyDst, CopySrc, DecodePicture, DecoderCaps,
    DecoderCapsQuery, DecoderParams, DeviceInfo, DevicePtr, DisplayArea, DisplayInfo,
    EncodeConfig, EncodeSession, FieldMode, GpuDevice, GraphicsInterop, GraphicsResource,
    HwDecoder, HwHandle, HwPreset, HwProfile, HwRcMode, InitParams, InputBufferDesc,
    LockedBitstream, MapAccess, MappedPointer, MappedSurface, ParserCallbacks, ParserPacket,
    ParserParams, PictureParams, PictureStruct, PictureType, PitchedAlloc, ProcParams, Qp,
    RcParams, SequenceInfo, StreamHandle, SubmitStatus, SurfaceFormat, CodecConfig,
    INFINITE_GOP,
};
use nvpipe_core::error::{CodecError, Result};
use nvpipe_core::types::{
    ChromaFormat, CodecId, ExternalMemory, PixelFormat, TextureFrame, VideoInfo, round_up,
};
use nvpipe_cuda::copy::{encode_scratch_plan, input_surface_plan, input_surface_size};
use nvpipe_cuda::interop::{TextureBackend, TextureThread};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

pub const BACKEND_NAME: &str = "loopback";

const MAGIC: &[u8; 4] = b"NVLB";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 46;
/// CUDA_ERROR_INVALID_CONTEXT.
const INVALID_CONTEXT: i32 = 201;
const PITCH_ALIGN: usize = 256;

// ─── Configuration ───────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    pub devices: u32,
    /// Pictures the encoder holds before producing output.
    pub encode_delay: usize,
    /// Pictures the parser holds before the display callback.
    pub display_delay: usize,
    /// Whether `decoder_caps` answers (older drivers cannot).
    pub decoder_caps_query: bool,
    pub field_encoding: bool,
    pub stream_creation_fails: bool,
    pub texture_pixel_buffers: bool,
    pub presets: Vec<HwPreset>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            encode_delay: 0,
            display_delay: 0,
            decoder_caps_query: true,
            field_encoding: true,
            stream_creation_fails: false,
            texture_pixel_buffers: true,
            presets: vec![
                HwPreset::Default,
                HwPreset::Hp,
                HwPreset::Hq,
                HwPreset::LowLatencyDefault,
                HwPreset::LowLatencyHq,
                HwPreset::LowLatencyHp,
                HwPreset::LosslessDefault,
                HwPreset::LosslessHp,
            ],
        }
    }
}

/// Failure injection switches, shared by every object of one platform.
#[derive(Debug)]
pub struct LoopbackFaults {
    /// Fail the submission whose zero-based index equals this value.
    pub fail_encode_at: AtomicU64,
    pub fail_lock_bitstream: AtomicBool,
    pub fail_map_frame: AtomicBool,
}

impl Default for LoopbackFaults {
    fn default() -> Self {
        Self {
            fail_encode_at: AtomicU64::new(u64::MAX),
            fail_lock_bitstream: AtomicBool::new(false),
            fail_map_frame: AtomicBool::new(false),
        }
    }
}

/// Hardware-side counters.
#[derive(Debug, Default)]
pub struct LoopbackStats {
    pub sessions_opened: AtomicU64,
    pub sessions_destroyed: AtomicU64,
    pub initializations: AtomicU64,
    pub reconfigures: AtomicU64,
    pub pictures_encoded: AtomicU64,
    pub eos_pictures: AtomicU64,
    pub input_buffers: AtomicU64,
    pub bitstream_buffers: AtomicU64,
    pub parsers_created: AtomicU64,
    pub decoders_created: AtomicU64,
    pub frames_mapped: AtomicU64,
}

impl LoopbackStats {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Acquire)
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::AcqRel);
}

// ─── Context tracking ────────────────────────────────────────────────────

thread_local! {
    static CURRENT: RefCell<Vec<u32>> = const { RefCell::new(Vec::new()) };
}

fn require_current(ordinal: u32, call: &'static str) -> Result<()> {
    let current = CURRENT.with(|c| c.borrow().last() == Some(&ordinal));
    if current {
        Ok(())
    } else {
        Err(CodecError::Driver {
            call,
            code: INVALID_CONTEXT,
        })
    }
}

// ─── Device heap ─────────────────────────────────────────────────────────

#[derive(Default)]
struct HeapState {
    next: u64,
    allocs: BTreeMap<DevicePtr, Vec<u8>>,
}

impl HeapState {
    fn span_mut(&mut self, ptr: DevicePtr, len: usize) -> Result<&mut [u8]> {
        let (base, block) = self
            .allocs
            .range_mut(..=ptr)
            .next_back()
            .ok_or_else(|| CodecError::InvariantViolation(format!("{ptr:#x} not allocated")))?;
        let start = (ptr - *base) as usize;
        let end = start + len;
        if end > block.len() {
            return Err(CodecError::InvariantViolation(format!(
                "access {ptr:#x}+{len} overruns allocation {base:#x}+{}",
                block.len()
            )));
        }
        Ok(&mut block[start..end])
    }
}

/// Host memory addressed like device memory.
pub struct DeviceHeap {
    state: Mutex<HeapState>,
}

impl Default for DeviceHeap {
    fn default() -> Self {
        Self {
            state: Mutex::new(HeapState {
                next: 0x1_0000_0000,
                allocs: BTreeMap::new(),
            }),
        }
    }
}

impl DeviceHeap {
    pub fn alloc(&self, size: usize) -> DevicePtr {
        let mut state = self.state.lock();
        let ptr = state.next;
        state.next += round_up(size.max(1), 4096) as u64 + 4096;
        state.allocs.insert(ptr, vec![0; size]);
        ptr
    }

    pub fn free(&self, ptr: DevicePtr) -> Result<()> {
        self.state
            .lock()
            .allocs
            .remove(&ptr)
            .map(|_| ())
            .ok_or_else(|| CodecError::InvariantViolation(format!("double free of {ptr:#x}")))
    }

    pub fn read(&self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>> {
        Ok(self.state.lock().span_mut(ptr, len)?.to_vec())
    }

    pub fn write(&self, ptr: DevicePtr, data: &[u8]) -> Result<()> {
        self.state
            .lock()
            .span_mut(ptr, data.len())?
            .copy_from_slice(data);
        Ok(())
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocs.len()
    }

    fn copy_2d(&self, copy: Copy2d<'_>) -> Result<()> {
        copy.validate()?;
        let Copy2d {
            src,
            src_pitch,
            dst,
            dst_pitch,
            width_bytes,
            height,
        } = copy;
        let mut state = self.state.lock();
        let mut row = vec![0u8; width_bytes];
        let mut dst = dst;
        for r in 0..height {
            match &src {
                CopySrc::Host(s) => {
                    row.copy_from_slice(&s[r * src_pitch..r * src_pitch + width_bytes])
                }
                CopySrc::Device(p) => row.copy_from_slice(
                    state.span_mut(p + (r * src_pitch) as u64, width_bytes)?,
                ),
            }
            match &mut dst {
                CopyDst::Host(d) => {
                    d[r * dst_pitch..r * dst_pitch + width_bytes].copy_from_slice(&row)
                }
                CopyDst::Device(p) => state
                    .span_mut(*p + (r * dst_pitch) as u64, width_bytes)?
                    .copy_from_slice(&row),
            }
        }
        Ok(())
    }
}

// ─── Platform and device ─────────────────────────────────────────────────

pub struct LoopbackPlatform {
    config: LoopbackConfig,
    heap: Arc<DeviceHeap>,
    faults: Arc<LoopbackFaults>,
    stats: Arc<LoopbackStats>,
}

impl LoopbackPlatform {
    pub fn new(config: LoopbackConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            heap: Arc::new(DeviceHeap::default()),
            faults: Arc::new(LoopbackFaults::default()),
            stats: Arc::new(LoopbackStats::default()),
        })
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    pub fn heap(&self) -> &Arc<DeviceHeap> {
        &self.heap
    }

    pub fn faults(&self) -> &Arc<LoopbackFaults> {
        &self.faults
    }

    pub fn stats(&self) -> &Arc<LoopbackStats> {
        &self.stats
    }

    /// Texture context whose pixel buffers live in this platform's heap.
    pub fn texture_context(&self, name: &str) -> Result<Arc<TextureThread>> {
        let heap = self.heap.clone();
        let pixel_buffers = self.config.texture_pixel_buffers;
        TextureThread::spawn(name, move || {
            Ok(Box::new(HeapTextureBackend::new(heap, pixel_buffers)) as Box<dyn TextureBackend>)
        })
    }

    /// Contents of one texture plane.
    pub fn read_texture(&self, memory: &ExternalMemory) -> Result<Vec<u8>> {
        self.heap.read(texture_ptr(memory), memory.size)
    }

    pub fn write_texture(&self, memory: &ExternalMemory, data: &[u8]) -> Result<()> {
        self.heap.write(texture_ptr(memory), data)
    }
}

impl CodecPlatform for LoopbackPlatform {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn device_count(&self) -> Result<u32> {
        Ok(self.config.devices)
    }

    fn device_info(&self, ordinal: u32) -> Result<DeviceInfo> {
        if ordinal >= self.config.devices {
            return Err(CodecError::ContextCreate(format!("no device {ordinal}")));
        }
        Ok(DeviceInfo {
            ordinal,
            name: format!("Loopback Device {ordinal}"),
            total_mem_bytes: 1 << 30,
        })
    }

    fn open_device(&self, ordinal: u32) -> Result<Arc<dyn GpuDevice>> {
        self.device_info(ordinal)?;
        Ok(Arc::new(LoopbackDevice {
            ordinal,
            config: self.config.clone(),
            heap: self.heap.clone(),
            faults: self.faults.clone(),
            stats: self.stats.clone(),
            next_stream: AtomicU64::new(1),
        }))
    }
}

pub struct LoopbackDevice {
    ordinal: u32,
    config: LoopbackConfig,
    heap: Arc<DeviceHeap>,
    faults: Arc<LoopbackFaults>,
    stats: Arc<LoopbackStats>,
    next_stream: AtomicU64,
}

impl GpuDevice for LoopbackDevice {
    fn ordinal(&self) -> u32 {
        self.ordinal
    }

    fn push_context(&self) -> Result<()> {
        CURRENT.with(|c| c.borrow_mut().push(self.ordinal));
        Ok(())
    }

    fn pop_context(&self) -> Result<()> {
        let popped = CURRENT.with(|c| c.borrow_mut().pop());
        match popped {
            Some(o) if o == self.ordinal => Ok(()),
            _ => Err(CodecError::Driver {
                call: "cuCtxPopCurrent",
                code: INVALID_CONTEXT,
            }),
        }
    }

    fn create_stream(&self) -> Result<StreamHandle> {
        require_current(self.ordinal, "cuStreamCreate")?;
        if self.config.stream_creation_fails {
            return Err(CodecError::Driver {
                call: "cuStreamCreate",
                code: 2,
            });
        }
        Ok(StreamHandle(
            self.next_stream.fetch_add(1, Ordering::Relaxed) as usize
        ))
    }

    fn destroy_stream(&self, _stream: StreamHandle) -> Result<()> {
        require_current(self.ordinal, "cuStreamDestroy")
    }

    fn synchronize(&self, _stream: StreamHandle) -> Result<()> {
        require_current(self.ordinal, "cuStreamSynchronize")
    }

    fn alloc_pitched(&self, width_bytes: usize, height: usize) -> Result<PitchedAlloc> {
        require_current(self.ordinal, "cuMemAllocPitch")?;
        let pitch = round_up(width_bytes.max(1), PITCH_ALIGN);
        Ok(PitchedAlloc {
            ptr: self.heap.alloc(pitch * height),
            pitch,
        })
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        require_current(self.ordinal, "cuMemFree")?;
        self.heap.free(ptr)
    }

    fn copy_2d(&self, copy: Copy2d<'_>, _stream: StreamHandle) -> Result<()> {
        require_current(self.ordinal, "cuMemcpy2DAsync")?;
        self.heap.copy_2d(copy)
    }

    fn open_encode_session(&self) -> Result<Arc<dyn EncodeSession>> {
        require_current(self.ordinal, "nvEncOpenEncodeSessionEx")?;
        bump(&self.stats.sessions_opened);
        Ok(Arc::new(LoopbackEncodeSession {
            ordinal: self.ordinal,
            config: self.config.clone(),
            heap: self.heap.clone(),
            faults: self.faults.clone(),
            stats: self.stats.clone(),
            state: Mutex::new(EncState::default()),
            ready: Condvar::new(),
        }))
    }

    fn create_parser(&self, params: &ParserParams) -> Result<Box<dyn BitstreamParser>> {
        bump(&self.stats.parsers_created);
        Ok(Box::new(LoopbackParser {
            params: *params,
            display_delay: self.config.display_delay,
            sequence: None,
            decoded: 0,
            display_queue: VecDeque::new(),
        }))
    }

    fn create_decoder(&self, params: &DecoderParams) -> Result<Box<dyn HwDecoder>> {
        require_current(self.ordinal, "cuvidCreateDecoder")?;
        bump(&self.stats.decoders_created);
        debug!(
            codec = ?params.codec,
            width = params.target_width,
            height = params.target_height,
            "loopback decoder created"
        );
        Ok(Box::new(LoopbackDecoder {
            ordinal: self.ordinal,
            params: *params,
            heap: self.heap.clone(),
            faults: self.faults.clone(),
            stats: self.stats.clone(),
            pictures: HashMap::new(),
            mapped: Vec::new(),
        }))
    }

    fn decoder_caps(&self, query: &DecoderCapsQuery) -> Result<Option<DecoderCaps>> {
        if !self.config.decoder_caps_query {
            return Ok(None);
        }
        let bd = query.bit_depth_minus8;
        let supported = match (query.chroma, query.codec) {
            (ChromaFormat::Yuv420, CodecId::H265 | CodecId::Vp9) => matches!(bd, 0 | 2 | 4),
            (ChromaFormat::Yuv420, CodecId::H264) => matches!(bd, 0 | 2),
            (ChromaFormat::Yuv420, _) => bd == 0,
            (ChromaFormat::Yuv444, CodecId::H265) => matches!(bd, 0 | 2 | 4),
            (ChromaFormat::Yuv444, CodecId::H264 | CodecId::Vp9) => bd == 0,
            _ => false,
        };
        if !supported {
            return Ok(Some(DecoderCaps {
                supported: false,
                min_width: 0,
                min_height: 0,
                max_width: 0,
                max_height: 0,
                output_formats: Vec::new(),
            }));
        }
        let output = match (query.chroma, bd) {
            (ChromaFormat::Yuv444, 0) => SurfaceFormat::Yuv444,
            (ChromaFormat::Yuv444, _) => SurfaceFormat::Yuv444_16,
            (_, 0) => SurfaceFormat::Nv12,
            _ => SurfaceFormat::P016,
        };
        let max = if query.codec == CodecId::H265 { 8192 } else { 4096 };
        Ok(Some(DecoderCaps {
            supported: true,
            min_width: 48,
            min_height: 16,
            max_width: max,
            max_height: max,
            output_formats: vec![output],
        }))
    }
}

// ─── Access units ────────────────────────────────────────────────────────

const FLAG_INTERLACED: u8 = 1 << 0;
const FLAG_TFF: u8 = 1 << 1;
const FLAG_DECODE_ONLY: u8 = 1 << 2;

fn codec_code(codec: CodecId) -> u8 {
    CodecId::DECODABLE
        .iter()
        .position(|c| *c == codec)
        .unwrap_or(0) as u8
}

fn format_code(format: PixelFormat) -> u8 {
    PixelFormat::ALL
        .iter()
        .position(|f| *f == format)
        .unwrap_or(0) as u8
}

fn picture_type_code(t: PictureType) -> u8 {
    match t {
        PictureType::P => 0,
        PictureType::B => 1,
        PictureType::I => 2,
        PictureType::Idr => 3,
        PictureType::Bi => 4,
        PictureType::Skipped => 5,
        PictureType::Unknown => 6,
    }
}

fn picture_type_from(code: u8) -> PictureType {
    match code {
        0 => PictureType::P,
        1 => PictureType::B,
        2 => PictureType::I,
        3 => PictureType::Idr,
        4 => PictureType::Bi,
        5 => PictureType::Skipped,
        _ => PictureType::Unknown,
    }
}

fn fnv1a(data: &[u8]) -> u32 {
    data.iter().fold(0x811c_9dc5u32, |h, b| {
        (h ^ *b as u32).wrapping_mul(0x0100_0193)
    })
}

/// Decoded header of one loopback access unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitHeader {
    pub codec: CodecId,
    pub picture_type: PictureType,
    pub interlaced: bool,
    pub top_field_first: bool,
    pub decode_only: bool,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub fps_n: u32,
    pub fps_d: u32,
    pub pts: u64,
    pub frame_idx: u32,
    pub full_range: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
}

/// One parsed access unit.
#[derive(Clone, Debug)]
pub struct Unit {
    pub header: UnitHeader,
    pub sei: Vec<(u8, Vec<u8>)>,
    pub payload: Vec<u8>,
}

impl Unit {
    pub fn encode(&self) -> Vec<u8> {
        let h = &self.header;
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.push(codec_code(h.codec));
        out.push(picture_type_code(h.picture_type));
        let mut flags = 0;
        if h.interlaced {
            flags |= FLAG_INTERLACED;
        }
        if h.top_field_first {
            flags |= FLAG_TFF;
        }
        if h.decode_only {
            flags |= FLAG_DECODE_ONLY;
        }
        out.push(flags);
        out.extend_from_slice(&(h.width as u16).to_be_bytes());
        out.extend_from_slice(&(h.height as u16).to_be_bytes());
        out.push(format_code(h.format));
        out.extend_from_slice(&h.fps_n.to_be_bytes());
        out.extend_from_slice(&h.fps_d.to_be_bytes());
        out.extend_from_slice(&h.pts.to_be_bytes());
        out.extend_from_slice(&h.frame_idx.to_be_bytes());
        out.push(h.full_range as u8);
        out.push(h.colour_primaries);
        out.push(h.transfer_characteristics);
        out.push(h.matrix_coefficients);
        out.push(self.sei.len() as u8);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&fnv1a(&self.payload).to_be_bytes());
        for (ty, data) in &self.sei {
            out.push(*ty);
            out.extend_from_slice(&(data.len() as u16).to_be_bytes());
            out.extend_from_slice(data);
        }
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse the unit at the start of `data`; returns it and its length.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let corrupt = |what: &str| CodecError::Decode(format!("corrupt access unit: {what}"));
        if data.len() < HEADER_LEN || &data[..4] != MAGIC {
            return Err(corrupt("bad magic"));
        }
        if data[4] != VERSION {
            return Err(corrupt("unknown version"));
        }
        let be16 = |o: usize| u16::from_be_bytes([data[o], data[o + 1]]) as u32;
        let be32 = |o: usize| u32::from_be_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);
        let mut pts = [0u8; 8];
        pts.copy_from_slice(&data[21..29]);
        let flags = data[7];
        let header = UnitHeader {
            codec: *CodecId::DECODABLE
                .get(data[5] as usize)
                .ok_or_else(|| corrupt("codec"))?,
            picture_type: picture_type_from(data[6]),
            interlaced: flags & FLAG_INTERLACED != 0,
            top_field_first: flags & FLAG_TFF != 0,
            decode_only: flags & FLAG_DECODE_ONLY != 0,
            width: be16(8),
            height: be16(10),
            format: *PixelFormat::ALL
                .get(data[12] as usize)
                .ok_or_else(|| corrupt("format"))?,
            fps_n: be32(13),
            fps_d: be32(17),
            pts: u64::from_be_bytes(pts),
            frame_idx: be32(29),
            full_range: data[33] != 0,
            colour_primaries: data[34],
            transfer_characteristics: data[35],
            matrix_coefficients: data[36],
        };
        let n_sei = data[37] as usize;
        let payload_len = be32(38) as usize;
        let checksum = be32(42);
        let mut pos = HEADER_LEN;
        let mut sei = Vec::with_capacity(n_sei);
        for _ in 0..n_sei {
            if pos + 3 > data.len() {
                return Err(corrupt("truncated SEI"));
            }
            let ty = data[pos];
            let len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
            pos += 3;
            if pos + len > data.len() {
                return Err(corrupt("truncated SEI"));
            }
            sei.push((ty, data[pos..pos + len].to_vec()));
            pos += len;
        }
        if pos + payload_len > data.len() {
            return Err(corrupt("truncated payload"));
        }
        let payload = data[pos..pos + payload_len].to_vec();
        if fnv1a(&payload) != checksum {
            return Err(corrupt("checksum mismatch"));
        }
        Ok((
            Self {
                header,
                sei,
                payload,
            },
            pos + payload_len,
        ))
    }
}

/// Every unit in a buffer.
pub fn split_units(mut data: &[u8]) -> Result<Vec<Unit>> {
    let mut units = Vec::new();
    while !data.is_empty() {
        let (unit, used) = Unit::decode(data)?;
        units.push(unit);
        data = &data[used..];
    }
    Ok(units)
}

/// Tightly packed planes of a frame of `format`.
fn tight_strides(format: PixelFormat, width: usize) -> Vec<usize> {
    (0..format.n_planes())
        .map(|p| format.plane_width_bytes(p, width))
        .collect()
}

fn tight_size(format: PixelFormat, width: usize, height: usize) -> usize {
    (0..format.n_planes())
        .map(|p| format.plane_width_bytes(p, width) * format.plane_height(p, height))
        .sum()
}

// ─── Encode session ──────────────────────────────────────────────────────

struct HostSurface {
    desc: InputBufferDesc,
    pitch: usize,
    data: Vec<u8>,
}

struct Registration {
    ptr: DevicePtr,
    pitch: usize,
    desc: InputBufferDesc,
}

enum Bitstream {
    Idle,
    Pending,
    Ready(LockedBitstream),
    Locked,
}

#[derive(Default)]
struct EncState {
    init: Option<InitParams>,
    next_handle: usize,
    inputs: HashMap<usize, HostSurface>,
    registered: HashMap<usize, Registration>,
    mapped: HashMap<usize, usize>,
    bitstreams: HashMap<usize, Bitstream>,
    held: Vec<(usize, LockedBitstream)>,
    since_idr: u32,
    force_idr: bool,
    destroyed: bool,
}

impl EncState {
    fn handle(&mut self) -> usize {
        self.next_handle += 1;
        self.next_handle
    }

    fn complete_held(&mut self) -> usize {
        let held = std::mem::take(&mut self.held);
        let n = held.len();
        for (buffer, bitstream) in held {
            if let Some(slot) = self.bitstreams.get_mut(&buffer) {
                *slot = Bitstream::Ready(bitstream);
            }
        }
        n
    }

    fn init(&self) -> Result<&InitParams> {
        self.init
            .as_ref()
            .ok_or_else(|| CodecError::Encode("encoder not initialized".into()))
    }
}

pub struct LoopbackEncodeSession {
    ordinal: u32,
    config: LoopbackConfig,
    heap: Arc<DeviceHeap>,
    faults: Arc<LoopbackFaults>,
    stats: Arc<LoopbackStats>,
    state: Mutex<EncState>,
    ready: Condvar,
}

const ENCODE_CODECS: [CodecId; 2] = [CodecId::H264, CodecId::H265];

impl LoopbackEncodeSession {
    fn check_codec(&self, codec: CodecId) -> Result<()> {
        if ENCODE_CODECS.contains(&codec) {
            Ok(())
        } else {
            Err(CodecError::UnsupportedFormat(format!(
                "loopback cannot encode {codec:?}"
            )))
        }
    }

    fn read_input(&self, state: &EncState, params: &PictureParams) -> Result<Vec<u8>> {
        let (w, h) = (params.width as usize, params.height as usize);
        let format = params.format;
        let strides = tight_strides(format, w);
        let mut out = vec![0u8; tight_size(format, w, h)];
        let mut tight_offsets = Vec::with_capacity(strides.len());
        let mut offset = 0;
        for (p, stride) in strides.iter().enumerate() {
            tight_offsets.push(offset);
            offset += stride * format.plane_height(p, h);
        }

        if let Some(surface) = state.inputs.get(&params.input.0) {
            let plan = input_surface_plan(format, w, h, &strides, surface.pitch);
            for copy in plan {
                for row in 0..copy.height {
                    let s = copy.dst_offset + row * copy.dst_pitch;
                    let d = tight_offsets[copy.plane] + row * copy.width_bytes;
                    out[d..d + copy.width_bytes]
                        .copy_from_slice(&surface.data[s..s + copy.width_bytes]);
                }
            }
            return Ok(out);
        }

        let registration = state
            .mapped
            .get(&params.input.0)
            .and_then(|r| state.registered.get(r))
            .ok_or_else(|| CodecError::Encode(format!("unknown input {:?}", params.input)))?;
        if registration.desc.format != format {
            return Err(CodecError::Encode(format!(
                "resource registered as {:?}, submitted as {format:?}",
                registration.desc.format
            )));
        }
        let plan = encode_scratch_plan(format, w, h, &strides, registration.pitch);
        for copy in plan {
            for row in 0..copy.height {
                let src = registration.ptr + (copy.dst_offset + row * copy.dst_pitch) as u64;
                let bytes = self.heap.read(src, copy.width_bytes)?;
                let d = tight_offsets[copy.plane] + row * copy.width_bytes;
                out[d..d + copy.width_bytes].copy_from_slice(&bytes);
            }
        }
        Ok(out)
    }
}

fn default_level(codec: CodecId, width: u32, height: u32) -> u32 {
    let mbs = round_up(width as usize, 16) / 16 * (round_up(height as usize, 16) / 16);
    match (codec, mbs) {
        (CodecId::H265, m) if m <= 3600 => 93,
        (CodecId::H265, m) if m <= 8192 => 120,
        (CodecId::H265, _) => 153,
        (_, m) if m <= 3600 => 31,
        (_, m) if m <= 8192 => 40,
        _ => 51,
    }
}

impl EncodeSession for LoopbackEncodeSession {
    fn codecs(&self) -> Result<Vec<CodecId>> {
        Ok(ENCODE_CODECS.to_vec())
    }

    fn presets(&self, codec: CodecId) -> Result<Vec<HwPreset>> {
        self.check_codec(codec)?;
        Ok(self.config.presets.clone())
    }

    fn input_formats(&self, codec: CodecId) -> Result<Vec<PixelFormat>> {
        self.check_codec(codec)?;
        let mut formats = vec![
            PixelFormat::Nv12,
            PixelFormat::Yv12,
            PixelFormat::I420,
            PixelFormat::Bgra,
            PixelFormat::Rgba,
            PixelFormat::Y444,
        ];
        if codec == CodecId::H265 {
            formats.extend([PixelFormat::P010, PixelFormat::Y444_16, PixelFormat::Bgr10a2]);
        }
        Ok(formats)
    }

    fn profiles(&self, codec: CodecId) -> Result<Vec<HwProfile>> {
        self.check_codec(codec)?;
        Ok(match codec {
            CodecId::H264 => vec![
                HwProfile::H264Baseline,
                HwProfile::H264Main,
                HwProfile::H264High,
                HwProfile::H264High444,
            ],
            _ => vec![HwProfile::HevcMain, HwProfile::HevcMain10, HwProfile::HevcFrext],
        })
    }

    fn supports_field_encoding(&self, codec: CodecId) -> Result<bool> {
        self.check_codec(codec)?;
        Ok(self.config.field_encoding && codec == CodecId::H264)
    }

    fn preset_config(&self, codec: CodecId, preset: HwPreset) -> Result<EncodeConfig> {
        self.check_codec(codec)?;
        if !self.config.presets.contains(&preset) {
            return Err(CodecError::Config(format!("preset {preset:?} unavailable")));
        }
        let lossless = matches!(preset, HwPreset::LosslessDefault | HwPreset::LosslessHp);
        Ok(EncodeConfig {
            profile: HwProfile::Auto,
            gop_length: 30,
            frame_interval_p: 1,
            field_mode: FieldMode::Frame,
            rc: RcParams {
                mode: if lossless {
                    HwRcMode::ConstQp
                } else {
                    HwRcMode::Vbr
                },
                average_bitrate: if lossless { 0 } else { 5_000_000 },
                max_bitrate: 0,
                const_qp: Qp::uniform(if lossless { 0 } else { 26 }),
                min_qp: None,
                max_qp: None,
            },
            codec: CodecConfig {
                level: 0,
                idr_period: 30,
                chroma_format_idc: 1,
                bit_depth_minus8: 0,
                output_aud: false,
                vui: None,
            },
        })
    }

    fn initialize(&self, params: &InitParams) -> Result<()> {
        self.check_codec(params.codec)?;
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(CodecError::Encode("session destroyed".into()));
        }
        if state.init.is_some() {
            return Err(CodecError::Encode("encoder already initialized".into()));
        }
        if params.width == 0 || params.height == 0 {
            return Err(CodecError::Encode("zero-sized encode".into()));
        }
        if params.max_width != 0 && (params.width > params.max_width || params.height > params.max_height)
        {
            return Err(CodecError::Encode("size exceeds max encode size".into()));
        }
        if !self.config.presets.contains(&params.preset) {
            return Err(CodecError::Encode(format!("preset {:?} unavailable", params.preset)));
        }
        state.init = Some(*params);
        state.since_idr = 0;
        state.force_idr = true;
        bump(&self.stats.initializations);
        debug!(
            width = params.width,
            height = params.height,
            gop = params.config.gop_length,
            "loopback encoder initialized"
        );
        Ok(())
    }

    fn reconfigure(&self, params: &InitParams, reset_encoder: bool, force_idr: bool) -> Result<()> {
        let mut state = self.state.lock();
        let init = *state.init()?;
        let (max_w, max_h) = if init.max_width != 0 {
            (init.max_width, init.max_height)
        } else {
            (init.width, init.height)
        };
        if params.width > max_w || params.height > max_h {
            return Err(CodecError::Encode(format!(
                "reconfigure to {}x{} exceeds {max_w}x{max_h}",
                params.width, params.height
            )));
        }
        let mut next = *params;
        next.max_width = init.max_width;
        next.max_height = init.max_height;
        state.init = Some(next);
        if reset_encoder {
            state.complete_held();
            self.ready.notify_all();
        }
        if force_idr {
            state.force_idr = true;
        }
        bump(&self.stats.reconfigures);
        Ok(())
    }

    fn create_input_buffer(&self, desc: &InputBufferDesc) -> Result<HwHandle> {
        let pitch = round_up(desc.format.plane_width_bytes(0, desc.width as usize), 64);
        let size = input_surface_size(desc.format, desc.height as usize, pitch);
        let mut state = self.state.lock();
        let id = state.handle();
        state.inputs.insert(
            id,
            HostSurface {
                desc: *desc,
                pitch,
                data: vec![0; size],
            },
        );
        bump(&self.stats.input_buffers);
        Ok(HwHandle(id))
    }

    fn destroy_input_buffer(&self, buffer: HwHandle) -> Result<()> {
        self.state
            .lock()
            .inputs
            .remove(&buffer.0)
            .map(|_| ())
            .ok_or_else(|| CodecError::Encode(format!("unknown input buffer {buffer:?}")))
    }

    fn write_input_buffer(
        &self,
        buffer: HwHandle,
        write: &mut dyn FnMut(&mut [u8], usize) -> Result<()>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let surface = state
            .inputs
            .get_mut(&buffer.0)
            .ok_or_else(|| CodecError::Encode(format!("unknown input buffer {buffer:?}")))?;
        let pitch = surface.pitch;
        trace!(buffer = buffer.0, pitch, format = ?surface.desc.format, "input locked");
        write(&mut surface.data, pitch)
    }

    fn register_device_buffer(
        &self,
        ptr: DevicePtr,
        pitch: usize,
        desc: &InputBufferDesc,
    ) -> Result<HwHandle> {
        let mut state = self.state.lock();
        let id = state.handle();
        state.registered.insert(
            id,
            Registration {
                ptr,
                pitch,
                desc: *desc,
            },
        );
        Ok(HwHandle(id))
    }

    fn unregister_resource(&self, resource: HwHandle) -> Result<()> {
        let mut state = self.state.lock();
        if state.mapped.values().any(|r| *r == resource.0) {
            return Err(CodecError::Encode("unregistering a mapped resource".into()));
        }
        state
            .registered
            .remove(&resource.0)
            .map(|_| ())
            .ok_or_else(|| CodecError::Encode(format!("unknown resource {resource:?}")))
    }

    fn map_resource(&self, resource: HwHandle) -> Result<HwHandle> {
        let mut state = self.state.lock();
        if !state.registered.contains_key(&resource.0) {
            return Err(CodecError::Encode(format!("unknown resource {resource:?}")));
        }
        if state.mapped.values().any(|r| *r == resource.0) {
            return Err(CodecError::Encode(format!("{resource:?} already mapped")));
        }
        let id = state.handle();
        state.mapped.insert(id, resource.0);
        Ok(HwHandle(id))
    }

    fn unmap_resource(&self, mapped: HwHandle) -> Result<()> {
        require_current(self.ordinal, "nvEncUnmapInputResource")?;
        self.state
            .lock()
            .mapped
            .remove(&mapped.0)
            .map(|_| ())
            .ok_or_else(|| CodecError::Encode(format!("{mapped:?} not mapped")))
    }

    fn create_bitstream_buffer(&self, _size: usize) -> Result<HwHandle> {
        let mut state = self.state.lock();
        let id = state.handle();
        state.bitstreams.insert(id, Bitstream::Idle);
        bump(&self.stats.bitstream_buffers);
        Ok(HwHandle(id))
    }

    fn destroy_bitstream_buffer(&self, buffer: HwHandle) -> Result<()> {
        self.state
            .lock()
            .bitstreams
            .remove(&buffer.0)
            .map(|_| ())
            .ok_or_else(|| CodecError::Encode(format!("unknown bitstream buffer {buffer:?}")))
    }

    fn encode_picture(&self, params: &PictureParams) -> Result<SubmitStatus> {
        let index = self.stats.pictures_encoded.load(Ordering::Acquire);
        if self.faults.fail_encode_at.load(Ordering::Acquire) == index {
            bump(&self.stats.pictures_encoded);
            return Err(CodecError::Encode("injected encode failure".into()));
        }
        let mut state = self.state.lock();
        let init = *state.init()?;
        match state.bitstreams.get(&params.output.0) {
            Some(Bitstream::Idle) => {}
            Some(_) => return Err(CodecError::Encode("bitstream buffer busy".into())),
            None => return Err(CodecError::Encode("unknown bitstream buffer".into())),
        }
        let payload = self.read_input(&state, params)?;

        let gop = init.config.gop_length;
        let periodic = gop != INFINITE_GOP && gop > 0 && state.since_idr >= gop;
        let picture_type = if params.force_idr || state.force_idr || periodic {
            state.force_idr = false;
            state.since_idr = 1;
            PictureType::Idr
        } else {
            state.since_idr += 1;
            PictureType::P
        };

        let vui = init.config.codec.vui;
        let unit = Unit {
            header: UnitHeader {
                codec: init.codec,
                picture_type,
                interlaced: params.picture_struct != PictureStruct::Frame,
                top_field_first: params.picture_struct == PictureStruct::FieldTopBottom,
                decode_only: false,
                width: params.width,
                height: params.height,
                format: params.format,
                fps_n: init.fps_n,
                fps_d: init.fps_d,
                pts: params.pts,
                frame_idx: params.frame_idx,
                full_range: vui.is_some_and(|v| v.full_range),
                colour_primaries: vui.map_or(2, |v| v.colour_primaries as u8),
                transfer_characteristics: vui.map_or(2, |v| v.transfer_characteristics as u8),
                matrix_coefficients: vui.map_or(2, |v| v.matrix_coefficients as u8),
            },
            sei: params
                .sei
                .iter()
                .map(|s| (s.payload_type as u8, s.data.clone()))
                .collect(),
            payload,
        };
        if let Some(slot) = state.bitstreams.get_mut(&params.output.0) {
            *slot = Bitstream::Pending;
        }
        state.held.push((
            params.output.0,
            LockedBitstream {
                data: unit.encode(),
                picture_type,
                pts: params.pts,
            },
        ));
        bump(&self.stats.pictures_encoded);

        if state.held.len() > self.config.encode_delay {
            state.complete_held();
            self.ready.notify_all();
            Ok(SubmitStatus::Accepted)
        } else {
            Ok(SubmitStatus::NeedMoreInput)
        }
    }

    fn send_eos(&self) -> Result<()> {
        let mut state = self.state.lock();
        let flushed = state.complete_held();
        self.ready.notify_all();
        bump(&self.stats.eos_pictures);
        trace!(flushed, "loopback EOS");
        Ok(())
    }

    fn lock_bitstream(&self, buffer: HwHandle, wait: bool) -> Result<LockedBitstream> {
        if self.faults.fail_lock_bitstream.load(Ordering::Acquire) {
            return Err(CodecError::Encode("injected lock failure".into()));
        }
        require_current(self.ordinal, "nvEncLockBitstream")?;
        let mut state = self.state.lock();
        loop {
            if state.destroyed {
                return Err(CodecError::Encode("session destroyed".into()));
            }
            let slot = state
                .bitstreams
                .get_mut(&buffer.0)
                .ok_or_else(|| CodecError::Encode(format!("unknown bitstream {buffer:?}")))?;
            match std::mem::replace(slot, Bitstream::Locked) {
                Bitstream::Ready(bitstream) => return Ok(bitstream),
                Bitstream::Pending if wait => {
                    *slot = Bitstream::Pending;
                    self.ready.wait(&mut state);
                }
                Bitstream::Pending => {
                    *slot = Bitstream::Pending;
                    return Err(CodecError::Encode("bitstream not ready".into()));
                }
                Bitstream::Idle => {
                    *slot = Bitstream::Idle;
                    return Err(CodecError::Encode("bitstream never submitted".into()));
                }
                Bitstream::Locked => {
                    return Err(CodecError::Encode("bitstream already locked".into()));
                }
            }
        }
    }

    fn unlock_bitstream(&self, buffer: HwHandle) -> Result<()> {
        require_current(self.ordinal, "nvEncUnlockBitstream")?;
        let mut state = self.state.lock();
        match state.bitstreams.get_mut(&buffer.0) {
            Some(slot) if matches!(slot, Bitstream::Locked) => {
                *slot = Bitstream::Idle;
                Ok(())
            }
            _ => Err(CodecError::Encode(format!("{buffer:?} not locked"))),
        }
    }

    fn sequence_params(&self) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let init = state.init()?;
        let cfg = &init.config;
        let level = if cfg.codec.level != 0 {
            cfg.codec.level
        } else {
            default_level(init.codec, init.width, init.height)
        };
        let mut out = vec![0, 0, 0, 1];
        match init.codec {
            CodecId::H264 => {
                let (profile_idc, constraints) = match cfg.profile {
                    HwProfile::H264Baseline => (66, 0x40),
                    HwProfile::H264Main => (77, 0),
                    HwProfile::H264High444 => (244, 0),
                    _ if cfg.codec.chroma_format_idc == 3 => (244, 0),
                    _ => (100, 0),
                };
                out.extend_from_slice(&[0x67, profile_idc, constraints, level as u8, 0xac, 0x2b]);
                out.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80]);
            }
            _ => {
                let profile_idc = match cfg.profile {
                    HwProfile::HevcMain10 => 2,
                    HwProfile::HevcFrext => 4,
                    _ => 1,
                };
                out.extend_from_slice(&[0x40, 0x01]);
                let mut ptl = [0u8; 12];
                ptl[0] = profile_idc;
                ptl[1] = 0x60;
                ptl[11] = level as u8;
                out.extend_from_slice(&ptl);
            }
        }
        Ok(out)
    }

    fn destroy(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.destroyed = true;
        state.held.clear();
        self.ready.notify_all();
        bump(&self.stats.sessions_destroyed);
        Ok(())
    }
}

// ─── Parser and decoder ──────────────────────────────────────────────────

/// Backend payload handed from the parser to the decoder.
pub struct LoopbackPicture {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<u8>,
}

struct LoopbackParser {
    params: ParserParams,
    display_delay: usize,
    sequence: Option<SequenceInfo>,
    decoded: u64,
    display_queue: VecDeque<DisplayInfo>,
}

fn sequence_for(header: &UnitHeader) -> SequenceInfo {
    let (chroma, bit_depth) = match header.format {
        PixelFormat::Y444 => (ChromaFormat::Yuv444, 0),
        PixelFormat::Y444_16 => (ChromaFormat::Yuv444, 2),
        PixelFormat::P010 | PixelFormat::Bgr10a2 | PixelFormat::Rgb10a2 => {
            (ChromaFormat::Yuv420, 2)
        }
        PixelFormat::P016 => (ChromaFormat::Yuv420, 4),
        _ => (ChromaFormat::Yuv420, 0),
    };
    SequenceInfo {
        codec: header.codec,
        coded_width: round_up(header.width as usize, 16) as u32,
        coded_height: round_up(header.height as usize, 16) as u32,
        display_area: DisplayArea {
            left: 0,
            top: 0,
            right: header.width as i32,
            bottom: header.height as i32,
        },
        chroma,
        bit_depth_luma_minus8: bit_depth,
        frame_rate_num: header.fps_n,
        frame_rate_den: header.fps_d,
        progressive: !header.interlaced,
        min_decode_surfaces: 8,
        video_full_range: header.full_range,
        color_primaries: header.colour_primaries as u32,
        transfer_characteristics: header.transfer_characteristics as u32,
        matrix_coefficients: header.matrix_coefficients as u32,
    }
}

impl LoopbackParser {
    fn flush_display(
        &mut self,
        keep: usize,
        callbacks: &mut dyn ParserCallbacks,
    ) -> Result<()> {
        while self.display_queue.len() > keep {
            if let Some(display) = self.display_queue.pop_front() {
                callbacks.on_display(&display)?;
            }
        }
        Ok(())
    }
}

impl BitstreamParser for LoopbackParser {
    fn parse(
        &mut self,
        packet: &ParserPacket<'_>,
        callbacks: &mut dyn ParserCallbacks,
    ) -> Result<()> {
        if packet.discont {
            trace!("discontinuity");
        }
        for unit in split_units(packet.data)? {
            let sequence = sequence_for(&unit.header);
            if self.sequence != Some(sequence) {
                callbacks.on_sequence(&sequence)?;
                self.sequence = Some(sequence);
            }
            let picture_index =
                (self.decoded % self.params.max_decode_surfaces.max(1) as u64) as i32;
            self.decoded += 1;
            let picture = LoopbackPicture {
                format: unit.header.format,
                width: unit.header.width,
                height: unit.header.height,
                planes: unit.payload,
            };
            callbacks.on_decode(&DecodePicture {
                picture_index,
                params: &picture as &dyn Any,
            })?;
            if !unit.header.decode_only {
                self.display_queue.push_back(DisplayInfo {
                    picture_index,
                    progressive_frame: !unit.header.interlaced,
                    top_field_first: unit.header.top_field_first,
                    repeat_first_field: 0,
                    timestamp: packet.timestamp.unwrap_or(unit.header.pts),
                });
            }
            self.flush_display(self.display_delay, callbacks)?;
        }
        if packet.end_of_stream {
            self.flush_display(0, callbacks)?;
        }
        Ok(())
    }
}

struct LoopbackDecoder {
    ordinal: u32,
    params: DecoderParams,
    heap: Arc<DeviceHeap>,
    faults: Arc<LoopbackFaults>,
    stats: Arc<LoopbackStats>,
    pictures: HashMap<i32, LoopbackPicture>,
    mapped: Vec<DevicePtr>,
}

fn surface_pixel_format(format: SurfaceFormat) -> PixelFormat {
    match format {
        SurfaceFormat::Nv12 => PixelFormat::Nv12,
        SurfaceFormat::P016 => PixelFormat::P016,
        SurfaceFormat::Yuv444 => PixelFormat::Y444,
        SurfaceFormat::Yuv444_16 => PixelFormat::Y444_16,
    }
}

impl LoopbackDecoder {
    /// Planes of `picture` converted to the output surface format, each
    /// tightly packed.
    fn convert(&self, picture: &LoopbackPicture, out: PixelFormat) -> Vec<Vec<u8>> {
        let (w, h) = (picture.width as usize, picture.height as usize);
        let src = picture.format;
        let mut planes = Vec::with_capacity(src.n_planes());
        let mut offset = 0;
        for p in 0..src.n_planes() {
            let len = src.plane_width_bytes(p, w) * src.plane_height(p, h);
            planes.push(&picture.planes[offset.min(picture.planes.len())..(offset + len).min(picture.planes.len())]);
            offset += len;
        }
        let same_layout = src == out
            || (src == PixelFormat::P010 && out == PixelFormat::P016);
        if same_layout {
            return planes.iter().map(|p| p.to_vec()).collect();
        }
        match (src, out) {
            (PixelFormat::I420 | PixelFormat::Yv12, PixelFormat::Nv12) => {
                let (u, v) = if src == PixelFormat::I420 {
                    (planes[1], planes[2])
                } else {
                    (planes[2], planes[1])
                };
                let uv = u.iter().zip(v).flat_map(|(u, v)| [*u, *v]).collect();
                vec![planes[0].to_vec(), uv]
            }
            _ => (0..out.n_planes())
                .map(|p| vec![0x80; out.plane_width_bytes(p, w) * out.plane_height(p, h)])
                .collect(),
        }
    }
}

impl HwDecoder for LoopbackDecoder {
    fn decode_picture(&mut self, picture: &DecodePicture<'_>) -> Result<()> {
        require_current(self.ordinal, "cuvidDecodePicture")?;
        let payload = picture
            .params
            .downcast_ref::<LoopbackPicture>()
            .ok_or_else(|| CodecError::Decode("foreign picture parameters".into()))?;
        self.pictures.insert(
            picture.picture_index,
            LoopbackPicture {
                format: payload.format,
                width: payload.width,
                height: payload.height,
                planes: payload.planes.clone(),
            },
        );
        Ok(())
    }

    fn map_frame(&mut self, picture_index: i32, params: &ProcParams) -> Result<MappedSurface> {
        require_current(self.ordinal, "cuvidMapVideoFrame")?;
        if self.faults.fail_map_frame.load(Ordering::Acquire) {
            return Err(CodecError::Decode("injected map failure".into()));
        }
        if self.mapped.len() >= self.params.num_output_surfaces as usize {
            return Err(CodecError::Decode("no free output surface".into()));
        }
        let picture = self
            .pictures
            .get(&picture_index)
            .ok_or_else(|| CodecError::Decode(format!("picture {picture_index} not decoded")))?;
        let out = surface_pixel_format(self.params.output_format);
        let (w, h) = (
            self.params.target_width as usize,
            self.params.target_height as usize,
        );
        let pitch = round_up(out.plane_width_bytes(0, w), PITCH_ALIGN);
        let ptr = self.heap.alloc(pitch * h * out.n_planes());
        for (p, plane) in self.convert(picture, out).iter().enumerate() {
            let row = out.plane_width_bytes(p, w);
            for r in 0..out.plane_height(p, h) {
                let Some(src) = plane.get(r * row..(r + 1) * row) else {
                    break;
                };
                self.heap
                    .write(ptr + (p * pitch * h + r * pitch) as u64, src)?;
            }
        }
        trace!(
            picture_index,
            second_field = params.second_field,
            "loopback frame mapped"
        );
        self.mapped.push(ptr);
        bump(&self.stats.frames_mapped);
        Ok(MappedSurface { ptr, pitch })
    }

    fn unmap_frame(&mut self, surface: MappedSurface) -> Result<()> {
        require_current(self.ordinal, "cuvidUnmapVideoFrame")?;
        let pos = self
            .mapped
            .iter()
            .position(|p| *p == surface.ptr)
            .ok_or_else(|| CodecError::Decode("surface not mapped".into()))?;
        self.mapped.swap_remove(pos);
        self.heap.free(surface.ptr)
    }
}

// ─── Texture backend ─────────────────────────────────────────────────────

/// Encodes the heap address of a texture plane in its buffer name.
fn texture_ptr(memory: &ExternalMemory) -> DevicePtr {
    (memory.buffer_name as u64) << 12
}

/// Pixel buffers backed by the device heap.
pub struct HeapTextureBackend {
    heap: Arc<DeviceHeap>,
    pixel_buffers: bool,
    registered: HashMap<usize, (DevicePtr, usize)>,
    mapped: HashMap<usize, bool>,
    next: usize,
}

impl HeapTextureBackend {
    pub fn new(heap: Arc<DeviceHeap>, pixel_buffers: bool) -> Self {
        Self {
            heap,
            pixel_buffers,
            registered: HashMap::new(),
            mapped: HashMap::new(),
            next: 0,
        }
    }
}

impl GraphicsInterop for HeapTextureBackend {
    fn register(&mut self, memory: &ExternalMemory) -> Result<GraphicsResource> {
        self.next += 1;
        self.registered
            .insert(self.next, (texture_ptr(memory), memory.size));
        Ok(GraphicsResource(self.next))
    }

    fn unregister(&mut self, resource: GraphicsResource) -> Result<()> {
        self.registered
            .remove(&resource.0)
            .map(|_| ())
            .ok_or_else(|| CodecError::Interop(format!("{resource:?} not registered")))
    }

    fn map(
        &mut self,
        resource: GraphicsResource,
        _access: MapAccess,
        _stream: StreamHandle,
    ) -> Result<MappedPointer> {
        let (ptr, size) = *self
            .registered
            .get(&resource.0)
            .ok_or_else(|| CodecError::Interop(format!("{resource:?} not registered")))?;
        if self.mapped.insert(resource.0, true).is_some() {
            return Err(CodecError::Interop(format!("{resource:?} already mapped")));
        }
        Ok(MappedPointer { ptr, size })
    }

    fn unmap(&mut self, resource: GraphicsResource, _stream: StreamHandle) -> Result<()> {
        self.mapped
            .remove(&resource.0)
            .map(|_| ())
            .ok_or_else(|| CodecError::Interop(format!("{resource:?} not mapped")))
    }
}

impl TextureBackend for HeapTextureBackend {
    fn as_interop(&mut self) -> &mut dyn GraphicsInterop {
        self
    }

    fn allocate_frame(&mut self, info: &VideoInfo) -> Result<TextureFrame> {
        let strides = info.strides();
        let planes = (0..info.format.n_planes())
            .map(|p| {
                let size = info.plane_size(p);
                let ptr = self.heap.alloc(size);
                let name = u32::try_from(ptr >> 12).map_err(|_| {
                    CodecError::Interop(format!("heap address {ptr:#x} has no buffer name"))
                })?;
                Ok(ExternalMemory::new(name, size))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(TextureFrame { planes, strides })
    }

    fn supports_pixel_buffers(&self) -> bool {
        self.pixel_buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> (Arc<LoopbackPlatform>, Arc<dyn GpuDevice>) {
        let platform = LoopbackPlatform::new(LoopbackConfig::default());
        let device = platform.open_device(0).unwrap();
        (platform, device)
    }

    #[test]
    fn device_memory_needs_current_context() {
        let (_platform, device) = device();
        assert!(matches!(
            device.alloc_pitched(64, 4),
            Err(CodecError::Driver { code: INVALID_CONTEXT, .. })
        ));
        device.push_context().unwrap();
        let alloc = device.alloc_pitched(64, 4).unwrap();
        assert_eq!(alloc.pitch, 256);
        device.free(alloc.ptr).unwrap();
        device.pop_context().unwrap();
        assert!(device.pop_context().is_err());
    }

    #[test]
    fn host_device_round_trip_respects_pitch() {
        let (platform, device) = device();
        device.push_context().unwrap();
        let alloc = device.alloc_pitched(4, 2).unwrap();
        let src = [1u8, 2, 3, 4, 5, 6, 7, 8];
        device
            .copy_2d(
                Copy2d {
                    src: CopySrc::Host(&src),
                    src_pitch: 4,
                    dst: CopyDst::Device(alloc.ptr),
                    dst_pitch: alloc.pitch,
                    width_bytes: 4,
                    height: 2,
                },
                StreamHandle::DEFAULT,
            )
            .unwrap();
        assert_eq!(
            platform.heap().read(alloc.ptr + alloc.pitch as u64, 4).unwrap(),
            vec![5, 6, 7, 8]
        );
        let mut back = [0u8; 8];
        device
            .copy_2d(
                Copy2d {
                    src: CopySrc::Device(alloc.ptr),
                    src_pitch: alloc.pitch,
                    dst: CopyDst::Host(&mut back),
                    dst_pitch: 4,
                    width_bytes: 4,
                    height: 2,
                },
                StreamHandle::DEFAULT,
            )
            .unwrap();
        assert_eq!(back, src);
        device.pop_context().unwrap();
    }

    #[test]
    fn unit_header_survives_encoding() {
        let unit = Unit {
            header: UnitHeader {
                codec: CodecId::H265,
                picture_type: PictureType::Idr,
                interlaced: true,
                top_field_first: true,
                decode_only: false,
                width: 64,
                height: 48,
                format: PixelFormat::P010,
                fps_n: 30,
                fps_d: 1,
                pts: 123_456,
                frame_idx: 9,
                full_range: true,
                colour_primaries: 9,
                transfer_characteristics: 16,
                matrix_coefficients: 9,
            },
            sei: vec![(144, vec![0, 1, 0, 2])],
            payload: vec![7; 32],
        };
        let bytes = unit.encode();
        let (parsed, used) = Unit::decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(parsed.header, unit.header);
        assert_eq!(parsed.sei, unit.sei);

        let mut corrupt = bytes.clone();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xff;
        assert!(matches!(Unit::decode(&corrupt), Err(CodecError::Decode(_))));
    }

    #[test]
    fn encode_delay_reports_need_more_input() {
        let platform = LoopbackPlatform::new(LoopbackConfig {
            encode_delay: 1,
            ..LoopbackConfig::default()
        });
        let device = platform.open_device(0).unwrap();
        device.push_context().unwrap();
        let session = device.open_encode_session().unwrap();

        let config = session.preset_config(CodecId::H264, HwPreset::Default).unwrap();
        session
            .initialize(&InitParams {
                codec: CodecId::H264,
                preset: HwPreset::Default,
                width: 16,
                height: 16,
                max_width: 16,
                max_height: 16,
                dar_width: 1,
                dar_height: 1,
                fps_n: 30,
                fps_d: 1,
                enable_ptd: true,
                config,
            })
            .unwrap();
        let desc = InputBufferDesc {
            width: 32,
            height: 32,
            format: PixelFormat::Nv12,
        };
        let input = session.create_input_buffer(&desc).unwrap();
        let out = [
            session.create_bitstream_buffer(1 << 20).unwrap(),
            session.create_bitstream_buffer(1 << 20).unwrap(),
        ];
        let params = |output| PictureParams {
            input,
            output,
            width: 16,
            height: 16,
            pitch: 64,
            format: PixelFormat::Nv12,
            picture_struct: PictureStruct::Frame,
            frame_idx: 0,
            pts: 0,
            duration: 0,
            force_idr: false,
            sei: Vec::new(),
        };
        assert_eq!(
            session.encode_picture(&params(out[0])).unwrap(),
            SubmitStatus::NeedMoreInput
        );
        assert!(session.lock_bitstream(out[0], false).is_err());
        assert_eq!(
            session.encode_picture(&params(out[1])).unwrap(),
            SubmitStatus::Accepted
        );
        let first = session.lock_bitstream(out[0], true).unwrap();
        assert_eq!(first.picture_type, PictureType::Idr);
        let second = session.lock_bitstream(out[1], true).unwrap();
        assert_eq!(second.picture_type, PictureType::P);
        session.unlock_bitstream(out[0]).unwrap();
        device.pop_context().unwrap();
        assert!(matches!(
            session.unlock_bitstream(out[1]),
            Err(CodecError::Driver {
                call: "nvEncUnlockBitstream",
                ..
            })
        ));
        device.push_context().unwrap();
        session.unlock_bitstream(out[1]).unwrap();
        device.pop_context().unwrap();
    }

    struct Recorder(Vec<String>);

    impl ParserCallbacks for Recorder {
        fn on_sequence(&mut self, s: &SequenceInfo) -> Result<()> {
            self.0.push(format!("seq {}x{}", s.display_area.width(), s.display_area.height()));
            Ok(())
        }
        fn on_decode(&mut self, p: &DecodePicture<'_>) -> Result<()> {
            self.0.push(format!("dec {}", p.picture_index));
            Ok(())
        }
        fn on_display(&mut self, d: &DisplayInfo) -> Result<()> {
            self.0.push(format!("disp {} @{}", d.picture_index, d.timestamp));
            Ok(())
        }
    }

    fn unit(pts: u64) -> Vec<u8> {
        Unit {
            header: UnitHeader {
                codec: CodecId::H264,
                picture_type: PictureType::P,
                interlaced: false,
                top_field_first: false,
                decode_only: false,
                width: 16,
                height: 8,
                format: PixelFormat::Nv12,
                fps_n: 25,
                fps_d: 1,
                pts,
                frame_idx: 0,
                full_range: false,
                colour_primaries: 2,
                transfer_characteristics: 2,
                matrix_coefficients: 2,
            },
            sei: Vec::new(),
            payload: vec![0; 16 * 8 * 3 / 2],
        }
        .encode()
    }

    #[test]
    fn parser_delays_display_and_flushes_on_eos() {
        let platform = LoopbackPlatform::new(LoopbackConfig {
            display_delay: 1,
            ..LoopbackConfig::default()
        });
        let device = platform.open_device(0).unwrap();
        let mut parser = device
            .create_parser(&ParserParams {
                codec: CodecId::H264,
                max_decode_surfaces: 20,
                clock_rate: 1_000_000_000,
                error_threshold: 100,
                max_display_delay: 0,
            })
            .unwrap();
        let mut rec = Recorder(Vec::new());
        for pts in [10, 20] {
            let data = unit(pts);
            parser
                .parse(
                    &ParserPacket {
                        data: &data,
                        timestamp: Some(pts),
                        discont: false,
                        end_of_stream: false,
                    },
                    &mut rec,
                )
                .unwrap();
        }
        parser.parse(&ParserPacket::eos(), &mut rec).unwrap();
        assert_eq!(
            rec.0,
            vec!["seq 16x8", "dec 0", "dec 1", "disp 0 @10", "disp 1 @20"]
        );
    }
}
