//! Value types shared by the encoder and decoder paths.
//!
//! Timestamps are nanoseconds (`u64`), matching the framework clock; `None`
//! means "no timestamp".

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// One second in framework clock units (nanoseconds).
pub const SECOND: u64 = 1_000_000_000;

/// Round `v` up to the next multiple of `align` (power of two).
#[inline]
pub const fn round_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

/// `a * num / den` without intermediate overflow, rounded down.
#[inline]
pub fn scale_u64(a: u64, num: u64, den: u64) -> u64 {
    if den == 0 {
        return 0;
    }
    ((a as u128 * num as u128) / den as u128) as u64
}

// ─── Pixel formats ───────────────────────────────────────────────────────

/// Chroma layout class, used for capability probing and profile ceilings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChromaFormat {
    Monochrome,
    Yuv420,
    Yuv422,
    Yuv444,
    Rgb,
}

impl ChromaFormat {
    /// Index in the profile-ceiling scale (0 = 4:2:0, 1 = 4:2:2, 2 = 4:4:4).
    pub fn ceiling_index(self) -> u32 {
        match self {
            Self::Yuv422 => 1,
            Self::Yuv444 => 2,
            _ => 0,
        }
    }
}

/// Raw pixel formats the elements accept or produce.
///
/// Multi-byte formats are little-endian.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit 4:2:0, Y plane + interleaved UV plane.
    Nv12,
    /// 8-bit 4:2:0, Y + V + U planes.
    Yv12,
    /// 8-bit 4:2:0, Y + U + V planes.
    I420,
    Bgra,
    Rgba,
    /// 8-bit 4:4:4 planar.
    Y444,
    /// 10-bit 4:2:0 in the high bits of 16-bit words, NV12 layout.
    P010,
    /// 16-bit 4:2:0, NV12 layout.
    P016,
    /// 16-bit 4:4:4 planar.
    Y444_16,
    Bgr10a2,
    Rgb10a2,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 11] = [
        Self::Nv12,
        Self::Yv12,
        Self::I420,
        Self::Bgra,
        Self::Rgba,
        Self::Y444,
        Self::P010,
        Self::P016,
        Self::Y444_16,
        Self::Bgr10a2,
        Self::Rgb10a2,
    ];

    /// Name used in caps strings.
    pub const fn caps_name(self) -> &'static str {
        match self {
            Self::Nv12 => "NV12",
            Self::Yv12 => "YV12",
            Self::I420 => "I420",
            Self::Bgra => "BGRA",
            Self::Rgba => "RGBA",
            Self::Y444 => "Y444",
            Self::P010 => "P010_10LE",
            Self::P016 => "P016_LE",
            Self::Y444_16 => "Y444_16LE",
            Self::Bgr10a2 => "BGR10A2_LE",
            Self::Rgb10a2 => "RGB10A2_LE",
        }
    }

    pub fn from_caps_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.caps_name() == name)
    }

    pub const fn n_planes(self) -> usize {
        match self {
            Self::Nv12 | Self::P010 | Self::P016 => 2,
            Self::Yv12 | Self::I420 | Self::Y444 | Self::Y444_16 => 3,
            Self::Bgra | Self::Rgba | Self::Bgr10a2 | Self::Rgb10a2 => 1,
        }
    }

    pub const fn chroma(self) -> ChromaFormat {
        match self {
            Self::Nv12 | Self::Yv12 | Self::I420 | Self::P010 | Self::P016 => {
                ChromaFormat::Yuv420
            }
            Self::Y444 | Self::Y444_16 => ChromaFormat::Yuv444,
            Self::Bgra | Self::Rgba | Self::Bgr10a2 | Self::Rgb10a2 => ChromaFormat::Rgb,
        }
    }

    /// Significant bits per component.
    pub const fn bit_depth(self) -> u32 {
        match self {
            Self::P010 | Self::Bgr10a2 | Self::Rgb10a2 => 10,
            Self::P016 | Self::Y444_16 => 16,
            _ => 8,
        }
    }

    /// Bytes between horizontally adjacent samples of `plane`.
    pub const fn pixel_stride(self, plane: usize) -> usize {
        match self {
            Self::Nv12 => {
                if plane == 0 {
                    1
                } else {
                    2
                }
            }
            Self::P010 | Self::P016 => {
                if plane == 0 {
                    2
                } else {
                    4
                }
            }
            Self::Yv12 | Self::I420 | Self::Y444 => 1,
            Self::Y444_16 => 2,
            Self::Bgra | Self::Rgba | Self::Bgr10a2 | Self::Rgb10a2 => 4,
        }
    }

    /// Samples per row of `plane` for a frame `width` pixels wide.
    pub const fn plane_width(self, plane: usize, width: usize) -> usize {
        if plane == 0 {
            return width;
        }
        match self.chroma() {
            ChromaFormat::Yuv420 | ChromaFormat::Yuv422 => width.div_ceil(2),
            _ => width,
        }
    }

    pub const fn plane_width_bytes(self, plane: usize, width: usize) -> usize {
        self.plane_width(plane, width) * self.pixel_stride(plane)
    }

    pub const fn plane_height(self, plane: usize, height: usize) -> usize {
        if plane == 0 {
            return height;
        }
        match self.chroma() {
            ChromaFormat::Yuv420 => height.div_ceil(2),
            _ => height,
        }
    }

    /// Planar 4:2:0 formats whose chroma planes use half the luma pitch.
    pub const fn has_half_pitch_chroma(self) -> bool {
        matches!(self, Self::Yv12 | Self::I420)
    }

    /// Row stride of `plane` in a tightly packed system-memory frame,
    /// aligned to four bytes.
    pub const fn default_stride(self, plane: usize, width: usize) -> usize {
        round_up(self.plane_width_bytes(plane, width), 4)
    }
}

// ─── Interlacing and colour ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterlaceMode {
    #[default]
    Progressive,
    Interleaved,
    Mixed,
}

impl InterlaceMode {
    pub const fn caps_name(self) -> &'static str {
        match self {
            Self::Progressive => "progressive",
            Self::Interleaved => "interleaved",
            Self::Mixed => "mixed",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorRange {
    #[default]
    Unknown,
    Full,
    Limited,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorPrimaries {
    #[default]
    Unknown,
    Bt709,
    Bt470m,
    Bt470bg,
    Smpte170m,
    Smpte240m,
    Film,
    Bt2020,
    Smpte428,
    Smpte431,
    Smpte432,
    Ebu3213,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferFunction {
    #[default]
    Unknown,
    Bt709,
    Gamma22,
    Gamma28,
    Bt601,
    Smpte240m,
    Linear,
    Srgb,
    Bt2020_10,
    Bt2020_12,
    Smpte2084,
    AribStdB67,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorMatrix {
    #[default]
    Unknown,
    Rgb,
    Bt709,
    Fcc,
    Bt601,
    Smpte240m,
    Bt2020,
}

impl ColorPrimaries {
    /// Map an ISO/IEC 23001-8 `colour_primaries` code.
    pub fn from_iso(code: u32) -> Self {
        match code {
            1 => Self::Bt709,
            4 => Self::Bt470m,
            5 => Self::Bt470bg,
            6 => Self::Smpte170m,
            7 => Self::Smpte240m,
            8 => Self::Film,
            9 => Self::Bt2020,
            10 => Self::Smpte428,
            11 => Self::Smpte431,
            12 => Self::Smpte432,
            22 => Self::Ebu3213,
            _ => Self::Unknown,
        }
    }

    pub fn to_iso(self) -> u32 {
        match self {
            Self::Unknown => 2,
            Self::Bt709 => 1,
            Self::Bt470m => 4,
            Self::Bt470bg => 5,
            Self::Smpte170m => 6,
            Self::Smpte240m => 7,
            Self::Film => 8,
            Self::Bt2020 => 9,
            Self::Smpte428 => 10,
            Self::Smpte431 => 11,
            Self::Smpte432 => 12,
            Self::Ebu3213 => 22,
        }
    }
}

impl TransferFunction {
    /// Map an ISO/IEC 23001-8 `transfer_characteristics` code.
    pub fn from_iso(code: u32) -> Self {
        match code {
            1 => Self::Bt709,
            4 => Self::Gamma22,
            5 => Self::Gamma28,
            6 => Self::Bt601,
            7 => Self::Smpte240m,
            8 => Self::Linear,
            13 => Self::Srgb,
            14 => Self::Bt2020_10,
            15 => Self::Bt2020_12,
            16 => Self::Smpte2084,
            18 => Self::AribStdB67,
            _ => Self::Unknown,
        }
    }

    pub fn to_iso(self) -> u32 {
        match self {
            Self::Unknown => 2,
            Self::Bt709 => 1,
            Self::Gamma22 => 4,
            Self::Gamma28 => 5,
            Self::Bt601 => 6,
            Self::Smpte240m => 7,
            Self::Linear => 8,
            Self::Srgb => 13,
            Self::Bt2020_10 => 14,
            Self::Bt2020_12 => 15,
            Self::Smpte2084 => 16,
            Self::AribStdB67 => 18,
        }
    }
}

impl ColorMatrix {
    /// Map an ISO/IEC 23001-8 `matrix_coefficients` code.
    pub fn from_iso(code: u32) -> Self {
        match code {
            0 => Self::Rgb,
            1 => Self::Bt709,
            4 => Self::Fcc,
            5 | 6 => Self::Bt601,
            7 => Self::Smpte240m,
            9 => Self::Bt2020,
            _ => Self::Unknown,
        }
    }

    pub fn to_iso(self) -> u32 {
        match self {
            Self::Unknown => 2,
            Self::Rgb => 0,
            Self::Bt709 => 1,
            Self::Fcc => 4,
            Self::Bt601 => 6,
            Self::Smpte240m => 7,
            Self::Bt2020 => 9,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Colorimetry {
    pub range: ColorRange,
    pub matrix: ColorMatrix,
    pub transfer: TransferFunction,
    pub primaries: ColorPrimaries,
}

impl Colorimetry {
    pub const BT601: Self = Self {
        range: ColorRange::Limited,
        matrix: ColorMatrix::Bt601,
        transfer: TransferFunction::Bt709,
        primaries: ColorPrimaries::Smpte170m,
    };

    pub const BT709: Self = Self {
        range: ColorRange::Limited,
        matrix: ColorMatrix::Bt709,
        transfer: TransferFunction::Bt709,
        primaries: ColorPrimaries::Bt709,
    };

    pub const SRGB: Self = Self {
        range: ColorRange::Full,
        matrix: ColorMatrix::Rgb,
        transfer: TransferFunction::Srgb,
        primaries: ColorPrimaries::Bt709,
    };

    /// Colorimetry assumed when nothing is signalled: sRGB for RGB formats,
    /// BT.709 from 720 lines upward and BT.601 below.
    pub fn default_for(format: PixelFormat, height: u32) -> Self {
        if format.chroma() == ChromaFormat::Rgb {
            Self::SRGB
        } else if height >= 720 {
            Self::BT709
        } else {
            Self::BT601
        }
    }

    /// Whether any of primaries, transfer or matrix is known.
    pub fn any_known(&self) -> bool {
        self.primaries != ColorPrimaries::Unknown
            || self.transfer != TransferFunction::Unknown
            || self.matrix != ColorMatrix::Unknown
    }
}

// ─── HDR metadata ────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Chromaticity {
    pub x: f64,
    pub y: f64,
}

/// SMPTE ST 2086 mastering display colour volume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MasteringDisplayInfo {
    pub red: Chromaticity,
    pub green: Chromaticity,
    pub blue: Chromaticity,
    pub white_point: Chromaticity,
    /// cd/m².
    pub max_luminance: f64,
    /// cd/m².
    pub min_luminance: f64,
}

/// CTA-861.3 content light level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentLightLevel {
    pub max_cll: f64,
    pub max_fall: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HdrMetadata {
    pub mastering_display: Option<MasteringDisplayInfo>,
    pub content_light_level: Option<ContentLightLevel>,
}

// ─── Video info ──────────────────────────────────────────────────────────

/// Negotiated description of a raw video stream.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub fps_n: i32,
    pub fps_d: i32,
    pub par_n: i32,
    pub par_d: i32,
    pub interlace: InterlaceMode,
    pub top_field_first: bool,
    pub colorimetry: Colorimetry,
    pub hdr: HdrMetadata,
}

impl VideoInfo {
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
            fps_n: 0,
            fps_d: 1,
            par_n: 1,
            par_d: 1,
            interlace: InterlaceMode::Progressive,
            top_field_first: false,
            colorimetry: Colorimetry::default_for(format, height),
            hdr: HdrMetadata::default(),
        }
    }

    pub fn with_framerate(mut self, fps_n: i32, fps_d: i32) -> Self {
        self.fps_n = fps_n;
        self.fps_d = fps_d;
        self
    }

    pub fn with_interlace(mut self, interlace: InterlaceMode) -> Self {
        self.interlace = interlace;
        self
    }

    /// Tightly packed strides for system-memory frames.
    pub fn strides(&self) -> Vec<usize> {
        (0..self.format.n_planes())
            .map(|p| self.format.default_stride(p, self.width as usize))
            .collect()
    }

    pub fn plane_size(&self, plane: usize) -> usize {
        self.format.default_stride(plane, self.width as usize)
            * self.format.plane_height(plane, self.height as usize)
    }

    /// Duration of one frame, if the framerate is known.
    pub fn frame_duration(&self) -> Option<u64> {
        if self.fps_n > 0 && self.fps_d > 0 {
            Some(scale_u64(SECOND, self.fps_d as u64, self.fps_n as u64))
        } else {
            None
        }
    }

    pub fn is_interlaced(&self) -> bool {
        self.interlace != InterlaceMode::Progressive
    }

    /// Display aspect ratio in lowest terms.
    ///
    /// Falls back to `width:height` when the pixel aspect ratio is unset or
    /// the reduced ratio does not fit in 32 bits.
    pub fn display_aspect(&self) -> (u32, u32) {
        let square = (self.width, self.height);
        if self.par_n <= 0 || self.par_d <= 0 || self.width == 0 || self.height == 0 {
            return square;
        }
        let n = self.width as u64 * self.par_n as u64;
        let d = self.height as u64 * self.par_d as u64;
        let g = gcd(n, d);
        match (u32::try_from(n / g), u32::try_from(d / g)) {
            (Ok(n), Ok(d)) => (n, d),
            _ => square,
        }
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

// ─── Compressed streams ──────────────────────────────────────────────────

/// Codec families handled by the hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecId {
    Mpeg1,
    Mpeg2,
    Mpeg4,
    H264,
    Jpeg,
    H265,
    Vp8,
    Vp9,
}

impl CodecId {
    pub const DECODABLE: [CodecId; 8] = [
        Self::Mpeg1,
        Self::Mpeg2,
        Self::Mpeg4,
        Self::H264,
        Self::Jpeg,
        Self::H265,
        Self::Vp8,
        Self::Vp9,
    ];

    /// Token used in element names (`nv{token}dec`).
    pub const fn element_token(self) -> &'static str {
        match self {
            Self::Mpeg1 => "mpegvideo",
            Self::Mpeg2 => "mpeg2video",
            Self::Mpeg4 => "mpeg4video",
            Self::H264 => "h264",
            Self::Jpeg => "jpeg",
            Self::H265 => "h265",
            Self::Vp8 => "vp8",
            Self::Vp9 => "vp9",
        }
    }

    pub const fn media_type(self) -> &'static str {
        match self {
            Self::Mpeg1 | Self::Mpeg2 | Self::Mpeg4 => "video/mpeg",
            Self::H264 => "video/x-h264",
            Self::Jpeg => "image/jpeg",
            Self::H265 => "video/x-h265",
            Self::Vp8 => "video/x-vp8",
            Self::Vp9 => "video/x-vp9",
        }
    }
}

/// Description of a compressed stream: decoder input or encoder output.
///
/// Optional fields are `None` when the peer did not specify them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompressedCaps {
    pub codec: CodecId,
    pub width: u32,
    pub height: u32,
    pub fps_n: i32,
    pub fps_d: i32,
    pub par_n: i32,
    pub par_d: i32,
    pub interlace: InterlaceMode,
    pub colorimetry: Option<Colorimetry>,
    pub stream_format: Option<String>,
    pub alignment: Option<String>,
    pub profile: Option<String>,
    pub level: Option<String>,
    pub tier: Option<String>,
}

impl CompressedCaps {
    pub fn new(codec: CodecId, width: u32, height: u32) -> Self {
        Self {
            codec,
            width,
            height,
            fps_n: 0,
            fps_d: 1,
            par_n: 1,
            par_d: 1,
            interlace: InterlaceMode::Progressive,
            colorimetry: None,
            stream_format: None,
            alignment: None,
            profile: None,
            level: None,
            tier: None,
        }
    }

    pub fn with_framerate(mut self, fps_n: i32, fps_d: i32) -> Self {
        self.fps_n = fps_n;
        self.fps_d = fps_d;
        self
    }

    /// Caps string in the framework's textual form, for logs and inspection.
    pub fn to_caps_string(&self) -> String {
        let mut s = self.codec.media_type().to_string();
        if let Some(v) = &self.stream_format {
            s.push_str(&format!(", stream-format={v}"));
        }
        if let Some(v) = &self.alignment {
            s.push_str(&format!(", alignment={v}"));
        }
        if let Some(v) = &self.profile {
            s.push_str(&format!(", profile={v}"));
        }
        if let Some(v) = &self.tier {
            s.push_str(&format!(", tier={v}"));
        }
        if let Some(v) = &self.level {
            s.push_str(&format!(", level={v}"));
        }
        if self.width > 0 && self.height > 0 {
            s.push_str(&format!(", width={}, height={}", self.width, self.height));
        }
        if self.fps_n > 0 {
            s.push_str(&format!(", framerate={}/{}", self.fps_n, self.fps_d));
        }
        s
    }
}

// ─── Memory ──────────────────────────────────────────────────────────────

/// Memory domain of a raw frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    /// Host-visible system memory.
    System,
    /// Pixel buffers owned by an external texture API context.
    Texture,
}

static NEXT_MEMORY_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one plane of externally owned texture memory.
///
/// Clones share identity: the interop bridge memoizes device registration
/// per `id()` and drops the registration once every clone is gone.
#[derive(Clone, Debug)]
pub struct ExternalMemory {
    id: u64,
    /// Name of the buffer object in the owning texture API.
    pub buffer_name: u32,
    /// Allocation size in bytes.
    pub size: usize,
    alive: Arc<()>,
}

impl ExternalMemory {
    pub fn new(buffer_name: u32, size: usize) -> Self {
        Self {
            id: NEXT_MEMORY_ID.fetch_add(1, Ordering::Relaxed),
            buffer_name,
            size,
            alive: Arc::new(()),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Weak token that expires when the last clone is dropped.
    pub fn lifetime(&self) -> std::sync::Weak<()> {
        Arc::downgrade(&self.alive)
    }
}

/// A raw frame living in external texture memory, one buffer per plane.
#[derive(Clone, Debug)]
pub struct TextureFrame {
    pub planes: Vec<ExternalMemory>,
    pub strides: Vec<usize>,
}

/// A raw frame in host memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemFrame {
    pub planes: Vec<Vec<u8>>,
    pub strides: Vec<usize>,
}

impl SystemFrame {
    /// Zeroed frame with the default layout for `info`.
    pub fn alloc(info: &VideoInfo) -> Self {
        let strides = info.strides();
        let planes = (0..info.format.n_planes())
            .map(|p| vec![0u8; info.plane_size(p)])
            .collect();
        Self { planes, strides }
    }
}

#[derive(Clone, Debug)]
pub enum FrameMemory {
    System(SystemFrame),
    Texture(TextureFrame),
}

impl FrameMemory {
    pub fn kind(&self) -> MemoryKind {
        match self {
            Self::System(_) => MemoryKind::System,
            Self::Texture(_) => MemoryKind::Texture,
        }
    }
}

// ─── Frames and packets ──────────────────────────────────────────────────

/// Uncompressed frame submitted to the encoder.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub system_frame_number: u32,
    pub pts: Option<u64>,
    pub duration: Option<u64>,
    /// Request a sync point for this frame.
    pub force_keyframe: bool,
    pub memory: FrameMemory,
}

/// Compressed access unit emitted by the encoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessUnit {
    pub system_frame_number: u32,
    pub data: Vec<u8>,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub duration: Option<u64>,
    pub sync_point: bool,
}

/// Compressed packet pushed into the decoder.
#[derive(Clone, Debug, Default)]
pub struct CompressedPacket {
    pub data: Vec<u8>,
    pub pts: Option<u64>,
    pub duration: Option<u64>,
    pub discont: bool,
}

/// Per-buffer flags carried on decoded output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: Self = Self(0);
    pub const INTERLACED: Self = Self(1 << 0);
    pub const TFF: Self = Self(1 << 1);
    pub const RFF: Self = Self(1 << 2);
    pub const ONEFIELD: Self = Self(1 << 3);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

/// Uncompressed frame produced by the decoder.
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    /// Frame number of the originating input packet, `None` for outputs
    /// synthesized without a pending frame.
    pub system_frame_number: Option<u32>,
    pub info: VideoInfo,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub duration: Option<u64>,
    pub flags: BufferFlags,
    pub memory: FrameMemory,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_plane_geometry() {
        let f = PixelFormat::Nv12;
        assert_eq!(f.n_planes(), 2);
        assert_eq!(f.plane_width_bytes(0, 65), 65);
        assert_eq!(f.plane_width_bytes(1, 65), 66);
        assert_eq!(f.plane_height(1, 65), 33);
        assert_eq!(f.default_stride(0, 65), 68);
    }

    #[test]
    fn display_aspect_is_reduced_and_never_overflows() {
        let mut info = VideoInfo::new(PixelFormat::Nv12, 720, 576);
        assert_eq!(info.display_aspect(), (5, 4));
        info.par_n = 16;
        info.par_d = 15;
        assert_eq!(info.display_aspect(), (4, 3));

        let mut wide = VideoInfo::new(PixelFormat::Nv12, 1_000_000, 7);
        wide.par_n = i32::MAX;
        wide.par_d = 1;
        assert_eq!(wide.display_aspect(), (1_000_000, 7));

        wide.par_n = 0;
        assert_eq!(wide.display_aspect(), (1_000_000, 7));
    }

    #[test]
    fn p010_uses_two_byte_samples() {
        let f = PixelFormat::P010;
        assert_eq!(f.plane_width_bytes(0, 64), 128);
        assert_eq!(f.plane_width_bytes(1, 64), 128);
        assert_eq!(f.bit_depth(), 10);
    }

    #[test]
    fn i420_chroma_is_quarter_size() {
        let info = VideoInfo::new(PixelFormat::I420, 64, 64);
        assert_eq!(info.plane_size(0), 64 * 64);
        assert_eq!(info.plane_size(1), 32 * 32);
        assert!(PixelFormat::I420.has_half_pitch_chroma());
        assert!(!PixelFormat::Nv12.has_half_pitch_chroma());
    }

    #[test]
    fn caps_names_round_trip() {
        for f in PixelFormat::ALL {
            assert_eq!(PixelFormat::from_caps_name(f.caps_name()), Some(f));
        }
        assert_eq!(PixelFormat::from_caps_name("YUY2"), None);
    }

    #[test]
    fn iso_codes() {
        assert_eq!(ColorPrimaries::from_iso(9), ColorPrimaries::Bt2020);
        assert_eq!(TransferFunction::from_iso(16), TransferFunction::Smpte2084);
        assert_eq!(ColorMatrix::from_iso(5), ColorMatrix::Bt601);
        assert_eq!(ColorMatrix::Bt709.to_iso(), 1);
        assert_eq!(ColorPrimaries::from_iso(2), ColorPrimaries::Unknown);
    }

    #[test]
    fn frame_duration_from_fps() {
        let info = VideoInfo::new(PixelFormat::Nv12, 64, 64).with_framerate(30, 1);
        assert_eq!(info.frame_duration(), Some(33_333_333));
        let unknown = VideoInfo::new(PixelFormat::Nv12, 64, 64);
        assert_eq!(unknown.frame_duration(), None);
    }

    #[test]
    fn default_colorimetry_depends_on_height() {
        assert_eq!(
            Colorimetry::default_for(PixelFormat::Nv12, 1080),
            Colorimetry::BT709
        );
        assert_eq!(
            Colorimetry::default_for(PixelFormat::Nv12, 480),
            Colorimetry::BT601
        );
        assert_eq!(
            Colorimetry::default_for(PixelFormat::Bgra, 480),
            Colorimetry::SRGB
        );
    }

    #[test]
    fn external_memory_lifetime_tracks_clones() {
        let mem = ExternalMemory::new(7, 4096);
        let token = mem.lifetime();
        let clone = mem.clone();
        assert_eq!(clone.id(), mem.id());
        drop(mem);
        assert!(token.upgrade().is_some());
        drop(clone);
        assert!(token.upgrade().is_none());
    }
}
