//! Hardware decoder element.
//!
//! Packets go to the bitstream parser, which calls back synchronously on
//! the same thread:
//!
//! ```text
//!  handle_frame ─▸ parser.parse ─┬─▸ on_sequence  (re)create decoder, negotiate
//!                                ├─▸ on_decode    submit picture, tag a pending frame
//!                                └─▸ on_display   map, copy out, push downstream
//! ```
//!
//! A pending frame is tagged with `picture_index + 1` when its picture is
//! submitted; 0 means untagged.  A display whose index matches no pending
//! frame produces a synthesized output stamped from the display event.

use std::collections::VecDeque;
use std::sync::Arc;

use nvpipe_core::codec_traits::{
    BitstreamParser, Copy2d, CopyDst, CopySrc, DecodePicture, DecodedSink, DecoderParams,
    DeinterlaceMode, DisplayInfo, GpuDevice, HwDecoder, MappedSurface, ParserCallbacks,
    ParserPacket, ProcParams, SequenceInfo, StreamHandle, SurfaceFormat, TextureContext,
};
use nvpipe_core::context::{ContextGuard, DeviceContext};
use nvpipe_core::error::{CodecError, FlowError, Result};
use nvpipe_core::subsystem::CodecSubsystem;
use nvpipe_core::types::{
    BufferFlags, ChromaFormat, CodecId, ColorMatrix, ColorPrimaries, ColorRange, Colorimetry,
    CompressedCaps, CompressedPacket, DecodedFrame, FrameMemory, InterlaceMode, MemoryKind,
    PixelFormat, SystemFrame, TransferFunction, VideoInfo,
};
use nvpipe_cuda::copy::decode_surface_plan;
use nvpipe_cuda::interop::InteropBridge;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::metrics::ElementMetrics;
use crate::settings::DecoderSettings;

/// Where the parser is within the current `parse` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeState {
    Init,
    /// A packet was handed to the parser, no picture submitted yet.
    Parse,
    /// At least one picture was submitted during this packet.
    Decode,
    /// End of stream was pushed through the parser.
    Drained,
}

/// Output pixel format for a (chroma, bit depth) pair.
pub fn output_format(chroma: ChromaFormat, bit_depth_minus8: u32) -> Option<PixelFormat> {
    match (chroma, bit_depth_minus8) {
        (ChromaFormat::Yuv444, 0) => Some(PixelFormat::Y444),
        (ChromaFormat::Yuv444, 2 | 4) => Some(PixelFormat::Y444_16),
        (ChromaFormat::Yuv420, 0) => Some(PixelFormat::Nv12),
        (ChromaFormat::Yuv420, 2) => Some(PixelFormat::P010),
        (ChromaFormat::Yuv420, 4) => Some(PixelFormat::P016),
        _ => None,
    }
}

/// Decoder surface format producing `format`.
pub fn surface_format(format: PixelFormat) -> SurfaceFormat {
    match format {
        PixelFormat::P010 | PixelFormat::P016 => SurfaceFormat::P016,
        PixelFormat::Y444 => SurfaceFormat::Yuv444,
        PixelFormat::Y444_16 => SurfaceFormat::Yuv444_16,
        _ => SurfaceFormat::Nv12,
    }
}

/// Output buffer flags for a display event.
pub fn display_flags(display: &DisplayInfo) -> BufferFlags {
    let mut flags = BufferFlags::NONE;
    if !display.progressive_frame {
        flags.insert(BufferFlags::INTERLACED);
        if display.top_field_first {
            flags.insert(BufferFlags::TFF);
        }
        if display.repeat_first_field == -1 {
            flags.insert(BufferFlags::ONEFIELD);
        } else {
            flags.insert(BufferFlags::RFF);
        }
    }
    flags
}

/// Output stream description for a parsed sequence.
pub fn output_info(
    sequence: &SequenceInfo,
    input: &CompressedCaps,
) -> Result<VideoInfo> {
    let format = output_format(sequence.chroma, sequence.bit_depth_luma_minus8).ok_or_else(|| {
        CodecError::NotNegotiated(format!(
            "unhandled chroma format {:?}, bitdepth {}",
            sequence.chroma,
            sequence.bit_depth_luma_minus8 + 8
        ))
    })?;
    let (width, height) = (sequence.display_area.width(), sequence.display_area.height());
    let mut info = VideoInfo::new(format, width, height);

    if input.fps_n >= 1 && input.fps_d >= 1 {
        info.fps_n = input.fps_n;
        info.fps_d = input.fps_d;
    } else {
        info.fps_n = sequence.frame_rate_num as i32;
        info.fps_d = sequence.frame_rate_den.max(1) as i32;
    }
    if input.par_n > 0 && input.par_d > 0 {
        info.par_n = input.par_n;
        info.par_d = input.par_d;
    }

    info.colorimetry = match input.colorimetry {
        Some(colorimetry) => colorimetry,
        None => {
            let parsed = Colorimetry {
                range: if sequence.video_full_range {
                    ColorRange::Full
                } else {
                    ColorRange::Limited
                },
                primaries: ColorPrimaries::from_iso(sequence.color_primaries),
                transfer: TransferFunction::from_iso(sequence.transfer_characteristics),
                matrix: ColorMatrix::from_iso(sequence.matrix_coefficients),
            };
            if parsed.any_known() {
                debug!("found valid colorimetry, update output colorimetry");
                parsed
            } else {
                Colorimetry::default_for(format, height)
            }
        }
    };

    info.interlace = if !sequence.progressive {
        InterlaceMode::Mixed
    } else if sequence.codec == CodecId::H265 {
        // The HEVC progressive flag is not reliable.
        input.interlace
    } else {
        InterlaceMode::Progressive
    };
    Ok(info)
}

struct PendingFrame {
    system_frame_number: u32,
    pts: Option<u64>,
    duration: Option<u64>,
    /// `picture_index + 1`, 0 while untagged.
    tag: u32,
}

/// Everything the parser callbacks touch.
struct DecodeCore {
    codec: CodecId,
    settings: DecoderSettings,
    device: Arc<dyn GpuDevice>,
    stream: StreamHandle,
    decoder: Option<Box<dyn HwDecoder>>,
    state: DecodeState,
    last_flow: Option<FlowError>,
    input: Option<CompressedCaps>,
    output: Option<VideoInfo>,
    negotiated: bool,
    memory: MemoryKind,
    texture: Option<Arc<dyn TextureContext>>,
    bridge: Option<InteropBridge>,
    pending: VecDeque<PendingFrame>,
    /// Displays are discarded instead of pushed.
    flushing: bool,
    sink: Box<dyn DecodedSink>,
    metrics: Arc<ElementMetrics>,
}

impl DecodeCore {
    fn fail(&mut self, flow: FlowError, err: CodecError) -> CodecError {
        self.last_flow = Some(flow);
        err
    }

    fn negotiate(&mut self, info: &VideoInfo) -> Result<()> {
        debug!(format = info.format.caps_name(), info.width, info.height, "negotiate");
        let wants_texture = self.sink.allowed_memory().contains(&MemoryKind::Texture);
        let texture = if wants_texture { self.sink.texture_context() } else { None };
        self.memory = MemoryKind::System;
        self.bridge = None;
        match texture {
            Some(texture) if texture.supports_pixel_buffers() => {
                debug!("found texture memory feature, use texture");
                self.bridge = Some(InteropBridge::new(
                    texture.clone(),
                    self.device.clone(),
                    self.stream,
                ));
                self.texture = Some(texture);
                self.memory = MemoryKind::Texture;
            }
            Some(_) => {
                warn!("texture context cannot support pixel buffers, fallback to system memory");
            }
            None => debug!("use system memory"),
        }
        if let Err(flow) = self.sink.negotiate(info, self.memory) {
            error!(%flow, "failed to negotiate with downstream");
            return Err(self.fail(
                FlowError::NotNegotiated,
                CodecError::NotNegotiated("downstream refused output format".into()),
            ));
        }
        self.negotiated = true;
        Ok(())
    }

    fn create_decoder(&mut self, sequence: &SequenceInfo, info: &VideoInfo) -> Result<()> {
        let _guard = ContextGuard::push(&self.device)?;
        if self.decoder.take().is_some() {
            debug!("destroying decoder");
        }
        debug!("creating decoder");
        let params = DecoderParams {
            codec: sequence.codec,
            coded_width: sequence.coded_width,
            coded_height: sequence.coded_height,
            chroma: sequence.chroma,
            bit_depth_minus8: sequence.bit_depth_luma_minus8,
            num_decode_surfaces: self.settings.num_decode_surfaces,
            num_output_surfaces: self.settings.num_output_surfaces,
            output_format: surface_format(info.format),
            deinterlace: DeinterlaceMode::Weave,
            target_width: info.width,
            target_height: info.height,
            display_area: sequence.display_area,
        };
        self.decoder = Some(self.device.create_decoder(&params)?);
        Ok(())
    }

    /// Copy a mapped surface into freshly allocated output memory.
    fn copy_out(&self, surface: MappedSurface, info: &VideoInfo) -> Result<FrameMemory> {
        match self.memory {
            MemoryKind::System => {
                let mut frame = SystemFrame::alloc(info);
                let plan = decode_surface_plan(
                    info.format,
                    info.width as usize,
                    info.height as usize,
                    surface.pitch,
                    &frame.strides,
                );
                for copy in &plan {
                    let plane = frame.planes.get_mut(copy.plane).ok_or_else(|| {
                        CodecError::InvariantViolation(format!("no output plane {}", copy.plane))
                    })?;
                    self.device.copy_2d(
                        Copy2d {
                            src: CopySrc::Device(surface.ptr + copy.src_offset as u64),
                            src_pitch: copy.src_pitch,
                            dst: CopyDst::Host(&mut plane[copy.dst_offset..]),
                            dst_pitch: copy.dst_pitch,
                            width_bytes: copy.width_bytes,
                            height: copy.height,
                        },
                        self.stream,
                    )?;
                }
                self.device.synchronize(self.stream)?;
                Ok(FrameMemory::System(frame))
            }
            MemoryKind::Texture => {
                let (Some(texture), Some(bridge)) = (&self.texture, &self.bridge) else {
                    return Err(CodecError::InvariantViolation(
                        "texture output without bridge".into(),
                    ));
                };
                let frame = texture.allocate_frame(info)?;
                bridge.download_planes(surface, info.format, info.width, info.height, &frame)?;
                Ok(FrameMemory::Texture(frame))
            }
        }
    }

    /// Map the picture, copy it out and unmap.
    fn fetch(&mut self, display: &DisplayInfo, info: &VideoInfo) -> Result<FrameMemory> {
        let device = self.device.clone();
        let _guard = ContextGuard::push(&device)?;
        let proc = ProcParams {
            progressive_frame: display.progressive_frame,
            top_field_first: display.top_field_first,
            second_field: 0,
            unpaired_field: display.repeat_first_field < 0,
            stream: self.stream,
        };
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| CodecError::Decode("display before decoder creation".into()))?;
        let surface = decoder.map_frame(display.picture_index, &proc)?;
        let copied = self.copy_out(surface, info);
        let unmapped = match self.decoder.as_mut() {
            Some(decoder) => decoder.unmap_frame(surface),
            None => Ok(()),
        };
        let memory = copied?;
        unmapped?;
        Ok(memory)
    }
}

impl ParserCallbacks for DecodeCore {
    fn on_sequence(&mut self, sequence: &SequenceInfo) -> Result<()> {
        let input = self.input.clone().unwrap_or_else(|| CompressedCaps::new(self.codec, 0, 0));
        let info = match output_info(sequence, &input) {
            Ok(info) => info,
            Err(err) => {
                error!(%err, "sequence not supported");
                return Err(self.fail(FlowError::NotNegotiated, err));
            }
        };
        debug!(
            format = info.format.caps_name(),
            width = info.width,
            height = info.height,
            fps_n = info.fps_n,
            fps_d = info.fps_d,
            "sequence"
        );

        let changed = self.decoder.is_none() || self.output != Some(info);
        if changed {
            if let Err(err) = self.create_decoder(sequence, &info) {
                error!(%err, "failed to create decoder");
                return Err(self.fail(FlowError::Error, err));
            }
        }
        self.output = Some(info);
        if !self.negotiated || changed {
            self.negotiate(&info)?;
        }
        Ok(())
    }

    fn on_decode(&mut self, picture: &DecodePicture<'_>) -> Result<()> {
        trace!(picture_index = picture.picture_index, "decode");
        let submitted = match self.decoder.as_mut() {
            Some(decoder) => {
                ContextGuard::push(&self.device).and_then(|_guard| decoder.decode_picture(picture))
            }
            None => Err(CodecError::Decode("picture before sequence".into())),
        };
        if let Err(err) = submitted {
            error!(%err, "failed to decode picture");
            return Err(self.fail(FlowError::Error, err));
        }
        ElementMetrics::bump(&self.metrics.frames_decoded);

        let tag = (picture.picture_index + 1) as u32;
        let retag = self.state == DecodeState::Decode;
        // A second picture within one packet replaces the tag set by the
        // first; the last decoded picture is the one displayed.
        let target = self
            .pending
            .iter_mut()
            .find(|f| if retag { f.tag != 0 } else { f.tag == 0 });
        if let Some(frame) = target {
            if retag {
                trace!(frame = frame.system_frame_number, "reset the last tag");
            }
            frame.tag = tag;
        }
        self.state = DecodeState::Decode;
        Ok(())
    }

    fn on_display(&mut self, disp: &DisplayInfo) -> Result<()> {
        trace!(picture_index = disp.picture_index, "display");
        let Some(info) = self.output else {
            return Err(self.fail(
                FlowError::NotNegotiated,
                CodecError::NotNegotiated("display before sequence".into()),
            ));
        };
        let tag = (disp.picture_index + 1) as u32;
        let frame = match self.pending.iter().position(|f| f.tag == tag) {
            Some(pos) => self.pending.remove(pos),
            None => None,
        };

        let memory = match self.fetch(disp, &info) {
            Ok(memory) => memory,
            Err(err) => {
                error!(%err, "failed to copy decoded picture to output buffer");
                ElementMetrics::bump(&self.metrics.copy_failures);
                return Err(self.fail(FlowError::Error, err));
            }
        };

        let output = match frame {
            Some(frame) => {
                if frame.pts.is_some_and(|pts| pts != disp.timestamp) {
                    info!(
                        shown = disp.timestamp,
                        frame = ?frame.pts,
                        "timestamp mismatch"
                    );
                }
                DecodedFrame {
                    system_frame_number: Some(frame.system_frame_number),
                    info,
                    pts: frame.pts,
                    dts: None,
                    duration: frame.duration.or_else(|| info.frame_duration()),
                    flags: display_flags(disp),
                    memory,
                }
            }
            None => {
                warn!(picture_index = disp.picture_index, "no frame for picture index");
                ElementMetrics::bump(&self.metrics.synthesized_outputs);
                DecodedFrame {
                    system_frame_number: None,
                    info,
                    pts: Some(disp.timestamp),
                    dts: None,
                    duration: info.frame_duration(),
                    flags: display_flags(disp),
                    memory,
                }
            }
        };
        ElementMetrics::bump(&self.metrics.frames_displayed);

        if self.flushing {
            trace!("discarding display while flushing");
            return Ok(());
        }
        if let Err(flow) = self.sink.push(output) {
            debug!(%flow, "failed to finish frame");
            return Err(self.fail(flow, CodecError::Flow(flow)));
        }
        Ok(())
    }
}

struct DecoderStream {
    ctx: Option<DeviceContext>,
    parser: Option<Box<dyn BitstreamParser>>,
    core: Option<DecodeCore>,
    next_frame_number: u32,
}

/// Decoder element for one codec on one device.
pub struct Decoder {
    codec: CodecId,
    subsystem: Arc<CodecSubsystem>,
    settings: DecoderSettings,
    metrics: Arc<ElementMetrics>,
    /// Held until `open` moves it into the parser-facing core.
    sink: Mutex<Option<Box<dyn DecodedSink>>>,
    stream: Mutex<DecoderStream>,
}

impl Decoder {
    pub fn new(
        subsystem: &Arc<CodecSubsystem>,
        codec: CodecId,
        settings: DecoderSettings,
        sink: Box<dyn DecodedSink>,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            codec,
            subsystem: subsystem.clone(),
            settings,
            metrics: ElementMetrics::new(),
            sink: Mutex::new(Some(sink)),
            stream: Mutex::new(DecoderStream {
                ctx: None,
                parser: None,
                core: None,
                next_frame_number: 0,
            }),
        })
    }

    pub fn codec(&self) -> CodecId {
        self.codec
    }

    pub fn metrics(&self) -> &Arc<ElementMetrics> {
        &self.metrics
    }

    pub fn state(&self) -> Option<DecodeState> {
        self.stream.lock().core.as_ref().map(|c| c.state)
    }

    /// Negotiated output, once a sequence was parsed.
    pub fn output_info(&self) -> Option<VideoInfo> {
        self.stream.lock().core.as_ref().and_then(|c| c.output)
    }

    pub fn output_memory(&self) -> Option<MemoryKind> {
        self.stream.lock().core.as_ref().map(|c| c.memory)
    }

    /// Frames handed in but not yet displayed.
    pub fn pending_frames(&self) -> usize {
        self.stream.lock().core.as_ref().map_or(0, |c| c.pending.len())
    }

    /// Open the device context.
    pub fn open(&self) -> Result<()> {
        let mut stream = self.stream.lock();
        if stream.ctx.is_some() {
            return Err(CodecError::InvalidState {
                expected: "closed",
                actual: "opened",
            });
        }
        let sink = self.sink.lock().take().ok_or(CodecError::InvalidState {
            expected: "closed",
            actual: "closed for good",
        })?;
        debug!(ordinal = self.settings.device_ordinal, "creating device context");
        let ctx = DeviceContext::open(&self.subsystem, self.settings.device_ordinal)?;
        stream.core = Some(DecodeCore {
            codec: self.codec,
            settings: self.settings,
            device: ctx.device()?.clone(),
            stream: ctx.stream(),
            decoder: None,
            state: DecodeState::Init,
            last_flow: None,
            input: None,
            output: None,
            negotiated: false,
            memory: MemoryKind::System,
            texture: None,
            bridge: None,
            pending: VecDeque::new(),
            flushing: false,
            sink,
            metrics: self.metrics.clone(),
        });
        stream.ctx = Some(ctx);
        info!(codec = ?self.codec, ordinal = self.settings.device_ordinal, "decoder opened");
        Ok(())
    }

    /// New input caps: the decoder and parser are recreated.
    pub fn set_format(&self, caps: CompressedCaps) -> Result<()> {
        let mut stream = self.stream.lock();
        let DecoderStream { parser, core, .. } = &mut *stream;
        let core = core.as_mut().ok_or(CodecError::InvalidState {
            expected: "opened",
            actual: "closed",
        })?;
        if caps.codec != self.codec {
            return Err(CodecError::NotNegotiated(format!(
                "{:?} input on a {:?} decoder",
                caps.codec, self.codec
            )));
        }
        debug!(caps = %caps.to_caps_string(), "set format");
        destroy_decoder_and_parser(core, parser);
        core.input = Some(caps);
        core.state = DecodeState::Init;
        debug!("creating parser");
        let _guard = ContextGuard::push(&core.device)?;
        *parser = Some(core.device.create_parser(&self.settings.parser_params(self.codec))?);
        Ok(())
    }

    /// Feed one packet.  Returns the flow result of the callbacks it
    /// triggered.
    pub fn handle_frame(&self, packet: &CompressedPacket) -> Result<()> {
        let mut stream = self.stream.lock();
        let system_frame_number = stream.next_frame_number;
        stream.next_frame_number = stream.next_frame_number.wrapping_add(1);
        let DecoderStream { parser, core, .. } = &mut *stream;
        let (Some(parser), Some(core)) = (parser.as_mut(), core.as_mut()) else {
            return Err(CodecError::InvalidState {
                expected: "configured",
                actual: "opened",
            });
        };
        trace!(frame = system_frame_number, bytes = packet.data.len(), "handle frame");
        core.pending.push_back(PendingFrame {
            system_frame_number,
            pts: packet.pts,
            duration: packet.duration,
            tag: 0,
        });
        core.state = DecodeState::Parse;
        core.last_flow = None;
        let parser_packet = ParserPacket {
            data: &packet.data,
            timestamp: packet.pts,
            discont: packet.discont,
            end_of_stream: false,
        };
        if let Err(err) = parser.parse(&parser_packet, core) {
            warn!(%err, "parser failed");
        }
        match core.last_flow {
            Some(flow) => Err(CodecError::Flow(flow)),
            None => Ok(()),
        }
    }

    /// Push end of stream through the parser.  With `discard`, the
    /// resulting displays are dropped.
    fn push_eos(&self, discard: bool) -> Result<()> {
        let mut stream = self.stream.lock();
        let DecoderStream { parser, core, .. } = &mut *stream;
        let Some(core) = core.as_mut() else {
            return Ok(());
        };
        core.state = DecodeState::Parse;
        core.last_flow = None;
        core.flushing = discard;
        if let Some(parser) = parser.as_mut() {
            if let Err(err) = parser.parse(&ParserPacket::eos(), core) {
                warn!(%err, "parser failed");
            }
        }
        core.flushing = false;
        core.state = DecodeState::Drained;
        if !core.pending.is_empty() {
            debug!(frames = core.pending.len(), "dropping frames never displayed");
            core.pending.clear();
        }
        if discard {
            core.last_flow = None;
        }
        match core.last_flow {
            Some(flow) => Err(CodecError::Flow(flow)),
            None => Ok(()),
        }
    }

    /// Output every pending picture.
    pub fn drain(&self) -> Result<()> {
        debug!("draining decoder");
        self.push_eos(false)
    }

    pub fn finish(&self) -> Result<()> {
        debug!("finish");
        self.drain()
    }

    /// Discard every pending picture.
    pub fn flush(&self) -> Result<()> {
        debug!("flush");
        self.push_eos(true)
    }

    /// Destroy the decoder and parser; the context stays open.
    pub fn stop(&self) -> Result<()> {
        let mut stream = self.stream.lock();
        let DecoderStream { parser, core, .. } = &mut *stream;
        if let Some(core) = core.as_mut() {
            debug!("stop");
            destroy_decoder_and_parser(core, parser);
            core.input = None;
            core.output = None;
            core.negotiated = false;
            core.bridge = None;
            core.texture = None;
            core.pending.clear();
            core.state = DecodeState::Init;
            core.last_flow = None;
        }
        self.metrics.report(&format!("nv{}dec", self.codec.element_token()));
        Ok(())
    }

    /// Release the device context.  The element cannot be reopened.
    pub fn close(&self) -> Result<()> {
        self.stop()?;
        let mut stream = self.stream.lock();
        stream.core = None;
        if let Some(mut ctx) = stream.ctx.take() {
            ctx.close();
        }
        Ok(())
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(%err, "decoder close failed");
        }
    }
}

fn destroy_decoder_and_parser(core: &mut DecodeCore, parser: &mut Option<Box<dyn BitstreamParser>>) {
    match ContextGuard::push(&core.device) {
        Ok(_guard) => {
            if core.decoder.take().is_some() {
                debug!("destroying decoder");
            }
            if parser.take().is_some() {
                debug!("destroying parser");
            }
        }
        Err(err) => {
            error!(%err, "failed to lock device context");
            core.decoder = None;
            *parser = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvpipe_core::codec_traits::DisplayArea;

    fn sequence(chroma: ChromaFormat, bd: u32) -> SequenceInfo {
        SequenceInfo {
            codec: CodecId::H264,
            coded_width: 64,
            coded_height: 48,
            display_area: DisplayArea {
                left: 0,
                top: 0,
                right: 60,
                bottom: 40,
            },
            chroma,
            bit_depth_luma_minus8: bd,
            frame_rate_num: 25,
            frame_rate_den: 0,
            progressive: true,
            min_decode_surfaces: 8,
            video_full_range: false,
            color_primaries: 2,
            transfer_characteristics: 2,
            matrix_coefficients: 2,
        }
    }

    #[test]
    fn format_table() {
        assert_eq!(output_format(ChromaFormat::Yuv420, 0), Some(PixelFormat::Nv12));
        assert_eq!(output_format(ChromaFormat::Yuv420, 2), Some(PixelFormat::P010));
        assert_eq!(output_format(ChromaFormat::Yuv420, 4), Some(PixelFormat::P016));
        assert_eq!(output_format(ChromaFormat::Yuv444, 4), Some(PixelFormat::Y444_16));
        assert_eq!(output_format(ChromaFormat::Yuv420, 8), None);
        assert_eq!(output_format(ChromaFormat::Yuv422, 0), None);
        assert_eq!(surface_format(PixelFormat::P010), SurfaceFormat::P016);
    }

    #[test]
    fn output_uses_display_area_and_stream_fps_fallback() {
        let input = CompressedCaps::new(CodecId::H264, 0, 0);
        let info = output_info(&sequence(ChromaFormat::Yuv420, 0), &input).unwrap();
        assert_eq!((info.width, info.height), (60, 40));
        assert_eq!((info.fps_n, info.fps_d), (25, 1));
        // All codes unspecified: default colorimetry.
        assert_eq!(info.colorimetry, Colorimetry::default_for(PixelFormat::Nv12, 40));
        assert_eq!(info.interlace, InterlaceMode::Progressive);
    }

    #[test]
    fn upstream_colorimetry_and_fps_win() {
        let input = CompressedCaps::new(CodecId::H264, 0, 0).with_framerate(30, 1);
        let mut input = input;
        input.colorimetry = Some(Colorimetry::BT709);
        let mut seq = sequence(ChromaFormat::Yuv420, 0);
        seq.color_primaries = 9;
        let info = output_info(&seq, &input).unwrap();
        assert_eq!(info.colorimetry, Colorimetry::BT709);
        assert_eq!((info.fps_n, info.fps_d), (30, 1));
    }

    #[test]
    fn hevc_keeps_upstream_interlace() {
        let mut input = CompressedCaps::new(CodecId::H265, 0, 0);
        input.interlace = InterlaceMode::Interleaved;
        let mut seq = sequence(ChromaFormat::Yuv420, 0);
        seq.codec = CodecId::H265;
        assert_eq!(output_info(&seq, &input).unwrap().interlace, InterlaceMode::Interleaved);
        seq.progressive = false;
        assert_eq!(output_info(&seq, &input).unwrap().interlace, InterlaceMode::Mixed);
    }

    #[test]
    fn interlace_flags() {
        let mut d = DisplayInfo {
            picture_index: 0,
            progressive_frame: true,
            top_field_first: true,
            repeat_first_field: 0,
            timestamp: 0,
        };
        assert_eq!(display_flags(&d), BufferFlags::NONE);
        d.progressive_frame = false;
        let f = display_flags(&d);
        assert!(f.contains(BufferFlags::INTERLACED) && f.contains(BufferFlags::TFF));
        assert!(f.contains(BufferFlags::RFF));
        d.repeat_first_field = -1;
        d.top_field_first = false;
        let f = display_flags(&d);
        assert!(f.contains(BufferFlags::ONEFIELD) && !f.contains(BufferFlags::RFF));
        assert!(!f.contains(BufferFlags::TFF));
    }
}
