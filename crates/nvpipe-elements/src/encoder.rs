//! Hardware encoder element.
//!
//! # Threads
//!
//! ```text
//!  handle_frame (caller)                     drain thread
//!  ─────────────────────                     ────────────
//!  stream lock
//!  in_pool.acquire  (lock released)
//!  copy / map input
//!  out_pool.try_acquire │ acquire
//!  encode_picture
//!  pending.push ─┐
//!  queue.push ───┼──────────────────────────▸ queue.pop
//!                │                            lock_bitstream(wait)
//!                └───── stream lock ◂──────── find pending frame by output id
//!                                             unlock, unmap, release both slots
//!                                             sink.push
//! ```
//!
//! Output buffers complete in submission order: the FIFO is the only path
//! from the submitting thread to the drain thread.
//!
//! # Locking
//!
//! The stream lock is never held while blocking on the input pool, the
//! output pool or the drain thread's join, because the drain thread needs
//! it to finish frames.  Lock order is stream lock, then sink lock.
//!
//! # Shutdown
//!
//! `finish()` submits EOS and lets the drain thread empty the queue.
//! `stop()` steals whatever is still queued back into the free pool,
//! pushes the shutdown sentinels and joins; afterwards every buffer is
//! free and the pools are destroyed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use nvpipe_core::codec_traits::{
    DownstreamConstraints, EncodeConfig, EncodeSession, EncodedSink, FieldMode, GpuDevice,
    HwHandle, InitParams, InputBufferDesc, PictureParams, PictureStruct, PitchedAlloc, Qp,
    SubmitStatus, TextureContext, INFINITE_GOP,
};
use nvpipe_core::context::{ContextGuard, DeviceContext};
use nvpipe_core::error::{CodecError, FlowError, Result};
use nvpipe_core::pool::{BitstreamQueue, BitstreamReceiver, BufferPool, PoolCounts, pool_size_for};
use nvpipe_core::subsystem::CodecSubsystem;
use nvpipe_core::types::{
    AccessUnit, CodecId, CompressedCaps, FrameMemory, InterlaceMode, MemoryKind, RawFrame,
    VideoInfo, round_up,
};
use nvpipe_cuda::copy::{copy_plane_host, input_surface_plan, scratch_height};
use nvpipe_cuda::interop::InteropBridge;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

use crate::caps::EncoderCapabilities;
use crate::metrics::ElementMetrics;
use crate::settings::{EncoderProperties, EncoderSettings, RateControl};

/// Size of one bitstream buffer.
pub const BITSTREAM_BUFFER_SIZE: usize = 1024 * 1024;

// ─── Codec variants ──────────────────────────────────────────────────────

/// Codec-specific hooks of an encoder element.
pub trait CodecVariant: Send + Sync + 'static {
    const CODEC: CodecId;

    /// Fill the codec-specific part of `config`.  Runs after the generic
    /// rate-control and GOP settings are applied.
    fn set_encoder_config(
        &self,
        info: &VideoInfo,
        downstream: &DownstreamConstraints,
        config: &mut EncodeConfig,
    ) -> Result<()>;

    /// Per-picture additions such as SEI messages.
    fn set_picture_params(&self, _info: &VideoInfo, _params: &mut PictureParams) {}

    /// Source caps for the configured session.
    fn output_caps(&self, session: &dyn EncodeSession, info: &VideoInfo) -> Result<CompressedCaps>;
}

// ─── Buffers ─────────────────────────────────────────────────────────────

#[derive(Debug)]
enum InputResource {
    /// Session-allocated surface written from host memory.
    Hardware(HwHandle),
    /// Device scratch buffer registered with the session, filled from
    /// texture memory and mapped for the duration of one encode.
    Texture {
        scratch: PitchedAlloc,
        registered: HwHandle,
        mapped: Option<HwHandle>,
    },
}

#[derive(Debug)]
pub(crate) struct InputSlot {
    id: usize,
    resource: InputResource,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct OutputSlot {
    id: usize,
    handle: HwHandle,
}

/// Frame accepted by the session, waiting for its bitstream.
struct PendingFrame {
    system_frame_number: u32,
    pts: Option<u64>,
    duration: Option<u64>,
    inputs: Vec<InputSlot>,
    outputs: Vec<usize>,
    collected: usize,
    data: Vec<u8>,
    sync_point: bool,
}

// ─── State ───────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncoderState {
    Closed,
    Opened,
    Configured,
    Encoding,
}

impl EncoderState {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Opened => "opened",
            Self::Configured => "configured",
            Self::Encoding => "encoding",
        }
    }
}

struct EncoderShared {
    props: EncoderProperties,
    in_pool: BufferPool<InputSlot>,
    out_pool: BufferPool<OutputSlot>,
    queue: BitstreamQueue<OutputSlot>,
    last_flow: Mutex<Option<FlowError>>,
    /// Set while a forced stop discards queued output.
    flushing: AtomicBool,
    sink: Mutex<Box<dyn EncodedSink>>,
    metrics: Arc<ElementMetrics>,
}

impl EncoderShared {
    fn last_flow(&self) -> Option<FlowError> {
        *self.last_flow.lock()
    }

    fn flow_result(&self) -> Result<()> {
        match self.last_flow() {
            Some(flow) => Err(CodecError::Flow(flow)),
            None => Ok(()),
        }
    }

    fn latch(&self, flow: FlowError) {
        let mut last = self.last_flow.lock();
        if last.is_none() {
            *last = Some(flow);
        }
    }
}

struct EncoderStream {
    state: EncoderState,
    ctx: Option<DeviceContext>,
    session: Option<Arc<dyn EncodeSession>>,
    caps: Option<EncoderCapabilities>,
    info: Option<VideoInfo>,
    memory: MemoryKind,
    bridge: Option<InteropBridge>,
    init: Option<InitParams>,
    buffers_allocated: bool,
    next_slot_id: usize,
    pending: Vec<PendingFrame>,
    drain: Option<JoinHandle<()>>,
}

impl EncoderStream {
    fn session(&self) -> Result<Arc<dyn EncodeSession>> {
        self.session.clone().ok_or(CodecError::InvalidState {
            expected: "opened",
            actual: self.state.name(),
        })
    }

    fn device(&self) -> Result<Arc<dyn GpuDevice>> {
        self.ctx
            .as_ref()
            .ok_or(CodecError::InvalidState {
                expected: "opened",
                actual: self.state.name(),
            })?
            .device()
            .cloned()
    }

    fn ctx(&self) -> Result<&DeviceContext> {
        self.ctx.as_ref().ok_or(CodecError::InvalidState {
            expected: "opened",
            actual: self.state.name(),
        })
    }

    fn next_id(&mut self) -> usize {
        self.next_slot_id += 1;
        self.next_slot_id
    }
}

// ─── Element ─────────────────────────────────────────────────────────────

/// Encoder element for one codec on one device.
pub struct Encoder<V: CodecVariant> {
    variant: V,
    subsystem: Arc<CodecSubsystem>,
    ordinal: u32,
    shared: Arc<EncoderShared>,
    stream: Arc<Mutex<EncoderStream>>,
}

impl<V: CodecVariant> Encoder<V> {
    pub fn new(
        subsystem: &Arc<CodecSubsystem>,
        ordinal: u32,
        variant: V,
        settings: EncoderSettings,
        sink: Box<dyn EncodedSink>,
    ) -> Self {
        Self {
            variant,
            subsystem: subsystem.clone(),
            ordinal,
            shared: Arc::new(EncoderShared {
                props: EncoderProperties::new(settings),
                in_pool: BufferPool::new("input"),
                out_pool: BufferPool::new("bitstream"),
                queue: BitstreamQueue::new(),
                last_flow: Mutex::new(None),
                flushing: AtomicBool::new(false),
                sink: Mutex::new(sink),
                metrics: ElementMetrics::new(),
            }),
            stream: Arc::new(Mutex::new(EncoderStream {
                state: EncoderState::Closed,
                ctx: None,
                session: None,
                caps: None,
                info: None,
                memory: MemoryKind::System,
                bridge: None,
                init: None,
                buffers_allocated: false,
                next_slot_id: 0,
                pending: Vec::new(),
                drain: None,
            })),
        }
    }

    pub fn codec(&self) -> CodecId {
        V::CODEC
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Live-mutable settings.  Changes take effect at the next frame.
    pub fn properties(&self) -> &EncoderProperties {
        &self.shared.props
    }

    pub fn metrics(&self) -> &Arc<ElementMetrics> {
        &self.shared.metrics
    }

    pub fn state(&self) -> EncoderState {
        self.stream.lock().state
    }

    /// (input, output) pool occupancy.
    pub fn pool_counts(&self) -> (PoolCounts, PoolCounts) {
        (self.shared.in_pool.counts(), self.shared.out_pool.counts())
    }

    pub fn queued_outputs(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn capabilities(&self) -> Option<EncoderCapabilities> {
        self.stream.lock().caps.clone()
    }

    /// Input formats acceptable given what downstream asks for.
    pub fn sink_formats(&self) -> Vec<nvpipe_core::types::PixelFormat> {
        let caps = self.stream.lock().caps.clone();
        let constraints = self.shared.sink.lock().constraints();
        caps.map(|c| c.sink_formats(&constraints.profiles))
            .unwrap_or_default()
    }

    /// Open the device context and session, discover capabilities.
    pub fn open(&self) -> Result<()> {
        let mut stream = self.stream.lock();
        if stream.state != EncoderState::Closed {
            return Err(CodecError::InvalidState {
                expected: "closed",
                actual: stream.state.name(),
            });
        }
        let mut ctx = DeviceContext::open(&self.subsystem, self.ordinal)?;
        let session = ctx.open_encode_session()?;
        let caps = {
            let _guard = ctx.make_current()?;
            EncoderCapabilities::probe(session.as_ref(), V::CODEC)?
        };
        info!(
            codec = ?V::CODEC,
            ordinal = self.ordinal,
            formats = caps.input_formats.len(),
            "encoder opened"
        );
        stream.ctx = Some(ctx);
        stream.session = Some(session);
        stream.caps = Some(caps);
        stream.state = EncoderState::Opened;
        Ok(())
    }

    /// Negotiate the input format and configure the session.
    ///
    /// Texture input needs the context that owns the texture memory.
    pub fn set_format(
        &self,
        info: VideoInfo,
        memory: MemoryKind,
        texture: Option<Arc<dyn TextureContext>>,
    ) -> Result<()> {
        let mut stream = self.stream.lock();
        if stream.state == EncoderState::Closed {
            return Err(CodecError::InvalidState {
                expected: "opened",
                actual: stream.state.name(),
            });
        }
        let caps = stream.caps.clone().ok_or(CodecError::InvalidState {
            expected: "opened",
            actual: stream.state.name(),
        })?;
        let constraints = self.shared.sink.lock().constraints();
        if !caps.sink_formats(&constraints.profiles).contains(&info.format) {
            return Err(CodecError::NotNegotiated(format!(
                "{} not accepted for {:?}",
                info.format.caps_name(),
                V::CODEC
            )));
        }
        if !caps.accepts_interlace(info.interlace) {
            return Err(CodecError::NotNegotiated(format!(
                "interlace mode {} not supported",
                info.interlace.caps_name()
            )));
        }

        if memory != stream.memory && stream.buffers_allocated {
            debug!(from = ?stream.memory, to = ?memory, "input memory changed");
            self.reinit(&mut stream)?;
        }
        stream.memory = memory;
        stream.bridge = match memory {
            MemoryKind::System => None,
            MemoryKind::Texture => {
                let texture = texture.ok_or_else(|| {
                    CodecError::NotNegotiated("texture input without texture context".into())
                })?;
                let device = stream.device()?;
                Some(InteropBridge::new(texture, device, stream.ctx()?.stream()))
            }
        };
        if stream.session.is_none() {
            let session = match stream.ctx.as_mut() {
                Some(ctx) => ctx.open_encode_session()?,
                None => {
                    return Err(CodecError::InvalidState {
                        expected: "opened",
                        actual: "closed",
                    });
                }
            };
            stream.session = Some(session);
        }
        self.configure(&mut stream, &info)
    }

    /// Apply the current settings to `info`, choosing between in-place
    /// reconfigure and full reinit.
    fn configure(&self, stream: &mut MutexGuard<'_, EncoderStream>, info: &VideoInfo) -> Result<()> {
        self.shared.props.clear_reconfig();
        let settings = self.shared.props.snapshot();
        let preset = settings.hw_preset();

        if let Some(prev) = stream.init {
            let format_changed = stream.info.is_some_and(|old| old.format != info.format);
            let larger = info.width > prev.max_width || info.height > prev.max_height;
            let gop_changed = gop_differs(&prev.config, settings.gop_size);
            if larger || format_changed || gop_changed {
                info!(
                    larger,
                    format_changed,
                    gop_changed,
                    width = info.width,
                    height = info.height,
                    "full encoder reinit"
                );
                self.reinit(stream)?;
            }
        }

        let session = stream.session()?;
        let mut config = {
            let _guard = stream.ctx()?.make_current()?;
            if !session.presets(V::CODEC)?.contains(&preset) {
                return Err(CodecError::Config("selected preset not supported".into()));
            }
            session.preset_config(V::CODEC, preset)?
        };

        if info.is_interlaced() {
            config.field_mode = FieldMode::Field;
        }
        apply_rate_control(&settings, &mut config);
        match settings.gop_size {
            g if g < 0 => {
                config.gop_length = INFINITE_GOP;
                config.frame_interval_p = 1;
            }
            0 => {}
            g => config.gop_length = g as u32,
        }
        let constraints = self.shared.sink.lock().constraints();
        self.variant
            .set_encoder_config(info, &constraints, &mut config)?;

        let (fps_n, fps_d) = if info.fps_n > 0 && info.fps_d > 0 {
            (info.fps_n as u32, info.fps_d as u32)
        } else {
            (0, 1)
        };
        let (dar_width, dar_height) = info.display_aspect();
        let first = stream.init.is_none();
        let (max_width, max_height) = match stream.init {
            Some(prev) => (prev.max_width, prev.max_height),
            None => (info.width, info.height),
        };
        let params = InitParams {
            codec: V::CODEC,
            preset,
            width: info.width,
            height: info.height,
            max_width,
            max_height,
            dar_width,
            dar_height,
            fps_n,
            fps_d,
            enable_ptd: true,
            config,
        };

        {
            let _init = self.subsystem.init_lock();
            let _guard = stream.ctx()?.make_current()?;
            if first {
                session.initialize(&params)?;
            } else {
                session.reconfigure(&params, true, true)?;
                ElementMetrics::bump(&self.shared.metrics.reconfigures);
            }
        }
        debug!(
            first,
            width = params.width,
            height = params.height,
            gop = params.config.gop_length,
            rc = ?params.config.rc.mode,
            "encoder configured"
        );

        stream.init = Some(params);
        stream.info = Some(*info);
        if !stream.buffers_allocated {
            self.allocate_buffers(stream, info)?;
        }

        let caps = {
            let _guard = stream.ctx()?.make_current()?;
            self.variant.output_caps(session.as_ref(), info)?
        };
        debug!(caps = %caps.to_caps_string(), "output caps");
        self.shared
            .sink
            .lock()
            .set_output_caps(&caps)
            .map_err(CodecError::Flow)?;

        if stream.state == EncoderState::Opened {
            stream.state = EncoderState::Configured;
        }
        Ok(())
    }

    /// Drain, stop, free the buffers and replace the session.
    fn reinit(&self, stream: &mut MutexGuard<'_, EncoderStream>) -> Result<()> {
        if stream.drain.is_some() {
            self.drain_session(stream);
        }
        self.stop_drain_thread(stream, false);
        self.free_buffers(stream)?;
        let ctx = stream.ctx.as_mut().ok_or(CodecError::InvalidState {
            expected: "opened",
            actual: "closed",
        })?;
        ctx.close_session();
        let session = ctx.open_encode_session()?;
        stream.session = Some(session);
        stream.init = None;
        if stream.state == EncoderState::Encoding {
            stream.state = EncoderState::Configured;
        }
        ElementMetrics::bump(&self.shared.metrics.reinits);
        Ok(())
    }

    fn allocate_buffers(&self, stream: &mut EncoderStream, info: &VideoInfo) -> Result<()> {
        let settings = self.shared.props.snapshot();
        let n_bufs = pool_size_for(info.width, info.height, &settings.pool);
        let session = stream.session()?;
        let device = stream.device()?;
        let mut inputs = Vec::with_capacity(n_bufs);
        let mut outputs = Vec::with_capacity(n_bufs);

        {
            let _guard = ContextGuard::push(&device)?;
            for _ in 0..n_bufs {
                let resource = match stream.memory {
                    MemoryKind::System => {
                        let desc = InputBufferDesc {
                            width: round_up(info.width as usize, 32) as u32,
                            height: round_up(info.height as usize, 32) as u32,
                            format: info.format,
                        };
                        InputResource::Hardware(session.create_input_buffer(&desc)?)
                    }
                    MemoryKind::Texture => {
                        let scratch = device.alloc_pitched(
                            info.format.plane_width_bytes(0, info.width as usize),
                            scratch_height(info.format, info.height as usize),
                        )?;
                        let desc = InputBufferDesc {
                            width: info.width,
                            height: info.height,
                            format: info.format,
                        };
                        let registered =
                            session.register_device_buffer(scratch.ptr, scratch.pitch, &desc)?;
                        InputResource::Texture {
                            scratch,
                            registered,
                            mapped: None,
                        }
                    }
                };
                let id = stream.next_id();
                inputs.push(InputSlot { id, resource });
            }
            let _init = self.subsystem.init_lock();
            for _ in 0..n_bufs {
                let handle = session.create_bitstream_buffer(BITSTREAM_BUFFER_SIZE)?;
                let id = stream.next_id();
                outputs.push(OutputSlot { id, handle });
            }
        }

        self.shared.in_pool.reset();
        self.shared.out_pool.reset();
        self.shared.in_pool.seed(inputs);
        self.shared.out_pool.seed(outputs);
        stream.buffers_allocated = true;
        info!(
            width = info.width,
            height = info.height,
            n_bufs,
            memory = ?stream.memory,
            "buffers allocated"
        );
        Ok(())
    }

    /// Destroy every buffer.  Fails if any is still in flight.
    fn free_buffers(&self, stream: &mut EncoderStream) -> Result<()> {
        if !stream.buffers_allocated {
            return Ok(());
        }
        let inputs = self.shared.in_pool.take_all();
        let outputs = self.shared.out_pool.take_all();
        let (inputs, outputs) = match (inputs, outputs) {
            (Ok(i), Ok(o)) => (i, o),
            (Err(err), _) | (_, Err(err)) => {
                error!(%err, "buffers still in flight at free");
                return Err(err);
            }
        };
        let session = stream.session()?;
        let device = stream.device()?;
        let _guard = ContextGuard::push(&device)?;
        for slot in inputs {
            let result = match slot.resource {
                InputResource::Hardware(handle) => session.destroy_input_buffer(handle),
                InputResource::Texture {
                    scratch,
                    registered,
                    mapped,
                } => {
                    if let Some(mapped) = mapped {
                        let _ = session.unmap_resource(mapped);
                    }
                    session
                        .unregister_resource(registered)
                        .and_then(|()| device.free(scratch.ptr))
                }
            };
            if let Err(err) = result {
                warn!(%err, id = slot.id, "input buffer destroy failed");
            }
        }
        let _init = self.subsystem.init_lock();
        for slot in outputs {
            if let Err(err) = session.destroy_bitstream_buffer(slot.handle) {
                warn!(%err, id = slot.id, "bitstream buffer destroy failed");
            }
        }
        self.shared.in_pool.reset();
        self.shared.out_pool.reset();
        stream.buffers_allocated = false;
        debug!("buffers freed");
        Ok(())
    }

    fn start_drain_thread(&self, stream: &mut EncoderStream) -> Result<()> {
        let session = stream.session()?;
        let device = stream.device()?;
        let shared = self.shared.clone();
        let state = self.stream.clone();
        let receiver = self.shared.queue.receiver();
        let handle = thread::Builder::new()
            .name(format!("nv{}enc-drain", V::CODEC.element_token()))
            .spawn(move || drain_loop(&shared, &state, session.as_ref(), &device, &receiver))
            .map_err(|e| CodecError::Encode(format!("spawn drain thread: {e}")))?;
        stream.drain = Some(handle);
        debug!("drain thread started");
        Ok(())
    }

    /// Push EOS so buffered pictures complete.
    fn drain_session(&self, stream: &EncoderStream) {
        let (Ok(session), Ok(device)) = (stream.session(), stream.device()) else {
            return;
        };
        let result = ContextGuard::push(&device).and_then(|_guard| session.send_eos());
        if let Err(err) = result {
            warn!(%err, "EOS submission failed");
        }
    }

    /// Stop the drain thread.
    ///
    /// Forced: queued outputs go straight back to the free pool together
    /// with their frames' inputs.  Either way the stream lock is released
    /// while joining, and outputs left behind by a drain thread that quit
    /// on a flow error are reclaimed.
    fn stop_drain_thread(&self, stream: &mut MutexGuard<'_, EncoderStream>, force: bool) {
        let handle = stream.drain.take();
        if force {
            self.shared.flushing.store(true, Ordering::Release);
            let stolen = self.shared.queue.steal_all();
            debug!(stolen = stolen.len(), "reclaiming queued bitstream buffers");
            self.reclaim(stream, stolen);
            if handle.is_some() {
                // A picture held inside the session would keep the drain
                // thread blocked in lock_bitstream.
                self.drain_session(stream);
            }
            self.shared.in_pool.push_shutdown();
        }
        if let Some(handle) = handle {
            self.shared.queue.push_shutdown();
            MutexGuard::unlocked(stream, || {
                if handle.join().is_err() {
                    error!("drain thread panicked");
                }
            });
        }

        let leftover = self.shared.queue.steal_all();
        self.reclaim(stream, leftover);
        if !stream.pending.is_empty() {
            warn!(frames = stream.pending.len(), "pending frames dropped at stop");
            let device = stream.device().ok();
            let session = stream.session.clone();
            for frame in std::mem::take(&mut stream.pending) {
                for input in frame.inputs {
                    release_input(&self.shared, session.as_deref(), device.as_ref(), input);
                }
            }
        }
        self.shared.flushing.store(false, Ordering::Release);
        debug!(force, "drain thread stopped");
    }

    /// Return stolen outputs and the inputs of their frames to the pools.
    fn reclaim(&self, stream: &mut EncoderStream, outputs: Vec<OutputSlot>) {
        let device = stream.device().ok();
        let session = stream.session.clone();
        for out in outputs {
            if let Some(pos) = stream.pending.iter().position(|f| f.outputs.contains(&out.id)) {
                let frame = stream.pending.remove(pos);
                for input in frame.inputs {
                    release_input(&self.shared, session.as_deref(), device.as_ref(), input);
                }
            }
            self.shared.out_pool.release(out);
        }
    }

    /// Encode one frame.
    ///
    /// Returns the latched downstream flow error, if any.
    pub fn handle_frame(&self, frame: RawFrame) -> Result<()> {
        let mut stream = self.stream.lock();
        match stream.state {
            EncoderState::Configured | EncoderState::Encoding => {}
            other => {
                return Err(CodecError::InvalidState {
                    expected: "configured",
                    actual: other.name(),
                });
            }
        }
        self.shared.flow_result()?;

        let mut force_idr = frame.force_keyframe;
        if self.shared.props.take_reconfig() {
            let info = stream.info.ok_or(CodecError::InvalidState {
                expected: "configured",
                actual: stream.state.name(),
            })?;
            debug!("applying scheduled reconfiguration");
            self.configure(&mut stream, &info)?;
            force_idr = true;
        }
        if stream.drain.is_none() {
            self.start_drain_thread(&mut stream)?;
        }
        stream.state = EncoderState::Encoding;

        let info = stream.info.ok_or(CodecError::InvalidState {
            expected: "configured",
            actual: stream.state.name(),
        })?;
        let session = stream.session()?;
        let device = stream.device()?;

        let input = match self.shared.in_pool.try_acquire() {
            Some(input) => Some(input),
            None => MutexGuard::unlocked(&mut stream, || self.shared.in_pool.acquire()),
        };
        let Some(mut input) = input else {
            return Err(CodecError::Flow(
                self.shared.last_flow().unwrap_or(FlowError::Flushing),
            ));
        };
        if stream.state != EncoderState::Encoding {
            self.shared.in_pool.release(input);
            return Err(CodecError::Flow(FlowError::Flushing));
        }

        let (picture_input, pitch) = match self.fill_input(&stream, &session, &device, &info, &frame, &mut input) {
            Ok(v) => v,
            Err(err) => {
                release_input(&self.shared, Some(session.as_ref()), Some(&device), input);
                return Err(err);
            }
        };

        let output = match self.shared.out_pool.try_acquire() {
            Some(output) => Some(output),
            None => MutexGuard::unlocked(&mut stream, || self.shared.out_pool.acquire()),
        };
        let Some(output) = output else {
            release_input(&self.shared, Some(session.as_ref()), Some(&device), input);
            return Err(CodecError::Flow(
                self.shared.last_flow().unwrap_or(FlowError::Flushing),
            ));
        };

        let picture_struct = match info.interlace {
            InterlaceMode::Progressive => PictureStruct::Frame,
            _ if info.top_field_first => PictureStruct::FieldTopBottom,
            _ => PictureStruct::FieldBottomTop,
        };
        let mut params = PictureParams {
            input: picture_input,
            output: output.handle,
            width: info.width,
            height: info.height,
            pitch: pitch as u32,
            format: info.format,
            picture_struct,
            frame_idx: frame.system_frame_number,
            pts: frame.pts.unwrap_or(0),
            duration: frame.duration.unwrap_or(0),
            force_idr,
            sei: Vec::new(),
        };
        self.variant.set_picture_params(&info, &mut params);

        let submitted = ContextGuard::push(&device).and_then(|_guard| session.encode_picture(&params));
        match submitted {
            Ok(SubmitStatus::Accepted) => {}
            Ok(SubmitStatus::NeedMoreInput) => {
                trace!(frame = frame.system_frame_number, "encoder needs more input");
                ElementMetrics::bump(&self.shared.metrics.need_more_input);
            }
            Err(err) => {
                error!(%err, frame = frame.system_frame_number, "encode picture failed");
                release_input(&self.shared, Some(session.as_ref()), Some(&device), input);
                self.shared.out_pool.release(output);
                return Err(CodecError::Encode(err.to_string()));
            }
        }
        ElementMetrics::bump(&self.shared.metrics.frames_submitted);

        stream.pending.push(PendingFrame {
            system_frame_number: frame.system_frame_number,
            pts: frame.pts,
            duration: frame.duration,
            inputs: vec![input],
            outputs: vec![output.id],
            collected: 0,
            data: Vec::new(),
            sync_point: false,
        });
        self.shared.queue.push(output);

        self.shared.flow_result()
    }

    /// Copy or map the frame into `input`; returns the handle and pitch to
    /// submit.
    fn fill_input(
        &self,
        stream: &EncoderStream,
        session: &Arc<dyn EncodeSession>,
        device: &Arc<dyn GpuDevice>,
        info: &VideoInfo,
        frame: &RawFrame,
        input: &mut InputSlot,
    ) -> Result<(HwHandle, usize)> {
        match (&frame.memory, &mut input.resource) {
            (FrameMemory::System(sys), InputResource::Hardware(handle)) => {
                let mut pitch_used = 0;
                let _guard = ContextGuard::push(device)?;
                session.write_input_buffer(*handle, &mut |dst: &mut [u8], pitch: usize| {
                    pitch_used = pitch;
                    let plan = input_surface_plan(
                        info.format,
                        info.width as usize,
                        info.height as usize,
                        &sys.strides,
                        pitch,
                    );
                    for copy in &plan {
                        let src = sys.planes.get(copy.plane).ok_or_else(|| {
                            CodecError::InvariantViolation(format!(
                                "frame has no plane {}",
                                copy.plane
                            ))
                        })?;
                        copy_plane_host(src, dst, copy)?;
                    }
                    Ok(())
                })?;
                Ok((*handle, pitch_used))
            }
            (
                FrameMemory::Texture(tex),
                InputResource::Texture {
                    scratch,
                    registered,
                    mapped,
                },
            ) => {
                let bridge = stream.bridge.as_ref().ok_or_else(|| {
                    CodecError::InvariantViolation("texture input without bridge".into())
                })?;
                bridge.upload_planes(tex, info.format, info.width, info.height, *scratch)?;
                let _guard = ContextGuard::push(device)?;
                let handle = session.map_resource(*registered)?;
                *mapped = Some(handle);
                Ok((handle, scratch.pitch))
            }
            (memory, _) => Err(CodecError::NotNegotiated(format!(
                "frame in {:?} memory, negotiated {:?}",
                memory.kind(),
                stream.memory
            ))),
        }
    }

    /// Submit EOS and wait until every queued output is pushed.
    pub fn finish(&self) -> Result<()> {
        let mut stream = self.stream.lock();
        if stream.drain.is_some() {
            self.drain_session(&stream);
        }
        self.stop_drain_thread(&mut stream, false);
        if stream.state == EncoderState::Encoding {
            stream.state = EncoderState::Configured;
        }
        self.shared.flow_result()
    }

    /// Forced stop: discard queued work, free the buffers and the session.
    pub fn stop(&self) -> Result<()> {
        let mut stream = self.stream.lock();
        self.stop_drain_thread(&mut stream, true);
        let freed = self.free_buffers(&mut stream);
        if let Some(ctx) = stream.ctx.as_mut() {
            ctx.close_session();
        }
        stream.session = None;
        stream.init = None;
        stream.info = None;
        stream.bridge = None;
        *self.shared.last_flow.lock() = None;
        self.shared.props.clear_reconfig();
        if stream.state != EncoderState::Closed {
            stream.state = EncoderState::Opened;
        }
        self.shared.metrics.report(&format!("nv{}enc", V::CODEC.element_token()));
        freed
    }

    /// Stop and release the device context.  Safe to call repeatedly.
    pub fn close(&self) -> Result<()> {
        let result = if self.state() == EncoderState::Closed {
            Ok(())
        } else {
            self.stop()
        };
        let mut stream = self.stream.lock();
        if let Some(mut ctx) = stream.ctx.take() {
            ctx.close();
        }
        stream.caps = None;
        stream.state = EncoderState::Closed;
        result
    }
}

impl<V: CodecVariant> Drop for Encoder<V> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(%err, "encoder close failed");
        }
    }
}

/// Whether the configured GOP differs from the `gop_size` property.
fn gop_differs(config: &EncodeConfig, gop_size: i32) -> bool {
    match gop_size {
        g if g < 0 => !config.has_infinite_gop(),
        0 => false,
        g => config.gop_length != g as u32,
    }
}

fn apply_rate_control(settings: &EncoderSettings, config: &mut EncodeConfig) {
    let Some(mode) = settings.rc_mode.hw_mode() else {
        return;
    };
    debug_assert!(settings.rc_mode != RateControl::Default);
    config.rc.mode = mode;
    if settings.bitrate > 0 {
        let bps = settings.bitrate * 1024;
        config.rc.average_bitrate = bps;
        config.rc.max_bitrate = bps;
    }
    if settings.qp_const > 0 {
        config.rc.const_qp = Qp::uniform(settings.qp_const as u32);
    }
    if settings.qp_min >= 0 {
        config.rc.min_qp = Some(Qp::uniform(settings.qp_min as u32));
    }
    if settings.qp_max >= 0 {
        config.rc.max_qp = Some(Qp::uniform(settings.qp_max as u32));
    }
}

/// Unmap a texture input if needed and return it to the pool.
fn release_input(
    shared: &EncoderShared,
    session: Option<&dyn EncodeSession>,
    device: Option<&Arc<dyn GpuDevice>>,
    mut input: InputSlot,
) {
    if let InputResource::Texture { mapped, .. } = &mut input.resource {
        if let (Some(handle), Some(session), Some(device)) = (mapped.take(), session, device) {
            let result = ContextGuard::push(device).and_then(|_guard| session.unmap_resource(handle));
            if let Err(err) = result {
                warn!(%err, "unmap input resource failed");
            }
        }
    }
    shared.in_pool.release(input);
}

/// Body of the drain thread.
fn drain_loop(
    shared: &EncoderShared,
    stream: &Mutex<EncoderStream>,
    session: &dyn EncodeSession,
    device: &Arc<dyn GpuDevice>,
    receiver: &BitstreamReceiver<OutputSlot>,
) {
    while let Some(out) = receiver.pop() {
        // Held across lock, unlock and the input unmap.
        let (ctx, locked) = match ContextGuard::push(device) {
            Ok(ctx) => {
                let locked = session.lock_bitstream(out.handle, true);
                (Some(ctx), locked)
            }
            Err(err) => (None, Err(err)),
        };

        let mut guard = stream.lock();
        let Some(pos) = guard.pending.iter().position(|f| f.outputs.contains(&out.id)) else {
            error!(id = out.id, "no pending frame for bitstream buffer");
            if locked.is_ok() {
                let _ = session.unlock_bitstream(out.handle);
            }
            drop(ctx);
            shared.out_pool.release(out);
            continue;
        };

        let bitstream = match locked {
            Ok(bitstream) => bitstream,
            Err(err) => {
                error!(%err, "lock bitstream failed");
                let frame = guard.pending.remove(pos);
                drop(guard);
                for input in frame.inputs {
                    release_input(shared, Some(session), Some(device), input);
                }
                drop(ctx);
                shared.out_pool.release(out);
                shared.latch(FlowError::Error);
                shared.in_pool.push_shutdown();
                break;
            }
        };
        if let Err(err) = session.unlock_bitstream(out.handle) {
            warn!(%err, "unlock bitstream failed");
        }

        let frame = &mut guard.pending[pos];
        frame.data.extend_from_slice(&bitstream.data);
        frame.sync_point |= bitstream.picture_type.is_sync_point();
        frame.collected += 1;
        let done = frame.collected == frame.outputs.len();
        shared.out_pool.release(out);
        if !done {
            continue;
        }
        let frame = guard.pending.remove(pos);
        drop(guard);
        for input in frame.inputs {
            release_input(shared, Some(session), Some(device), input);
        }
        drop(ctx);

        if shared.flushing.load(Ordering::Acquire) {
            trace!(frame = frame.system_frame_number, "discarding output while flushing");
            continue;
        }
        let unit = AccessUnit {
            system_frame_number: frame.system_frame_number,
            data: frame.data,
            pts: frame.pts,
            dts: frame.pts,
            duration: frame.duration,
            sync_point: frame.sync_point,
        };
        trace!(
            frame = unit.system_frame_number,
            bytes = unit.data.len(),
            sync = unit.sync_point,
            "finishing frame"
        );
        let pushed = shared.sink.lock().push(unit);
        if let Err(flow) = pushed {
            warn!(%flow, "downstream rejected frame, stopping drain");
            shared.latch(flow);
            shared.in_pool.push_shutdown();
            break;
        }
        ElementMetrics::bump(&shared.metrics.units_emitted);
    }
    debug!("drain thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvpipe_core::codec_traits::{CodecConfig, HwProfile, HwRcMode, RcParams};

    fn preset_config() -> EncodeConfig {
        EncodeConfig {
            profile: HwProfile::Auto,
            gop_length: 30,
            frame_interval_p: 1,
            field_mode: FieldMode::Frame,
            rc: RcParams {
                mode: HwRcMode::Vbr,
                average_bitrate: 5_000_000,
                max_bitrate: 0,
                const_qp: Qp::uniform(26),
                min_qp: None,
                max_qp: None,
            },
            codec: CodecConfig::default(),
        }
    }

    #[test]
    fn infinite_gop_matches_negative_property() {
        let mut config = preset_config();
        assert!(gop_differs(&config, -1));
        config.gop_length = INFINITE_GOP;
        assert!(!gop_differs(&config, -1));
        assert!(gop_differs(&config, 30));
        assert!(!gop_differs(&config, 0));
    }

    #[test]
    fn default_rate_control_keeps_preset() {
        let mut config = preset_config();
        let settings = EncoderSettings {
            bitrate: 4000,
            qp_min: 10,
            ..EncoderSettings::default()
        };
        apply_rate_control(&settings, &mut config);
        assert_eq!(config, preset_config());
    }

    #[test]
    fn cbr_sets_both_bitrates_in_bits() {
        let mut config = preset_config();
        let settings = EncoderSettings {
            rc_mode: RateControl::Cbr,
            bitrate: 4000,
            qp_min: 10,
            qp_max: 40,
            ..EncoderSettings::default()
        };
        apply_rate_control(&settings, &mut config);
        assert_eq!(config.rc.mode, HwRcMode::Cbr);
        assert_eq!(config.rc.average_bitrate, 4000 * 1024);
        assert_eq!(config.rc.max_bitrate, 4000 * 1024);
        assert_eq!(config.rc.min_qp, Some(Qp::uniform(10)));
        assert_eq!(config.rc.max_qp, Some(Qp::uniform(40)));
        assert_eq!(config.rc.const_qp, Qp::uniform(26));
    }
}
