#![allow(dead_code)]

use std::sync::Arc;

use nvpipe_core::codec_traits::{DecodedSink, DownstreamConstraints, EncodedSink, TextureContext};
use nvpipe_core::error::FlowError;
use nvpipe_core::subsystem::CodecSubsystem;
use nvpipe_core::types::{
    AccessUnit, CompressedCaps, CompressedPacket, DecodedFrame, FrameMemory, MemoryKind,
    PixelFormat, RawFrame, SystemFrame, VideoInfo,
};
use nvpipe_elements::loopback::{LoopbackConfig, LoopbackPlatform};
use parking_lot::Mutex;

pub const FRAME_NS: u64 = 33_333_333;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn loopback(config: LoopbackConfig) -> (Arc<LoopbackPlatform>, Arc<CodecSubsystem>) {
    init_tracing();
    let platform = LoopbackPlatform::new(config);
    let subsystem = CodecSubsystem::new(platform.clone());
    (platform, subsystem)
}

/// Deterministic content for frame `n`.
pub fn pattern_frame(info: &VideoInfo, n: u32) -> SystemFrame {
    let mut frame = SystemFrame::alloc(info);
    for (p, plane) in frame.planes.iter_mut().enumerate() {
        for (i, byte) in plane.iter_mut().enumerate() {
            *byte = (n as usize * 7 + i + p * 31) as u8;
        }
    }
    frame
}

pub fn raw_frame(info: &VideoInfo, n: u32) -> RawFrame {
    RawFrame {
        system_frame_number: n,
        pts: Some(n as u64 * FRAME_NS),
        duration: Some(FRAME_NS),
        force_keyframe: false,
        memory: FrameMemory::System(pattern_frame(info, n)),
    }
}

pub fn nv12_64() -> VideoInfo {
    VideoInfo::new(PixelFormat::Nv12, 64, 64).with_framerate(30, 1)
}

// ─── Encoder side ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct Collected {
    pub caps: Vec<CompressedCaps>,
    pub units: Vec<AccessUnit>,
}

/// Encoded sink recording everything it is handed.  Pushes beyond
/// `fail_after` are refused with `flow`.
#[derive(Clone)]
pub struct CollectSink {
    pub collected: Arc<Mutex<Collected>>,
    pub constraints: DownstreamConstraints,
    pub fail_after: Option<(usize, FlowError)>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self {
            collected: Arc::new(Mutex::new(Collected::default())),
            constraints: DownstreamConstraints::default(),
            fail_after: None,
        }
    }

    pub fn units(&self) -> Vec<AccessUnit> {
        self.collected.lock().units.clone()
    }

    pub fn last_caps(&self) -> Option<CompressedCaps> {
        self.collected.lock().caps.last().cloned()
    }
}

impl EncodedSink for CollectSink {
    fn constraints(&self) -> DownstreamConstraints {
        self.constraints.clone()
    }

    fn set_output_caps(&mut self, caps: &CompressedCaps) -> Result<(), FlowError> {
        self.collected.lock().caps.push(caps.clone());
        Ok(())
    }

    fn push(&mut self, unit: AccessUnit) -> Result<(), FlowError> {
        let mut collected = self.collected.lock();
        if let Some((limit, flow)) = self.fail_after {
            if collected.units.len() >= limit {
                return Err(flow);
            }
        }
        collected.units.push(unit);
        Ok(())
    }
}

pub fn packet(unit: &AccessUnit) -> CompressedPacket {
    CompressedPacket {
        data: unit.data.clone(),
        pts: unit.pts,
        duration: unit.duration,
        discont: false,
    }
}

// ─── Decoder side ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct Decoded {
    pub negotiated: Vec<(VideoInfo, MemoryKind)>,
    pub frames: Vec<DecodedFrame>,
}

#[derive(Clone)]
pub struct FrameSink {
    pub decoded: Arc<Mutex<Decoded>>,
    pub memory: Vec<MemoryKind>,
    pub texture: Option<Arc<dyn TextureContext>>,
}

impl FrameSink {
    pub fn system() -> Self {
        Self {
            decoded: Arc::new(Mutex::new(Decoded::default())),
            memory: vec![MemoryKind::System],
            texture: None,
        }
    }

    pub fn texture(texture: Arc<dyn TextureContext>) -> Self {
        Self {
            decoded: Arc::new(Mutex::new(Decoded::default())),
            memory: vec![MemoryKind::Texture, MemoryKind::System],
            texture: Some(texture),
        }
    }

    pub fn frames(&self) -> Vec<DecodedFrame> {
        self.decoded.lock().frames.clone()
    }
}

impl DecodedSink for FrameSink {
    fn allowed_memory(&self) -> Vec<MemoryKind> {
        self.memory.clone()
    }

    fn texture_context(&self) -> Option<Arc<dyn TextureContext>> {
        self.texture.clone()
    }

    fn negotiate(&mut self, info: &VideoInfo, memory: MemoryKind) -> Result<(), FlowError> {
        self.decoded.lock().negotiated.push((*info, memory));
        Ok(())
    }

    fn push(&mut self, frame: DecodedFrame) -> Result<(), FlowError> {
        self.decoded.lock().frames.push(frame);
        Ok(())
    }
}

pub fn system_planes(frame: &DecodedFrame) -> Vec<Vec<u8>> {
    match &frame.memory {
        FrameMemory::System(sys) => sys.planes.clone(),
        FrameMemory::Texture(_) => panic!("expected system memory output"),
    }
}
