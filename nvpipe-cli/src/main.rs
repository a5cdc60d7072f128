//! nvpipe CLI entrypoint.
//!
//! ```bash
//! nvpipe devices --json
//! nvpipe inspect --loopback
//! nvpipe selftest --frames 30 --json
//! ```

use std::io::IsTerminal;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;

use nvpipe_core::codec_traits::{CodecPlatform, DecodedSink, EncodedSink};
use nvpipe_core::error::{CodecError, FlowError, Result};
use nvpipe_core::subsystem::CodecSubsystem;
use nvpipe_core::types::{
    AccessUnit, CompressedCaps, CompressedPacket, DecodedFrame, FrameMemory, MemoryKind,
    PixelFormat, RawFrame, SystemFrame, VideoInfo,
};
use nvpipe_elements::{
    Decoder, DecoderSettings, EncoderSettings, H264Encoder, LoopbackConfig, LoopbackPlatform,
    MetricsSnapshot, Registry,
};
use nvpipe_elements::h264::H264;
use nvpipe_nvcodec::NvPlatform;

const JSON_SCHEMA_VERSION: u32 = 1;
const SELFTEST_FPS: i32 = 30;

#[derive(Parser, Debug)]
#[command(
    name = "nvpipe",
    version,
    about = "NVENC/NVDEC codec elements",
    arg_required_else_help = true,
    after_help = "Examples:\n  nvpipe devices --json\n  nvpipe inspect --loopback\n  nvpipe selftest --frames 30 --json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List visible devices.
    Devices(DevicesArgs),
    /// List the elements that would be registered, with ranks and caps.
    Inspect(InspectArgs),
    /// Encode and decode synthetic frames through the loopback backend.
    Selftest(SelftestArgs),
}

#[derive(Args, Debug, Clone)]
struct BackendArgs {
    /// Use the in-process loopback backend instead of the NVIDIA driver.
    #[arg(long = "loopback", default_value_t = false)]
    loopback: bool,

    /// Number of loopback devices.
    #[arg(long = "loopback-devices", default_value_t = 1, requires = "loopback")]
    loopback_devices: u32,
}

#[derive(Args, Debug, Clone)]
struct DevicesArgs {
    #[command(flatten)]
    backend: BackendArgs,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct InspectArgs {
    #[command(flatten)]
    backend: BackendArgs,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct SelftestArgs {
    /// Number of 64x64 frames to push through encoder and decoder.
    #[arg(long = "frames", default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..=10_000))]
    frames: u32,

    /// Frames between keyframes.
    #[arg(long = "gop-size", default_value_t = 30)]
    gop_size: i32,

    /// Emit structured JSON output to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let (command, json) = match &cli.command {
        Commands::Devices(args) => ("devices", args.json),
        Commands::Inspect(args) => ("inspect", args.json),
        Commands::Selftest(args) => ("selftest", args.json),
    };

    let result = match cli.command {
        Commands::Devices(args) => run_devices(args),
        Commands::Inspect(args) => run_inspect(args),
        Commands::Selftest(args) => run_selftest(args),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if json {
                println!("{}", command_error_json(command, &err));
            } else {
                tracing::error!(error = %err, code = err.error_code(), "command failed");
            }
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

fn platform(args: &BackendArgs) -> Arc<dyn CodecPlatform> {
    if args.loopback {
        return LoopbackPlatform::new(LoopbackConfig {
            devices: args.loopback_devices,
            ..LoopbackConfig::default()
        });
    }
    Arc::new(NvPlatform::new())
}

fn command_error_json(command: &str, err: &CodecError) -> serde_json::Value {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "code": err.error_code(),
        "error": err.to_string(),
    })
}

// ─── devices ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct DeviceRow {
    device: u32,
    name: String,
    total_mem_mb: u64,
}

fn run_devices(args: DevicesArgs) -> Result<()> {
    let platform = platform(&args.backend);
    let count = platform.device_count()?;
    let devices = (0..count)
        .map(|ordinal| {
            platform.device_info(ordinal).map(|info| DeviceRow {
                device: info.ordinal,
                name: info.name,
                total_mem_mb: info.total_mem_bytes / (1024 * 1024),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    if args.json {
        println!(
            "{}",
            json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "devices",
                "ok": true,
                "backend": platform.backend_name(),
                "devices": devices,
            })
        );
    } else {
        println!("devices: {}", devices.len());
        println!("backend={}", platform.backend_name());
        for dev in &devices {
            println!(
                "device={} name={} total_mem_mb={}",
                dev.device, dev.name, dev.total_mem_mb
            );
        }
    }
    Ok(())
}

// ─── inspect ─────────────────────────────────────────────────────────────

fn run_inspect(args: InspectArgs) -> Result<()> {
    let platform = platform(&args.backend);
    let backend = platform.backend_name();
    let subsystem = CodecSubsystem::new(platform);
    let registry = Registry::probe(&subsystem)?;

    if args.json {
        println!(
            "{}",
            json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "inspect",
                "ok": true,
                "backend": backend,
                "elements": registry.entries(),
            })
        );
    } else {
        println!("elements: {}", registry.entries().len());
        println!("backend={backend}");
        for entry in registry.entries() {
            println!(
                "{} rank={} device={}{}",
                entry.name,
                entry.rank,
                entry.device,
                if entry.is_default { " default" } else { "" }
            );
            println!("  sink: {}", entry.sink_caps);
            println!("  src:  {}", entry.src_caps);
        }
    }
    Ok(())
}

// ─── selftest ────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct UnitCollector {
    caps: Arc<Mutex<Option<CompressedCaps>>>,
    units: Arc<Mutex<Vec<AccessUnit>>>,
}

impl EncodedSink for UnitCollector {
    fn set_output_caps(&mut self, caps: &CompressedCaps) -> std::result::Result<(), FlowError> {
        *self.caps.lock() = Some(caps.clone());
        Ok(())
    }

    fn push(&mut self, unit: AccessUnit) -> std::result::Result<(), FlowError> {
        self.units.lock().push(unit);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct FrameCollector {
    frames: Arc<Mutex<Vec<DecodedFrame>>>,
}

impl DecodedSink for FrameCollector {
    fn negotiate(
        &mut self,
        _info: &VideoInfo,
        _memory: MemoryKind,
    ) -> std::result::Result<(), FlowError> {
        Ok(())
    }

    fn push(&mut self, frame: DecodedFrame) -> std::result::Result<(), FlowError> {
        self.frames.lock().push(frame);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SelftestSummary {
    frames: u32,
    units: usize,
    decoded: usize,
    sync_points: Vec<u32>,
    mismatches: Vec<u32>,
    caps: Option<String>,
    encoder: MetricsSnapshot,
    decoder: MetricsSnapshot,
}

fn test_frame(info: &VideoInfo, n: u32) -> RawFrame {
    let mut frame = SystemFrame::alloc(info);
    for (p, plane) in frame.planes.iter_mut().enumerate() {
        for (i, byte) in plane.iter_mut().enumerate() {
            *byte = (n as usize * 3 + i * 5 + p * 17) as u8;
        }
    }
    let duration = info.frame_duration();
    RawFrame {
        system_frame_number: n,
        pts: duration.map(|d| d * n as u64),
        duration,
        force_keyframe: false,
        memory: FrameMemory::System(frame),
    }
}

fn run_selftest(args: SelftestArgs) -> Result<()> {
    let subsystem = CodecSubsystem::new(LoopbackPlatform::new(LoopbackConfig::default()));
    let info = VideoInfo::new(PixelFormat::Nv12, 64, 64).with_framerate(SELFTEST_FPS, 1);

    let encoded = UnitCollector::default();
    let settings = EncoderSettings {
        gop_size: args.gop_size,
        ..EncoderSettings::default()
    };
    let encoder = H264Encoder::new(&subsystem, 0, H264, settings, Box::new(encoded.clone()));
    encoder.open()?;
    encoder.set_format(info, MemoryKind::System, None)?;
    let mut expected = Vec::with_capacity(args.frames as usize);
    for n in 0..args.frames {
        let frame = test_frame(&info, n);
        if let FrameMemory::System(sys) = &frame.memory {
            expected.push(sys.planes.clone());
        }
        encoder.handle_frame(frame)?;
    }
    encoder.finish()?;
    let encoder_metrics = encoder.metrics().snapshot();
    encoder.close()?;

    let units = encoded.units.lock().clone();
    let caps = encoded.caps.lock().clone().ok_or_else(|| {
        CodecError::NotNegotiated("encoder produced no output caps".into())
    })?;
    let caps_string = caps.to_caps_string();

    let decoded = FrameCollector::default();
    let decoder = Decoder::new(
        &subsystem,
        caps.codec,
        DecoderSettings::default(),
        Box::new(decoded.clone()),
    )?;
    decoder.open()?;
    decoder.set_format(caps)?;
    for unit in &units {
        decoder.handle_frame(&CompressedPacket {
            data: unit.data.clone(),
            pts: unit.pts,
            duration: unit.duration,
            discont: false,
        })?;
    }
    decoder.finish()?;
    let decoder_metrics = decoder.metrics().snapshot();
    decoder.close()?;

    let frames = decoded.frames.lock().clone();
    let mismatches = frames
        .iter()
        .enumerate()
        .filter(|(n, frame)| {
            let planes = match &frame.memory {
                FrameMemory::System(sys) => Some(&sys.planes),
                FrameMemory::Texture(_) => None,
            };
            frame.system_frame_number != Some(*n as u32) || planes != expected.get(*n)
        })
        .map(|(n, _)| n as u32)
        .collect::<Vec<_>>();

    let summary = SelftestSummary {
        frames: args.frames,
        units: units.len(),
        decoded: frames.len(),
        sync_points: units
            .iter()
            .filter(|u| u.sync_point)
            .map(|u| u.system_frame_number)
            .collect(),
        mismatches,
        caps: Some(caps_string),
        encoder: encoder_metrics,
        decoder: decoder_metrics,
    };
    let ok = summary.mismatches.is_empty()
        && summary.units == args.frames as usize
        && summary.decoded == args.frames as usize;

    if args.json {
        println!(
            "{}",
            json!({
                "schema_version": JSON_SCHEMA_VERSION,
                "command": "selftest",
                "ok": ok,
                "summary": summary,
            })
        );
    } else {
        println!(
            "selftest: frames={} units={} decoded={} sync_points={:?} mismatches={}",
            summary.frames,
            summary.units,
            summary.decoded,
            summary.sync_points,
            summary.mismatches.len()
        );
        if let Some(caps) = &summary.caps {
            println!("caps={caps}");
        }
    }

    if !ok {
        return Err(CodecError::InvariantViolation(format!(
            "selftest round trip failed: {} of {} frames decoded, {} mismatched",
            summary.decoded,
            summary.frames,
            summary.mismatches.len()
        )));
    }
    Ok(())
}
