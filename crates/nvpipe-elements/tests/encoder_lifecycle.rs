mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::{CollectSink, loopback, nv12_64, raw_frame};
use nvpipe_core::error::{CodecError, FlowError};
use nvpipe_core::pool::PoolSizing;
use nvpipe_core::types::{CodecId, FrameMemory, MemoryKind, PixelFormat, VideoInfo};
use nvpipe_elements::encoder::EncoderState;
use nvpipe_elements::h264::{H264, H264Encoder};
use nvpipe_elements::h265::{H265, H265Encoder};
use nvpipe_elements::loopback::{LoopbackConfig, LoopbackPlatform, LoopbackStats};
use nvpipe_elements::settings::EncoderSettings;

fn h264(
    config: LoopbackConfig,
    settings: EncoderSettings,
) -> (H264Encoder, CollectSink, Arc<LoopbackPlatform>) {
    let (platform, subsystem) = loopback(config);
    let sink = CollectSink::new();
    let enc = H264Encoder::new(&subsystem, 0, H264, settings, Box::new(sink.clone()));
    (enc, sink, platform)
}

#[test]
fn frames_come_out_in_submission_order_and_pools_refill() {
    let (enc, sink, _platform) = h264(LoopbackConfig::default(), EncoderSettings::default());
    enc.open().unwrap();
    assert_eq!(enc.state(), EncoderState::Opened);
    let info = nv12_64();
    enc.set_format(info, MemoryKind::System, None).unwrap();
    assert_eq!(enc.state(), EncoderState::Configured);

    let (inputs, outputs) = enc.pool_counts();
    assert_eq!(inputs.total, PoolSizing::default().small_frame_buffers);
    assert_eq!(outputs.total, inputs.total);

    for n in 0..20 {
        enc.handle_frame(raw_frame(&info, n)).unwrap();
        let (inputs, outputs) = enc.pool_counts();
        assert!(inputs.is_consistent());
        assert!(outputs.is_consistent());
    }
    enc.finish().unwrap();

    let units = sink.units();
    let order: Vec<u32> = units.iter().map(|u| u.system_frame_number).collect();
    assert_eq!(order, (0..20).collect::<Vec<_>>());
    assert!(units[0].sync_point);
    assert_eq!(units[3].pts, Some(3 * common::FRAME_NS));

    let (inputs, outputs) = enc.pool_counts();
    assert_eq!(inputs.free, inputs.total);
    assert_eq!(outputs.free, outputs.total);
    assert_eq!(enc.queued_outputs(), 0);

    let metrics = enc.metrics().snapshot();
    assert_eq!(metrics.frames_submitted, 20);
    assert_eq!(metrics.units_emitted, 20);
    assert!(enc.metrics().validate());
    enc.close().unwrap();
    assert_eq!(enc.state(), EncoderState::Closed);
}

#[test]
fn output_caps_describe_the_stream() {
    let (enc, sink, _platform) = h264(LoopbackConfig::default(), EncoderSettings::default());
    enc.open().unwrap();
    enc.set_format(nv12_64(), MemoryKind::System, None).unwrap();
    let caps = sink.last_caps().unwrap();
    assert_eq!(caps.codec, CodecId::H264);
    assert_eq!(caps.stream_format.as_deref(), Some("byte-stream"));
    assert_eq!(caps.alignment.as_deref(), Some("au"));
    assert_eq!(caps.profile.as_deref(), Some("high"));
    assert_eq!(caps.level.as_deref(), Some("3.1"));
    assert_eq!((caps.width, caps.height, caps.fps_n, caps.fps_d), (64, 64, 30, 1));
}

#[test]
fn gop_size_places_sync_points() {
    let settings = EncoderSettings {
        gop_size: 4,
        ..EncoderSettings::default()
    };
    let (enc, sink, _platform) = h264(LoopbackConfig::default(), settings);
    enc.open().unwrap();
    let info = nv12_64();
    enc.set_format(info, MemoryKind::System, None).unwrap();
    for n in 0..10 {
        let mut frame = raw_frame(&info, n);
        frame.force_keyframe = n == 6;
        enc.handle_frame(frame).unwrap();
    }
    enc.finish().unwrap();
    let sync: Vec<u32> = sink
        .units()
        .iter()
        .filter(|u| u.sync_point)
        .map(|u| u.system_frame_number)
        .collect();
    assert_eq!(sync, vec![0, 4, 6]);
}

#[test]
fn smaller_format_reconfigures_and_larger_reinitializes() {
    let (enc, sink, platform) = h264(LoopbackConfig::default(), EncoderSettings::default());
    enc.open().unwrap();
    let big = nv12_64();
    enc.set_format(big, MemoryKind::System, None).unwrap();
    for n in 0..3 {
        enc.handle_frame(raw_frame(&big, n)).unwrap();
    }

    let small = VideoInfo::new(PixelFormat::Nv12, 32, 32).with_framerate(30, 1);
    enc.set_format(small, MemoryKind::System, None).unwrap();
    let metrics = enc.metrics().snapshot();
    assert_eq!((metrics.reconfigures, metrics.reinits), (1, 0));
    assert_eq!(LoopbackStats::get(&platform.stats().sessions_opened), 1);
    for n in 3..6 {
        enc.handle_frame(raw_frame(&small, n)).unwrap();
    }

    let bigger = VideoInfo::new(PixelFormat::Nv12, 128, 96).with_framerate(30, 1);
    enc.set_format(bigger, MemoryKind::System, None).unwrap();
    let metrics = enc.metrics().snapshot();
    assert_eq!(metrics.reinits, 1);
    assert_eq!(LoopbackStats::get(&platform.stats().sessions_opened), 2);
    // Reinit drains what was in flight before replacing the session.
    assert_eq!(sink.units().len(), 6);

    for n in 6..9 {
        enc.handle_frame(raw_frame(&bigger, n)).unwrap();
    }
    enc.finish().unwrap();
    let units = sink.units();
    assert_eq!(units.len(), 9);
    // A new session starts with a keyframe.
    assert!(units[6].sync_point);
    assert_eq!(sink.last_caps().map(|c| (c.width, c.height)), Some((128, 96)));
}

#[test]
fn live_property_change_reconfigures_with_keyframe() {
    let (enc, sink, platform) = h264(LoopbackConfig::default(), EncoderSettings::default());
    enc.open().unwrap();
    let info = nv12_64();
    enc.set_format(info, MemoryKind::System, None).unwrap();
    enc.handle_frame(raw_frame(&info, 0)).unwrap();
    enc.handle_frame(raw_frame(&info, 1)).unwrap();

    let stats = platform.stats();
    let (inputs_before, outputs_before) = enc.pool_counts();
    let bitstreams_before = LoopbackStats::get(&stats.bitstream_buffers);
    let input_buffers_before = LoopbackStats::get(&stats.input_buffers);

    enc.properties().set_bitrate(2_000).unwrap();
    assert!(enc.properties().reconfig_pending());
    enc.handle_frame(raw_frame(&info, 2)).unwrap();
    assert!(!enc.properties().reconfig_pending());
    enc.finish().unwrap();

    let units = sink.units();
    assert!(!units[1].sync_point);
    assert!(units[2].sync_point);
    let metrics = enc.metrics().snapshot();
    assert_eq!((metrics.reconfigures, metrics.reinits), (1, 0));

    // A bitrate change keeps the session and every pooled buffer.
    let (inputs_after, outputs_after) = enc.pool_counts();
    assert_eq!(inputs_after.total, inputs_before.total);
    assert_eq!(outputs_after.total, outputs_before.total);
    assert_eq!(LoopbackStats::get(&stats.bitstream_buffers), bitstreams_before);
    assert_eq!(LoopbackStats::get(&stats.input_buffers), input_buffers_before);
    assert_eq!(LoopbackStats::get(&stats.sessions_opened), 1);
}

#[test]
fn short_input_planes_are_rejected() {
    let (enc, sink, _platform) = h264(LoopbackConfig::default(), EncoderSettings::default());
    enc.open().unwrap();
    let info = nv12_64();
    enc.set_format(info, MemoryKind::System, None).unwrap();
    enc.handle_frame(raw_frame(&info, 0)).unwrap();

    let mut short = raw_frame(&info, 1);
    if let FrameMemory::System(sys) = &mut short.memory {
        sys.planes[0].truncate(100);
        sys.planes[1].clear();
    }
    assert!(matches!(
        enc.handle_frame(short),
        Err(CodecError::BufferTooSmall { have: 100, .. })
    ));
    let (inputs, outputs) = enc.pool_counts();
    assert!(inputs.is_consistent());
    assert!(outputs.is_consistent());

    enc.handle_frame(raw_frame(&info, 2)).unwrap();
    enc.finish().unwrap();
    let order: Vec<u32> = sink.units().iter().map(|u| u.system_frame_number).collect();
    assert_eq!(order, vec![0, 2]);
    let (inputs, _) = enc.pool_counts();
    assert_eq!(inputs.free, inputs.total);
}

#[test]
fn gop_property_change_reinitializes() {
    let (enc, sink, platform) = h264(LoopbackConfig::default(), EncoderSettings::default());
    enc.open().unwrap();
    let info = nv12_64();
    enc.set_format(info, MemoryKind::System, None).unwrap();
    enc.handle_frame(raw_frame(&info, 0)).unwrap();
    enc.properties().set_gop_size(-1).unwrap();
    enc.handle_frame(raw_frame(&info, 1)).unwrap();
    enc.finish().unwrap();
    assert_eq!(enc.metrics().snapshot().reinits, 1);
    assert_eq!(LoopbackStats::get(&platform.stats().sessions_opened), 2);
    assert_eq!(sink.units().len(), 2);
}

#[test]
fn forced_stop_returns_every_buffer() {
    let config = LoopbackConfig {
        encode_delay: 8,
        ..LoopbackConfig::default()
    };
    let (enc, sink, platform) = h264(config, EncoderSettings::default());
    enc.open().unwrap();
    let info = nv12_64();
    enc.set_format(info, MemoryKind::System, None).unwrap();
    for n in 0..5 {
        enc.handle_frame(raw_frame(&info, n)).unwrap();
    }
    assert_eq!(enc.metrics().snapshot().need_more_input, 5);

    // Freeing fails if any buffer is still in flight.
    enc.stop().unwrap();
    assert_eq!(enc.state(), EncoderState::Opened);
    assert!(sink.units().is_empty());
    assert_eq!(enc.queued_outputs(), 0);
    assert_eq!(LoopbackStats::get(&platform.stats().sessions_destroyed), 1);

    // The element can be configured again after a stop.
    enc.set_format(info, MemoryKind::System, None).unwrap();
    enc.handle_frame(raw_frame(&info, 5)).unwrap();
    enc.finish().unwrap();
    assert_eq!(sink.units().len(), 1);
}

#[test]
fn downstream_error_is_latched() {
    let (platform, subsystem) = loopback(LoopbackConfig::default());
    let mut sink = CollectSink::new();
    sink.fail_after = Some((2, FlowError::Eos));
    let enc = H264Encoder::new(&subsystem, 0, H264, EncoderSettings::default(), Box::new(sink.clone()));
    enc.open().unwrap();
    let info = nv12_64();
    enc.set_format(info, MemoryKind::System, None).unwrap();

    for n in 0..6 {
        if let Err(err) = enc.handle_frame(raw_frame(&info, n)) {
            assert!(matches!(err, CodecError::Flow(FlowError::Eos)));
        }
    }
    let finished = enc.finish();
    assert!(matches!(finished, Err(CodecError::Flow(FlowError::Eos))));
    assert!(matches!(
        enc.handle_frame(raw_frame(&info, 6)),
        Err(CodecError::Flow(FlowError::Eos))
    ));
    assert_eq!(sink.units().len(), 2);

    // Stop clears the latched error; streaming resumes after set_format.
    enc.stop().unwrap();
    assert_eq!(LoopbackStats::get(&platform.stats().sessions_destroyed), 1);
}

#[test]
fn submit_failure_is_reported_and_recovers_buffers() {
    let (enc, sink, platform) = h264(LoopbackConfig::default(), EncoderSettings::default());
    platform.faults().fail_encode_at.store(2, Ordering::Release);
    enc.open().unwrap();
    let info = nv12_64();
    enc.set_format(info, MemoryKind::System, None).unwrap();
    enc.handle_frame(raw_frame(&info, 0)).unwrap();
    enc.handle_frame(raw_frame(&info, 1)).unwrap();
    assert!(matches!(
        enc.handle_frame(raw_frame(&info, 2)),
        Err(CodecError::Encode(_))
    ));
    enc.handle_frame(raw_frame(&info, 3)).unwrap();
    enc.finish().unwrap();
    let order: Vec<u32> = sink.units().iter().map(|u| u.system_frame_number).collect();
    assert_eq!(order, vec![0, 1, 3]);
    enc.stop().unwrap();
}

#[test]
fn unsupported_input_is_not_negotiated() {
    let (enc, _sink, _platform) = h264(LoopbackConfig::default(), EncoderSettings::default());
    assert!(matches!(
        enc.set_format(nv12_64(), MemoryKind::System, None),
        Err(CodecError::InvalidState { .. })
    ));
    enc.open().unwrap();
    let p010 = VideoInfo::new(PixelFormat::P010, 64, 64);
    assert!(matches!(
        enc.set_format(p010, MemoryKind::System, None),
        Err(CodecError::NotNegotiated(_))
    ));
    assert!(matches!(
        enc.set_format(nv12_64(), MemoryKind::Texture, None),
        Err(CodecError::NotNegotiated(_))
    ));
}

#[test]
fn missing_preset_is_a_config_error() {
    let config = LoopbackConfig {
        presets: vec![nvpipe_core::codec_traits::HwPreset::Default],
        ..LoopbackConfig::default()
    };
    let settings = EncoderSettings {
        preset: nvpipe_elements::settings::Preset::Hq,
        ..EncoderSettings::default()
    };
    let (enc, _sink, _platform) = h264(config, settings);
    enc.open().unwrap();
    let err = enc.set_format(nv12_64(), MemoryKind::System, None).unwrap_err();
    assert!(matches!(err, CodecError::Config(msg) if msg == "selected preset not supported"));
}

#[test]
fn hevc_reports_profile_from_sequence_header() {
    let (platform, subsystem) = loopback(LoopbackConfig::default());
    let sink = CollectSink::new();
    let enc = H265Encoder::new(&subsystem, 0, H265::new(), EncoderSettings::default(), Box::new(sink.clone()));
    enc.open().unwrap();
    let info = VideoInfo::new(PixelFormat::P010, 64, 64).with_framerate(25, 1);
    enc.set_format(info, MemoryKind::System, None).unwrap();
    let caps = sink.last_caps().unwrap();
    assert_eq!(caps.profile.as_deref(), Some("main-10"));
    assert_eq!(caps.tier.as_deref(), Some("main"));
    enc.handle_frame(raw_frame(&info, 0)).unwrap();
    enc.finish().unwrap();
    assert_eq!(sink.units().len(), 1);
    drop(enc);
    assert_eq!(LoopbackStats::get(&platform.stats().sessions_destroyed), 1);
}
