mod common;

use std::sync::Arc;

use common::{
    CollectSink, FRAME_NS, FrameSink, loopback, nv12_64, packet, pattern_frame, raw_frame,
    system_planes,
};
use nvpipe_core::codec_traits::TextureContext;
use nvpipe_core::subsystem::CodecSubsystem;
use nvpipe_core::types::{
    AccessUnit, CodecId, FrameMemory, MemoryKind, PixelFormat, RawFrame, VideoInfo,
};
use nvpipe_elements::decoder::Decoder;
use nvpipe_elements::h264::{H264, H264Encoder};
use nvpipe_elements::h265::{H265, H265Encoder};
use nvpipe_elements::loopback::LoopbackConfig;
use nvpipe_elements::settings::{DecoderSettings, EncoderSettings};

fn decode_all(subsystem: &Arc<CodecSubsystem>, sink: &CollectSink, units: &[AccessUnit]) -> FrameSink {
    let caps = sink.last_caps().unwrap();
    let frames = FrameSink::system();
    let dec = Decoder::new(subsystem, caps.codec, DecoderSettings::default(), Box::new(frames.clone()))
        .unwrap();
    dec.open().unwrap();
    dec.set_format(caps).unwrap();
    for unit in units {
        dec.handle_frame(&packet(unit)).unwrap();
    }
    dec.finish().unwrap();
    assert!(dec.metrics().validate());
    assert_eq!(dec.metrics().snapshot().synthesized_outputs, 0);
    dec.close().unwrap();
    frames
}

fn roundtrip_nv12(frames: u32) {
    common::init_tracing();
    let (_platform, subsystem) = loopback(LoopbackConfig::default());
    let sink = CollectSink::new();
    let enc = H264Encoder::new(&subsystem, 0, H264, EncoderSettings::default(), Box::new(sink.clone()));
    enc.open().unwrap();
    let info = nv12_64();
    enc.set_format(info, MemoryKind::System, None).unwrap();
    for n in 0..frames {
        enc.handle_frame(raw_frame(&info, n)).unwrap();
    }
    enc.finish().unwrap();
    let units = sink.units();
    assert_eq!(units.len(), frames as usize);

    let decoded = decode_all(&subsystem, &sink, &units).frames();
    assert_eq!(decoded.len(), frames as usize);
    for (n, frame) in decoded.iter().enumerate() {
        let n = n as u32;
        assert_eq!(frame.system_frame_number, Some(n));
        assert_eq!(frame.pts, Some(n as u64 * FRAME_NS));
        assert_eq!(frame.duration, Some(FRAME_NS));
        assert_eq!((frame.info.width, frame.info.height), (64, 64));
        assert_eq!(system_planes(frame), pattern_frame(&info, n).planes, "frame {n}");
    }
}

#[test]
fn single_frame_roundtrip() {
    roundtrip_nv12(1);
}

#[test]
fn single_keyframe_decodes_with_rate_derived_duration() {
    let (_platform, subsystem) = loopback(LoopbackConfig::default());
    let sink = CollectSink::new();
    let enc = H264Encoder::new(&subsystem, 0, H264, EncoderSettings::default(), Box::new(sink.clone()));
    enc.open().unwrap();
    let info = nv12_64();
    enc.set_format(info, MemoryKind::System, None).unwrap();
    enc.handle_frame(raw_frame(&info, 0)).unwrap();
    enc.finish().unwrap();
    let units = sink.units();
    assert_eq!(units.len(), 1);
    assert!(units[0].sync_point);

    let frames = FrameSink::system();
    let caps = sink.last_caps().unwrap();
    let dec = Decoder::new(&subsystem, caps.codec, DecoderSettings::default(), Box::new(frames.clone()))
        .unwrap();
    dec.open().unwrap();
    dec.set_format(caps).unwrap();
    let mut pkt = packet(&units[0]);
    pkt.duration = None;
    dec.handle_frame(&pkt).unwrap();
    dec.finish().unwrap();

    let decoded = frames.frames();
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].info.format, PixelFormat::Nv12);
    assert_eq!((decoded[0].info.width, decoded[0].info.height), (64, 64));
    assert_eq!(decoded[0].duration, info.frame_duration());
}

#[test]
fn ten_frame_roundtrip() {
    roundtrip_nv12(10);
}

#[test]
fn hundred_frame_roundtrip() {
    roundtrip_nv12(100);
}

#[test]
fn planar_input_comes_back_semi_planar() {
    let (_platform, subsystem) = loopback(LoopbackConfig::default());
    let sink = CollectSink::new();
    let enc = H264Encoder::new(&subsystem, 0, H264, EncoderSettings::default(), Box::new(sink.clone()));
    enc.open().unwrap();
    let info = VideoInfo::new(PixelFormat::I420, 64, 64).with_framerate(30, 1);
    enc.set_format(info, MemoryKind::System, None).unwrap();
    enc.handle_frame(raw_frame(&info, 5)).unwrap();
    enc.finish().unwrap();

    let decoded = decode_all(&subsystem, &sink, &sink.units()).frames();
    assert_eq!(decoded[0].info.format, PixelFormat::Nv12);
    let input = pattern_frame(&info, 5).planes;
    let output = system_planes(&decoded[0]);
    assert_eq!(output[0], input[0]);
    let interleaved: Vec<u8> = input[1].iter().zip(&input[2]).flat_map(|(u, v)| [*u, *v]).collect();
    assert_eq!(output[1], interleaved);
}

#[test]
fn hevc_ten_bit_roundtrip() {
    let (_platform, subsystem) = loopback(LoopbackConfig::default());
    let sink = CollectSink::new();
    let enc = H265Encoder::new(&subsystem, 0, H265::new(), EncoderSettings::default(), Box::new(sink.clone()));
    enc.open().unwrap();
    let info = VideoInfo::new(PixelFormat::P010, 64, 64).with_framerate(30, 1);
    enc.set_format(info, MemoryKind::System, None).unwrap();
    for n in 0..4 {
        enc.handle_frame(raw_frame(&info, n)).unwrap();
    }
    enc.finish().unwrap();
    assert_eq!(sink.last_caps().map(|c| c.codec), Some(CodecId::H265));

    let decoded = decode_all(&subsystem, &sink, &sink.units()).frames();
    assert_eq!(decoded.len(), 4);
    for (n, frame) in decoded.iter().enumerate() {
        assert_eq!(frame.info.format, PixelFormat::P010);
        assert_eq!(system_planes(frame), pattern_frame(&info, n as u32).planes);
    }
}

#[test]
fn texture_input_is_encoded() {
    let (platform, subsystem) = loopback(LoopbackConfig::default());
    let texture: Arc<dyn TextureContext> = platform.texture_context("texture-in").unwrap();
    let sink = CollectSink::new();
    let enc = H264Encoder::new(&subsystem, 0, H264, EncoderSettings::default(), Box::new(sink.clone()));
    enc.open().unwrap();
    let info = nv12_64();
    enc.set_format(info, MemoryKind::Texture, Some(texture.clone())).unwrap();

    for n in 0..3 {
        let frame = texture.allocate_frame(&info).unwrap();
        let content = pattern_frame(&info, n);
        for (memory, plane) in frame.planes.iter().zip(&content.planes) {
            platform.write_texture(memory, plane).unwrap();
        }
        enc.handle_frame(RawFrame {
            system_frame_number: n,
            pts: Some(n as u64 * FRAME_NS),
            duration: Some(FRAME_NS),
            force_keyframe: false,
            memory: FrameMemory::Texture(frame),
        })
        .unwrap();
    }
    enc.finish().unwrap();

    let decoded = decode_all(&subsystem, &sink, &sink.units()).frames();
    assert_eq!(decoded.len(), 3);
    for (n, frame) in decoded.iter().enumerate() {
        assert_eq!(system_planes(frame), pattern_frame(&info, n as u32).planes);
    }
}
