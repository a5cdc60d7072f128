mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::{FrameSink, loopback, system_planes};
use nvpipe_core::codec_traits::PictureType;
use nvpipe_core::error::{CodecError, FlowError};
use nvpipe_core::subsystem::CodecSubsystem;
use nvpipe_core::types::{
    BufferFlags, CodecId, CompressedCaps, CompressedPacket, FrameMemory, InterlaceMode,
    MemoryKind, PixelFormat, SECOND,
};
use nvpipe_elements::decoder::{DecodeState, Decoder};
use nvpipe_elements::loopback::{LoopbackConfig, LoopbackPlatform, Unit, UnitHeader};
use nvpipe_elements::settings::DecoderSettings;

fn unit(n: u32, decode_only: bool) -> Unit {
    let (w, h) = (64usize, 48usize);
    Unit {
        header: UnitHeader {
            codec: CodecId::H264,
            picture_type: if n == 0 { PictureType::Idr } else { PictureType::P },
            interlaced: false,
            top_field_first: false,
            decode_only,
            width: w as u32,
            height: h as u32,
            format: PixelFormat::Nv12,
            fps_n: 25,
            fps_d: 1,
            pts: n as u64 * 40_000_000,
            frame_idx: n,
            full_range: false,
            colour_primaries: 1,
            transfer_characteristics: 1,
            matrix_coefficients: 1,
        },
        sei: Vec::new(),
        payload: (0..w * h * 3 / 2).map(|i| (i + n as usize) as u8).collect(),
    }
}

fn packet(data: Vec<u8>, n: u32) -> CompressedPacket {
    CompressedPacket {
        data,
        pts: Some(n as u64 * 40_000_000),
        duration: None,
        discont: n == 0,
    }
}

fn decoder(
    config: LoopbackConfig,
) -> (Decoder, FrameSink, Arc<LoopbackPlatform>, Arc<CodecSubsystem>) {
    let (platform, subsystem) = loopback(config);
    let sink = FrameSink::system();
    let dec = Decoder::new(
        &subsystem,
        CodecId::H264,
        DecoderSettings::default(),
        Box::new(sink.clone()),
    )
    .unwrap();
    dec.open().unwrap();
    dec.set_format(CompressedCaps::new(CodecId::H264, 64, 48).with_framerate(25, 1))
        .unwrap();
    (dec, sink, platform, subsystem)
}

fn frame_numbers(sink: &FrameSink) -> Vec<Option<u32>> {
    sink.frames().iter().map(|f| f.system_frame_number).collect()
}

#[test]
fn outputs_follow_their_input_frames() {
    let (dec, sink, _platform, _subsystem) = decoder(LoopbackConfig::default());
    for n in 0..5 {
        dec.handle_frame(&packet(unit(n, false).encode(), n)).unwrap();
    }
    dec.drain().unwrap();
    assert_eq!(frame_numbers(&sink), (0..5).map(Some).collect::<Vec<_>>());

    let frames = sink.frames();
    let info = dec.output_info().unwrap();
    assert_eq!((info.format, info.width, info.height), (PixelFormat::Nv12, 64, 48));
    assert_eq!(frames[2].pts, Some(80_000_000));
    assert_eq!(frames[2].dts, None);
    assert_eq!(frames[2].duration, Some(SECOND / 25));
    assert_eq!(frames[2].flags, BufferFlags::NONE);

    let expected = unit(2, false).payload;
    let planes = system_planes(&frames[2]);
    assert_eq!(planes[0], expected[..64 * 48]);
    assert_eq!(planes[1], expected[64 * 48..]);
    assert_eq!(dec.state(), Some(DecodeState::Drained));
    assert_eq!(dec.output_memory(), Some(MemoryKind::System));
}

#[test]
fn display_delay_keeps_correlation() {
    let config = LoopbackConfig {
        display_delay: 2,
        ..LoopbackConfig::default()
    };
    let (dec, sink, _platform, _subsystem) = decoder(config);
    for n in 0..4 {
        dec.handle_frame(&packet(unit(n, false).encode(), n)).unwrap();
    }
    assert_eq!(frame_numbers(&sink), vec![Some(0), Some(1)]);
    assert_eq!(dec.pending_frames(), 2);
    dec.finish().unwrap();
    assert_eq!(frame_numbers(&sink), vec![Some(0), Some(1), Some(2), Some(3)]);
    assert_eq!(dec.pending_frames(), 0);
}

#[test]
fn decode_only_picture_is_dropped_at_drain() {
    let (dec, sink, _platform, _subsystem) = decoder(LoopbackConfig::default());
    dec.handle_frame(&packet(unit(0, true).encode(), 0)).unwrap();
    dec.handle_frame(&packet(unit(1, false).encode(), 1)).unwrap();
    assert_eq!(frame_numbers(&sink), vec![Some(1)]);
    assert_eq!(dec.pending_frames(), 1);
    dec.drain().unwrap();
    assert_eq!(dec.pending_frames(), 0);
    assert_eq!(sink.frames().len(), 1);
    let metrics = dec.metrics().snapshot();
    assert_eq!((metrics.frames_decoded, metrics.frames_displayed), (2, 1));
}

#[test]
fn second_picture_in_a_packet_is_synthesized() {
    let (dec, sink, _platform, _subsystem) = decoder(LoopbackConfig::default());
    let mut data = unit(0, false).encode();
    data.extend(unit(1, false).encode());
    dec.handle_frame(&packet(data, 0)).unwrap();

    let frames = sink.frames();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].system_frame_number, Some(0));
    assert_eq!(frames[1].system_frame_number, None);
    // Synthesized outputs take the display timestamp.
    assert_eq!(frames[1].pts, Some(0));
    assert_eq!(frames[1].duration, Some(SECOND / 25));
    assert_eq!(dec.metrics().snapshot().synthesized_outputs, 1);
    assert!(dec.metrics().validate());
}

#[test]
fn flush_discards_pending_displays() {
    let config = LoopbackConfig {
        display_delay: 2,
        ..LoopbackConfig::default()
    };
    let (dec, sink, _platform, _subsystem) = decoder(config);
    for n in 0..3 {
        dec.handle_frame(&packet(unit(n, false).encode(), n)).unwrap();
    }
    assert_eq!(sink.frames().len(), 1);
    dec.flush().unwrap();
    assert_eq!(sink.frames().len(), 1);
    assert_eq!(dec.pending_frames(), 0);

    for n in 3..6 {
        dec.handle_frame(&packet(unit(n, false).encode(), n)).unwrap();
    }
    dec.drain().unwrap();
    assert_eq!(
        frame_numbers(&sink),
        vec![Some(0), Some(3), Some(4), Some(5)]
    );
}

#[test]
fn stream_framerate_fills_missing_upstream_rate() {
    let (_platform, subsystem) = loopback(LoopbackConfig::default());
    let sink = FrameSink::system();
    let dec = Decoder::new(&subsystem, CodecId::H264, DecoderSettings::default(), Box::new(sink.clone()))
        .unwrap();
    dec.open().unwrap();
    dec.set_format(CompressedCaps::new(CodecId::H264, 0, 0)).unwrap();
    dec.handle_frame(&packet(unit(0, false).encode(), 0)).unwrap();
    let info = dec.output_info().unwrap();
    assert_eq!((info.fps_n, info.fps_d), (25, 1));
    let negotiated = sink.decoded.lock().negotiated.clone();
    assert_eq!(negotiated.len(), 1);
    assert_eq!(negotiated[0].1, MemoryKind::System);
}

#[test]
fn interlaced_stream_sets_buffer_flags() {
    let (dec, sink, _platform, _subsystem) = decoder(LoopbackConfig::default());
    let mut interlaced = unit(0, false);
    interlaced.header.interlaced = true;
    interlaced.header.top_field_first = true;
    dec.handle_frame(&packet(interlaced.encode(), 0)).unwrap();
    assert_eq!(dec.output_info().map(|i| i.interlace), Some(InterlaceMode::Mixed));
    let flags = sink.frames()[0].flags;
    assert!(flags.contains(BufferFlags::INTERLACED));
    assert!(flags.contains(BufferFlags::TFF));
    assert!(flags.contains(BufferFlags::RFF));
    assert!(!flags.contains(BufferFlags::ONEFIELD));
}

#[test]
fn corrupt_packet_only_warns() {
    let (dec, sink, _platform, _subsystem) = decoder(LoopbackConfig::default());
    dec.handle_frame(&packet(vec![0xde, 0xad, 0xbe, 0xef], 0)).unwrap();
    assert!(sink.frames().is_empty());
    dec.handle_frame(&packet(unit(1, false).encode(), 1)).unwrap();
    assert_eq!(sink.frames().len(), 1);
}

#[test]
fn copy_failure_is_a_flow_error() {
    let (dec, sink, platform, _subsystem) = decoder(LoopbackConfig::default());
    platform.faults().fail_map_frame.store(true, Ordering::Release);
    let result = dec.handle_frame(&packet(unit(0, false).encode(), 0));
    assert!(matches!(result, Err(CodecError::Flow(FlowError::Error))));
    assert_eq!(dec.metrics().snapshot().copy_failures, 1);
    assert!(sink.frames().is_empty());

    platform.faults().fail_map_frame.store(false, Ordering::Release);
    dec.handle_frame(&packet(unit(1, false).encode(), 1)).unwrap();
    assert_eq!(frame_numbers(&sink), vec![Some(1)]);
}

#[test]
fn lifecycle_errors() {
    let (_platform, subsystem) = loopback(LoopbackConfig::default());
    let dec = Decoder::new(
        &subsystem,
        CodecId::H265,
        DecoderSettings::default(),
        Box::new(FrameSink::system()),
    )
    .unwrap();
    assert!(matches!(
        dec.set_format(CompressedCaps::new(CodecId::H265, 64, 64)),
        Err(CodecError::InvalidState { .. })
    ));
    dec.open().unwrap();
    assert!(matches!(
        dec.handle_frame(&CompressedPacket::default()),
        Err(CodecError::InvalidState { .. })
    ));
    assert!(matches!(
        dec.set_format(CompressedCaps::new(CodecId::H264, 64, 64)),
        Err(CodecError::NotNegotiated(_))
    ));
    dec.close().unwrap();

    let invalid = DecoderSettings {
        num_output_surfaces: 0,
        ..DecoderSettings::default()
    };
    assert!(matches!(
        Decoder::new(&subsystem, CodecId::H264, invalid, Box::new(FrameSink::system())),
        Err(CodecError::Config(_))
    ));
}

#[test]
fn texture_output_when_downstream_supports_it() {
    let (platform, subsystem) = loopback(LoopbackConfig::default());
    let texture = platform.texture_context("texture-out").unwrap();
    let sink = FrameSink::texture(texture);
    let dec = Decoder::new(&subsystem, CodecId::H264, DecoderSettings::default(), Box::new(sink.clone()))
        .unwrap();
    dec.open().unwrap();
    dec.set_format(CompressedCaps::new(CodecId::H264, 64, 48)).unwrap();
    dec.handle_frame(&packet(unit(3, false).encode(), 0)).unwrap();
    assert_eq!(dec.output_memory(), Some(MemoryKind::Texture));

    let frames = sink.frames();
    let FrameMemory::Texture(frame) = &frames[0].memory else {
        panic!("expected texture output");
    };
    let expected = unit(3, false).payload;
    assert_eq!(platform.read_texture(&frame.planes[0]).unwrap(), expected[..64 * 48]);
    assert_eq!(platform.read_texture(&frame.planes[1]).unwrap(), expected[64 * 48..]);
}

#[test]
fn texture_without_pixel_buffers_falls_back_to_system() {
    let config = LoopbackConfig {
        texture_pixel_buffers: false,
        ..LoopbackConfig::default()
    };
    let (platform, subsystem) = loopback(config);
    let texture = platform.texture_context("texture-out").unwrap();
    let sink = FrameSink::texture(texture);
    let dec = Decoder::new(&subsystem, CodecId::H264, DecoderSettings::default(), Box::new(sink.clone()))
        .unwrap();
    dec.open().unwrap();
    dec.set_format(CompressedCaps::new(CodecId::H264, 64, 48)).unwrap();
    dec.handle_frame(&packet(unit(0, false).encode(), 0)).unwrap();
    assert_eq!(dec.output_memory(), Some(MemoryKind::System));
    assert!(matches!(sink.frames()[0].memory, FrameMemory::System(_)));
}
