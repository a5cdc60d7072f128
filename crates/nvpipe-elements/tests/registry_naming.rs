mod common;

use common::loopback;
use nvpipe_core::types::CodecId;
use nvpipe_elements::loopback::LoopbackConfig;
use nvpipe_elements::registry::{ElementKind, RANK_PRIMARY, Registry};

fn two_devices() -> Registry {
    let (_platform, subsystem) = loopback(LoopbackConfig {
        devices: 2,
        ..LoopbackConfig::default()
    });
    Registry::probe(&subsystem).unwrap()
}

#[test]
fn second_device_gets_suffixed_names_and_lower_rank() {
    let registry = two_devices();

    let default = registry.find("nvh264dec").unwrap();
    assert_eq!((default.device, default.rank, default.is_default), (0, RANK_PRIMARY, true));
    let second = registry.find("nvh264device1dec").unwrap();
    assert_eq!((second.device, second.rank, second.is_default), (1, RANK_PRIMARY - 1, false));

    assert_eq!(registry.find("nvh264enc").map(|e| e.device), Some(0));
    assert_eq!(registry.find("nvh265device1enc").map(|e| e.rank), Some(RANK_PRIMARY - 1));
    assert!(registry.find("nvh264device0enc").is_none());

    let candidates = registry.candidates(ElementKind::Decoder, CodecId::H265);
    let names: Vec<_> = candidates.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["nvh265dec", "nvh265device1dec"]);
}

#[test]
fn every_decodable_codec_and_both_encoders_are_registered() {
    let registry = two_devices();
    for codec in CodecId::DECODABLE {
        assert_eq!(registry.candidates(ElementKind::Decoder, codec).len(), 2, "{codec:?}");
    }
    assert_eq!(registry.candidates(ElementKind::Encoder, CodecId::H264).len(), 2);
    assert_eq!(registry.entries().len(), 2 * (CodecId::DECODABLE.len() + 2));
}

#[test]
fn probed_caps_follow_device_capabilities() {
    let registry = two_devices();
    let jpeg = registry.find("nvjpegdec").unwrap();
    assert!(jpeg.sink_caps.starts_with("image/jpeg"));
    assert!(jpeg.src_caps.contains("NV12"));
    assert!(!jpeg.src_caps.contains("Y444"));

    let hevc = registry.find("nvh265dec").unwrap();
    assert!(hevc.src_caps.contains("Y444"));
    assert!(hevc.sink_caps.contains("main-444"));
    assert!(hevc.sink_caps.contains("height=[ 16, 8192 ]"));

    let h264 = registry.find("nvh264dec").unwrap();
    assert!(h264.sink_caps.contains("high-10"));

    let enc = registry.find("nvh264enc").unwrap();
    assert!(enc.src_caps.starts_with("video/x-h264"));
    assert!(enc.src_caps.contains("high"));
    assert!(enc.sink_caps.contains("NV12"));
}

#[test]
fn without_capability_query_only_nv12_decoders_exist() {
    let (_platform, subsystem) = loopback(LoopbackConfig {
        devices: 2,
        decoder_caps_query: false,
        ..LoopbackConfig::default()
    });
    let registry = Registry::probe(&subsystem).unwrap();
    let decoders: Vec<_> = registry
        .entries()
        .iter()
        .filter(|e| e.kind == ElementKind::Decoder)
        .collect();
    assert_eq!(decoders.len(), CodecId::DECODABLE.len());
    for entry in decoders {
        assert_eq!(entry.device, 0);
        assert_eq!(entry.src_caps, "video/x-raw, format=NV12");
    }
    assert!(registry.find("nvh265device1enc").is_some());
}

#[test]
fn no_devices_means_no_elements() {
    let (_platform, subsystem) = loopback(LoopbackConfig {
        devices: 0,
        ..LoopbackConfig::default()
    });
    assert!(Registry::probe(&subsystem).unwrap().entries().is_empty());
}

#[test]
fn entries_serialize_for_inspection() {
    let registry = two_devices();
    let entry = registry.find("nvh265device1dec").unwrap();
    let json = serde_json::to_value(entry).unwrap();
    assert_eq!(json["kind"], "decoder");
    assert_eq!(json["codec"], "h265");
    assert_eq!(json["device"], 1);
    assert_eq!(json["is_default"], false);
}
