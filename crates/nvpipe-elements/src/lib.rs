#![doc = include_str!("../README.md")]

pub mod caps;
pub mod decoder;
pub mod encoder;
pub mod h264;
pub mod h265;
pub mod loopback;
pub mod metrics;
pub mod registry;
pub mod settings;

pub use decoder::{DecodeState, Decoder};
pub use encoder::{CodecVariant, Encoder, EncoderState};
pub use h264::H264Encoder;
pub use h265::H265Encoder;
pub use loopback::{LoopbackConfig, LoopbackPlatform};
pub use metrics::{ElementMetrics, MetricsSnapshot};
pub use registry::{ElementEntry, ElementKind, Registry};
pub use settings::{DecoderSettings, EncoderSettings, Preset, RateControl};
