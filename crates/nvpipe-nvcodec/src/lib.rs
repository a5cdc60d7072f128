#![doc = include_str!("../README.md")]

pub mod device;
pub mod nvdec;
pub mod nvenc;
pub mod sys;

pub use device::{NvDevice, NvPlatform};
pub use nvdec::{CuvidDecoder, CuvidParser, PicParamsPtr};
pub use nvenc::NvEncodeSession;
