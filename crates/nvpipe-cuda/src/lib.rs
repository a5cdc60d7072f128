#![doc = include_str!("../README.md")]

pub mod context;
pub mod copy;
pub mod graphics;
pub mod interop;
pub mod sys;

pub use context::CudaContext;
pub use interop::{InteropBridge, MappedResource, RegistrationCache, TextureBackend, TextureThread};
