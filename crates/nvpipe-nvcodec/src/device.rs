//! CUDA device and platform entry points for the NVIDIA backend.

use std::sync::Arc;

use nvpipe_core::codec_traits::{
    BitstreamParser, CodecPlatform, Copy2d, DecoderCaps, DecoderCapsQuery, DecoderParams,
    DeviceInfo, DevicePtr, EncodeSession, GpuDevice, HwDecoder, ParserParams, PitchedAlloc,
    StreamHandle,
};
use nvpipe_core::error::Result;
use nvpipe_cuda::CudaContext;
use nvpipe_cuda::context::{device_count, device_properties};
use tracing::debug;

use crate::nvdec::{self, CuvidDecoder, CuvidParser};
use crate::nvenc::NvEncodeSession;

/// [`CodecPlatform`] backed by the CUDA driver, NVENC and NVDEC.
#[derive(Debug, Default, Clone, Copy)]
pub struct NvPlatform;

impl NvPlatform {
    pub fn new() -> Self {
        Self
    }
}

impl CodecPlatform for NvPlatform {
    fn backend_name(&self) -> &'static str {
        "nvcodec"
    }

    fn device_count(&self) -> Result<u32> {
        device_count()
    }

    fn device_info(&self, ordinal: u32) -> Result<DeviceInfo> {
        let (name, total_mem_bytes) = device_properties(ordinal)?;
        Ok(DeviceInfo {
            ordinal,
            name,
            total_mem_bytes,
        })
    }

    fn open_device(&self, ordinal: u32) -> Result<Arc<dyn GpuDevice>> {
        Ok(Arc::new(NvDevice::open(ordinal)?))
    }
}

/// One CUDA context; the unit every element instance owns.
pub struct NvDevice {
    ctx: Arc<CudaContext>,
}

impl NvDevice {
    pub fn open(ordinal: u32) -> Result<Self> {
        let ctx = Arc::new(CudaContext::create(ordinal)?);
        debug!(ordinal, "NVIDIA device opened");
        Ok(Self { ctx })
    }

    pub fn context(&self) -> &Arc<CudaContext> {
        &self.ctx
    }
}

impl GpuDevice for NvDevice {
    fn ordinal(&self) -> u32 {
        self.ctx.ordinal()
    }

    fn push_context(&self) -> Result<()> {
        self.ctx.push()
    }

    fn pop_context(&self) -> Result<()> {
        self.ctx.pop()
    }

    fn create_stream(&self) -> Result<StreamHandle> {
        self.ctx.create_stream()
    }

    fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        self.ctx.destroy_stream(stream)
    }

    fn synchronize(&self, stream: StreamHandle) -> Result<()> {
        self.ctx.synchronize(stream)
    }

    fn alloc_pitched(&self, width_bytes: usize, height: usize) -> Result<PitchedAlloc> {
        self.ctx.alloc_pitched(width_bytes, height)
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        self.ctx.free(ptr)
    }

    fn copy_2d(&self, copy: Copy2d<'_>, stream: StreamHandle) -> Result<()> {
        self.ctx.copy_2d(copy, stream)
    }

    fn open_encode_session(&self) -> Result<Arc<dyn EncodeSession>> {
        Ok(Arc::new(NvEncodeSession::open(self.ctx.clone())?))
    }

    fn create_parser(&self, params: &ParserParams) -> Result<Box<dyn BitstreamParser>> {
        Ok(Box::new(CuvidParser::new(params)?))
    }

    fn create_decoder(&self, params: &DecoderParams) -> Result<Box<dyn HwDecoder>> {
        Ok(Box::new(CuvidDecoder::new(self.ctx.clone(), params)?))
    }

    fn decoder_caps(&self, query: &DecoderCapsQuery) -> Result<Option<DecoderCaps>> {
        nvdec::decoder_caps(&self.ctx, query)
    }
}
