//! Owned CUDA context with stream, allocation and copy helpers.

use std::ffi::{CStr, c_char};
use std::ptr;

use nvpipe_core::codec_traits::{Copy2d, CopyDst, CopySrc, DevicePtr, PitchedAlloc, StreamHandle};
use nvpipe_core::error::{CodecError, Result};
use tracing::{debug, warn};

use crate::sys::{self, CUDA_MEMCPY2D, CUcontext, CUdevice, CUstream, check_cu};

/// Number of CUDA devices visible to the driver.
pub fn device_count() -> Result<u32> {
    let driver = sys::driver()?;
    let mut count = 0;
    // SAFETY: `count` is a valid out pointer.
    check_cu(unsafe { (driver.cuDeviceGetCount)(&mut count) }, "cuDeviceGetCount")?;
    Ok(count.max(0) as u32)
}

fn device_handle(ordinal: u32) -> Result<CUdevice> {
    let driver = sys::driver()?;
    let mut device: CUdevice = 0;
    // SAFETY: `device` is a valid out pointer.
    check_cu(
        unsafe { (driver.cuDeviceGet)(&mut device, ordinal as i32) },
        "cuDeviceGet",
    )?;
    Ok(device)
}

/// Marketing name and total memory of device `ordinal`.
pub fn device_properties(ordinal: u32) -> Result<(String, u64)> {
    let driver = sys::driver()?;
    let device = device_handle(ordinal)?;
    let mut name = [0 as c_char; 256];
    let mut total = 0usize;
    // SAFETY: buffer length is passed alongside the buffer.
    unsafe {
        check_cu(
            (driver.cuDeviceGetName)(name.as_mut_ptr(), name.len() as i32, device),
            "cuDeviceGetName",
        )?;
        check_cu((driver.cuDeviceTotalMem)(&mut total, device), "cuDeviceTotalMem")?;
    }
    // SAFETY: the driver NUL-terminates within the buffer.
    let name = unsafe { CStr::from_ptr(name.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    Ok((name, total as u64))
}

/// A CUDA context created for one element instance.
pub struct CudaContext {
    ctx: CUcontext,
    ordinal: u32,
}

// SAFETY: CUDA contexts may be pushed on any thread; all access goes through
// the driver, which serializes internally.
unsafe impl Send for CudaContext {}
unsafe impl Sync for CudaContext {}

impl CudaContext {
    /// Create a context on device `ordinal`.  The context is left
    /// uncurrent on the calling thread.
    pub fn create(ordinal: u32) -> Result<Self> {
        let driver = sys::driver()?;
        let device = device_handle(ordinal)?;
        let mut ctx: CUcontext = ptr::null_mut();
        // SAFETY: `ctx` is a valid out pointer and `device` was just resolved.
        let rc = unsafe { (driver.cuCtxCreate)(&mut ctx, sys::CU_CTX_SCHED_AUTO, device) };
        check_cu(rc, "cuCtxCreate")
            .map_err(|e| CodecError::ContextCreate(format!("device {ordinal}: {e}")))?;
        // cuCtxCreate makes the new context current; undo that.
        let mut popped: CUcontext = ptr::null_mut();
        // SAFETY: the context was pushed by cuCtxCreate on this thread.
        check_cu(unsafe { (driver.cuCtxPopCurrent)(&mut popped) }, "cuCtxPopCurrent")?;
        debug!(ordinal, "CUDA context created");
        Ok(Self { ctx, ordinal })
    }

    #[inline]
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Raw handle, for APIs that bind to a context (NVENC session open).
    #[inline]
    pub fn raw(&self) -> CUcontext {
        self.ctx
    }

    pub fn push(&self) -> Result<()> {
        let driver = sys::driver()?;
        // SAFETY: `self.ctx` is live until drop.
        check_cu(unsafe { (driver.cuCtxPushCurrent)(self.ctx) }, "cuCtxPushCurrent")
    }

    pub fn pop(&self) -> Result<()> {
        let driver = sys::driver()?;
        let mut popped: CUcontext = ptr::null_mut();
        // SAFETY: out pointer is valid; popping an empty stack returns an error.
        check_cu(unsafe { (driver.cuCtxPopCurrent)(&mut popped) }, "cuCtxPopCurrent")
    }

    pub fn create_stream(&self) -> Result<StreamHandle> {
        let driver = sys::driver()?;
        let mut stream: CUstream = ptr::null_mut();
        // SAFETY: requires this context to be current (caller holds a guard).
        check_cu(
            unsafe { (driver.cuStreamCreate)(&mut stream, sys::CU_STREAM_DEFAULT) },
            "cuStreamCreate",
        )?;
        Ok(StreamHandle(stream as usize))
    }

    pub fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        if stream.is_default() {
            return Ok(());
        }
        let driver = sys::driver()?;
        // SAFETY: the handle came from `create_stream`.
        check_cu(
            unsafe { (driver.cuStreamDestroy)(stream.0 as CUstream) },
            "cuStreamDestroy",
        )
    }

    pub fn synchronize(&self, stream: StreamHandle) -> Result<()> {
        let driver = sys::driver()?;
        // SAFETY: null is the legacy default stream.
        check_cu(
            unsafe { (driver.cuStreamSynchronize)(stream.0 as CUstream) },
            "cuStreamSynchronize",
        )
    }

    pub fn alloc_pitched(&self, width_bytes: usize, height: usize) -> Result<PitchedAlloc> {
        let driver = sys::driver()?;
        let mut ptr: DevicePtr = 0;
        let mut pitch = 0usize;
        // SAFETY: out pointers are valid; 16 is the largest element size
        // the driver accepts for pitch alignment.
        check_cu(
            unsafe { (driver.cuMemAllocPitch)(&mut ptr, &mut pitch, width_bytes, height, 16) },
            "cuMemAllocPitch",
        )?;
        Ok(PitchedAlloc { ptr, pitch })
    }

    pub fn free(&self, ptr: DevicePtr) -> Result<()> {
        let driver = sys::driver()?;
        // SAFETY: `ptr` came from `alloc_pitched`.
        check_cu(unsafe { (driver.cuMemFree)(ptr) }, "cuMemFree")
    }

    /// Enqueue a strided 2D copy on `stream`.
    pub fn copy_2d(&self, copy: Copy2d<'_>, stream: StreamHandle) -> Result<()> {
        copy.validate()?;
        let mut params = CUDA_MEMCPY2D {
            srcPitch: copy.src_pitch,
            dstPitch: copy.dst_pitch,
            WidthInBytes: copy.width_bytes,
            Height: copy.height,
            ..Default::default()
        };
        match copy.src {
            CopySrc::Host(src) => {
                params.srcMemoryType = sys::CU_MEMORYTYPE_HOST;
                params.srcHost = src.as_ptr().cast();
            }
            CopySrc::Device(ptr) => {
                params.srcMemoryType = sys::CU_MEMORYTYPE_DEVICE;
                params.srcDevice = ptr;
            }
        }
        let host_dst = matches!(copy.dst, CopyDst::Host(_));
        match copy.dst {
            CopyDst::Host(dst) => {
                params.dstMemoryType = sys::CU_MEMORYTYPE_HOST;
                params.dstHost = dst.as_mut_ptr().cast();
            }
            CopyDst::Device(ptr) => {
                params.dstMemoryType = sys::CU_MEMORYTYPE_DEVICE;
                params.dstDevice = ptr;
            }
        }
        let driver = sys::driver()?;
        // SAFETY: host spans were validated above; device pointers belong
        // to the current context.
        check_cu(
            unsafe { (driver.cuMemcpy2DAsync)(&params, stream.0 as CUstream) },
            "cuMemcpy2DAsync",
        )?;
        // Host slices are only borrowed for this call.
        if host_dst || matches!(params.srcMemoryType, sys::CU_MEMORYTYPE_HOST) {
            self.synchronize(stream)?;
        }
        Ok(())
    }
}

impl Drop for CudaContext {
    fn drop(&mut self) {
        let Ok(driver) = sys::driver() else {
            return;
        };
        // SAFETY: the context is owned and no longer used.
        let rc = unsafe { (driver.cuCtxDestroy)(self.ctx) };
        if rc != sys::CUDA_SUCCESS {
            warn!(rc, name = sys::cu_result_name(rc), "cuCtxDestroy failed");
        } else {
            debug!(ordinal = self.ordinal, "CUDA context destroyed");
        }
    }
}
