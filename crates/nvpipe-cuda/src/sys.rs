//! CUDA driver API, loaded at runtime.
//!
//! The driver library is opened once per process and cached; every entry
//! point used by nvpipe is resolved up front so a missing symbol surfaces
//! as a single [`CodecError::LibraryLoad`] instead of a crash mid-stream.
//!
//! # Safety
//!
//! Function pointers in [`CudaDriver`] are raw driver entry points.  Callers
//! must pass handles created by the same driver instance and respect the
//! context rules of the CUDA driver API.

#![allow(non_camel_case_types, non_snake_case, dead_code)]

use std::ffi::{c_char, c_int, c_uint, c_void};
use std::sync::OnceLock;

use libloading::Library;
use nvpipe_core::error::{CodecError, Result};
use tracing::{debug, info};

// ═══════════════════════════════════════════════════════════════════════════
//  TYPES
// ═══════════════════════════════════════════════════════════════════════════

pub type CUresult = c_int;
pub const CUDA_SUCCESS: CUresult = 0;

pub type CUdevice = c_int;
pub type CUdeviceptr = u64;
pub type CUcontext = *mut c_void;
pub type CUstream = *mut c_void;
pub type CUarray = *mut c_void;
pub type CUgraphicsResource = *mut c_void;

/// `CUmemorytype`.
pub type CUmemorytype = c_uint;
pub const CU_MEMORYTYPE_HOST: CUmemorytype = 1;
pub const CU_MEMORYTYPE_DEVICE: CUmemorytype = 2;

pub const CU_CTX_SCHED_AUTO: c_uint = 0;
pub const CU_STREAM_DEFAULT: c_uint = 0;

/// `CUgraphicsRegisterFlags`.
pub const CU_GRAPHICS_REGISTER_FLAGS_NONE: c_uint = 0;
/// `CUgraphicsMapResourceFlags`.
pub const CU_GRAPHICS_MAP_RESOURCE_FLAGS_READ_ONLY: c_uint = 1;
pub const CU_GRAPHICS_MAP_RESOURCE_FLAGS_WRITE_DISCARD: c_uint = 2;

/// `CUDA_MEMCPY2D`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct CUDA_MEMCPY2D {
    pub srcXInBytes: usize,
    pub srcY: usize,
    pub srcMemoryType: CUmemorytype,
    pub srcHost: *const c_void,
    pub srcDevice: CUdeviceptr,
    pub srcArray: CUarray,
    pub srcPitch: usize,

    pub dstXInBytes: usize,
    pub dstY: usize,
    pub dstMemoryType: CUmemorytype,
    pub dstHost: *mut c_void,
    pub dstDevice: CUdeviceptr,
    pub dstArray: CUarray,
    pub dstPitch: usize,

    pub WidthInBytes: usize,
    pub Height: usize,
}

impl Default for CUDA_MEMCPY2D {
    fn default() -> Self {
        // SAFETY: all-zero is a valid CUDA_MEMCPY2D (null pointers, type 0).
        unsafe { std::mem::zeroed() }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  DRIVER TABLE
// ═══════════════════════════════════════════════════════════════════════════

/// Resolved CUDA driver entry points.
pub struct CudaDriver {
    _lib: Library,

    pub cuInit: unsafe extern "C" fn(c_uint) -> CUresult,
    pub cuDeviceGetCount: unsafe extern "C" fn(*mut c_int) -> CUresult,
    pub cuDeviceGet: unsafe extern "C" fn(*mut CUdevice, c_int) -> CUresult,
    pub cuDeviceGetName: unsafe extern "C" fn(*mut c_char, c_int, CUdevice) -> CUresult,
    pub cuDeviceTotalMem: unsafe extern "C" fn(*mut usize, CUdevice) -> CUresult,

    pub cuCtxCreate: unsafe extern "C" fn(*mut CUcontext, c_uint, CUdevice) -> CUresult,
    pub cuCtxDestroy: unsafe extern "C" fn(CUcontext) -> CUresult,
    pub cuCtxPushCurrent: unsafe extern "C" fn(CUcontext) -> CUresult,
    pub cuCtxPopCurrent: unsafe extern "C" fn(*mut CUcontext) -> CUresult,

    pub cuStreamCreate: unsafe extern "C" fn(*mut CUstream, c_uint) -> CUresult,
    pub cuStreamDestroy: unsafe extern "C" fn(CUstream) -> CUresult,
    pub cuStreamSynchronize: unsafe extern "C" fn(CUstream) -> CUresult,

    pub cuMemAllocPitch:
        unsafe extern "C" fn(*mut CUdeviceptr, *mut usize, usize, usize, c_uint) -> CUresult,
    pub cuMemFree: unsafe extern "C" fn(CUdeviceptr) -> CUresult,
    pub cuMemcpy2DAsync: unsafe extern "C" fn(*const CUDA_MEMCPY2D, CUstream) -> CUresult,

    pub cuGraphicsGLRegisterBuffer:
        unsafe extern "C" fn(*mut CUgraphicsResource, c_uint, c_uint) -> CUresult,
    pub cuGraphicsUnregisterResource: unsafe extern "C" fn(CUgraphicsResource) -> CUresult,
    pub cuGraphicsResourceSetMapFlags: unsafe extern "C" fn(CUgraphicsResource, c_uint) -> CUresult,
    pub cuGraphicsMapResources:
        unsafe extern "C" fn(c_uint, *mut CUgraphicsResource, CUstream) -> CUresult,
    pub cuGraphicsUnmapResources:
        unsafe extern "C" fn(c_uint, *mut CUgraphicsResource, CUstream) -> CUresult,
    pub cuGraphicsResourceGetMappedPointer:
        unsafe extern "C" fn(*mut CUdeviceptr, *mut usize, CUgraphicsResource) -> CUresult,
}

// SAFETY: the table only holds function pointers into the driver, which is
// itself thread safe; `_lib` keeps them valid.
unsafe impl Send for CudaDriver {}
unsafe impl Sync for CudaDriver {}

static DRIVER: OnceLock<std::result::Result<CudaDriver, String>> = OnceLock::new();

fn library_candidates() -> &'static [&'static str] {
    if cfg!(target_os = "windows") {
        &["nvcuda.dll"]
    } else {
        &["libcuda.so.1", "libcuda.so"]
    }
}

/// Resolve `name` from `lib` as a function pointer of type `T`.
///
/// # Safety
/// `T` must match the C signature of the exported symbol.
pub unsafe fn symbol<T: Copy>(lib: &Library, name: &'static str) -> std::result::Result<T, String> {
    let mut cname = Vec::with_capacity(name.len() + 1);
    cname.extend_from_slice(name.as_bytes());
    cname.push(0);
    // SAFETY: caller guarantees the signature.
    unsafe { lib.get::<T>(&cname) }
        .map(|sym| *sym)
        .map_err(|e| format!("{name}: {e}"))
}

/// Open the first library in `candidates` that loads.
pub fn open_first(candidates: &[&'static str]) -> std::result::Result<Library, String> {
    let mut last_err = String::from("no candidate library");
    for candidate in candidates {
        // SAFETY: loading a vendor driver library runs only its own
        // initializers.
        match unsafe { Library::new(candidate) } {
            Ok(lib) => {
                info!(library = candidate, "driver library loaded");
                return Ok(lib);
            }
            Err(e) => last_err = format!("{candidate}: {e}"),
        }
    }
    Err(last_err)
}

fn load_driver() -> std::result::Result<CudaDriver, String> {
    let lib = open_first(library_candidates())?;

    // SAFETY: every signature below matches cuda.h of driver API 12.x; the
    // `_v2` entry points are the ones the unsuffixed macros resolve to.
    let driver = unsafe {
        CudaDriver {
            cuInit: symbol(&lib, "cuInit")?,
            cuDeviceGetCount: symbol(&lib, "cuDeviceGetCount")?,
            cuDeviceGet: symbol(&lib, "cuDeviceGet")?,
            cuDeviceGetName: symbol(&lib, "cuDeviceGetName")?,
            cuDeviceTotalMem: symbol(&lib, "cuDeviceTotalMem_v2")?,
            cuCtxCreate: symbol(&lib, "cuCtxCreate_v2")?,
            cuCtxDestroy: symbol(&lib, "cuCtxDestroy_v2")?,
            cuCtxPushCurrent: symbol(&lib, "cuCtxPushCurrent_v2")?,
            cuCtxPopCurrent: symbol(&lib, "cuCtxPopCurrent_v2")?,
            cuStreamCreate: symbol(&lib, "cuStreamCreate")?,
            cuStreamDestroy: symbol(&lib, "cuStreamDestroy_v2")?,
            cuStreamSynchronize: symbol(&lib, "cuStreamSynchronize")?,
            cuMemAllocPitch: symbol(&lib, "cuMemAllocPitch_v2")?,
            cuMemFree: symbol(&lib, "cuMemFree_v2")?,
            cuMemcpy2DAsync: symbol(&lib, "cuMemcpy2DAsync_v2")?,
            cuGraphicsGLRegisterBuffer: symbol(&lib, "cuGraphicsGLRegisterBuffer")?,
            cuGraphicsUnregisterResource: symbol(&lib, "cuGraphicsUnregisterResource")?,
            cuGraphicsResourceSetMapFlags: symbol(&lib, "cuGraphicsResourceSetMapFlags_v2")?,
            cuGraphicsMapResources: symbol(&lib, "cuGraphicsMapResources")?,
            cuGraphicsUnmapResources: symbol(&lib, "cuGraphicsUnmapResources")?,
            cuGraphicsResourceGetMappedPointer: symbol(
                &lib,
                "cuGraphicsResourceGetMappedPointer_v2",
            )?,
            _lib: lib,
        }
    };

    // SAFETY: cuInit has no preconditions.
    let rc = unsafe { (driver.cuInit)(0) };
    if rc != CUDA_SUCCESS {
        return Err(format!("cuInit failed: {} ({rc})", cu_result_name(rc)));
    }
    debug!("cuInit ok");
    Ok(driver)
}

/// The process-wide driver table, loading it on first use.
pub fn driver() -> Result<&'static CudaDriver> {
    DRIVER
        .get_or_init(load_driver)
        .as_ref()
        .map_err(|reason| CodecError::LibraryLoad {
            library: "libcuda".into(),
            reason: reason.clone(),
        })
}

// ═══════════════════════════════════════════════════════════════════════════
//  ERROR HELPERS
// ═══════════════════════════════════════════════════════════════════════════

/// Map a `CUresult` to `Result`.
#[inline]
pub fn check_cu(rc: CUresult, call: &'static str) -> Result<()> {
    if rc == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(CodecError::Driver { call, code: rc })
    }
}

/// Symbolic name of the common `CUresult` values.
pub const fn cu_result_name(rc: CUresult) -> &'static str {
    match rc {
        0 => "CUDA_SUCCESS",
        1 => "CUDA_ERROR_INVALID_VALUE",
        2 => "CUDA_ERROR_OUT_OF_MEMORY",
        3 => "CUDA_ERROR_NOT_INITIALIZED",
        4 => "CUDA_ERROR_DEINITIALIZED",
        100 => "CUDA_ERROR_NO_DEVICE",
        101 => "CUDA_ERROR_INVALID_DEVICE",
        201 => "CUDA_ERROR_INVALID_CONTEXT",
        205 => "CUDA_ERROR_MAP_FAILED",
        206 => "CUDA_ERROR_UNMAP_FAILED",
        208 => "CUDA_ERROR_ALREADY_MAPPED",
        211 => "CUDA_ERROR_NOT_MAPPED",
        219 => "CUDA_ERROR_INVALID_GRAPHICS_CONTEXT",
        400 => "CUDA_ERROR_INVALID_HANDLE",
        700 => "CUDA_ERROR_ILLEGAL_ADDRESS",
        999 => "CUDA_ERROR_UNKNOWN",
        _ => "CUDA_ERROR_OTHER",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_cu_maps_codes() {
        assert!(check_cu(CUDA_SUCCESS, "cuInit").is_ok());
        match check_cu(2, "cuMemAllocPitch") {
            Err(CodecError::Driver { call, code }) => {
                assert_eq!(call, "cuMemAllocPitch");
                assert_eq!(code, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn memcpy2d_default_is_zeroed() {
        let m = CUDA_MEMCPY2D::default();
        assert_eq!(m.WidthInBytes, 0);
        assert!(m.srcHost.is_null());
        assert!(m.dstArray.is_null());
    }

    #[test]
    fn result_names() {
        assert_eq!(cu_result_name(0), "CUDA_SUCCESS");
        assert_eq!(cu_result_name(205), "CUDA_ERROR_MAP_FAILED");
        assert_eq!(cu_result_name(-7), "CUDA_ERROR_OTHER");
    }
}
