//! CUDA/OpenGL buffer interop.
//!
//! Must be constructed and used on the thread whose OpenGL context is
//! current; [`crate::interop::TextureThread`] guarantees that.
//!
//! Applications that own an OpenGL context start from [`spawn_gl_thread`]
//! and hand the returned thread to the elements as their texture context.
//! The loopback backend stands in for it in tests.

use std::ptr;
use std::sync::Arc;

use nvpipe_core::codec_traits::{
    GraphicsInterop, GraphicsResource, MapAccess, MappedPointer, StreamHandle,
};
use nvpipe_core::error::{CodecError, Result};
use nvpipe_core::types::{ExternalMemory, TextureFrame, VideoInfo};
use tracing::trace;

use crate::interop::{TextureBackend, TextureThread};
use crate::sys::{self, CUgraphicsResource, CUstream, check_cu};

/// Maps OpenGL pixel buffer objects into CUDA address space.
pub struct CudaGlInterop {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl CudaGlInterop {
    pub fn new() -> Result<Self> {
        sys::driver()?;
        Ok(Self {
            _not_send: std::marker::PhantomData,
        })
    }
}

fn raw(resource: GraphicsResource) -> CUgraphicsResource {
    resource.0 as CUgraphicsResource
}

impl GraphicsInterop for CudaGlInterop {
    fn register(&mut self, memory: &ExternalMemory) -> Result<GraphicsResource> {
        let driver = sys::driver()?;
        let mut resource: CUgraphicsResource = ptr::null_mut();
        // SAFETY: `buffer_name` names a buffer object of the GL context
        // current on this thread.
        let rc = unsafe {
            (driver.cuGraphicsGLRegisterBuffer)(
                &mut resource,
                memory.buffer_name,
                sys::CU_GRAPHICS_REGISTER_FLAGS_NONE,
            )
        };
        check_cu(rc, "cuGraphicsGLRegisterBuffer")
            .map_err(|e| CodecError::Interop(format!("buffer {}: {e}", memory.buffer_name)))?;
        trace!(buffer = memory.buffer_name, "GL buffer registered");
        Ok(GraphicsResource(resource as usize))
    }

    fn unregister(&mut self, resource: GraphicsResource) -> Result<()> {
        let driver = sys::driver()?;
        // SAFETY: the resource came from `register`.
        check_cu(
            unsafe { (driver.cuGraphicsUnregisterResource)(raw(resource)) },
            "cuGraphicsUnregisterResource",
        )
    }

    fn map(
        &mut self,
        resource: GraphicsResource,
        access: MapAccess,
        stream: StreamHandle,
    ) -> Result<MappedPointer> {
        let driver = sys::driver()?;
        let flags = match access {
            MapAccess::ReadOnly => sys::CU_GRAPHICS_MAP_RESOURCE_FLAGS_READ_ONLY,
            MapAccess::WriteDiscard => sys::CU_GRAPHICS_MAP_RESOURCE_FLAGS_WRITE_DISCARD,
        };
        let mut handle = raw(resource);
        let mut ptr = 0;
        let mut size = 0usize;
        // SAFETY: `handle` is a registered resource; out pointers are valid.
        unsafe {
            check_cu(
                (driver.cuGraphicsResourceSetMapFlags)(handle, flags),
                "cuGraphicsResourceSetMapFlags",
            )?;
            check_cu(
                (driver.cuGraphicsMapResources)(1, &mut handle, stream.0 as CUstream),
                "cuGraphicsMapResources",
            )?;
            check_cu(
                (driver.cuGraphicsResourceGetMappedPointer)(&mut ptr, &mut size, handle),
                "cuGraphicsResourceGetMappedPointer",
            )?;
        }
        Ok(MappedPointer { ptr, size })
    }

    fn unmap(&mut self, resource: GraphicsResource, stream: StreamHandle) -> Result<()> {
        let driver = sys::driver()?;
        let mut handle = raw(resource);
        // SAFETY: the resource is currently mapped on this stream.
        check_cu(
            unsafe { (driver.cuGraphicsUnmapResources)(1, &mut handle, stream.0 as CUstream) },
            "cuGraphicsUnmapResources",
        )
    }
}

/// Allocates pixel buffers in the current OpenGL context.
pub type GlAllocator = Box<dyn FnMut(&VideoInfo) -> Result<TextureFrame>>;

/// [`TextureBackend`] for an application-owned OpenGL context.
pub struct GlTextureBackend {
    interop: CudaGlInterop,
    allocate: GlAllocator,
}

impl GlTextureBackend {
    pub fn new(allocate: GlAllocator) -> Result<Self> {
        Ok(Self {
            interop: CudaGlInterop::new()?,
            allocate,
        })
    }
}

impl GraphicsInterop for GlTextureBackend {
    fn register(&mut self, memory: &ExternalMemory) -> Result<GraphicsResource> {
        self.interop.register(memory)
    }

    fn unregister(&mut self, resource: GraphicsResource) -> Result<()> {
        self.interop.unregister(resource)
    }

    fn map(
        &mut self,
        resource: GraphicsResource,
        access: MapAccess,
        stream: StreamHandle,
    ) -> Result<MappedPointer> {
        self.interop.map(resource, access, stream)
    }

    fn unmap(&mut self, resource: GraphicsResource, stream: StreamHandle) -> Result<()> {
        self.interop.unmap(resource, stream)
    }
}

impl TextureBackend for GlTextureBackend {
    fn as_interop(&mut self) -> &mut dyn GraphicsInterop {
        self
    }

    fn allocate_frame(&mut self, info: &VideoInfo) -> Result<TextureFrame> {
        (self.allocate)(info)
    }
}

/// Start a texture thread for an application OpenGL context.
///
/// `setup` runs first on the new thread. It makes the application's context
/// current there and returns the pixel buffer allocator.
pub fn spawn_gl_thread<F>(name: impl Into<String>, setup: F) -> Result<Arc<TextureThread>>
where
    F: FnOnce() -> Result<GlAllocator> + Send + 'static,
{
    TextureThread::spawn(name, move || {
        let allocate = setup()?;
        let backend: Box<dyn TextureBackend> = Box::new(GlTextureBackend::new(allocate)?);
        Ok(backend)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_failure_is_returned_from_spawn() {
        let err = spawn_gl_thread("gl-test", || {
            Err(CodecError::Interop("no GL context".into()))
        })
        .err()
        .unwrap();
        assert!(matches!(err, CodecError::Interop(msg) if msg == "no GL context"));
    }

    #[test]
    fn setup_runs_on_the_texture_thread() {
        let caller = std::thread::current().id();
        let err = spawn_gl_thread("gl-test", move || {
            let on = std::thread::current();
            assert_ne!(on.id(), caller);
            Err(CodecError::Interop(on.name().unwrap_or_default().to_string()))
        })
        .err()
        .unwrap();
        assert!(matches!(err, CodecError::Interop(msg) if msg == "gl-test"));
    }
}
