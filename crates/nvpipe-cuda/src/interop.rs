//! Cross-memory bridge between external texture memory and device memory.
//!
//! ```text
//!  element thread                         texture thread
//!  ──────────────                         ──────────────
//!  InteropBridge::upload_planes ──post──▸ push ctx
//!        (blocks on reply)                  for each plane:
//!                                             register (memoized)
//!                                             map read-only ─┐
//!                                             2D copy        │ MappedResource
//!                                             unmap ◂────────┘
//!                                           sync stream, pop ctx
//!                              ◂──reply──
//! ```
//!
//! The external texture API is bound to one thread, so every registration,
//! map and unmap travels to that thread as a task.  Registrations are
//! memoized per [`ExternalMemory`] identity and released once the memory
//! object is gone.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use nvpipe_core::codec_traits::{
    Copy2d, CopyDst, CopySrc, GpuDevice, GraphicsInterop, GraphicsResource, MapAccess,
    MappedPointer, MappedSurface, PitchedAlloc, StreamHandle, TextureContext, TextureTask,
};
use nvpipe_core::context::ContextGuard;
use nvpipe_core::error::{CodecError, Result};
use nvpipe_core::types::{ExternalMemory, PixelFormat, TextureFrame, VideoInfo};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::copy::{PlaneCopy, decode_surface_plan, encode_scratch_plan};

// ─── Texture thread ──────────────────────────────────────────────────────

/// Graphics interop plus pixel-buffer allocation, owned by the texture
/// thread.
pub trait TextureBackend: GraphicsInterop {
    fn as_interop(&mut self) -> &mut dyn GraphicsInterop;

    fn allocate_frame(&mut self, info: &VideoInfo) -> Result<TextureFrame>;

    fn supports_pixel_buffers(&self) -> bool {
        true
    }
}

enum Message {
    Task(TextureTask),
    Allocate(VideoInfo, Sender<Result<TextureFrame>>),
    Quit,
}

/// Dedicated thread owning a texture API context.
pub struct TextureThread {
    name: String,
    tx: Sender<Message>,
    pixel_buffers: bool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TextureThread {
    /// Spawn the thread and build the backend on it with `factory`.
    pub fn spawn<F>(name: impl Into<String>, factory: F) -> Result<Arc<Self>>
    where
        F: FnOnce() -> Result<Box<dyn TextureBackend>> + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = channel::unbounded::<Message>();
        let (ready_tx, ready_rx) = channel::bounded::<Result<bool>>(1);

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut backend = match factory() {
                    Ok(backend) => {
                        let _ = ready_tx.send(Ok(backend.supports_pixel_buffers()));
                        backend
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                run_texture_loop(backend.as_mut(), &rx);
            })
            .map_err(|e| CodecError::Interop(format!("spawn {name}: {e}")))?;

        let pixel_buffers = match ready_rx.recv() {
            Ok(Ok(pixel_buffers)) => pixel_buffers,
            Ok(Err(err)) => {
                let _ = handle.join();
                return Err(err);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(CodecError::Interop(format!(
                    "{name} exited during startup"
                )));
            }
        };
        debug!(thread = %name, pixel_buffers, "texture thread started");

        Ok(Arc::new(Self {
            name,
            tx,
            pixel_buffers,
            handle: Mutex::new(Some(handle)),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the thread after already queued tasks ran.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Message::Quit);
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!(thread = %self.name, "texture thread panicked");
        }
    }
}

fn run_texture_loop(backend: &mut dyn TextureBackend, rx: &Receiver<Message>) {
    while let Ok(message) = rx.recv() {
        match message {
            Message::Task(task) => task(backend.as_interop()),
            Message::Allocate(info, reply) => {
                let _ = reply.send(backend.allocate_frame(&info));
            }
            Message::Quit => break,
        }
    }
    trace!("texture thread loop exited");
}

impl TextureContext for TextureThread {
    fn post(&self, task: TextureTask) -> Result<()> {
        self.tx
            .send(Message::Task(task))
            .map_err(|_| CodecError::Interop(format!("{} is gone", self.name)))
    }

    fn supports_pixel_buffers(&self) -> bool {
        self.pixel_buffers
    }

    fn allocate_frame(&self, info: &VideoInfo) -> Result<TextureFrame> {
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.tx
            .send(Message::Allocate(info.clone(), reply_tx))
            .map_err(|_| CodecError::Interop(format!("{} is gone", self.name)))?;
        reply_rx
            .recv()
            .map_err(|_| CodecError::Interop(format!("{} dropped allocation", self.name)))?
    }
}

impl Drop for TextureThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run `f` on the texture thread and wait for its result.
///
/// Must not be called from the texture thread itself.
pub fn run_sync<R, F>(texture: &dyn TextureContext, f: F) -> Result<R>
where
    R: Send + 'static,
    F: FnOnce(&mut dyn GraphicsInterop) -> Result<R> + Send + 'static,
{
    let (reply_tx, reply_rx) = channel::bounded(1);
    texture.post(Box::new(move |interop: &mut dyn GraphicsInterop| {
        let _ = reply_tx.send(f(interop));
    }))?;
    reply_rx
        .recv()
        .map_err(|_| CodecError::Interop("texture task dropped without reply".into()))?
}

// ─── Registration cache ──────────────────────────────────────────────────

struct CacheEntry {
    resource: GraphicsResource,
    alive: Weak<()>,
}

/// Registered resources keyed by external memory identity.
#[derive(Default)]
pub struct RegistrationCache {
    entries: HashMap<u64, CacheEntry>,
}

impl RegistrationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered resource for `memory`, registering it on first use.
    pub fn get_or_register(
        &mut self,
        interop: &mut dyn GraphicsInterop,
        memory: &ExternalMemory,
    ) -> Result<GraphicsResource> {
        self.sweep(interop);
        if let Some(entry) = self.entries.get(&memory.id()) {
            return Ok(entry.resource);
        }
        let resource = interop.register(memory)?;
        trace!(memory = memory.id(), buffer = memory.buffer_name, "registered");
        self.entries.insert(
            memory.id(),
            CacheEntry {
                resource,
                alive: memory.lifetime(),
            },
        );
        Ok(resource)
    }

    /// Unregister entries whose memory has been dropped.
    pub fn sweep(&mut self, interop: &mut dyn GraphicsInterop) -> usize {
        let dead: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.alive.strong_count() == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            if let Some(entry) = self.entries.remove(id) {
                if let Err(err) = interop.unregister(entry.resource) {
                    warn!(%err, memory = id, "unregister failed");
                }
            }
        }
        dead.len()
    }

    /// Unregister everything.
    pub fn clear(&mut self, interop: &mut dyn GraphicsInterop) {
        for (id, entry) in self.entries.drain() {
            if let Err(err) = interop.unregister(entry.resource) {
                warn!(%err, memory = id, "unregister failed");
            }
        }
    }
}

// ─── Mapping guard ───────────────────────────────────────────────────────

/// A mapped resource; unmapped on drop.
pub struct MappedResource<'a> {
    interop: &'a mut dyn GraphicsInterop,
    resource: GraphicsResource,
    stream: StreamHandle,
    pointer: MappedPointer,
}

impl<'a> MappedResource<'a> {
    pub fn map(
        interop: &'a mut dyn GraphicsInterop,
        resource: GraphicsResource,
        access: MapAccess,
        stream: StreamHandle,
    ) -> Result<Self> {
        let pointer = interop.map(resource, access, stream)?;
        Ok(Self {
            interop,
            resource,
            stream,
            pointer,
        })
    }

    #[inline]
    pub fn pointer(&self) -> MappedPointer {
        self.pointer
    }
}

impl Drop for MappedResource<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.interop.unmap(self.resource, self.stream) {
            warn!(%err, "unmap failed");
        }
    }
}

// ─── Bridge ──────────────────────────────────────────────────────────────

/// Copies between external texture memory and device memory.
pub struct InteropBridge {
    texture: Arc<dyn TextureContext>,
    device: Arc<dyn GpuDevice>,
    stream: StreamHandle,
    cache: Arc<Mutex<RegistrationCache>>,
}

impl InteropBridge {
    pub fn new(
        texture: Arc<dyn TextureContext>,
        device: Arc<dyn GpuDevice>,
        stream: StreamHandle,
    ) -> Self {
        Self {
            texture,
            device,
            stream,
            cache: Arc::new(Mutex::new(RegistrationCache::new())),
        }
    }

    pub fn texture(&self) -> &Arc<dyn TextureContext> {
        &self.texture
    }

    /// Register `memory` with the device, memoized per memory object.
    pub fn register_external_memory(&self, memory: &ExternalMemory) -> Result<GraphicsResource> {
        let cache = self.cache.clone();
        let memory = memory.clone();
        run_sync(self.texture.as_ref(), move |interop| {
            cache.lock().get_or_register(interop, &memory)
        })
    }

    /// Number of live registrations.
    pub fn registered_count(&self) -> usize {
        self.cache.lock().len()
    }

    /// Copy every plane of `frame` into the contiguous `scratch` buffer.
    pub fn upload_planes(
        &self,
        frame: &TextureFrame,
        format: PixelFormat,
        width: u32,
        height: u32,
        scratch: PitchedAlloc,
    ) -> Result<()> {
        let plan = encode_scratch_plan(
            format,
            width as usize,
            height as usize,
            &frame.strides,
            scratch.pitch,
        );
        self.run_plan(frame, plan, MapAccess::ReadOnly, move |copy, mapped| Copy2d {
            src: CopySrc::Device(mapped.ptr + copy.src_offset as u64),
            src_pitch: copy.src_pitch,
            dst: CopyDst::Device(scratch.ptr + copy.dst_offset as u64),
            dst_pitch: copy.dst_pitch,
            width_bytes: copy.width_bytes,
            height: copy.height,
        })
    }

    /// Copy a mapped decoder surface into the planes of `frame`.
    pub fn download_planes(
        &self,
        surface: MappedSurface,
        format: PixelFormat,
        width: u32,
        height: u32,
        frame: &TextureFrame,
    ) -> Result<()> {
        let plan = decode_surface_plan(
            format,
            width as usize,
            height as usize,
            surface.pitch,
            &frame.strides,
        );
        self.run_plan(frame, plan, MapAccess::WriteDiscard, move |copy, mapped| Copy2d {
            src: CopySrc::Device(surface.ptr + copy.src_offset as u64),
            src_pitch: copy.src_pitch,
            dst: CopyDst::Device(mapped.ptr + copy.dst_offset as u64),
            dst_pitch: copy.dst_pitch,
            width_bytes: copy.width_bytes,
            height: copy.height,
        })
    }

    fn run_plan<F>(
        &self,
        frame: &TextureFrame,
        plan: Vec<PlaneCopy>,
        access: MapAccess,
        make_copy: F,
    ) -> Result<()>
    where
        F: Fn(&PlaneCopy, MappedPointer) -> Copy2d<'static> + Send + 'static,
    {
        if frame.planes.len() < plan.len() {
            return Err(CodecError::Interop(format!(
                "texture frame has {} planes, format needs {}",
                frame.planes.len(),
                plan.len()
            )));
        }
        let planes = frame.planes.clone();
        let device = self.device.clone();
        let cache = self.cache.clone();
        let stream = self.stream;

        run_sync(self.texture.as_ref(), move |interop| {
            let _guard = ContextGuard::push(&device)?;
            let mut cache = cache.lock();
            for copy in &plan {
                let resource = cache.get_or_register(interop, &planes[copy.plane])?;
                let mapped = MappedResource::map(interop, resource, access, stream)?;
                let pointer = mapped.pointer();
                let copy_2d = make_copy(copy, pointer);
                let mapped_pitch = match access {
                    MapAccess::ReadOnly => copy_2d.src_pitch,
                    MapAccess::WriteDiscard => copy_2d.dst_pitch,
                };
                let need = copy_2d.span(mapped_pitch);
                if pointer.size < need {
                    return Err(CodecError::BufferTooSmall {
                        need,
                        have: pointer.size,
                    });
                }
                device.copy_2d(copy_2d, stream)?;
            }
            device.synchronize(stream)
        })
    }
}

impl Drop for InteropBridge {
    fn drop(&mut self) {
        let cache = self.cache.clone();
        let posted = self.texture.post(Box::new(move |interop: &mut dyn GraphicsInterop| {
            cache.lock().clear(interop);
        }));
        if posted.is_err() {
            debug!("texture thread gone, registrations dropped with it");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Default)]
    struct CountingInterop {
        next: usize,
        registered: HashSet<usize>,
        mapped: HashSet<usize>,
        unmaps: usize,
    }

    impl GraphicsInterop for CountingInterop {
        fn register(&mut self, _memory: &ExternalMemory) -> Result<GraphicsResource> {
            self.next += 1;
            self.registered.insert(self.next);
            Ok(GraphicsResource(self.next))
        }

        fn unregister(&mut self, resource: GraphicsResource) -> Result<()> {
            self.registered.remove(&resource.0);
            Ok(())
        }

        fn map(
            &mut self,
            resource: GraphicsResource,
            _access: MapAccess,
            _stream: StreamHandle,
        ) -> Result<MappedPointer> {
            if !self.mapped.insert(resource.0) {
                return Err(CodecError::Interop("already mapped".into()));
            }
            Ok(MappedPointer {
                ptr: 0x1000 * resource.0 as u64,
                size: 4096,
            })
        }

        fn unmap(&mut self, resource: GraphicsResource, _stream: StreamHandle) -> Result<()> {
            self.unmaps += 1;
            self.mapped.remove(&resource.0);
            Ok(())
        }
    }

    impl TextureBackend for CountingInterop {
        fn as_interop(&mut self) -> &mut dyn GraphicsInterop {
            self
        }

        fn allocate_frame(&mut self, info: &VideoInfo) -> Result<TextureFrame> {
            let planes = (0..info.format.n_planes())
                .map(|p| ExternalMemory::new(p as u32 + 1, info.plane_size(p)))
                .collect();
            Ok(TextureFrame {
                planes,
                strides: info.strides(),
            })
        }
    }

    #[test]
    fn registration_is_memoized_until_memory_dies() {
        let mut interop = CountingInterop::default();
        let mut cache = RegistrationCache::new();
        let memory = ExternalMemory::new(7, 64);

        let a = cache.get_or_register(&mut interop, &memory).unwrap();
        let b = cache.get_or_register(&mut interop, &memory.clone()).unwrap();
        assert_eq!(a, b);
        assert_eq!(interop.registered.len(), 1);

        drop(memory);
        assert_eq!(cache.sweep(&mut interop), 1);
        assert!(cache.is_empty());
        assert!(interop.registered.is_empty());
    }

    #[test]
    fn mapped_resource_unmaps_on_drop() {
        let mut interop = CountingInterop::default();
        let memory = ExternalMemory::new(1, 64);
        let resource = interop.register(&memory).unwrap();
        {
            let mapped = MappedResource::map(
                &mut interop,
                resource,
                MapAccess::ReadOnly,
                StreamHandle::DEFAULT,
            )
            .unwrap();
            assert_eq!(mapped.pointer().size, 4096);
        }
        assert_eq!(interop.unmaps, 1);
        assert!(interop.mapped.is_empty());
    }

    #[test]
    fn texture_thread_runs_tasks_on_its_own_thread() {
        let texture = TextureThread::spawn("texture-test", || {
            Ok(Box::new(CountingInterop::default()) as Box<dyn TextureBackend>)
        })
        .unwrap();
        let caller = thread::current().id();
        let ran_on = run_sync(texture.as_ref(), |_interop| Ok(thread::current().id())).unwrap();
        assert_ne!(caller, ran_on);

        let frame = texture
            .allocate_frame(&VideoInfo::new(PixelFormat::Nv12, 16, 16))
            .unwrap();
        assert_eq!(frame.planes.len(), 2);
        texture.shutdown();
        assert!(
            texture
                .post(Box::new(|_: &mut dyn GraphicsInterop| {}))
                .is_err()
        );
    }

    #[test]
    fn factory_failure_is_reported() {
        let result = TextureThread::spawn("texture-fail", || {
            Err(CodecError::Interop("no display".into()))
        });
        assert!(matches!(result, Err(CodecError::Interop(_))));
    }
}
