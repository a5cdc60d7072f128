//! Device/session context owned by one element instance.
//!
//! ```text
//! open(ordinal) ──▸ device + stream ──▸ open_encode_session()
//!                       │
//!              make_current() ─── ContextGuard (pops on drop)
//!                       │
//! close() ◂── destroy session ◂── destroy stream ◂── drop device
//! ```
//!
//! Every hardware call happens between `make_current()` and the guard's
//! drop, on whichever thread issues it.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::codec_traits::{EncodeSession, GpuDevice, StreamHandle};
use crate::error::{CodecError, Result};
use crate::subsystem::CodecSubsystem;

/// Pushes the device context on creation, pops it on drop.
#[must_use = "the context is popped as soon as the guard is dropped"]
pub struct ContextGuard {
    device: Arc<dyn GpuDevice>,
}

impl ContextGuard {
    pub fn push(device: &Arc<dyn GpuDevice>) -> Result<Self> {
        device.push_context()?;
        Ok(Self {
            device: device.clone(),
        })
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Err(err) = self.device.pop_context() {
            warn!(%err, ordinal = self.device.ordinal(), "context pop failed");
        }
    }
}

pub struct DeviceContext {
    subsystem: Arc<CodecSubsystem>,
    ordinal: u32,
    device: Option<Arc<dyn GpuDevice>>,
    stream: StreamHandle,
    session: Option<Arc<dyn EncodeSession>>,
}

impl DeviceContext {
    /// Open device `ordinal` and create its command stream.
    ///
    /// Stream creation failure is not fatal: the default stream is used.
    pub fn open(subsystem: &Arc<CodecSubsystem>, ordinal: u32) -> Result<Self> {
        let device = subsystem
            .platform()
            .open_device(ordinal)
            .map_err(|err| CodecError::ContextCreate(format!("device {ordinal}: {err}")))?;

        let stream = {
            let _guard = ContextGuard::push(&device)?;
            match device.create_stream() {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(%err, "could not create stream, will use default stream");
                    StreamHandle::DEFAULT
                }
            }
        };

        info!(ordinal, default_stream = stream.is_default(), "device context opened");
        Ok(Self {
            subsystem: subsystem.clone(),
            ordinal,
            device: Some(device),
            stream,
            session: None,
        })
    }

    #[inline]
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    #[inline]
    pub fn stream(&self) -> StreamHandle {
        self.stream
    }

    #[inline]
    pub fn subsystem(&self) -> &Arc<CodecSubsystem> {
        &self.subsystem
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    pub fn device(&self) -> Result<&Arc<dyn GpuDevice>> {
        self.device.as_ref().ok_or(CodecError::InvalidState {
            expected: "open",
            actual: "closed",
        })
    }

    pub fn make_current(&self) -> Result<ContextGuard> {
        ContextGuard::push(self.device()?)
    }

    /// Open the codec session bound to this context.
    pub fn open_encode_session(&mut self) -> Result<Arc<dyn EncodeSession>> {
        let device = self.device()?.clone();
        let session = {
            let _init = self.subsystem.init_lock();
            let _guard = ContextGuard::push(&device)?;
            device
                .open_encode_session()
                .map_err(|err| CodecError::SessionOpen(err.to_string()))?
        };
        debug!(ordinal = self.ordinal, "encode session opened");
        self.session = Some(session.clone());
        Ok(session)
    }

    pub fn session(&self) -> Option<&Arc<dyn EncodeSession>> {
        self.session.as_ref()
    }

    /// Destroy the session, keeping the device open.
    pub fn close_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let Some(device) = self.device.as_ref() else {
            return;
        };
        let _init = self.subsystem.init_lock();
        let result = ContextGuard::push(device).and_then(|_guard| session.destroy());
        if let Err(err) = result {
            warn!(%err, "encode session destroy failed");
        }
    }

    /// Destroy session, stream and context.  Safe to call repeatedly.
    pub fn close(&mut self) {
        self.close_session();
        let Some(device) = self.device.take() else {
            return;
        };
        if !self.stream.is_default() {
            match ContextGuard::push(&device) {
                Ok(_guard) => {
                    if let Err(err) = device.destroy_stream(self.stream) {
                        warn!(%err, "stream destroy failed");
                    }
                }
                Err(err) => warn!(%err, "no context for stream destroy"),
            }
            self.stream = StreamHandle::DEFAULT;
        }
        info!(ordinal = self.ordinal, "device context closed");
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        self.close();
    }
}
