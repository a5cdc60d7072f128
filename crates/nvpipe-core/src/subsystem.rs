//! Process-wide codec subsystem.
//!
//! Owns the backend platform and the lock that serializes session
//! creation, initialisation and teardown across element instances.  The
//! subsystem is installed once when the plugin loads and torn down
//! explicitly; elements receive an `Arc<CodecSubsystem>` at construction
//! instead of reaching for ambient globals.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::codec_traits::CodecPlatform;
use crate::error::{CodecError, Result};

static INSTANCE: Mutex<Option<Arc<CodecSubsystem>>> = parking_lot::const_mutex(None);

pub struct CodecSubsystem {
    platform: Arc<dyn CodecPlatform>,
    init_lock: Mutex<()>,
}

impl std::fmt::Debug for CodecSubsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecSubsystem")
            .field("backend", &self.platform.backend_name())
            .finish()
    }
}

impl CodecSubsystem {
    /// Private subsystem, not registered as the process instance.
    pub fn new(platform: Arc<dyn CodecPlatform>) -> Arc<Self> {
        Arc::new(Self {
            platform,
            init_lock: Mutex::new(()),
        })
    }

    /// Install the process-wide instance.  Fails if one is installed.
    pub fn install(platform: Arc<dyn CodecPlatform>) -> Result<Arc<Self>> {
        let mut slot = INSTANCE.lock();
        if slot.is_some() {
            return Err(CodecError::InvalidState {
                expected: "uninstalled",
                actual: "installed",
            });
        }
        let subsystem = Self::new(platform);
        info!(
            backend = subsystem.platform.backend_name(),
            "codec subsystem installed"
        );
        *slot = Some(subsystem.clone());
        Ok(subsystem)
    }

    /// The installed instance, if any.
    pub fn instance() -> Option<Arc<Self>> {
        INSTANCE.lock().clone()
    }

    /// Drop the process-wide instance.  Elements still holding an `Arc`
    /// keep their subsystem alive until they close.
    pub fn teardown() -> bool {
        let removed = INSTANCE.lock().take();
        if removed.is_some() {
            debug!("codec subsystem torn down");
        }
        removed.is_some()
    }

    #[inline]
    pub fn platform(&self) -> &Arc<dyn CodecPlatform> {
        &self.platform
    }

    /// Serializes session open/initialise/reconfigure/destroy.
    pub fn init_lock(&self) -> MutexGuard<'_, ()> {
        self.init_lock.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec_traits::{DeviceInfo, GpuDevice};

    struct NoDevices;

    impl CodecPlatform for NoDevices {
        fn backend_name(&self) -> &'static str {
            "none"
        }

        fn device_count(&self) -> Result<u32> {
            Ok(0)
        }

        fn device_info(&self, ordinal: u32) -> Result<DeviceInfo> {
            Err(CodecError::ContextCreate(format!("no device {ordinal}")))
        }

        fn open_device(&self, ordinal: u32) -> Result<Arc<dyn GpuDevice>> {
            Err(CodecError::ContextCreate(format!("no device {ordinal}")))
        }
    }

    #[test]
    fn install_is_exclusive_until_teardown() {
        let installed = CodecSubsystem::install(Arc::new(NoDevices)).unwrap();
        assert!(matches!(
            CodecSubsystem::install(Arc::new(NoDevices)),
            Err(CodecError::InvalidState { .. })
        ));
        let instance = CodecSubsystem::instance().unwrap();
        assert!(Arc::ptr_eq(&installed, &instance));

        assert!(CodecSubsystem::teardown());
        assert!(!CodecSubsystem::teardown());
        assert!(CodecSubsystem::instance().is_none());
        // Holders keep their subsystem after teardown.
        assert_eq!(installed.platform().backend_name(), "none");
    }

    #[test]
    fn private_subsystems_have_independent_locks() {
        let a = CodecSubsystem::new(Arc::new(NoDevices));
        let b = CodecSubsystem::new(Arc::new(NoDevices));
        let _held = a.init_lock();
        drop(b.init_lock());
    }
}
