use crossbeam_channel::Sender;
use std::ops::Deref;
use std::sync::Arc;

use super::resource::ResourceHandle;

/// RAII custody of one asset reference. Dropping the guard releases the
/// reference during the owning manager's next `update`; the usual deferred
/// destruction rules apply from there.
///
/// Built by [`ResourceManager::auto_unload`](super::ResourceManager::auto_unload).
pub struct AutoUnload {
    handle: Option<ResourceHandle>,
    release_tx: Sender<Arc<str>>,
}

impl AutoUnload {
    pub(crate) fn new(
        handle: ResourceHandle,
        release_tx: Sender<Arc<str>>,
    ) -> AutoUnload {
        AutoUnload {
            handle: Some(handle),
            release_tx,
        }
    }

    pub fn handle(&self) -> &ResourceHandle {
        self.handle.as_ref().unwrap()
    }

    /// Detaches the handle; the caller owns the reference again and the
    /// guard releases nothing.
    pub fn into_inner(mut self) -> ResourceHandle {
        self.handle.take().unwrap()
    }
}

impl Deref for AutoUnload {
    type Target = ResourceHandle;

    fn deref(&self) -> &ResourceHandle {
        self.handle()
    }
}

impl Drop for AutoUnload {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // the manager may already be gone during teardown
            let _ = self.release_tx.send(handle.url());
        }
    }
}
