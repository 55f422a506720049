use bytes::Bytes;
use std::fmt::Formatter;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::task::Waker;

use crate::bundles::BundleHandle;
use crate::LoadMode;
use crate::LoadState;

/// A completion subscriber parked on a loading asset. Every waiter fires
/// exactly once, in registration order, when the asset reaches `Loaded`.
pub(crate) enum Waiter {
    Callback(Box<dyn FnOnce(&ResourceHandle)>),
    Waker(Waker),
}

pub(crate) struct ResourceInner {
    pub url: Arc<str>,
    pub state: LoadState,
    pub mode: LoadMode,
    pub payload: Option<Bytes>,
    pub bundle: Option<BundleHandle>,
    pub dependencies: Vec<ResourceHandle>,
    pub reference_count: u32,
    pub unload_delay_ms: u64,
    pub epoch: u64,
    pub destroy_at_ms: Option<u64>,
    pub waiters: Vec<Waiter>,
}

/// Shared view of one asset cache entry. The [`ResourceManager`] index owns
/// the record; every load of the same id yields a clone observing the same
/// state, whichever completion style requested it.
///
/// For async loads the handle doubles as the completion ticket: poll
/// [`is_done`](ResourceHandle::is_done) from the host loop until it flips.
///
/// [`ResourceManager`]: super::ResourceManager
#[derive(Clone)]
pub struct ResourceHandle {
    inner: Arc<Mutex<ResourceInner>>,
}

impl ResourceHandle {
    pub(crate) fn new(
        url: Arc<str>,
        mode: LoadMode,
        unload_delay_ms: u64,
    ) -> ResourceHandle {
        ResourceHandle {
            inner: Arc::new(Mutex::new(ResourceInner {
                url,
                state: LoadState::Unloaded,
                mode,
                payload: None,
                bundle: None,
                dependencies: Vec::new(),
                reference_count: 0,
                unload_delay_ms,
                epoch: 0,
                destroy_at_ms: None,
                waiters: Vec::new(),
            })),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<ResourceInner> {
        self.inner.lock().unwrap()
    }

    pub fn url(&self) -> Arc<str> {
        self.lock().url.clone()
    }

    pub fn load_state(&self) -> LoadState {
        self.lock().state
    }

    /// True once the payload is resident, with every dependency loaded.
    pub fn is_done(&self) -> bool {
        self.lock().state == LoadState::Loaded
    }

    /// The loaded bytes, or None while not loaded.
    pub fn payload(&self) -> Option<Bytes> {
        self.lock().payload.clone()
    }

    pub fn reference_count(&self) -> u32 {
        self.lock().reference_count
    }

    /// True when both handles observe the same cache record.
    pub fn ptr_eq(
        &self,
        other: &ResourceHandle,
    ) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn dependencies(&self) -> Vec<ResourceHandle> {
        self.lock().dependencies.clone()
    }
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ResourceHandle")
            .field("url", &inner.url)
            .field("state", &inner.state)
            .field("reference_count", &inner.reference_count)
            .finish()
    }
}
