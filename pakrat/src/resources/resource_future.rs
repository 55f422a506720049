use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use super::resource::ResourceHandle;
use super::resource::Waiter;
use crate::LoadState;

/// A future resolving to the handle once the asset reaches `Loaded`.
///
/// Wakes are issued by the owning [`ResourceManager`]'s `update`, so the
/// host loop must keep pumping the manager for this to make progress. The
/// future never fails; load errors surface from the originating
/// [`load_future`] call instead.
///
/// [`ResourceManager`]: super::ResourceManager
/// [`load_future`]: super::ResourceManager::load_future
pub struct ResourceFuture {
    handle: ResourceHandle,
}

impl ResourceFuture {
    pub(crate) fn new(handle: ResourceHandle) -> ResourceFuture {
        ResourceFuture { handle }
    }

    /// The underlying handle, usable before the future resolves.
    pub fn handle(&self) -> &ResourceHandle {
        &self.handle
    }
}

impl Future for ResourceFuture {
    type Output = ResourceHandle;

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<ResourceHandle> {
        let mut inner = self.handle.lock();
        if inner.state == LoadState::Loaded {
            drop(inner);
            return Poll::Ready(self.handle.clone());
        }

        // repolls from the same task reuse the parked waker
        for waiter in inner.waiters.iter() {
            if let Waiter::Waker(waker) = waiter {
                if waker.will_wake(cx.waker()) {
                    return Poll::Pending;
                }
            }
        }
        inner.waiters.push(Waiter::Waker(cx.waker().clone()));
        Poll::Pending
    }
}
