//! A runtime cache for packaged game content.
//!
//! Assets live inside bundle archives ([`format::PakArchive`]) and are
//! addressed by id. A [`ResourceManager`] is the asset-level cache; it owns a
//! [`BundleManager`], the container-level cache, and resolves every asset
//! request through it. Both tiers are reference counted: loading an id twice
//! returns the same entry with its count bumped, and entries whose count
//! reaches zero are destroyed by a time-ordered deferred sweep rather than
//! inline.
//!
//! The host drives everything from its frame loop:
//!
//! * [`ResourceManager::update`] advances in-flight async reads and promotes
//!   finished loads,
//! * [`ResourceManager::late_update`] runs the deferred-destruction sweep.
//!
//! Loads complete in one of four styles over the same underlying state:
//! blocking ([`ResourceManager::load`]), polling a returned handle
//! ([`ResourceManager::load_async`]), a callback
//! ([`ResourceManager::load_with_callback`]), or a future
//! ([`ResourceManager::load_future`]).
//!
//! ```no_run
//! use pakrat::{ResourceManager, ResourceManagerConfig};
//!
//! fn main() -> pakrat::PakratResult<()> {
//!     let resolver = Box::new(|id: &str| std::path::PathBuf::from("content").join(id));
//!     let mut resources = ResourceManager::new(ResourceManagerConfig::default(), resolver)?;
//!
//!     // Blocking: done on return.
//!     let hero = resources.load("Hero")?;
//!     assert!(hero.is_done());
//!
//!     // Async: the handle is the ticket, completed by a later update.
//!     let villain = resources.load_async("Villain")?;
//!     let mut now_ms = 0;
//!     while !villain.is_done() {
//!         resources.update(now_ms)?;
//!         resources.late_update()?;
//!         now_ms += 16;
//!     }
//!
//!     resources.unload(&hero)?;
//!     resources.unload(&villain)?;
//!     resources.update(now_ms)?;
//!     resources.late_update()?;
//!     Ok(())
//! }
//! ```

pub use pakrat_format as format;

pub use pakrat_format::PakratError;
pub use pakrat_format::PakratResult;

mod unload_queue;

pub mod bundles;
pub use bundles::BundleHandle;
pub use bundles::BundleManager;
pub use bundles::BundleManagerMetrics;

pub mod resources;
pub use resources::AutoUnload;
pub use resources::ResourceFuture;
pub use resources::ResourceHandle;
pub use resources::ResourceManager;
pub use resources::ResourceManagerConfig;
pub use resources::ResourceManagerMetrics;
pub use resources::SourceMode;

#[cfg(test)]
pub(crate) mod test_support;

/// How a load request's completion is driven.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadMode {
    /// The read completes inside the load call.
    Sync,
    /// The read advances one chunk per `update` until complete.
    Async,
    /// A loose-file read outside any bundle, done inside the load call.
    Direct,
}

/// Lifecycle of a cache entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadState {
    /// Created but carrying no content, or already destroyed.
    Unloaded,
    /// An async read or a dependency is still outstanding.
    Loading,
    /// Content is resident and the entry is usable.
    Loaded,
}

/// Maps a container or asset id to the file backing it. This is the only
/// seam between the caches and the filesystem, so tests and tools can point
/// ids anywhere.
pub type FileResolver = Box<dyn Fn(&str) -> std::path::PathBuf>;
