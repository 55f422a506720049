use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use fnv::FnvHashMap;
use fnv::FnvHashSet;
use pakrat_format::PackManifest;
use pakrat_format::PakratError;
use pakrat_format::PakratResult;
use pakrat_format::MANIFEST_BUNDLE;
use std::sync::Arc;

use super::auto_unload::AutoUnload;
use super::resource::ResourceHandle;
use super::resource::Waiter;
use super::resource_future::ResourceFuture;
use crate::bundles::read_all_at;
use crate::bundles::BundleManager;
use crate::bundles::BundleManagerMetrics;
use crate::unload_queue::UnloadQueue;
use crate::FileResolver;
use crate::LoadMode;
use crate::LoadState;

/// Where asset bytes come from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SourceMode {
    /// Bundle archives resolved through the pack manifest. The production
    /// path.
    Packed,
    /// Every asset id resolves to a loose file read whole at load time. No
    /// manifest, no containers, no dependencies; meant for development
    /// workflows that sidestep packing.
    Direct,
}

/// Tuning for a [`ResourceManager`].
#[derive(Clone, Debug)]
pub struct ResourceManagerConfig {
    pub source: SourceMode,
    /// Bytes to skip at the front of every container file, for packs shipped
    /// behind an application header.
    pub bundle_offset: u64,
    /// Upper bound on bytes read per in-flight container per `update`.
    pub async_read_chunk_size: usize,
    /// Deferred-unload delay for assets loaded without an explicit delay.
    pub default_unload_delay_ms: u64,
    /// Deferred-unload delay for containers.
    pub bundle_unload_delay_ms: u64,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        ResourceManagerConfig {
            source: SourceMode::Packed,
            bundle_offset: 0,
            async_read_chunk_size: 64 * 1024,
            default_unload_delay_ms: 0,
            bundle_unload_delay_ms: 0,
        }
    }
}

#[derive(Default, Debug, Copy, Clone)]
pub struct ResourceManagerMetrics {
    pub loaded_count: usize,
    pub loading_count: usize,
    pub pending_destroy_count: usize,
    /// Scheduled destruction entries, stale ones included.
    pub unload_queue_len: usize,
    pub bundles: BundleManagerMetrics,
}

/// The asset cache. Requests resolve their dependency assets and pull the
/// owning container through an embedded [`BundleManager`]; entries are
/// reference counted and destroyed by a deferred time-ordered sweep.
///
/// Four completion styles share one load state per asset: blocking
/// ([`load`]), polling the returned handle ([`load_async`]), a callback
/// ([`load_with_callback`]), and a future ([`load_future`]). Requesting an id
/// again in any style joins the entry already cached.
///
/// The host must call [`update`] then [`late_update`] once per tick, in that
/// order. Nothing completes or gets destroyed otherwise. Errors returned
/// from any operation indicate a broken pack or a host accounting bug, not a
/// condition to retry.
///
/// [`load`]: ResourceManager::load
/// [`load_async`]: ResourceManager::load_async
/// [`load_with_callback`]: ResourceManager::load_with_callback
/// [`load_future`]: ResourceManager::load_future
/// [`update`]: ResourceManager::update
/// [`late_update`]: ResourceManager::late_update
pub struct ResourceManager {
    bundles: BundleManager,
    manifest: Option<PackManifest>,
    resources: FnvHashMap<Arc<str>, ResourceHandle>,
    in_flight: Vec<ResourceHandle>,
    unload_queue: UnloadQueue<Arc<str>>,
    resolving: FnvHashSet<Arc<str>>,
    default_unload_delay_ms: u64,
    now_ms: u64,
    release_tx: Sender<Arc<str>>,
    release_rx: Receiver<Arc<str>>,
}

impl ResourceManager {
    /// Builds the cache. In `Packed` mode the manifest bundle is loaded
    /// through the container cache like any other bundle, parsed, and
    /// released again; the first sweep evicts it.
    pub fn new(
        config: ResourceManagerConfig,
        resolver: FileResolver,
    ) -> PakratResult<ResourceManager> {
        let mut bundles = BundleManager::new(
            resolver,
            config.bundle_offset,
            config.async_read_chunk_size,
            config.bundle_unload_delay_ms,
        );

        let manifest = match config.source {
            SourceMode::Direct => None,
            SourceMode::Packed => {
                let root = bundles.load(MANIFEST_BUNDLE)?;
                let archive = match root.archive() {
                    Some(archive) => archive,
                    None => {
                        return Err(PakratError::InvariantViolation(
                            "manifest bundle loaded without an archive".to_string(),
                        ));
                    }
                };
                let manifest = PackManifest::parse(&archive)?;
                bundles.unload(&root)?;
                Some(manifest)
            }
        };

        match &manifest {
            Some(manifest) => {
                bundles.set_dependencies(manifest.bundle_dependency_map());
                log::info!(
                    "resource manager ready: {} assets across {} bundles",
                    manifest.asset_count(),
                    manifest.bundle_count()
                );
            }
            None => log::info!("resource manager ready in direct mode"),
        }

        let (release_tx, release_rx) = crossbeam_channel::unbounded();

        Ok(ResourceManager {
            bundles,
            manifest,
            resources: FnvHashMap::default(),
            in_flight: Vec::new(),
            unload_queue: UnloadQueue::new(),
            resolving: FnvHashSet::default(),
            default_unload_delay_ms: config.default_unload_delay_ms,
            now_ms: 0,
            release_tx,
            release_rx,
        })
    }

    /// Blocking load with the default unload delay.
    pub fn load(
        &mut self,
        asset_id: &str,
    ) -> PakratResult<ResourceHandle> {
        self.load_with_unload_delay(asset_id, self.default_unload_delay_ms)
    }

    /// Blocking load: the handle is `Loaded` on return, dependencies
    /// included. An id already mid-flight as an async load is completed in
    /// place, dependencies first, rather than loaded twice.
    #[profiling::function]
    pub fn load_with_unload_delay(
        &mut self,
        asset_id: &str,
        unload_delay_ms: u64,
    ) -> PakratResult<ResourceHandle> {
        self.load_internal(asset_id, LoadMode::Sync, unload_delay_ms)
    }

    /// Async load with the default unload delay.
    pub fn load_async(
        &mut self,
        asset_id: &str,
    ) -> PakratResult<ResourceHandle> {
        self.load_async_with_unload_delay(asset_id, self.default_unload_delay_ms)
    }

    /// Async load. The returned handle is the completion ticket: it reports
    /// `Loaded` from the `update` call that promotes it, once its container
    /// and every dependency asset are done.
    #[profiling::function]
    pub fn load_async_with_unload_delay(
        &mut self,
        asset_id: &str,
        unload_delay_ms: u64,
    ) -> PakratResult<ResourceHandle> {
        self.load_internal(asset_id, LoadMode::Async, unload_delay_ms)
    }

    /// Async load invoking `on_done` exactly once: immediately, inside this
    /// call, if the asset is already loaded, otherwise during the `update`
    /// that promotes it. Callbacks on one asset fire in registration order.
    pub fn load_with_callback(
        &mut self,
        asset_id: &str,
        on_done: impl FnOnce(&ResourceHandle) + 'static,
    ) -> PakratResult<ResourceHandle> {
        let handle = self.load_internal(asset_id, LoadMode::Async, self.default_unload_delay_ms)?;
        if handle.is_done() {
            on_done(&handle);
        } else {
            handle.lock().waiters.push(Waiter::Callback(Box::new(on_done)));
        }
        Ok(handle)
    }

    /// Async load resolving a future once the asset is loaded. Wakes are
    /// issued by `update`, so the executor and this cache's pump must both
    /// keep running.
    pub fn load_future(
        &mut self,
        asset_id: &str,
    ) -> PakratResult<ResourceFuture> {
        let handle = self.load_internal(asset_id, LoadMode::Async, self.default_unload_delay_ms)?;
        Ok(ResourceFuture::new(handle))
    }

    /// Peeks the cache without touching reference counts.
    pub fn get(
        &self,
        asset_id: &str,
    ) -> Option<ResourceHandle> {
        self.resources.get(asset_id).cloned()
    }

    /// The parsed pack manifest; None in direct mode.
    pub fn manifest(&self) -> Option<&PackManifest> {
        self.manifest.as_ref()
    }

    /// The embedded container cache.
    pub fn bundles(&self) -> &BundleManager {
        &self.bundles
    }

    fn load_internal(
        &mut self,
        asset_id: &str,
        mode: LoadMode,
        unload_delay_ms: u64,
    ) -> PakratResult<ResourceHandle> {
        if self.resolving.contains(asset_id) {
            return Err(PakratError::Configuration(format!(
                "cyclic dependency re-entered asset {:?} during resolution",
                asset_id
            )));
        }

        if let Some(handle) = self.resources.get(asset_id).cloned() {
            {
                let mut inner = handle.lock();
                if inner.reference_count == 0 && inner.destroy_at_ms.is_some() {
                    // cancel the scheduled destruction; the queue entry is
                    // left behind and dies by epoch mismatch
                    inner.destroy_at_ms = None;
                    inner.epoch += 1;
                    log::trace!("asset {} rescued from deferred unload", inner.url);
                }
                inner.reference_count += 1;
                // a later request can lengthen the linger, never shorten it
                inner.unload_delay_ms = inner.unload_delay_ms.max(unload_delay_ms);
            }
            if mode == LoadMode::Sync && !handle.is_done() {
                self.force_complete(&handle)?;
            }
            return Ok(handle);
        }

        match self.manifest {
            Some(_) => self.load_packed(asset_id, mode, unload_delay_ms),
            None => self.load_direct(asset_id, unload_delay_ms),
        }
    }

    fn load_packed(
        &mut self,
        asset_id: &str,
        mode: LoadMode,
        unload_delay_ms: u64,
    ) -> PakratResult<ResourceHandle> {
        let (bundle_id, dep_ids) = {
            let manifest = match self.manifest.as_ref() {
                Some(manifest) => manifest,
                None => {
                    return Err(PakratError::InvariantViolation(
                        "packed load without a manifest".to_string(),
                    ));
                }
            };
            let bundle_id = match manifest.bundle_for_asset(asset_id) {
                Some(bundle_id) => bundle_id.clone(),
                None => {
                    return Err(PakratError::NotFound(format!(
                        "asset {:?} is not in the manifest",
                        asset_id
                    )));
                }
            };
            (bundle_id, manifest.asset_dependencies(asset_id).to_vec())
        };

        let url: Arc<str> = Arc::from(asset_id);
        self.resolving.insert(url.clone());
        let result = self.build_record(url.clone(), bundle_id, dep_ids, mode, unload_delay_ms);
        self.resolving.remove(&url);
        match result {
            Ok(handle) => Ok(handle),
            Err(error) => {
                // a half-built record does not stay behind; the next request
                // starts from scratch and reports the same error
                self.destroy_record(&url)?;
                Err(error)
            }
        }
    }

    fn build_record(
        &mut self,
        url: Arc<str>,
        bundle_id: Arc<str>,
        dep_ids: Vec<Arc<str>>,
        mode: LoadMode,
        unload_delay_ms: u64,
    ) -> PakratResult<ResourceHandle> {
        let handle = ResourceHandle::new(url.clone(), mode, unload_delay_ms);
        self.resources.insert(url.clone(), handle.clone());
        if mode == LoadMode::Async {
            // enters the poll set before its dependencies, in creation order
            self.in_flight.push(handle.clone());
        }

        // Dependency assets load through the same entry point, in the same
        // mode and with the requester's delay, so shared dependencies are
        // counted once per dependent and loaded once.
        for dep_id in &dep_ids {
            let dep = self.load_internal(dep_id, mode, unload_delay_ms)?;
            handle.lock().dependencies.push(dep);
        }

        let bundle = match mode {
            LoadMode::Sync => self.bundles.load(&bundle_id)?,
            LoadMode::Async => self.bundles.load_async(&bundle_id)?,
            LoadMode::Direct => unreachable!(),
        };

        {
            let mut inner = handle.lock();
            inner.bundle = Some(bundle);
            inner.reference_count += 1;
            if mode == LoadMode::Async {
                inner.state = LoadState::Loading;
            }
            log::trace!("asset {} created ({:?})", inner.url, inner.mode);
        }

        if mode == LoadMode::Sync {
            // the container finished inside bundles.load, so the payload is
            // extractable right away
            self.extract_payload(&handle)?;
        }

        Ok(handle)
    }

    fn load_direct(
        &mut self,
        asset_id: &str,
        unload_delay_ms: u64,
    ) -> PakratResult<ResourceHandle> {
        let path = self.bundles.resolve_path(asset_id);
        let payload = read_all_at(&path, 0)?;

        let url: Arc<str> = Arc::from(asset_id);
        let handle = ResourceHandle::new(url.clone(), LoadMode::Direct, unload_delay_ms);
        {
            let mut inner = handle.lock();
            inner.payload = Some(payload);
            inner.state = LoadState::Loaded;
            inner.reference_count = 1;
        }
        self.resources.insert(url.clone(), handle.clone());
        log::trace!("asset {} direct-loaded from {:?}", url, path);
        Ok(handle)
    }

    // The async-to-sync upgrade: dependency assets first, then the
    // container, then the payload, all inside this call.
    fn force_complete(
        &mut self,
        handle: &ResourceHandle,
    ) -> PakratResult<()> {
        if handle.is_done() {
            return Ok(());
        }

        for dep in handle.dependencies() {
            self.force_complete(&dep)?;
        }

        let bundle = handle.lock().bundle.clone();
        match bundle {
            Some(bundle) => {
                if !bundle.is_done() {
                    self.bundles.force_complete(&bundle)?;
                }
            }
            None => {
                return Err(PakratError::InvariantViolation(format!(
                    "asset {} is {:?} with no container",
                    handle.url(),
                    handle.load_state()
                )));
            }
        }

        self.extract_payload(handle)
    }

    // Pulls the payload out of the loaded container, promotes the record,
    // and fires its waiters. Waiters run after every lock is released and
    // cannot reach back into the manager.
    fn extract_payload(
        &mut self,
        handle: &ResourceHandle,
    ) -> PakratResult<()> {
        let (url, waiters) = {
            let mut inner = handle.lock();
            let bundle = match inner.bundle.as_ref() {
                Some(bundle) => bundle,
                None => {
                    return Err(PakratError::InvariantViolation(format!(
                        "asset {} promoted without a container",
                        inner.url
                    )));
                }
            };
            let payload = match bundle.extract(&inner.url) {
                Some(payload) => payload,
                None => {
                    return Err(PakratError::NotFound(format!(
                        "asset {:?} is missing from container {:?}",
                        inner.url,
                        bundle.url()
                    )));
                }
            };
            inner.payload = Some(payload);
            inner.state = LoadState::Loaded;
            (inner.url.clone(), std::mem::take(&mut inner.waiters))
        };
        log::trace!("asset {} promoted to loaded", url);

        for waiter in waiters {
            match waiter {
                Waiter::Callback(on_done) => on_done(handle),
                Waiter::Waker(waker) => waker.wake(),
            }
        }
        Ok(())
    }

    /// Releases one reference. At zero the asset is scheduled for deferred
    /// destruction at `now + unload delay` rather than destroyed inline.
    ///
    /// The handle must match the cache's current record for its id; anything
    /// else is an accounting bug and comes back as an invariant violation.
    pub fn unload(
        &mut self,
        handle: &ResourceHandle,
    ) -> PakratResult<()> {
        let url = handle.url();
        match self.resources.get(&url) {
            Some(current) if current.ptr_eq(handle) => {}
            _ => {
                return Err(PakratError::InvariantViolation(format!(
                    "unload of asset {} which is not in the cache",
                    url
                )));
            }
        }
        self.release(handle)
    }

    /// Releases one reference by id. The id must currently be cached.
    pub fn unload_url(
        &mut self,
        asset_id: &str,
    ) -> PakratResult<()> {
        let handle = match self.resources.get(asset_id).cloned() {
            Some(handle) => handle,
            None => {
                return Err(PakratError::InvariantViolation(format!(
                    "unload of asset {:?} which is not in the cache",
                    asset_id
                )));
            }
        };
        self.release(&handle)
    }

    /// Wraps a held reference in an RAII guard. Dropping the guard releases
    /// the reference during the next `update`.
    pub fn auto_unload(
        &self,
        handle: ResourceHandle,
    ) -> AutoUnload {
        AutoUnload::new(handle, self.release_tx.clone())
    }

    fn release(
        &mut self,
        handle: &ResourceHandle,
    ) -> PakratResult<()> {
        let mut inner = handle.lock();
        if inner.reference_count == 0 {
            return Err(PakratError::InvariantViolation(format!(
                "reference count underflow on asset {}",
                inner.url
            )));
        }
        inner.reference_count -= 1;
        log::trace!(
            "asset {} released, {} references remain",
            inner.url,
            inner.reference_count
        );

        if inner.reference_count == 0 {
            let destroy_at_ms = self.now_ms + inner.unload_delay_ms;
            inner.destroy_at_ms = Some(destroy_at_ms);
            let epoch = inner.epoch;
            let url = inner.url.clone();
            drop(inner);
            self.unload_queue.schedule(url, epoch, destroy_at_ms);
        }
        Ok(())
    }

    /// First pump phase. Applies releases from dropped [`AutoUnload`]
    /// guards, advances in-flight containers, then promotes in-flight assets
    /// whose container and dependencies are ready. Call once per tick with a
    /// monotonic timestamp, before [`late_update`].
    ///
    /// [`late_update`]: ResourceManager::late_update
    #[profiling::function]
    pub fn update(
        &mut self,
        now_ms: u64,
    ) -> PakratResult<()> {
        self.now_ms = now_ms;

        while let Ok(url) = self.release_rx.try_recv() {
            self.unload_url(&url)?;
        }

        self.bundles.update(now_ms)?;

        let mut i = 0;
        while i < self.in_flight.len() {
            let handle = self.in_flight[i].clone();
            if self.poll_resource(&handle)? {
                self.in_flight.remove(i);
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    // True when the asset left the poll set: promoted, force-completed
    // earlier, or destroyed.
    fn poll_resource(
        &mut self,
        handle: &ResourceHandle,
    ) -> PakratResult<bool> {
        if handle.load_state() != LoadState::Loading {
            return Ok(true);
        }

        for dep in handle.dependencies() {
            if !dep.is_done() {
                return Ok(false);
            }
        }

        let bundle = handle.lock().bundle.clone();
        match bundle {
            Some(bundle) => {
                if !bundle.is_done() {
                    return Ok(false);
                }
            }
            None => {
                return Err(PakratError::InvariantViolation(format!(
                    "asset {} is in the poll set with no container",
                    handle.url()
                )));
            }
        }

        self.extract_payload(handle)?;
        Ok(true)
    }

    /// Second pump phase: the deferred-destruction sweep, assets first and
    /// the container cache after, so a cascade started by an asset reaches
    /// its containers in the same tick.
    #[profiling::function]
    pub fn late_update(&mut self) -> PakratResult<()> {
        let now_ms = self.now_ms;
        let mut still_loading = Vec::new();

        while let Some(entry) = self.unload_queue.pop_due(now_ms) {
            let handle = match self.resources.get(&entry.key) {
                Some(handle) => handle.clone(),
                None => continue,
            };
            {
                let inner = handle.lock();
                if inner.epoch != entry.epoch || inner.reference_count > 0 {
                    continue;
                }
                // a destroyed-and-recreated record starts its epochs over, so
                // a stranded entry only counts when its deadline is the one
                // the record itself carries
                if inner.destroy_at_ms != Some(entry.destroy_at_ms) {
                    continue;
                }
                if inner.state == LoadState::Loading {
                    // never abort an in-flight load; promotion happens first
                    // and a later sweep collects the record
                    still_loading.push(entry);
                    continue;
                }
            }
            self.destroy_record(&entry.key)?;
        }

        // requeued outside the pop loop or a due entry would spin forever
        for entry in still_loading {
            self.unload_queue.requeue(entry);
        }

        self.bundles.late_update()
    }

    // Physically releases an asset: the payload is dropped, the index entry
    // removed, one reference returned to the container and to each
    // dependency asset.
    fn destroy_record(
        &mut self,
        url: &Arc<str>,
    ) -> PakratResult<()> {
        let handle = match self.resources.remove(url) {
            Some(handle) => handle,
            None => {
                return Err(PakratError::InvariantViolation(format!(
                    "destroying asset {} which is not in the cache",
                    url
                )));
            }
        };

        let (bundle, dependencies) = {
            let mut inner = handle.lock();
            inner.payload = None;
            inner.state = LoadState::Unloaded;
            inner.destroy_at_ms = None;
            inner.epoch += 1;
            inner.waiters.clear();
            (inner.bundle.take(), std::mem::take(&mut inner.dependencies))
        };
        log::trace!("asset {} destroyed", url);

        if let Some(bundle) = bundle {
            self.bundles.unload(&bundle)?;
        }
        for dep in &dependencies {
            self.release(dep)?;
        }
        Ok(())
    }

    pub fn metrics(&self) -> ResourceManagerMetrics {
        let mut metrics = ResourceManagerMetrics {
            unload_queue_len: self.unload_queue.len(),
            bundles: self.bundles.metrics(),
            ..Default::default()
        };
        for handle in self.resources.values() {
            let inner = handle.lock();
            match inner.state {
                LoadState::Loaded => metrics.loaded_count += 1,
                LoadState::Loading => metrics.loading_count += 1,
                LoadState::Unloaded => {}
            }
            if inner.reference_count == 0 && inner.destroy_at_ms.is_some() {
                metrics.pending_destroy_count += 1;
            }
        }
        metrics
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        let metrics = self.metrics();
        log::info!(
            "dropping ResourceManager: {} loaded, {} loading, {} pending destroy",
            metrics.loaded_count,
            metrics.loading_count,
            metrics.pending_destroy_count
        );
        for handle in self.resources.values() {
            let inner = handle.lock();
            if inner.reference_count > 0 {
                log::warn!(
                    "asset {} still has {} references at shutdown",
                    inner.url,
                    inner.reference_count
                );
            }
        }
    }
}
