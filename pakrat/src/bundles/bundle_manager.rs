use fnv::FnvHashMap;
use fnv::FnvHashSet;
use pakrat_format::PakArchive;
use pakrat_format::PakratError;
use pakrat_format::PakratResult;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use super::bundle::read_all_at;
use super::bundle::BundleHandle;
use super::bundle::PendingRead;
use crate::unload_queue::UnloadQueue;
use crate::FileResolver;
use crate::LoadMode;
use crate::LoadState;

#[derive(Default, Debug, Copy, Clone)]
pub struct BundleManagerMetrics {
    pub loaded_count: usize,
    pub loading_count: usize,
    pub pending_destroy_count: usize,
    /// Scheduled destruction entries, stale ones included.
    pub unload_queue_len: usize,
}

/// The container cache. Loads bundle archives by id, reference counted, with
/// recursive container-to-container dependencies and deferred destruction.
///
/// A [`ResourceManager`] owns one of these and pumps it; standalone use
/// follows the same contract: [`update`] once per tick, then [`late_update`].
///
/// [`ResourceManager`]: crate::ResourceManager
/// [`update`]: BundleManager::update
/// [`late_update`]: BundleManager::late_update
pub struct BundleManager {
    resolver: FileResolver,
    offset: u64,
    chunk_size: usize,
    unload_delay_ms: u64,
    dependencies: FnvHashMap<Arc<str>, Vec<Arc<str>>>,
    bundles: FnvHashMap<Arc<str>, BundleHandle>,
    in_flight: Vec<BundleHandle>,
    unload_queue: UnloadQueue<Arc<str>>,
    resolving: FnvHashSet<Arc<str>>,
    now_ms: u64,
}

impl BundleManager {
    pub fn new(
        resolver: FileResolver,
        offset: u64,
        chunk_size: usize,
        unload_delay_ms: u64,
    ) -> BundleManager {
        BundleManager {
            resolver,
            offset,
            chunk_size: chunk_size.max(1),
            unload_delay_ms,
            dependencies: FnvHashMap::default(),
            bundles: FnvHashMap::default(),
            in_flight: Vec::new(),
            unload_queue: UnloadQueue::new(),
            resolving: FnvHashSet::default(),
            now_ms: 0,
        }
    }

    /// Installs the container-to-container dependency edges, normally handed
    /// over once the pack manifest is parsed. An absent id means no
    /// dependencies. The manifest parser rejects cyclic maps up front; a
    /// cycle handed over directly comes back as a configuration error from
    /// the load that walks into it.
    pub fn set_dependencies(
        &mut self,
        dependencies: FnvHashMap<Arc<str>, Vec<Arc<str>>>,
    ) {
        self.dependencies = dependencies;
    }

    /// Resolves an id to the file backing it.
    pub fn resolve_path(
        &self,
        id: &str,
    ) -> PathBuf {
        (self.resolver)(id)
    }

    /// Blocking load. A cache hit only adjusts the reference count; a hit
    /// that is still mid-async has its read completed in place before
    /// returning.
    #[profiling::function]
    pub fn load(
        &mut self,
        bundle_id: &str,
    ) -> PakratResult<BundleHandle> {
        self.load_internal(bundle_id, LoadMode::Sync)
    }

    /// Async load. The returned handle reaches `Loaded` during a later
    /// [`update`](BundleManager::update) once the chunked read and every
    /// dependency container finish.
    #[profiling::function]
    pub fn load_async(
        &mut self,
        bundle_id: &str,
    ) -> PakratResult<BundleHandle> {
        self.load_internal(bundle_id, LoadMode::Async)
    }

    /// Peeks the cache without touching reference counts.
    pub fn get(
        &self,
        bundle_id: &str,
    ) -> Option<BundleHandle> {
        self.bundles.get(bundle_id).cloned()
    }

    fn load_internal(
        &mut self,
        bundle_id: &str,
        mode: LoadMode,
    ) -> PakratResult<BundleHandle> {
        if self.resolving.contains(bundle_id) {
            return Err(PakratError::Configuration(format!(
                "cyclic dependency re-entered bundle {:?} during resolution",
                bundle_id
            )));
        }

        if let Some(handle) = self.bundles.get(bundle_id).cloned() {
            {
                let mut inner = handle.lock();
                if inner.reference_count == 0 && inner.destroy_at_ms.is_some() {
                    // cancel the scheduled destruction; the queue entry is
                    // left behind and dies by epoch mismatch
                    inner.destroy_at_ms = None;
                    inner.epoch += 1;
                    log::trace!("bundle {} rescued from deferred unload", inner.url);
                }
                inner.reference_count += 1;
            }
            if mode == LoadMode::Sync && !handle.is_done() {
                self.force_complete(&handle)?;
            }
            return Ok(handle);
        }

        let url: Arc<str> = Arc::from(bundle_id);
        let path = (self.resolver)(&url);
        let dep_ids = self.dependencies.get(&url).cloned().unwrap_or_default();
        let handle = BundleHandle::new(url.clone(), mode);
        self.bundles.insert(url.clone(), handle.clone());
        if mode == LoadMode::Async {
            self.in_flight.push(handle.clone());
        }

        self.resolving.insert(url.clone());
        let built = self.build_record(&handle, &path, &dep_ids, mode);
        self.resolving.remove(&url);
        if let Err(error) = built {
            // a half-built record does not stay behind; the next request
            // starts from scratch and reports the same error
            self.destroy_record(&url)?;
            return Err(error);
        }

        {
            let mut inner = handle.lock();
            inner.reference_count += 1;
            log::trace!("bundle {} created ({:?})", inner.url, inner.mode);
        }

        Ok(handle)
    }

    // Everything fallible about a fresh record: dependency containers first,
    // then its own read. The caller throws the record out if this fails.
    fn build_record(
        &mut self,
        handle: &BundleHandle,
        path: &Path,
        dep_ids: &[Arc<str>],
        mode: LoadMode,
    ) -> PakratResult<()> {
        // Dependency containers load through the same entry point, so a
        // container shared by several requesters is counted once per
        // requester and loaded once.
        for dep_id in dep_ids {
            let dep = self.load_internal(dep_id, mode)?;
            handle.lock().dependencies.push(dep);
        }

        let mut inner = handle.lock();
        match mode {
            LoadMode::Sync => {
                let bytes = read_all_at(path, self.offset)?;
                inner.archive = Some(PakArchive::parse(bytes)?);
                inner.state = LoadState::Loaded;
            }
            LoadMode::Async => {
                inner.pending = Some(PendingRead::begin(path, self.offset, self.chunk_size)?);
                inner.state = LoadState::Loading;
            }
            LoadMode::Direct => unreachable!(),
        }
        Ok(())
    }

    /// Releases one reference. At zero the bundle is scheduled for deferred
    /// destruction rather than destroyed inline.
    ///
    /// The handle must match the cache's current record for its id; anything
    /// else is an accounting bug and comes back as an invariant violation.
    pub fn unload(
        &mut self,
        handle: &BundleHandle,
    ) -> PakratResult<()> {
        let url = handle.url();
        match self.bundles.get(&url) {
            Some(current) if current.ptr_eq(handle) => {}
            _ => {
                return Err(PakratError::InvariantViolation(format!(
                    "unload of bundle {} which is not in the cache",
                    url
                )));
            }
        }
        self.release(handle)
    }

    // Shared by unload and the destruction cascades, which already hold the
    // current record.
    fn release(
        &mut self,
        handle: &BundleHandle,
    ) -> PakratResult<()> {
        let mut inner = handle.lock();
        if inner.reference_count == 0 {
            return Err(PakratError::InvariantViolation(format!(
                "reference count underflow on bundle {}",
                inner.url
            )));
        }
        inner.reference_count -= 1;
        log::trace!(
            "bundle {} released, {} references remain",
            inner.url,
            inner.reference_count
        );

        if inner.reference_count == 0 {
            let destroy_at_ms = self.now_ms + self.unload_delay_ms;
            inner.destroy_at_ms = Some(destroy_at_ms);
            let epoch = inner.epoch;
            let url = inner.url.clone();
            drop(inner);
            self.unload_queue.schedule(url, epoch, destroy_at_ms);
        }
        Ok(())
    }

    /// Completes an async bundle inside this call: dependency containers
    /// first, then the rest of its own read. This is how a blocking load
    /// overtakes an async one already in flight.
    pub fn force_complete(
        &mut self,
        handle: &BundleHandle,
    ) -> PakratResult<()> {
        if handle.is_done() {
            return Ok(());
        }

        for dep in handle.dependencies() {
            self.force_complete(&dep)?;
        }

        let mut inner = handle.lock();
        let pending = match inner.pending.take() {
            Some(pending) => pending,
            None => {
                return Err(PakratError::InvariantViolation(format!(
                    "bundle {} is {:?} with no read in progress",
                    inner.url, inner.state
                )));
            }
        };
        let bytes = pending.finish()?;
        inner.archive = Some(PakArchive::parse(bytes)?);
        inner.state = LoadState::Loaded;
        log::trace!("bundle {} force-completed", inner.url);
        Ok(())
    }

    /// First pump phase: advances every in-flight async read by one chunk and
    /// promotes bundles whose read and dependencies are complete. The
    /// timestamp also feeds the destruction schedule, so call this before
    /// [`late_update`](BundleManager::late_update) each tick.
    #[profiling::function]
    pub fn update(
        &mut self,
        now_ms: u64,
    ) -> PakratResult<()> {
        self.now_ms = now_ms;

        let mut i = 0;
        while i < self.in_flight.len() {
            let handle = self.in_flight[i].clone();
            if self.poll_bundle(&handle)? {
                self.in_flight.remove(i);
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    // True when the bundle left the poll set: promoted, force-completed
    // earlier, or destroyed.
    fn poll_bundle(
        &mut self,
        handle: &BundleHandle,
    ) -> PakratResult<bool> {
        if handle.load_state() != LoadState::Loading {
            return Ok(true);
        }

        {
            let mut inner = handle.lock();
            let pending = match inner.pending.as_mut() {
                Some(pending) => pending,
                None => {
                    return Err(PakratError::InvariantViolation(format!(
                        "bundle {} is in the poll set with no read in progress",
                        inner.url
                    )));
                }
            };
            if !pending.poll()? {
                return Ok(false);
            }
        }

        // the read is buffered; promotion still waits for dependencies
        for dep in handle.dependencies() {
            if !dep.is_done() {
                return Ok(false);
            }
        }

        let (url, unwanted) = {
            let mut inner = handle.lock();
            if let Some(pending) = inner.pending.take() {
                let bytes = pending.finish()?;
                inner.archive = Some(PakArchive::parse(bytes)?);
            }
            inner.state = LoadState::Loaded;
            (inner.url.clone(), inner.reference_count == 0)
        };
        log::trace!("bundle {} promoted to loaded", url);

        if unwanted {
            // every requester bailed while the read was in flight; nothing
            // holds the result, so it goes straight out again
            log::trace!("bundle {} completed with zero references, disposing", url);
            self.destroy_record(&url)?;
        }
        Ok(true)
    }

    /// Second pump phase: destroys bundles whose scheduled time has elapsed.
    /// Entries whose record was re-requested or is still mid-read are left
    /// alone.
    #[profiling::function]
    pub fn late_update(&mut self) -> PakratResult<()> {
        let now_ms = self.now_ms;
        let mut still_loading = Vec::new();

        while let Some(entry) = self.unload_queue.pop_due(now_ms) {
            let handle = match self.bundles.get(&entry.key) {
                Some(handle) => handle.clone(),
                // already disposed at promotion time
                None => continue,
            };
            {
                let inner = handle.lock();
                if inner.epoch != entry.epoch || inner.reference_count > 0 {
                    continue;
                }
                // an entry stranded by promotion-time disposal can collide
                // with a successor record's epoch; the deadline has to match
                // the one the record itself carries
                if inner.destroy_at_ms != Some(entry.destroy_at_ms) {
                    continue;
                }
                if inner.state == LoadState::Loading {
                    // never abort an in-flight read; promotion disposes of it
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
        Ok(())
    }

    // Physically releases a bundle: the archive is dropped, the index entry
    // removed, and one reference returned to each dependency container.
    fn destroy_record(
        &mut self,
        url: &Arc<str>,
    ) -> PakratResult<()> {
        let handle = match self.bundles.remove(url) {
            Some(handle) => handle,
            None => {
                return Err(PakratError::InvariantViolation(format!(
                    "destroying bundle {} which is not in the cache",
                    url
                )));
            }
        };

        let dependencies = {
            let mut inner = handle.lock();
            inner.archive = None;
            inner.pending = None;
            inner.state = LoadState::Unloaded;
            inner.destroy_at_ms = None;
            inner.epoch += 1;
            std::mem::take(&mut inner.dependencies)
        };
        log::trace!("bundle {} destroyed", url);

        for dep in &dependencies {
            self.release(dep)?;
        }
        Ok(())
    }

    pub fn metrics(&self) -> BundleManagerMetrics {
        let mut metrics = BundleManagerMetrics {
            unload_queue_len: self.unload_queue.len(),
            ..Default::default()
        };
        for handle in self.bundles.values() {
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

impl Drop for BundleManager {
    fn drop(&mut self) {
        let metrics = self.metrics();
        log::info!(
            "dropping BundleManager: {} loaded, {} loading, {} pending destroy",
            metrics.loaded_count,
            metrics.loading_count,
            metrics.pending_destroy_count
        );
        for handle in self.bundles.values() {
            let inner = handle.lock();
            if inner.reference_count > 0 {
                log::warn!(
                    "bundle {} still has {} references at shutdown",
                    inner.url,
                    inner.reference_count
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    fn manager_for(dir: &tempfile::TempDir) -> BundleManager {
        BundleManager::new(test_support::resolver_for(dir), 0, 8, 0)
    }

    fn pump(manager: &mut BundleManager, now_ms: u64) {
        manager.update(now_ms).unwrap();
        manager.late_update().unwrap();
    }

    #[test]
    fn sync_load_is_done_on_return() {
        let dir = test_support::pack_dir();
        test_support::write_bundle(&dir, "bundle1", &[("Hero", b"hero bytes")], 0);
        let mut manager = manager_for(&dir);

        let handle = manager.load("bundle1").unwrap();
        assert!(handle.is_done());
        assert_eq!(handle.reference_count(), 1);
        assert_eq!(handle.extract("Hero").unwrap().as_ref(), b"hero bytes");
        assert!(handle.extract("Villain").is_none());
        assert_eq!(manager.metrics().loaded_count, 1);
    }

    #[test]
    fn second_load_shares_the_record() {
        let dir = test_support::pack_dir();
        test_support::write_bundle(&dir, "bundle1", &[("Hero", b"hero bytes")], 0);
        let (resolver, resolve_count) = test_support::counting_resolver_for(&dir);
        let mut manager = BundleManager::new(resolver, 0, 8, 0);

        let first = manager.load("bundle1").unwrap();
        let second = manager.load("bundle1").unwrap();

        assert!(first.ptr_eq(&second));
        assert_eq!(first.reference_count(), 2);
        assert_eq!(resolve_count.get(), 1);
    }

    #[test]
    fn async_load_completes_over_ticks() {
        let dir = test_support::pack_dir();
        test_support::write_bundle(&dir, "bundle1", &[("Hero", &[7u8; 64])], 0);
        let mut manager = manager_for(&dir);

        let handle = manager.load_async("bundle1").unwrap();
        assert_eq!(handle.load_state(), LoadState::Loading);
        assert!(handle.extract("Hero").is_none());

        let mut ticks = 0;
        while !handle.is_done() {
            pump(&mut manager, ticks);
            ticks += 1;
            assert!(ticks < 100, "async bundle load never completed");
        }

        // an 8 byte chunk cannot swallow the archive in one tick
        assert!(ticks > 1);
        assert_eq!(handle.extract("Hero").unwrap().len(), 64);
    }

    #[test]
    fn sync_load_overtakes_an_async_load_in_flight() {
        let dir = test_support::pack_dir();
        test_support::write_bundle(&dir, "bundle1", &[("Hero", &[7u8; 64])], 0);
        let mut manager = manager_for(&dir);

        let async_handle = manager.load_async("bundle1").unwrap();
        assert!(!async_handle.is_done());

        let sync_handle = manager.load("bundle1").unwrap();
        assert!(sync_handle.ptr_eq(&async_handle));
        assert!(async_handle.is_done());
        assert_eq!(sync_handle.reference_count(), 2);

        // the poll set entry drains without incident
        pump(&mut manager, 0);
        assert_eq!(manager.metrics().loaded_count, 1);
    }

    #[test]
    fn unload_to_zero_defers_destruction_to_the_sweep() {
        let dir = test_support::pack_dir();
        test_support::write_bundle(&dir, "bundle1", &[("Hero", b"hero bytes")], 0);
        let mut manager = manager_for(&dir);

        let handle = manager.load("bundle1").unwrap();
        manager.unload(&handle).unwrap();

        // not destroyed inline
        assert!(handle.is_done());
        assert_eq!(manager.metrics().pending_destroy_count, 1);

        pump(&mut manager, 0);
        assert_eq!(handle.load_state(), LoadState::Unloaded);
        assert_eq!(manager.metrics().loaded_count, 0);
    }

    #[test]
    fn unload_delay_keeps_the_bundle_until_its_time() {
        let dir = test_support::pack_dir();
        test_support::write_bundle(&dir, "bundle1", &[("Hero", b"hero bytes")], 0);
        let mut manager = BundleManager::new(test_support::resolver_for(&dir), 0, 8, 100);

        let handle = manager.load("bundle1").unwrap();
        manager.unload(&handle).unwrap();

        pump(&mut manager, 50);
        assert!(handle.is_done());

        pump(&mut manager, 99);
        assert!(handle.is_done());

        pump(&mut manager, 100);
        assert_eq!(handle.load_state(), LoadState::Unloaded);
    }

    #[test]
    fn reload_cancels_a_scheduled_destruction() {
        let dir = test_support::pack_dir();
        test_support::write_bundle(&dir, "bundle1", &[("Hero", b"hero bytes")], 0);
        let mut manager = BundleManager::new(test_support::resolver_for(&dir), 0, 8, 100);

        let handle = manager.load("bundle1").unwrap();
        manager.unload(&handle).unwrap();
        pump(&mut manager, 50);

        let again = manager.load("bundle1").unwrap();
        assert!(again.ptr_eq(&handle));
        assert_eq!(again.reference_count(), 1);

        // the stale queue entry comes due and must not destroy the record
        pump(&mut manager, 200);
        assert!(again.is_done());
        assert_eq!(manager.metrics().loaded_count, 1);
    }

    #[test]
    fn stale_entry_from_a_disposed_record_spares_its_successor() {
        let dir = test_support::pack_dir();
        test_support::write_bundle(&dir, "bundle1", &[("Hero", &[7u8; 64])], 0);
        let mut manager = BundleManager::new(test_support::resolver_for(&dir), 0, 8, 100);

        // abandon an async load; promotion disposes of the record and leaves
        // its scheduled entry queued
        let abandoned = manager.load_async("bundle1").unwrap();
        manager.unload(&abandoned).unwrap();
        let mut ticks = 0;
        while abandoned.load_state() == LoadState::Loading {
            pump(&mut manager, ticks);
            ticks += 1;
            assert!(ticks < 50, "abandoned bundle never resolved");
        }
        assert_eq!(abandoned.load_state(), LoadState::Unloaded);
        assert_eq!(manager.metrics().unload_queue_len, 1);

        // a successor record under the same id, scheduled out at t=150
        let handle = manager.load("bundle1").unwrap();
        pump(&mut manager, 50);
        manager.unload(&handle).unwrap();

        // the leftover entry comes due at t=100 and must not take the
        // successor with it
        pump(&mut manager, 100);
        assert!(handle.is_done());

        pump(&mut manager, 149);
        assert!(handle.is_done());

        pump(&mut manager, 150);
        assert_eq!(handle.load_state(), LoadState::Unloaded);
        assert_eq!(manager.metrics().loaded_count, 0);
    }

    #[test]
    fn unload_below_zero_is_an_invariant_violation() {
        let dir = test_support::pack_dir();
        test_support::write_bundle(&dir, "bundle1", &[("Hero", b"hero bytes")], 0);
        let mut manager = manager_for(&dir);

        let handle = manager.load("bundle1").unwrap();
        manager.unload(&handle).unwrap();
        let err = manager.unload(&handle).unwrap_err();
        assert!(matches!(err, PakratError::InvariantViolation(_)));
    }

    #[test]
    fn unload_of_a_destroyed_handle_is_an_invariant_violation() {
        let dir = test_support::pack_dir();
        test_support::write_bundle(&dir, "bundle1", &[("Hero", b"hero bytes")], 0);
        let mut manager = manager_for(&dir);

        let handle = manager.load("bundle1").unwrap();
        manager.unload(&handle).unwrap();
        pump(&mut manager, 0);

        let err = manager.unload(&handle).unwrap_err();
        assert!(matches!(err, PakratError::InvariantViolation(_)));
    }

    #[test]
    fn dependencies_load_and_unload_with_their_owner() {
        let dir = test_support::pack_dir();
        test_support::write_bundle(&dir, "outer", &[("Hero", b"hero bytes")], 0);
        test_support::write_bundle(&dir, "inner", &[("Arm", b"arm bytes")], 0);
        let mut manager = manager_for(&dir);

        let mut edges = FnvHashMap::default();
        edges.insert(Arc::from("outer"), vec![Arc::from("inner")]);
        manager.set_dependencies(edges);

        let outer = manager.load("outer").unwrap();
        assert!(outer.is_done());
        assert_eq!(manager.metrics().loaded_count, 2);

        manager.unload(&outer).unwrap();
        pump(&mut manager, 0);

        // the cascade reaches the dependency in the same sweep
        assert_eq!(manager.metrics().loaded_count, 0);
        assert_eq!(manager.metrics().pending_destroy_count, 0);
    }

    #[test]
    fn async_promotion_waits_for_dependency_containers() {
        let dir = test_support::pack_dir();
        // the dependency is much larger, so it finishes after its owner
        test_support::write_bundle(&dir, "outer", &[("Hero", b"hero bytes")], 0);
        test_support::write_bundle(&dir, "inner", &[("Arm", &[3u8; 256])], 0);
        let mut manager = manager_for(&dir);

        let mut edges = FnvHashMap::default();
        edges.insert(Arc::from("outer"), vec![Arc::from("inner")]);
        manager.set_dependencies(edges);

        let outer = manager.load_async("outer").unwrap();
        let inner = {
            let deps = outer.dependencies();
            assert_eq!(deps.len(), 1);
            deps[0].clone()
        };
        assert_eq!(inner.reference_count(), 1);

        let mut saw_outer_waiting = false;
        let mut ticks = 0;
        while !outer.is_done() {
            pump(&mut manager, ticks);
            if !inner.is_done() {
                // own read may be buffered, but promotion must hold
                assert!(!outer.is_done());
                saw_outer_waiting = true;
            }
            ticks += 1;
            assert!(ticks < 200, "dependent bundle never completed");
        }
        assert!(saw_outer_waiting);
        assert!(inner.is_done());
    }

    #[test]
    fn bundle_abandoned_mid_read_is_disposed_at_promotion() {
        let dir = test_support::pack_dir();
        test_support::write_bundle(&dir, "bundle1", &[("Hero", &[7u8; 64])], 0);
        let mut manager = manager_for(&dir);

        let handle = manager.load_async("bundle1").unwrap();
        manager.unload(&handle).unwrap();

        // sweeps refuse to abort the read while it is in flight
        pump(&mut manager, 0);
        assert_eq!(handle.load_state(), LoadState::Loading);

        let mut ticks = 1;
        while handle.load_state() == LoadState::Loading {
            pump(&mut manager, ticks);
            ticks += 1;
            assert!(ticks < 100, "abandoned bundle never resolved");
        }

        // promoted and immediately thrown out, never observable as loaded
        assert_eq!(handle.load_state(), LoadState::Unloaded);
        assert_eq!(manager.metrics().loaded_count, 0);
        assert_eq!(manager.metrics().loading_count, 0);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = test_support::pack_dir();
        let mut manager = manager_for(&dir);

        let err = manager.load("nowhere").unwrap_err();
        assert!(matches!(err, PakratError::NotFound(_)));
    }

    #[test]
    fn failed_load_leaves_no_record_behind() {
        let dir = test_support::pack_dir();
        let mut manager = manager_for(&dir);

        // blocking retries keep reporting the missing file
        let err = manager.load("nowhere").unwrap_err();
        assert!(matches!(err, PakratError::NotFound(_)));
        assert!(manager.get("nowhere").is_none());
        let err = manager.load("nowhere").unwrap_err();
        assert!(matches!(err, PakratError::NotFound(_)));

        // so do async ones, with nothing lingering in the poll set
        let err = manager.load_async("nowhere").unwrap_err();
        assert!(matches!(err, PakratError::NotFound(_)));
        let err = manager.load_async("nowhere").unwrap_err();
        assert!(matches!(err, PakratError::NotFound(_)));

        pump(&mut manager, 0);
        let metrics = manager.metrics();
        assert_eq!(metrics.loaded_count, 0);
        assert_eq!(metrics.loading_count, 0);
        assert_eq!(metrics.unload_queue_len, 0);
    }

    #[test]
    fn failed_load_rolls_back_dependency_references() {
        let dir = test_support::pack_dir();
        test_support::write_bundle(&dir, "inner", &[("Arm", b"arm bytes")], 0);
        let mut manager = manager_for(&dir);

        let mut edges = FnvHashMap::default();
        edges.insert(Arc::from("outer"), vec![Arc::from("inner")]);
        manager.set_dependencies(edges);

        // the dependency came up, then the owner's own file was missing
        let err = manager.load("outer").unwrap_err();
        assert!(matches!(err, PakratError::NotFound(_)));
        assert!(manager.get("outer").is_none());

        // the reference acquired for the failed owner was returned
        let inner = manager.get("inner").unwrap();
        assert_eq!(inner.reference_count(), 0);
        pump(&mut manager, 0);
        assert_eq!(manager.metrics().loaded_count, 0);
    }

    #[test]
    fn cyclic_dependency_map_is_a_configuration_error() {
        let dir = test_support::pack_dir();
        test_support::write_bundle(&dir, "bundle_a", &[("Hero", b"hero bytes")], 0);
        test_support::write_bundle(&dir, "bundle_b", &[("Arm", b"arm bytes")], 0);
        let mut manager = manager_for(&dir);

        let mut edges = FnvHashMap::default();
        edges.insert(Arc::from("bundle_a"), vec![Arc::from("bundle_b")]);
        edges.insert(Arc::from("bundle_b"), vec![Arc::from("bundle_a")]);
        manager.set_dependencies(edges);

        let err = manager.load("bundle_a").unwrap_err();
        assert!(matches!(err, PakratError::Configuration(_)));

        // the async path reports it at request time instead of stalling
        let err = manager.load_async("bundle_a").unwrap_err();
        assert!(matches!(err, PakratError::Configuration(_)));

        // neither half of the cycle stays behind
        assert!(manager.get("bundle_a").is_none());
        assert!(manager.get("bundle_b").is_none());
        pump(&mut manager, 0);
        assert_eq!(manager.metrics().loading_count, 0);
    }

    #[test]
    fn reads_skip_the_application_header() {
        let dir = test_support::pack_dir();
        test_support::write_bundle(&dir, "bundle1", &[("Hero", b"hero bytes")], 16);
        let mut manager = BundleManager::new(test_support::resolver_for(&dir), 16, 8, 0);

        let handle = manager.load("bundle1").unwrap();
        assert_eq!(handle.extract("Hero").unwrap().as_ref(), b"hero bytes");
    }

    #[test]
    fn async_reads_skip_the_application_header() {
        let dir = test_support::pack_dir();
        test_support::write_bundle(&dir, "bundle1", &[("Hero", &[7u8; 64])], 16);
        let mut manager = BundleManager::new(test_support::resolver_for(&dir), 16, 8, 0);

        let handle = manager.load_async("bundle1").unwrap();
        let mut ticks = 0;
        while !handle.is_done() {
            pump(&mut manager, ticks);
            ticks += 1;
            assert!(ticks < 100, "offset async load never completed");
        }
        assert_eq!(handle.extract("Hero").unwrap().len(), 64);
    }

    #[test]
    fn handle_debug_names_the_record() {
        let dir = test_support::pack_dir();
        test_support::write_bundle(&dir, "bundle1", &[("Hero", b"hero bytes")], 0);
        let mut manager = manager_for(&dir);

        let handle = manager.load("bundle1").unwrap();
        let printed = format!("{:?}", handle);
        assert!(printed.contains("bundle1"));
        assert!(printed.contains("Loaded"));
    }
}
