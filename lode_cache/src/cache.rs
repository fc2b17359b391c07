use crate::error::ResourceError;
use crate::fetch::Fetcher;
use crate::gpu::{GpuContext, GpuResource};
use crate::key::CacheKey;
use crate::loader::ResourceLoader;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

/// Reference-count change emitted by handles. Handles live on any thread;
/// the registry itself only mutates on the driving thread inside
/// [`ResourceCache::maintain`].
enum RefDelta {
    Add(CacheKey),
    Release(CacheKey),
}

struct CacheEntry {
    loader: Arc<dyn ResourceLoader>,
    refs: u32,
    keep_resident: bool,
}

/// Keyed registry of live loaders with single-flight semantics.
///
/// One cache is one session: independent renderer instances (and independent
/// test runs) construct their own and share nothing.
pub struct ResourceCache {
    entries: HashMap<CacheKey, CacheEntry>,
    delta_send: crossbeam_channel::Sender<RefDelta>,
    delta_recv: crossbeam_channel::Receiver<RefDelta>,
    garbage_send: crossbeam_channel::Sender<GpuResource>,
    garbage_recv: crossbeam_channel::Receiver<GpuResource>,
    fetcher: Arc<dyn Fetcher>,
}

impl ResourceCache {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        let (delta_send, delta_recv) = crossbeam_channel::unbounded();
        let (garbage_send, garbage_recv) = crossbeam_channel::unbounded();
        Self {
            entries: HashMap::new(),
            delta_send,
            delta_recv,
            garbage_send,
            garbage_recv,
            fetcher,
        }
    }

    pub fn fetcher(&self) -> Arc<dyn Fetcher> {
        self.fetcher.clone()
    }

    /// Sender loaders use to queue GPU resources for deferred destruction;
    /// `destroy` runs without device access, the driver flushes the queue.
    pub fn gpu_garbage_sender(&self) -> crossbeam_channel::Sender<GpuResource> {
        self.garbage_send.clone()
    }

    /// Destroy GPU resources released since the last flush. Call once per
    /// frame alongside [`ResourceCache::maintain`].
    pub fn flush_gpu_garbage(&mut self, gpu: &mut dyn GpuContext) {
        while let Ok(resource) = self.garbage_recv.try_recv() {
            match resource {
                GpuResource::Buffer(buffer) => gpu.destroy_buffer(buffer),
                GpuResource::Texture(texture) => gpu.destroy_texture(texture),
            }
        }
    }

    /// Return the loader registered under `key`, constructing and `load`ing
    /// it via `init` on first request.
    ///
    /// A hit increments the reference count and returns the existing instance
    /// without re-issuing `load`, so at most one fetch/decode is ever in
    /// flight per distinct key. `init` receives the cache so loaders can
    /// acquire their child references while being constructed.
    pub fn get_or_load<L, F>(
        &mut self,
        key: CacheKey,
        keep_resident: bool,
        init: F,
    ) -> Result<ResourceHandle<L>, ResourceError>
    where
        L: ResourceLoader,
        F: FnOnce(&mut ResourceCache) -> Result<Arc<L>, ResourceError>,
    {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.refs += 1;
            entry.keep_resident |= keep_resident;
            let loader = entry
                .loader
                .clone()
                .as_any()
                .downcast::<L>()
                .unwrap_or_else(|_| {
                    panic!("cache key {key} already registered with a different loader kind")
                });
            return Ok(ResourceHandle::new(loader, key, self.delta_send.clone()));
        }

        let loader = init(self)?;
        tracing::debug!(key = %key, "cache insert");
        self.entries.insert(
            key.clone(),
            CacheEntry {
                loader: loader.clone(),
                refs: 1,
                keep_resident,
            },
        );
        loader.clone().load();
        Ok(ResourceHandle::new(loader, key, self.delta_send.clone()))
    }

    /// Explicitly give a reference back and process the release immediately.
    pub fn release<L: ResourceLoader>(&mut self, handle: ResourceHandle<L>) {
        drop(handle);
        self.maintain();
    }

    /// Drain pending reference-count changes and tear down entries whose
    /// count reached zero. Call once per frame on the driving thread.
    pub fn maintain(&mut self) {
        while let Ok(delta) = self.delta_recv.try_recv() {
            match delta {
                RefDelta::Add(key) => match self.entries.get_mut(&key) {
                    Some(entry) => entry.refs += 1,
                    None => {
                        debug_assert!(false, "ref added for unknown cache key {key}");
                        tracing::warn!(key = %key, "ref added for unknown cache key");
                    }
                },
                RefDelta::Release(key) => self.process_release(&key),
            }
        }
    }

    fn process_release(&mut self, key: &CacheKey) {
        let Some(entry) = self.entries.get_mut(key) else {
            debug_assert!(false, "released cache key {key} more times than loaded");
            tracing::warn!(key = %key, "released unknown cache key");
            return;
        };
        debug_assert!(entry.refs > 0, "cache entry {key} released below zero");
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 && !entry.keep_resident {
            let entry = self.entries.remove(key).expect("entry present");
            tracing::debug!(key = %key, "cache evict");
            // destroy may release child handles, their deltas land in the
            // same channel and are drained by the enclosing maintain loop
            entry.loader.destroy();
        }
    }

    /// Destroy resident entries that no consumer references anymore.
    pub fn evict_resident(&mut self) {
        self.maintain();
        let stale: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.refs == 0 && entry.keep_resident)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            let entry = self.entries.remove(&key).expect("entry present");
            tracing::debug!(key = %key, "resident cache evict");
            entry.loader.destroy();
        }
        // children released by the destroys above
        self.maintain();
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn ref_count(&self, key: &CacheKey) -> Option<u32> {
        self.entries.get(key).map(|entry| entry.refs)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

impl Drop for ResourceCache {
    fn drop(&mut self) {
        for (key, entry) in self.entries.drain() {
            tracing::debug!(key = %key, "cache teardown");
            entry.loader.destroy();
        }
    }
}

/// Strong, typed reference to a cache entry.
///
/// Cloning increments the entry's reference count; dropping decrements it.
/// The decrement is observed on the driving thread during the next
/// [`ResourceCache::maintain`], never concurrently with registry mutation.
#[derive(Debug)]
pub struct ResourceHandle<L: ?Sized> {
    loader: Arc<L>,
    key: CacheKey,
    delta_send: crossbeam_channel::Sender<RefDelta>,
}

impl<L: ?Sized> ResourceHandle<L> {
    fn new(loader: Arc<L>, key: CacheKey, delta_send: crossbeam_channel::Sender<RefDelta>) -> Self {
        Self {
            loader,
            key,
            delta_send,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn loader(&self) -> &Arc<L> {
        &self.loader
    }
}

impl<L: ?Sized> Deref for ResourceHandle<L> {
    type Target = L;

    fn deref(&self) -> &L {
        &self.loader
    }
}

impl<L: ?Sized> Clone for ResourceHandle<L> {
    fn clone(&self) -> Self {
        // a clone created from a live handle always enqueues its Add before
        // that handle's Release, keeping the net count conservative
        let _ = self.delta_send.send(RefDelta::Add(self.key.clone()));
        Self {
            loader: self.loader.clone(),
            key: self.key.clone(),
            delta_send: self.delta_send.clone(),
        }
    }
}

impl<L: ?Sized> Drop for ResourceHandle<L> {
    fn drop(&mut self) {
        // cache may already be gone during teardown, releases are best-effort
        let _ = self.delta_send.send(RefDelta::Release(self.key.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::MemoryFetcher;
    use crate::frame::FrameContext;
    use crate::loader::LoaderCore;
    use crate::signal::LoadSignal;
    use crate::state::ResourceLoaderState;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubLoader {
        core: LoaderCore,
        loads: AtomicUsize,
    }

    impl StubLoader {
        fn new(key: CacheKey) -> Arc<Self> {
            Arc::new(Self {
                core: LoaderCore::new(key),
                loads: AtomicUsize::new(0),
            })
        }
    }

    impl ResourceLoader for StubLoader {
        fn cache_key(&self) -> &CacheKey {
            self.core.cache_key()
        }

        fn state(&self) -> ResourceLoaderState {
            self.core.state()
        }

        fn signal(&self) -> LoadSignal {
            self.core.signal()
        }

        fn load(self: Arc<Self>) {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.core.begin_loading();
            self.core.finish();
        }

        fn update(&self, _frame: &mut FrameContext<'_>) {}

        fn destroy(&self) {
            self.core.destroy();
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn cache() -> ResourceCache {
        ResourceCache::new(Arc::new(MemoryFetcher::new()))
    }

    fn load_stub(cache: &mut ResourceCache, key: &CacheKey) -> ResourceHandle<StubLoader> {
        cache
            .get_or_load(key.clone(), false, |_| Ok(StubLoader::new(key.clone())))
            .expect("stub load")
    }

    #[tokio::test]
    async fn identical_keys_share_one_loader() {
        let mut cache = cache();
        let key = CacheKey::external_buffer("mem://shared.bin");
        let a = load_stub(&mut cache, &key);
        let b = load_stub(&mut cache, &key);
        assert!(Arc::ptr_eq(a.loader(), b.loader()));
        assert_eq!(a.loads.load(Ordering::SeqCst), 1, "load issued exactly once");
        assert_eq!(cache.entry_count(), 1);
    }

    #[tokio::test]
    async fn refcount_parity_destroys_at_zero() {
        let mut cache = cache();
        let key = CacheKey::external_buffer("mem://counted.bin");
        let a = load_stub(&mut cache, &key);
        let b = load_stub(&mut cache, &key);
        assert_eq!(cache.ref_count(&key), Some(2));

        cache.release(a);
        assert!(cache.contains(&key), "one reference still outstanding");
        assert_eq!(cache.ref_count(&key), Some(1));

        let loader = b.loader().clone();
        cache.release(b);
        assert!(!cache.contains(&key));
        assert_eq!(loader.state(), ResourceLoaderState::Destroyed);
    }

    #[tokio::test]
    async fn clone_counts_as_a_reference() {
        let mut cache = cache();
        let key = CacheKey::external_buffer("mem://cloned.bin");
        let a = load_stub(&mut cache, &key);
        let b = a.clone();
        cache.release(a);
        assert!(cache.contains(&key));
        cache.release(b);
        assert!(!cache.contains(&key));
    }

    #[tokio::test]
    async fn dropped_handles_release_on_maintain() {
        let mut cache = cache();
        let key = CacheKey::external_buffer("mem://dropped.bin");
        let handle = load_stub(&mut cache, &key);
        drop(handle);
        assert!(cache.contains(&key), "release observed only on maintain");
        cache.maintain();
        assert!(!cache.contains(&key));
    }

    #[tokio::test]
    async fn resident_entries_survive_last_release() {
        let mut cache = cache();
        let key = CacheKey::gltf("mem://resident.gltf");
        let handle = cache
            .get_or_load(key.clone(), true, |_| Ok(StubLoader::new(key.clone())))
            .expect("load");
        cache.release(handle);
        assert!(cache.contains(&key), "resident entry kept past last ref");

        // a later request reuses it
        let again = load_stub(&mut cache, &key);
        assert_eq!(again.loads.load(Ordering::SeqCst), 1);
        cache.release(again);

        cache.evict_resident();
        assert!(!cache.contains(&key));
    }

    #[cfg(debug_assertions)]
    #[tokio::test]
    #[should_panic(expected = "more times than loaded")]
    async fn over_release_of_an_unknown_key_is_rejected() {
        let mut cache = cache();
        let key = CacheKey::external_buffer("mem://never-loaded.bin");
        cache
            .delta_send
            .send(RefDelta::Release(key))
            .expect("channel open");
        cache.maintain();
    }

    #[tokio::test]
    async fn teardown_destroys_live_entries() {
        let key = CacheKey::external_buffer("mem://teardown.bin");
        let loader;
        {
            let mut cache = cache();
            let handle = load_stub(&mut cache, &key);
            loader = handle.loader().clone();
            // handle and cache both drop here
        }
        assert_eq!(loader.state(), ResourceLoaderState::Destroyed);
    }
}
