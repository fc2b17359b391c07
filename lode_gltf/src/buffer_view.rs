use crate::buffer::BufferLoader;
use bytes::Bytes;
use lode_cache::cache::ResourceHandle;
use lode_cache::error::ResourceError;
use lode_cache::frame::FrameContext;
use lode_cache::key::CacheKey;
use lode_cache::loader::{LoaderCore, ResourceLoader};
use lode_cache::signal::LoadSignal;
use lode_cache::state::ResourceLoaderState;
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    /// Cache reference keeping the parent buffer alive; the view shares its
    /// memory, so this is released only on unload/destroy.
    parent: Option<ResourceHandle<BufferLoader>>,
    bytes: Option<Bytes>,
}

/// Zero-copy byte-range view into a buffer.
pub struct BufferViewLoader {
    core: LoaderCore,
    byte_offset: usize,
    byte_length: usize,
    inner: Mutex<Inner>,
}

impl BufferViewLoader {
    pub fn new(
        key: CacheKey,
        parent: ResourceHandle<BufferLoader>,
        byte_offset: usize,
        byte_length: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: LoaderCore::new(key),
            byte_offset,
            byte_length,
            inner: Mutex::new(Inner {
                parent: Some(parent),
                bytes: None,
            }),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// The sliced bytes, available once `Ready`. Shares the parent buffer's
    /// allocation.
    pub fn bytes(&self) -> Option<Bytes> {
        self.inner().bytes.clone()
    }
}

impl ResourceLoader for BufferViewLoader {
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
        if !self.core.begin_loading() {
            return;
        }
        let loader = self.clone();
        let parent_signal = match self.inner().parent.as_ref() {
            Some(parent) => parent.signal(),
            None => return,
        };
        tokio::spawn(async move {
            let settled = parent_signal.settled().await;
            let mut inner = loader.inner();
            if loader.core.is_destroyed() {
                return;
            }
            let sliced = settled.and_then(|()| {
                let parent_bytes = inner
                    .parent
                    .as_ref()
                    .and_then(|parent| parent.bytes())
                    .ok_or_else(|| {
                        ResourceError::format("Failed to load buffer view", "parent has no bytes")
                    })?;
                let end = loader.byte_offset + loader.byte_length;
                if end > parent_bytes.len() {
                    return Err(ResourceError::format(
                        "Failed to load buffer view",
                        format!(
                            "range {}..{} exceeds buffer length {}",
                            loader.byte_offset,
                            end,
                            parent_bytes.len()
                        ),
                    ));
                }
                Ok(parent_bytes.slice(loader.byte_offset..end))
            });
            match sliced {
                Ok(bytes) => {
                    inner.bytes = Some(bytes);
                    drop(inner);
                    loader.core.finish();
                }
                Err(error) => {
                    // failure paths release the parent before settling
                    inner.parent = None;
                    inner.bytes = None;
                    drop(inner);
                    loader
                        .core
                        .fail(ResourceError::dependency("Failed to load buffer view", error));
                }
            }
        });
    }

    fn update(&self, _frame: &mut FrameContext<'_>) {}

    fn destroy(&self) {
        if self.core.destroy() {
            let mut inner = self.inner();
            inner.parent = None;
            inner.bytes = None;
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
