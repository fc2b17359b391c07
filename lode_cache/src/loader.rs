use crate::error::ResourceError;
use crate::frame::FrameContext;
use crate::key::CacheKey;
use crate::signal::{self, LoadSignal, SignalSender};
use crate::state::ResourceLoaderState;
use std::any::Any;
use std::sync::{Arc, Mutex};

/// Contract implemented by every concrete loader.
///
/// `load` begins asynchronous work exactly once and is only ever invoked by
/// the cache (or by the owner of an uncached top-level loader). `update` is
/// called every frame by the driving thread and advances at most one stage of
/// `Processing` work; it must be a no-op in terminal states. `destroy` is the
/// only cancellation primitive: in-flight continuations observe it through
/// [`LoaderCore`] and discard their result instead of publishing it.
pub trait ResourceLoader: Send + Sync + 'static {
    fn cache_key(&self) -> &CacheKey;

    fn state(&self) -> ResourceLoaderState;

    /// Clonable observer settled exactly once with the terminal result.
    fn signal(&self) -> LoadSignal;

    /// Begin the load. Must be called inside a tokio runtime; loaders spawn
    /// their fetch/decode continuations from here.
    fn load(self: Arc<Self>);

    fn update(&self, frame: &mut FrameContext<'_>);

    /// Release everything, including child cache references. Safe to call in
    /// any state, idempotent.
    fn destroy(&self);

    fn is_destroyed(&self) -> bool {
        self.state() == ResourceLoaderState::Destroyed
    }

    /// Typed downcast support for the cache registry.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Shared state-machine implementation embedded in every concrete loader.
///
/// Transitions are checked under one lock so asynchronous continuations can
/// re-validate liveness before mutating loader state: every `begin_*`/`finish`
/// returns whether the transition was taken, and anything arriving after
/// `destroy` is rejected without settling the signal a second time.
#[derive(Debug)]
pub struct LoaderCore {
    key: CacheKey,
    state: Mutex<ResourceLoaderState>,
    sender: SignalSender,
    signal: LoadSignal,
}

impl LoaderCore {
    pub fn new(key: CacheKey) -> Self {
        let (sender, signal) = signal::channel();
        Self {
            key,
            state: Mutex::new(ResourceLoaderState::Unloaded),
            sender,
            signal,
        }
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.key
    }

    pub fn state(&self) -> ResourceLoaderState {
        *self.state.lock().unwrap()
    }

    pub fn signal(&self) -> LoadSignal {
        self.signal.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == ResourceLoaderState::Destroyed
    }

    fn transition(&self, from: ResourceLoaderState, to: ResourceLoaderState) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state != from {
            return false;
        }
        tracing::debug!(key = %self.key, ?to, "loader transition");
        *state = to;
        true
    }

    /// `Unloaded -> Loading`; false when already started or destroyed.
    pub fn begin_loading(&self) -> bool {
        self.transition(ResourceLoaderState::Unloaded, ResourceLoaderState::Loading)
    }

    /// `Loading -> Processing`; false when destroyed in flight.
    pub fn begin_processing(&self) -> bool {
        self.transition(
            ResourceLoaderState::Loading,
            ResourceLoaderState::Processing,
        )
    }

    /// `Loading | Processing -> Ready`, settling the signal with success.
    /// Returns false (and settles nothing) when the loader was destroyed.
    pub fn finish(&self) -> bool {
        let taken = {
            let mut state = self.state.lock().unwrap();
            if state.is_active() {
                *state = ResourceLoaderState::Ready;
                true
            } else {
                false
            }
        };
        if taken {
            tracing::debug!(key = %self.key, "loader ready");
            self.sender.settle(Ok(()));
        }
        taken
    }

    /// Transition to `Failed` and settle with `error`. A failure arriving
    /// after `destroy` is swallowed.
    pub fn fail(&self, error: ResourceError) -> bool {
        let taken = {
            let mut state = self.state.lock().unwrap();
            if !state.is_terminal() {
                *state = ResourceLoaderState::Failed;
                true
            } else {
                false
            }
        };
        if taken {
            tracing::error!(key = %self.key, error = %error, "loader failed");
            self.sender.settle(Err(error));
        }
        taken
    }

    /// Transition to `Destroyed` from any state. Returns true exactly once so
    /// the caller knows to release its resources; observers that have not yet
    /// settled see [`ResourceError::Destroyed`].
    pub fn destroy(&self) -> bool {
        let taken = {
            let mut state = self.state.lock().unwrap();
            if *state == ResourceLoaderState::Destroyed {
                false
            } else {
                *state = ResourceLoaderState::Destroyed;
                true
            }
        };
        if taken {
            tracing::debug!(key = %self.key, "loader destroyed");
            self.sender.settle(Err(ResourceError::Destroyed));
        }
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> LoaderCore {
        LoaderCore::new(CacheKey::external_buffer("mem://core.bin"))
    }

    #[tokio::test]
    async fn happy_path_is_monotonic() {
        let core = core();
        assert!(core.begin_loading());
        assert!(!core.begin_loading());
        assert!(core.begin_processing());
        assert!(!core.begin_processing());
        assert!(core.finish());
        assert_eq!(core.state(), ResourceLoaderState::Ready);
        assert!(core.signal().settled().await.is_ok());
    }

    #[tokio::test]
    async fn ready_without_processing_stage() {
        let core = core();
        assert!(core.begin_loading());
        assert!(core.finish());
        assert_eq!(core.state(), ResourceLoaderState::Ready);
    }

    #[tokio::test]
    async fn destroy_wins_over_late_completion() {
        let core = core();
        assert!(core.begin_loading());
        assert!(core.destroy());
        // the in-flight continuation arrives afterwards
        assert!(!core.begin_processing());
        assert!(!core.finish());
        assert!(!core.fail(ResourceError::fetch("mem://core.bin", "late")));
        assert_eq!(core.state(), ResourceLoaderState::Destroyed);
        assert!(matches!(
            core.signal().settled().await,
            Err(ResourceError::Destroyed)
        ));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let core = core();
        assert!(core.destroy());
        assert!(!core.destroy());
    }

    #[tokio::test]
    async fn failure_settles_signal_with_cause() {
        let core = core();
        assert!(core.begin_loading());
        assert!(core.fail(ResourceError::fetch("mem://core.bin", "404")));
        assert_eq!(core.state(), ResourceLoaderState::Failed);
        match core.signal().settled().await {
            Err(ResourceError::Fetch { uri, .. }) => assert_eq!(uri, "mem://core.bin"),
            other => panic!("expected fetch error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ready_result_is_not_clobbered_by_destroy() {
        let core = core();
        core.begin_loading();
        core.finish();
        core.destroy();
        // signal settled once, with success
        assert!(core.signal().settled().await.is_ok());
        assert_eq!(core.state(), ResourceLoaderState::Destroyed);
    }
}
