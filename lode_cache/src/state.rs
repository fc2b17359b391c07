/// Lifecycle states shared by every loader.
///
/// Legal transitions form a subsequence of
/// `Unloaded -> Loading -> Processing -> Ready | Failed`, with `Destroyed`
/// reachable from any state. `Processing` may be skipped by loaders that have
/// no cross-frame work.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub enum ResourceLoaderState {
    /// Nothing requested yet
    Unloaded = 0,
    /// Asynchronous fetch or dependency acquisition in flight
    Loading = 1,
    /// Fetched, CPU/GPU-side work remains across frame boundaries
    Processing = 2,
    /// Terminal success, result accessible
    Ready = 3,
    /// Terminal failure, signal settled with an error
    Failed = 4,
    /// Torn down, all resources released
    Destroyed = 5,
}

impl ResourceLoaderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResourceLoaderState::Ready | ResourceLoaderState::Failed | ResourceLoaderState::Destroyed
        )
    }

    /// Work is still in flight
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ResourceLoaderState::Loading | ResourceLoaderState::Processing
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!ResourceLoaderState::Unloaded.is_terminal());
        assert!(!ResourceLoaderState::Loading.is_terminal());
        assert!(!ResourceLoaderState::Processing.is_terminal());
        assert!(ResourceLoaderState::Ready.is_terminal());
        assert!(ResourceLoaderState::Failed.is_terminal());
        assert!(ResourceLoaderState::Destroyed.is_terminal());
    }

    #[test]
    fn active_states() {
        assert!(ResourceLoaderState::Loading.is_active());
        assert!(ResourceLoaderState::Processing.is_active());
        assert!(!ResourceLoaderState::Ready.is_active());
        assert!(!ResourceLoaderState::Unloaded.is_active());
    }
}
