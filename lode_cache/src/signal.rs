use crate::error::ResourceError;
use tokio::sync::watch;

pub type LoadResult = Result<(), ResourceError>;

/// Create a connected settle/observe pair.
pub fn channel() -> (SignalSender, LoadSignal) {
    let (tx, rx) = watch::channel(None);
    (SignalSender { tx }, LoadSignal { rx })
}

/// Settling half of a load signal, owned by the loader.
///
/// Settles at most once; later attempts are ignored so a failure arriving
/// after `destroy()` never re-rejects an already abandoned load.
#[derive(Debug)]
pub struct SignalSender {
    tx: watch::Sender<Option<LoadResult>>,
}

impl SignalSender {
    pub fn settle(&self, result: LoadResult) {
        let mut result = Some(result);
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = result.take();
                true
            } else {
                false
            }
        });
    }

    pub fn is_settled(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

/// Observing half of a load signal. Cheap to clone, safe to await from any
/// number of consumers; every observer sees the same terminal result.
#[derive(Debug, Clone)]
pub struct LoadSignal {
    rx: watch::Receiver<Option<LoadResult>>,
}

impl LoadSignal {
    /// Wait for the terminal result. If the owning loader is dropped without
    /// settling, the load counts as destroyed.
    pub async fn settled(&self) -> LoadResult {
        let mut rx = self.rx.clone();
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(ResourceError::Destroyed);
            }
        }
    }

    /// Non-blocking probe, `None` while the load is still in flight.
    pub fn try_result(&self) -> Option<LoadResult> {
        self.rx.borrow().clone()
    }
}
