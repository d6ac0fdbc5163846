//! Callback registration on top of the event channels.

use tokio::sync::broadcast;
use tracing::warn;

/// Callback handle for unregistering callbacks.
///
/// Dropping the handle unregisters the callback too; keep it alive for as
/// long as the callback should run.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle").field("id", &self.id).finish()
    }
}

/// Run `callback` for every event on `rx` until the handle goes away.
pub(crate) fn spawn_callback<T, F>(
    id: u64,
    mut rx: broadcast::Receiver<T>,
    callback: F,
) -> CallbackHandle
where
    T: Clone + Send + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    let handle = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => callback(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Callback {} missed {} events", id, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    CallbackHandle::new(id, move || {
        handle.abort();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_callback_runs_until_unregistered() {
        let (tx, rx) = broadcast::channel(8);
        let count = Arc::new(AtomicUsize::new(0));

        let handle = {
            let count = count.clone();
            spawn_callback(3, rx, move |n: usize| {
                count.fetch_add(n, Ordering::SeqCst);
            })
        };
        assert_eq!(handle.id(), 3);

        tx.send(2).unwrap();
        tx.send(5).unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 7);

        handle.unregister();
        tokio::task::yield_now().await;
        let _ = tx.send(100);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 7);
    }
}
