use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

static NEXT_MONITOR: AtomicU64 = AtomicU64::new(1);

/// One-shot liveness watch.
///
/// Delivers a single "down" message to its owner's mailbox once the watched
/// entity goes away. The watch is cancelled when the `Monitor` is dropped, so
/// replacing or forgetting the entity only needs the handle to be dropped.
#[derive(Debug)]
pub struct Monitor {
    id: u64,
    handle: JoinHandle<()>,
}

impl Monitor {
    /// Watches `until`, then sends `down` to `mailbox`.
    ///
    /// The mailbox is held weakly so a pending monitor never keeps its owner alive.
    pub fn spawn<F, M>(until: F, mailbox: mpsc::WeakSender<M>, down: M) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
        M: Send + 'static,
    {
        Self::spawn_with(until, mailbox, |_| down)
    }

    /// Like [`Monitor::spawn`], with the monitor id passed to `down`.
    pub fn spawn_with<F, M, D>(until: F, mailbox: mpsc::WeakSender<M>, down: D) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
        M: Send + 'static,
        D: FnOnce(u64) -> M,
    {
        let id = NEXT_MONITOR.fetch_add(1, Ordering::Relaxed);
        let message = down(id);
        let handle = tokio::spawn(async move {
            until.await;
            if let Some(mailbox) = mailbox.upgrade() {
                let _ = mailbox.send(message).await;
            }
        });
        Self { id, handle }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
