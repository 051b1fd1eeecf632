use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

/// Wakeup primitive behind `cancel()`.
///
/// Every blocking call snapshots the epoch on entry; `cancel()` bumps it and
///  wakes all currently registered waiters. A call that observes an epoch
///  change fails with *cancelled*. Calls entered after the bump see the new
///  epoch from the start and are unaffected, so each `cancel()` invalidates
///  exactly the calls blocked at that moment.
pub(crate) struct CancelChannel {
    epoch: AtomicU64,
    notify: Notify,
}

impl CancelChannel {
    pub fn new() -> CancelChannel {
        CancelChannel {
            epoch: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self, since: u64) -> bool {
        self.epoch() != since
    }

    /// Resolves once the epoch moves past `since`. Safe against the bump
    ///  racing the registration: the waiter is enabled before the epoch is
    ///  re-checked.
    pub async fn cancelled(&self, since: u64) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_cancelled(since) {
                return;
            }
            notified.await;
        }
    }
}
