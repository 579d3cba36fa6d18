// ── Change subscriptions ──
//
// A watcher is the consuming half of a long-lived change feed. The source
// keeps a `WatchSender`; the engine keeps the `Watcher` and must stop it
// on teardown (dropping it stops it too).

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Watcher yielding batches of changed identifiers.
pub type StringsWatcher = Watcher<Vec<String>>;

/// Watcher yielding bare "something changed" notifications.
pub type NotifyWatcher = Watcher<()>;

/// Consuming side of a change subscription.
#[derive(Debug)]
pub struct Watcher<T> {
    name: String,
    changes: mpsc::UnboundedReceiver<T>,
    stop: CancellationToken,
}

/// Producing side of a change subscription, held by the state source.
#[derive(Debug)]
pub struct WatchSender<T> {
    tx: mpsc::UnboundedSender<T>,
    stop: CancellationToken,
}

/// Create a connected sender/watcher pair.
pub fn channel<T>(name: impl Into<String>) -> (WatchSender<T>, Watcher<T>) {
    let (tx, changes) = mpsc::unbounded_channel();
    let stop = CancellationToken::new();
    (
        WatchSender {
            tx,
            stop: stop.clone(),
        },
        Watcher {
            name: name.into(),
            changes,
            stop,
        },
    )
}

impl<T> Watcher<T> {
    /// Human-readable description, used in error messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next change. `None` means the source closed the feed.
    pub async fn next(&mut self) -> Option<T> {
        self.changes.recv().await
    }

    /// End the subscription. The source stops delivering.
    pub fn stop(&self) {
        self.stop.cancel();
        tracing::trace!(watcher = %self.name, "watcher stopped");
    }
}

impl<T> Drop for Watcher<T> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl<T> WatchSender<T> {
    /// Deliver a change. Returns `false` once the subscriber is gone.
    pub fn send(&self, change: T) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.tx.send(change).is_ok()
    }

    /// Whether the subscriber stopped or dropped its watcher.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled() || self.tx.is_closed()
    }

    /// Close the feed from the source side; the watcher sees `None` next.
    pub fn close(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_changes_in_order() {
        let (tx, mut watcher) = channel::<Vec<String>>("machines");
        assert!(tx.send(vec!["0".into()]));
        assert!(tx.send(vec!["1".into(), "2".into()]));
        assert_eq!(watcher.next().await, Some(vec!["0".to_owned()]));
        assert_eq!(
            watcher.next().await,
            Some(vec!["1".to_owned(), "2".to_owned()])
        );
    }

    #[tokio::test]
    async fn closing_sender_ends_feed() {
        let (tx, mut watcher) = channel::<()>("environ config");
        tx.close();
        assert_eq!(watcher.next().await, None);
    }

    #[test]
    fn next_waits_for_a_change() {
        let (tx, mut watcher) = channel::<()>("environ config");
        let mut next = tokio_test::task::spawn(watcher.next());
        tokio_test::assert_pending!(next.poll());

        assert!(tx.send(()));
        assert!(next.is_woken());
        tokio_test::assert_ready_eq!(next.poll(), Some(()));
    }

    #[test]
    fn stop_is_visible_to_sender() {
        let (tx, watcher) = channel::<()>("service wordpress");
        assert!(!tx.is_stopped());
        watcher.stop();
        assert!(tx.is_stopped());
        assert!(!tx.send(()));
    }

    #[test]
    fn drop_stops_subscription() {
        let (tx, watcher) = channel::<()>("units of machine 0");
        drop(watcher);
        assert!(tx.is_stopped());
    }
}
