// ── Supervision tree ──
//
// Member tasks share one dying signal. The first member to fail records its
// error and cancels the root token, which every member observes through its
// child token. `wait()` returns only once every member has exited, so no
// task outlives the reported outcome. Concurrent waiters take turns draining
// the set, and every one of them sees the same recorded error.

use std::future::{self, Future};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::FirewallError;

/// Cloneable handle to a group of tasks that live and die together.
#[derive(Clone, Debug)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    dying: CancellationToken,
    error: Mutex<Option<FirewallError>>,
    tasks: Mutex<JoinSet<()>>,
    draining: tokio::sync::Mutex<()>,
}

/// Handle to a single member task.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    token: CancellationToken,
}

impl TaskHandle {
    /// Ask the member to exit. Does not wait for it.
    pub fn stop(&self) {
        self.token.cancel();
    }

    #[cfg(test)]
    pub(crate) fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                dying: CancellationToken::new(),
                error: Mutex::new(None),
                tasks: Mutex::new(JoinSet::new()),
                draining: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Start a member task. The closure receives the member's own token,
    /// which is cancelled by `TaskHandle::stop` or when the tree dies.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, task: F) -> TaskHandle
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), FirewallError>> + Send + 'static,
    {
        let name = name.into();
        let token = self.inner.dying.child_token();
        let fut = task(token.clone());
        let tree: Weak<Inner> = Arc::downgrade(&self.inner);

        debug!(task = %name, "starting supervised task");
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spawn(async move {
                let result = fut.await;
                match result {
                    Ok(()) => debug!(task = %name, "supervised task finished"),
                    Err(err) => {
                        warn!(task = %name, error = %err, "supervised task failed");
                        if let Some(inner) = tree.upgrade() {
                            Supervisor { inner }.kill(Some(err));
                        }
                    }
                }
            });

        TaskHandle { token }
    }

    /// Start dying. The first error recorded wins.
    pub fn kill(&self, err: Option<FirewallError>) {
        if let Some(err) = err {
            let mut slot = self
                .inner
                .error
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.inner.dying.cancel();
    }

    /// Token cancelled once the tree starts dying.
    pub fn dying(&self) -> CancellationToken {
        self.inner.dying.clone()
    }

    #[cfg(test)]
    pub(crate) fn is_dying(&self) -> bool {
        self.inner.dying.is_cancelled()
    }

    /// Wait for every member, including ones spawned while waiting, and
    /// return the first recorded error. Safe to call more than once and
    /// from several clones at the same time.
    pub async fn wait(&self) -> Result<(), FirewallError> {
        // Members stay in the shared set until joined, so a waiter that is
        // dropped part way leaves them for the next one.
        let _draining = self.inner.draining.lock().await;
        while let Some(joined) = future::poll_fn(|cx| {
            self.inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .poll_join_next(cx)
        })
        .await
        {
            if let Err(join_err) = joined {
                if join_err.is_panic() {
                    self.kill(Some(FirewallError::Internal(format!(
                        "supervised task panicked: {join_err}"
                    ))));
                }
            }
        }

        match self
            .inner
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[tokio::test]
    async fn clean_kill_yields_ok() {
        let sup = Supervisor::new();
        sup.spawn("idle", |token| async move {
            token.cancelled().await;
            Ok(())
        });
        sup.kill(None);
        assert!(sup.wait().await.is_ok());
    }

    #[tokio::test]
    async fn member_error_kills_siblings() {
        let sup = Supervisor::new();
        let sibling_stopped = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&sibling_stopped);
        sup.spawn("sibling", |token| async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        sup.spawn("failing", |_| async move {
            Err(FirewallError::watcher_closed("machines"))
        });

        let err = sup.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "machines watcher closed");
        assert!(sibling_stopped.load(Ordering::SeqCst));
        assert!(sup.is_dying());
    }

    #[tokio::test]
    async fn first_error_wins() {
        let sup = Supervisor::new();
        sup.kill(Some(FirewallError::Internal("first".into())));
        sup.kill(Some(FirewallError::Internal("second".into())));
        let err = sup.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "internal error: first");
    }

    #[tokio::test]
    async fn stopping_one_member_leaves_tree_alive() {
        let sup = Supervisor::new();
        let handle = sup.spawn("service watcher", |token| async move {
            token.cancelled().await;
            Ok(())
        });
        handle.stop();
        assert!(handle.is_stopped());
        assert!(!sup.is_dying());
        sup.kill(None);
        assert!(sup.wait().await.is_ok());
    }

    #[tokio::test]
    async fn waits_for_members_spawned_late() {
        let sup = Supervisor::new();
        let late_ran = Arc::new(AtomicBool::new(false));

        let nested = sup.clone();
        let flag = Arc::clone(&late_ran);
        sup.spawn("parent", move |_| async move {
            nested.spawn("child", move |_| async move {
                tokio::task::yield_now().await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        });

        assert!(sup.wait().await.is_ok());
        assert!(late_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn repeated_wait_reports_the_same_error() {
        let sup = Supervisor::new();
        sup.spawn("failing", |_| async move {
            Err(FirewallError::watcher_closed("machines"))
        });

        let first = sup.wait().await.unwrap_err();
        let second = sup.clone().wait().await.unwrap_err();
        assert_eq!(first.to_string(), "machines watcher closed");
        assert_eq!(second.to_string(), first.to_string());
    }

    #[tokio::test]
    async fn concurrent_waiters_outlast_every_member() {
        let sup = Supervisor::new();
        let finished = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&finished);
        sup.spawn("slow to stop", |token| async move {
            token.cancelled().await;
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
            Err(FirewallError::Internal("slow".into()))
        });

        let other = sup.clone();
        let first = tokio::spawn(async move { other.wait().await });
        // Let the first waiter start draining.
        tokio::task::yield_now().await;
        sup.kill(None);

        let err = sup.wait().await.unwrap_err();
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(err.to_string(), "internal error: slow");
        let err = first.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "internal error: slow");
    }

    #[tokio::test]
    async fn panic_is_reported_as_internal() {
        let sup = Supervisor::new();
        let explode = true;
        sup.spawn("panicking", move |_| async move {
            assert!(!explode, "boom");
            Ok(())
        });
        let err = sup.wait().await.unwrap_err();
        assert!(matches!(err, FirewallError::Internal(_)));
    }
}
