//! Hierarchical cancellation tokens.
//!
//! A [`CancelToken`] is passed down every call chain that may block.
//! Cancelling a token cancels all of its children, never its parent.
//! [`DelayedCancel`] derives a token that only follows its parent after a
//! grace period, so cleanup work (releasing leases, deregistering) can still
//! land after shutdown was requested.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::error::{Error, Result};

/// A cloneable cancellation handle.
#[derive(Debug, Clone)]
pub struct CancelToken {
    node: Arc<Node>,
}

#[derive(Debug)]
struct Node {
    cancelled: watch::Sender<bool>,
    parent: Option<CancelToken>,
}

impl CancelToken {
    /// Creates a new root token.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<Self>) -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            node: Arc::new(Node { cancelled, parent }),
        }
    }

    /// Creates a token that is cancelled whenever this one is.
    #[must_use]
    pub fn child(&self) -> Self {
        Self::with_parent(Some(self.clone()))
    }

    /// Cancels this token and every token derived from it.
    pub fn cancel(&self) {
        self.node.cancelled.send_replace(true);
    }

    /// Returns true if this token or one of its ancestors was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.lineage().any(|node| *node.cancelled.borrow())
    }

    /// Returns `Err(Error::Canceled)` once the token was cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Canceled`] if the token was cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }

    /// Completes once this token or one of its ancestors is cancelled.
    pub async fn cancelled(&self) {
        let mut receivers: Vec<watch::Receiver<bool>> = self
            .lineage()
            .map(|node| node.cancelled.subscribe())
            .collect();

        let waits = receivers.iter_mut().map(|rx| {
            Box::pin(async move {
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            })
        });
        select_all(waits).await;
    }

    /// Runs `fut` until it completes or the token is cancelled.
    ///
    /// Returns `None` if cancellation won.
    pub async fn run_until_cancelled<F>(&self, fut: F) -> Option<F::Output>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            () = self.cancelled() => None,
            output = fut => Some(output),
        }
    }

    /// Derives a token that follows this one only after `delay` has passed.
    #[must_use]
    pub fn delayed(&self, clock: SharedClock, delay: Duration) -> DelayedCancel {
        DelayedCancel::new(self, clock, delay)
    }

    fn lineage(&self) -> impl Iterator<Item = &Node> {
        std::iter::successors(Some(self.node.as_ref()), |node| {
            node.parent.as_ref().map(|parent| parent.node.as_ref())
        })
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A token cancelled a grace period after its parent.
///
/// Dropping the handle or calling [`DelayedCancel::stop`] cancels the token
/// immediately and stops the timer task.
#[derive(Debug)]
pub struct DelayedCancel {
    token: CancelToken,
    timer: JoinHandle<()>,
}

impl DelayedCancel {
    fn new(parent: &CancelToken, clock: SharedClock, delay: Duration) -> Self {
        let token = CancelToken::new();
        let timer = {
            let parent = parent.clone();
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = parent.cancelled() => {
                        tokio::select! {
                            () = clock.sleep(delay) => token.cancel(),
                            () = token.cancelled() => {}
                        }
                    }
                    () = token.cancelled() => {}
                }
            })
        };

        Self { token, timer }
    }

    /// Returns the delayed token.
    #[must_use]
    pub const fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Cancels the delayed token now and stops the timer.
    pub fn stop(&self) {
        self.token.cancel();
        self.timer.abort();
    }
}

impl Drop for DelayedCancel {
    fn drop(&mut self) {
        self.stop();
    }
}
