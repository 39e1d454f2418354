//! The user callback records are delivered to.

use std::future::Future;

use async_trait::async_trait;

/// Error a handler reports for a single record.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives records one at a time.
///
/// A failing record is logged and counted; the consumer still moves past it.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handles one record payload.
    async fn handle(&self, data: &[u8]) -> Result<(), HandlerError>;

    /// Called once the consumer stopped delivering records.
    fn done(&self) {}
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    handle: F,
}

impl<F> FnHandler<F> {
    /// Wraps `handle`.
    #[must_use]
    pub const fn new(handle: F) -> Self {
        Self { handle }
    }
}

impl<F> std::fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, data: &[u8]) -> Result<(), HandlerError> {
        (self.handle)(data.to_vec()).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_fn_handler_forwards_payload() {
        let seen = Arc::new(AtomicUsize::new(0));
        let handler = {
            let seen = Arc::clone(&seen);
            FnHandler::new(move |data: Vec<u8>| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(data.len(), Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        handler.handle(b"hello").await.expect("handle should succeed");
        handler.done();

        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }
}
