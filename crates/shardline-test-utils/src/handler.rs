//! Message handlers for tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use shardline_stream::{HandlerError, MessageHandler};
use tokio::sync::watch;

/// Records every payload it receives.
#[derive(Debug)]
pub struct CollectingHandler {
    payloads: Mutex<Vec<Vec<u8>>>,
    reject: Option<Vec<u8>>,
    done: AtomicBool,
    count: watch::Sender<usize>,
}

impl Default for CollectingHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectingHandler {
    /// Creates a handler accepting everything.
    #[must_use]
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            payloads: Mutex::new(Vec::new()),
            reject: None,
            done: AtomicBool::new(false),
            count,
        }
    }

    /// Creates a handler that records but rejects `payload`.
    #[must_use]
    pub fn rejecting(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            reject: Some(payload.into()),
            ..Self::new()
        }
    }

    /// Returns the payloads received so far, in order.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.payloads.lock().expect("lock").clone()
    }

    /// Returns the payloads received so far as strings, sorted.
    pub fn sorted_strings(&self) -> Vec<String> {
        let mut strings: Vec<String> = self
            .payloads()
            .into_iter()
            .map(|payload| String::from_utf8_lossy(&payload).into_owned())
            .collect();
        strings.sort();
        strings
    }

    /// Returns true once `done` was called.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` payloads arrived.
    pub async fn wait_for(&self, count: usize) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|current| *current >= count).await;
    }
}

#[async_trait]
impl MessageHandler for CollectingHandler {
    async fn handle(&self, data: &[u8]) -> Result<(), HandlerError> {
        let count = {
            let mut payloads = self.payloads.lock().expect("lock");
            payloads.push(data.to_vec());
            payloads.len()
        };
        self.count.send_replace(count);

        if self.reject.as_deref() == Some(data) {
            return Err(format!("rejected {}", String::from_utf8_lossy(data)).into());
        }
        Ok(())
    }

    fn done(&self) {
        self.done.store(true, Ordering::SeqCst);
    }
}
