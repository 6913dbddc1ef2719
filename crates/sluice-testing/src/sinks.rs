//! Delivery sinks for asserting what reached the downstream collaborator.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use sluice_core::{Envelope, EnvelopeSink, SinkError};
use tokio::sync::{watch, Notify};

/// Sink that keeps every accepted envelope.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    received: Arc<Mutex<Vec<Envelope>>>,
    notify: Arc<Notify>,
}

impl RecordingSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of envelopes accepted so far.
    pub fn count(&self) -> usize {
        self.received.lock().map(|r| r.len()).unwrap_or_default()
    }

    /// Removes and returns every envelope accepted so far.
    pub fn take(&self) -> Vec<Envelope> {
        self.received.lock().map(|mut r| std::mem::take(&mut *r)).unwrap_or_default()
    }

    /// Waits until at least `n` envelopes arrived. Returns `false` on timeout.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.count() >= n {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl EnvelopeSink for RecordingSink {
    async fn accept(&self, envelope: Envelope) -> Result<(), SinkError> {
        if let Ok(mut received) = self.received.lock() {
            received.push(envelope);
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Sink that rejects everything.
#[derive(Debug, Clone, Default)]
pub struct FailingSink;

#[async_trait]
impl EnvelopeSink for FailingSink {
    async fn accept(&self, _envelope: Envelope) -> Result<(), SinkError> {
        Err(SinkError::Rejected("trigger engine unavailable".to_string()))
    }
}

/// Sink that parks every call until released.
///
/// Used to hold a request in flight while a listener drains.
#[derive(Debug, Clone)]
pub struct BlockingSink {
    inner: RecordingSink,
    entered: Arc<Notify>,
    release: Arc<watch::Sender<bool>>,
}

impl BlockingSink {
    /// Creates a sink that blocks until [`BlockingSink::release`].
    pub fn new() -> Self {
        let (release, _) = watch::channel(false);
        Self { inner: RecordingSink::new(), entered: Arc::new(Notify::new()), release: Arc::new(release) }
    }

    /// Waits until some call has entered `accept`.
    pub async fn wait_until_entered(&self) {
        self.entered.notified().await;
    }

    /// Lets every parked and future call complete.
    pub fn release(&self) {
        self.release.send_replace(true);
    }

    /// Envelopes accepted after release.
    pub fn count(&self) -> usize {
        self.inner.count()
    }
}

impl Default for BlockingSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EnvelopeSink for BlockingSink {
    async fn accept(&self, envelope: Envelope) -> Result<(), SinkError> {
        self.entered.notify_one();
        let mut released = self.release.subscribe();
        released.wait_for(|released| *released).await.map_err(|_| SinkError::Closed)?;
        self.inner.accept(envelope).await
    }
}
