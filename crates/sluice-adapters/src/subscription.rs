//! Subscription loop driving queue and pub/sub producers.
//!
//! A producer connection is modelled as a stream of frames. Each loop
//! handles one frame at a time so per-connection ordering is preserved;
//! independent subscriptions run as independent tasks.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use sluice_core::{hand_off, EnvelopeSink, SourceKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::AdapterSet;

/// Counters reported when a subscription loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Frames read from the producer.
    pub frames: u64,
    /// Envelopes accepted by the sink.
    pub delivered: u64,
    /// Frames dropped as unsupported.
    pub rejected: u64,
    /// Envelopes the sink refused.
    pub lost: u64,
}

/// One producer subscription feeding the delivery sink.
#[derive(Debug, Clone)]
pub struct Subscription {
    name: String,
    kind: SourceKind,
    sink: Arc<dyn EnvelopeSink>,
    adapters: AdapterSet,
}

impl Subscription {
    /// Creates a subscription for producer `kind`.
    pub fn new(name: impl Into<String>, kind: SourceKind, sink: Arc<dyn EnvelopeSink>) -> Self {
        Self { name: name.into(), kind, sink, adapters: AdapterSet }
    }

    /// Subscription name, for logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consumes frames until the stream ends or `cancel` fires.
    ///
    /// Cancellation is checked between frames; a frame already being
    /// delivered is finished first.
    pub async fn run<S>(&self, frames: S, cancel: CancellationToken) -> SubscriptionStats
    where
        S: Stream<Item = Bytes>,
    {
        let mut frames = std::pin::pin!(frames);
        let mut stats = SubscriptionStats::default();

        info!(subscription = %self.name, kind = %self.kind, "subscription started");

        loop {
            let frame = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(subscription = %self.name, "subscription cancelled");
                    break;
                }
                frame = frames.next() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            stats.frames += 1;
            self.handle_frame(&frame, &mut stats).await;
        }

        info!(
            subscription = %self.name,
            kind = %self.kind,
            frames = stats.frames,
            delivered = stats.delivered,
            rejected = stats.rejected,
            lost = stats.lost,
            "subscription stopped"
        );
        stats
    }

    async fn handle_frame(&self, frame: &[u8], stats: &mut SubscriptionStats) {
        let envelopes = match self.adapters.normalize_frame(self.kind, frame) {
            Ok(envelopes) => envelopes,
            Err(e) => {
                warn!(
                    subscription = %self.name,
                    kind = %self.kind,
                    code = e.code(),
                    error = %e,
                    "dropping unsupported frame"
                );
                stats.rejected += 1;
                return;
            },
        };

        for envelope in envelopes {
            match hand_off(self.sink.as_ref(), envelope).await {
                Ok(()) => stats.delivered += 1,
                Err(_) => stats.lost += 1,
            }
        }
    }

    /// Runs the loop on its own task.
    pub fn spawn<S>(self, frames: S) -> SubscriptionHandle
    where
        S: Stream<Item = Bytes> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { self.run(frames, token).await });
        SubscriptionHandle { handle, cancel }
    }
}

/// Handle to a spawned subscription loop.
#[derive(Debug)]
pub struct SubscriptionHandle {
    handle: JoinHandle<SubscriptionStats>,
    cancel: CancellationToken,
}

impl SubscriptionHandle {
    /// Whether the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the producer stream to end on its own.
    pub async fn join(self) -> Option<SubscriptionStats> {
        self.handle.await.ok()
    }

    /// Cancels the loop and waits up to `timeout` for it to exit.
    ///
    /// Returns `None` if the loop had to be aborted or panicked.
    pub async fn stop(mut self, timeout: Duration) -> Option<SubscriptionStats> {
        self.cancel.cancel();
        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(result) => result.ok(),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "subscription did not stop in time, aborting");
                self.handle.abort();
                None
            },
        }
    }
}
