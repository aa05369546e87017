//! Bounded hand-off between a producing stream and its consumer.
//!
//! [`apply`] moves the upstream into a forwarding task that feeds a bounded
//! channel of `capacity` slots. Under [`BackpressureStrategy::Buffer`] the
//! forwarder waits for a free slot, so a slow consumer slows the producer
//! and nothing is lost. Under [`BackpressureStrategy::Drop`] a full channel
//! discards the newest item and bumps the step's [`DropCounter`]. Errors are
//! never dropped.

use crate::config::BackpressureStrategy;
use crate::error::Result;
use crate::events::{self, Event, EventHandler};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Shared count of items discarded by the drop strategy.
#[derive(Debug, Clone, Default)]
pub struct DropCounter(Arc<AtomicU64>);

impl DropCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Everything [`apply`] needs besides the stream itself.
#[derive(Clone)]
pub struct Backpressure {
    pub step: String,
    pub strategy: BackpressureStrategy,
    pub capacity: usize,
    pub drops: DropCounter,
    pub events: Option<Arc<dyn EventHandler>>,
}

/// Route `upstream` through a bounded buffer.
///
/// Must be called within a Tokio runtime. The forwarding task ends when
/// upstream is exhausted or the returned stream is dropped.
pub fn apply(
    upstream: BoxStream<'static, Result<Value>>,
    bp: Backpressure,
) -> BoxStream<'static, Result<Value>> {
    let (tx, rx) = mpsc::channel(bp.capacity.max(1));
    tokio::spawn(forward(upstream, tx, bp));
    stream::unfold(rx, |mut rx| async move {
        let item = rx.recv().await?;
        Some((item, rx))
    })
    .boxed()
}

async fn forward(
    mut upstream: BoxStream<'static, Result<Value>>,
    tx: mpsc::Sender<Result<Value>>,
    bp: Backpressure,
) {
    while let Some(item) = upstream.next().await {
        let keep_going = match bp.strategy {
            BackpressureStrategy::Buffer => tx.send(item).await.is_ok(),
            BackpressureStrategy::Drop if item.is_err() => tx.send(item).await.is_ok(),
            BackpressureStrategy::Drop => match tx.try_send(item) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    let total = bp.drops.increment();
                    debug!(step = %bp.step, total, "buffer full, dropped newest item");
                    events::emit(
                        &bp.events,
                        Event::ItemDropped {
                            name: bp.step.clone(),
                            total,
                        },
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            },
        };
        if !keep_going {
            debug!(step = %bp.step, "consumer gone, stopping forwarder");
            break;
        }
    }
}
