//! Size-or-time batch windows.
//!
//! A window opens on the first item after the previous one closed and its
//! timer starts then. It closes the instant it holds `size` items or
//! `timeout` has elapsed since it opened, whichever comes first. A partial
//! window pending when upstream ends is still emitted. An upstream error
//! flushes the pending window first, then surfaces and ends the stream.

use crate::error::Result;
use crate::events::CloseReason;
use crate::PipelineError;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// A closed window.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub items: Vec<Value>,
    pub reason: CloseReason,
}

struct Window {
    upstream: BoxStream<'static, Result<Value>>,
    size: usize,
    timeout: Duration,
    pending: Vec<Value>,
    deadline: Option<Instant>,
    error: Option<PipelineError>,
    done: bool,
}

impl Window {
    fn close(&mut self, reason: CloseReason) -> Batch {
        self.deadline = None;
        Batch {
            items: std::mem::take(&mut self.pending),
            reason,
        }
    }
}

enum Polled {
    Item(Option<Result<Value>>),
    Expired,
}

/// Group `upstream` into windows of at most `size` items.
pub fn windows(
    upstream: BoxStream<'static, Result<Value>>,
    size: usize,
    timeout: Duration,
) -> BoxStream<'static, Result<Batch>> {
    let state = Window {
        upstream,
        size: size.max(1),
        timeout,
        pending: Vec::new(),
        deadline: None,
        error: None,
        done: false,
    };
    stream::unfold(state, |mut w| async move {
        loop {
            if let Some(err) = w.error.take() {
                return Some((Err(err), w));
            }
            if w.done {
                if w.pending.is_empty() {
                    return None;
                }
                let batch = w.close(CloseReason::End);
                return Some((Ok(batch), w));
            }

            let polled = match w.deadline {
                Some(deadline) => tokio::select! {
                    biased;
                    item = w.upstream.next() => Polled::Item(item),
                    _ = sleep_until(deadline) => Polled::Expired,
                },
                None => Polled::Item(w.upstream.next().await),
            };

            match polled {
                Polled::Expired => {
                    let batch = w.close(CloseReason::Timeout);
                    return Some((Ok(batch), w));
                }
                Polled::Item(Some(Ok(item))) => {
                    if w.pending.is_empty() {
                        w.deadline = Some(Instant::now() + w.timeout);
                    }
                    w.pending.push(item);
                    if w.pending.len() >= w.size {
                        let batch = w.close(CloseReason::Size);
                        return Some((Ok(batch), w));
                    }
                }
                Polled::Item(Some(Err(err))) => {
                    w.done = true;
                    if w.pending.is_empty() {
                        return Some((Err(err), w));
                    }
                    w.error = Some(err);
                    let batch = w.close(CloseReason::End);
                    return Some((Ok(batch), w));
                }
                Polled::Item(None) => {
                    w.done = true;
                }
            }
        }
    })
    .boxed()
}
