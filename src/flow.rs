//! The value threaded from step to step: one future item or a stream of items.

use crate::error::Result;
use crate::exec_ctx::ExecCtx;
use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

/// A boxed, pinned, Send future.
pub type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A stream of items; the first `Err` is terminal.
pub type ItemStream = BoxStream<'static, Result<Value>>;

/// A single item. `Ok(None)` means the item was dead-lettered upstream.
pub type ItemFuture = BoxFuture<'static, Result<Option<Value>>>;

/// Current shape of the data moving through a pipeline.
pub enum Flow {
    Single(ItemFuture),
    Stream(ItemStream),
}

impl Flow {
    /// A single, already available item.
    pub fn value(item: Value) -> Self {
        Flow::Single(Box::pin(future::ready(Ok(Some(item)))))
    }

    /// A single item produced by `fut`.
    pub fn future<F>(fut: F) -> Self
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        Flow::Single(Box::pin(async move { fut.await.map(Some) }))
    }

    /// A finite stream over `items`.
    pub fn iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Flow::Stream(stream::iter(items.into_iter().map(Ok)).boxed())
    }

    /// Any stream of fallible items.
    pub fn stream<S>(items: S) -> Self
    where
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        Flow::Stream(items.boxed())
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Flow::Stream(_))
    }

    /// View as a stream: a single item becomes a one-element stream, a
    /// dead-lettered single item an empty one.
    pub fn into_stream(self) -> ItemStream {
        match self {
            Flow::Stream(s) => s,
            Flow::Single(fut) => stream::once(fut)
                .filter_map(|r| future::ready(r.transpose()))
                .boxed(),
        }
    }

    /// Drive to completion, gathering every item. Stops at the first error.
    pub async fn collect(self) -> Result<Vec<Value>> {
        match self {
            Flow::Single(fut) => Ok(fut.await?.into_iter().collect()),
            Flow::Stream(mut s) => {
                let mut items = Vec::new();
                while let Some(item) = s.next().await {
                    items.push(item?);
                }
                Ok(items)
            }
        }
    }

    /// Drive to completion, keeping only the final item.
    pub async fn last(self) -> Result<Option<Value>> {
        match self {
            Flow::Single(fut) => fut.await,
            Flow::Stream(mut s) => {
                let mut last = None;
                while let Some(item) = s.next().await {
                    last = Some(item?);
                }
                Ok(last)
            }
        }
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Flow::Single(_) => f.write_str("Flow::Single(..)"),
            Flow::Stream(_) => f.write_str("Flow::Stream(..)"),
        }
    }
}

/// End the stream right after its first error.
pub(crate) fn fuse_on_error(items: ItemStream) -> ItemStream {
    items
        .scan(false, |failed, item| {
            if *failed {
                return future::ready(None);
            }
            *failed = item.is_err();
            future::ready(Some(item))
        })
        .boxed()
}

/// Fail the stream with `Cancelled`/`DeadlineExceeded` between items.
pub(crate) fn guard(ctx: &ExecCtx, items: ItemStream) -> ItemStream {
    let ctx = ctx.clone();
    items
        .map(move |item| {
            ctx.check_cancelled()?;
            item
        })
        .boxed()
}

/// Drop dead-lettered (`None`) results from a stream of invocations.
pub(crate) fn skip_dead_letters<S>(results: S) -> ItemStream
where
    S: Stream<Item = Result<Option<Value>>> + Send + 'static,
{
    results
        .filter_map(|r| future::ready(r.transpose()))
        .boxed()
}
