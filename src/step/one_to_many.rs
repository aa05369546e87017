use super::contract::{self, Failed};
use super::{decode, encode, expansion, StepMeta};
use crate::config::{ConfigHandle, StepConfig};
use crate::error::Result;
use crate::exec_ctx::ExecCtx;
use crate::flow::{Flow, ItemStream};
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

pub(crate) const KIND: &str = "one-to-many";

type ExpandFn = Arc<dyn Fn(Value) -> ItemStream + Send + Sync>;

/// One item in, a sub-stream of items out.
///
/// Each attempt's sub-stream is drained before anything is emitted, so a
/// retried item never emits partial output twice. Sub-streams are
/// concatenated in upstream order, or with `parallel = true` interleaved as
/// they complete. The flattened output passes through the step's
/// backpressure buffer.
pub struct OneToMany {
    meta: StepMeta,
    expand: ExpandFn,
}

impl OneToMany {
    pub fn new<F, S>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        Self {
            meta: StepMeta::new(name),
            expand: Arc::new(move |item| f(item).boxed()),
        }
    }

    /// Expansion computed as a whole by a future.
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Value>>> + Send + 'static,
    {
        Self::new(name, move |item| {
            stream::once(f(item))
                .map_ok(|items| stream::iter(items.into_iter().map(Ok)))
                .try_flatten()
        })
    }

    /// Expansion over serde types.
    pub fn typed<I, O, F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<O>>> + Send + 'static,
    {
        let name = name.into();
        let step = name.clone();
        let f = Arc::new(f);
        Self::from_fn(name, move |item| {
            let f = f.clone();
            let step = step.clone();
            async move {
                let input: I = decode(&step, item)?;
                f(input)
                    .await?
                    .into_iter()
                    .map(|o| encode(&step, o))
                    .collect()
            }
        })
    }

    super::step_meta_methods!();

    /// Expand one item under the retry contract.
    pub async fn call(
        &self,
        ctx: &ExecCtx,
        config: &StepConfig,
        item: Value,
    ) -> Result<Option<Vec<Value>>> {
        contract::require_input(&self.meta.name, &item)?;
        if config.debug {
            debug!(step = %self.meta.name, item = %item, "expanding item");
        }
        let sink = self.meta.sink();
        let expanded = contract::invoke(
            ctx,
            &self.meta.name,
            KIND,
            config,
            &sink,
            Failed::Item(&item),
            |_| (self.expand)(item.clone()).try_collect::<Vec<Value>>(),
        )
        .await?;
        if config.debug {
            if let Some(ref items) = expanded {
                debug!(step = %self.meta.name, count = items.len(), "expanded item");
            }
        }
        Ok(expanded)
    }

    pub(crate) fn apply(self: &Arc<Self>, ctx: &ExecCtx, handle: &ConfigHandle, flow: Flow) -> Flow {
        let config = handle.effective();
        let this = self.clone();
        let task_ctx = ctx.clone();
        let handle = handle.clone();
        let expand_one = move |item: Result<Value>| -> ItemStream {
            let this = this.clone();
            let ctx = task_ctx.clone();
            let handle = handle.clone();
            stream::once(async move { this.call(&ctx, &handle.effective(), item?).await })
                .flat_map(expansion)
                .boxed()
        };
        let upstream = flow.into_stream();
        let flattened = if config.parallel {
            upstream
                .flat_map_unordered(config.backpressure_buffer_capacity, expand_one)
                .boxed()
        } else {
            upstream.flat_map(expand_one).boxed()
        };
        Flow::Stream(self.meta.backpressure(ctx, &config, flattened))
    }
}

impl std::fmt::Debug for OneToMany {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneToMany").field("meta", &self.meta).finish()
    }
}
