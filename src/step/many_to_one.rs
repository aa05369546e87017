use super::contract::{self, Failed};
use super::{decode, encode, StepMeta};
use crate::batch;
use crate::config::{ConfigHandle, StepConfig};
use crate::error::Result;
use crate::events::{self, Event};
use crate::exec_ctx::ExecCtx;
use crate::flow::{skip_dead_letters, BoxFut, Flow};
use crate::PipelineError;
use futures::future;
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

pub(crate) const KIND: &str = "many-to-one";

type ReduceFn = Arc<dyn Fn(Vec<Value>) -> BoxFut<'static, Result<Value>> + Send + Sync>;

/// What a batch step hands downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchOutput {
    /// A single item: the result of the final batch. Earlier batch results
    /// are computed and discarded.
    #[default]
    Last,
    /// A stream carrying every batch's result.
    All,
}

/// A stream in, one item per batch window out.
///
/// Windows close on `batch_size` items or `batch_timeout` after their first
/// item. The upstream feeding the windows goes through the step's
/// backpressure strategy. An upstream that yields nothing fails with
/// `EmptyInputNotAllowed`.
pub struct ManyToOne {
    meta: StepMeta,
    reduce: ReduceFn,
    output: BatchOutput,
}

impl ManyToOne {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            meta: StepMeta::new(name),
            reduce: Arc::new(move |batch| Box::pin(f(batch))),
            output: BatchOutput::default(),
        }
    }

    /// Reduction over serde types.
    pub fn typed<I, O, F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let name = name.into();
        let step = name.clone();
        let f = Arc::new(f);
        Self::new(name, move |batch| {
            let f = f.clone();
            let step = step.clone();
            async move {
                let inputs = batch
                    .into_iter()
                    .map(|item| decode(&step, item))
                    .collect::<Result<Vec<I>>>()?;
                encode(&step, f(inputs).await?)
            }
        })
    }

    pub fn with_output(mut self, output: BatchOutput) -> Self {
        self.output = output;
        self
    }

    pub fn output(&self) -> BatchOutput {
        self.output
    }

    super::step_meta_methods!();

    /// Reduce one closed batch under the retry contract.
    pub async fn call(
        &self,
        ctx: &ExecCtx,
        config: &StepConfig,
        items: Vec<Value>,
    ) -> Result<Option<Value>> {
        for item in &items {
            contract::require_input(&self.meta.name, item)?;
        }
        let sink = self.meta.sink();
        contract::invoke(
            ctx,
            &self.meta.name,
            KIND,
            config,
            &sink,
            Failed::Batch(&items),
            |_| (self.reduce)(items.clone()),
        )
        .await
    }

    pub(crate) fn apply(self: &Arc<Self>, ctx: &ExecCtx, handle: &ConfigHandle, flow: Flow) -> Flow {
        let config = handle.effective();
        let step = self.meta.name.clone();
        let upstream = self.meta.backpressure(ctx, &config, flow.into_stream());
        let windows = batch::windows(upstream, config.batch_size, config.batch_timeout);

        let non_empty = stream::once(async move {
            let mut windows = windows.peekable();
            if Pin::new(&mut windows).peek().await.is_none() {
                let empty = Err(PipelineError::EmptyInputNotAllowed { step });
                return stream::once(future::ready(empty)).boxed();
            }
            windows.boxed()
        })
        .flatten();

        let this = self.clone();
        let ctx = ctx.clone();
        let handle = handle.clone();
        let results = non_empty.then(move |window| {
            let this = this.clone();
            let ctx = ctx.clone();
            let handle = handle.clone();
            async move {
                let window = window?;
                let config = handle.effective();
                let size = window.items.len();
                if config.debug {
                    debug!(step = %this.meta.name, size, reason = ?window.reason, "batch closed");
                }
                events::emit(
                    &ctx.event_handler,
                    Event::BatchClosed {
                        name: this.meta.name.clone(),
                        size,
                        reason: window.reason,
                    },
                );
                this.call(&ctx, &config, window.items).await
            }
        });

        match self.output {
            BatchOutput::All => Flow::Stream(skip_dead_letters(results)),
            BatchOutput::Last => Flow::Single(Box::pin(async move {
                let mut results = results.boxed();
                let mut last = None;
                while let Some(result) = results.next().await {
                    last = result?;
                }
                Ok(last)
            })),
        }
    }
}

impl std::fmt::Debug for ManyToOne {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManyToOne")
            .field("meta", &self.meta)
            .field("output", &self.output)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackpressureStrategy;
    use crate::dead_letter::CollectingDeadLetter;
    use crate::events::EventLog;
    use serde_json::json;
    use std::time::Duration;

    fn collect_batches(name: &str) -> ManyToOne {
        ManyToOne::new(name, |batch| async move { Ok(Value::Array(batch)) })
    }

    fn config(size: usize, timeout_ms: u64) -> StepConfig {
        StepConfig::default()
            .with_batch_size(size)
            .and_then(|c| c.with_batch_timeout(Duration::from_millis(timeout_ms)))
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_batches_by_size() {
        let step = Arc::new(collect_batches("b").with_output(BatchOutput::All));
        let handle = ConfigHandle::fixed("b", config(3, 1000));
        let flow = Flow::iter(["a", "b", "c", "d", "e", "f"].map(|s| json!(s)));
        let out = step
            .apply(&ExecCtx::default(), &handle, flow)
            .collect()
            .await
            .unwrap();
        assert_eq!(out, vec![json!(["a", "b", "c"]), json!(["d", "e", "f"])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_keeps_only_final_batch() {
        let step = Arc::new(collect_batches("b"));
        let handle = ConfigHandle::fixed("b", config(2, 1000));
        let flow = Flow::iter((1..=5).map(|n| json!(n)).collect::<Vec<_>>());
        let out = step.apply(&ExecCtx::default(), &handle, flow);
        assert!(!out.is_stream());
        assert_eq!(out.last().await.unwrap(), Some(json!([5])));
    }

    #[tokio::test]
    async fn test_empty_upstream_is_an_error() {
        for output in [BatchOutput::Last, BatchOutput::All] {
            let step = Arc::new(collect_batches("sum").with_output(output));
            let handle = ConfigHandle::fixed("sum", StepConfig::default());
            let err = step
                .apply(&ExecCtx::default(), &handle, Flow::iter(Vec::new()))
                .collect()
                .await
                .unwrap_err();
            assert!(matches!(err, PipelineError::EmptyInputNotAllowed { ref step } if step == "sum"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_closes_partial_batch() {
        let step = Arc::new(collect_batches("b").with_output(BatchOutput::All));
        let handle = ConfigHandle::fixed("b", config(3, 250));
        let slow = stream::iter(0..2)
            .then(|i| async move {
                tokio::time::sleep(Duration::from_millis(400)).await;
                Ok(json!(i))
            })
            .boxed();
        let out = step
            .apply(&ExecCtx::default(), &handle, Flow::Stream(slow))
            .collect()
            .await
            .unwrap();
        assert_eq!(out, vec![json!([0]), json!([1])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_batch_dead_lettered_yields_none() {
        let sink = CollectingDeadLetter::new();
        let step = Arc::new(
            ManyToOne::new("sum", |_batch| async {
                Err(PipelineError::TransientFailure("db down".into()))
            })
            .with_dead_letter(sink.clone()),
        );
        let config = config(2, 1000)
            .with_retry_limit(0)
            .with_recover_on_failure(true);
        let handle = ConfigHandle::fixed("sum", config);
        let flow = Flow::iter((0..4).map(|n| json!(n)).collect::<Vec<_>>());
        let out = step.apply(&ExecCtx::default(), &handle, flow).last().await.unwrap();
        assert_eq!(out, None);
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.entries()[0].item, json!([0, 1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_strategy_applies_to_batch_input() {
        let log = Arc::new(EventLog::new());
        let ctx = ExecCtx::builder().event_handler(log.clone()).build();
        let step = Arc::new(
            ManyToOne::new("count", |batch: Vec<Value>| async move { Ok(json!(batch.len())) })
                .with_output(BatchOutput::All),
        );
        let config = config(5, 1000)
            .with_backpressure_strategy(BackpressureStrategy::Drop)
            .with_backpressure_buffer_capacity(1)
            .unwrap();
        let handle = ConfigHandle::fixed("count", config);
        let flow = Flow::iter((0..200).map(|n| json!(n)).collect::<Vec<_>>());

        let counts = step.apply(&ctx, &handle, flow).collect().await.unwrap();
        let batched: u64 = counts.iter().filter_map(Value::as_u64).sum();
        let dropped = step.dropped();
        assert!(dropped > 0);
        assert_eq!(batched + dropped, 200);
        assert_eq!(
            log.count(|e| matches!(e, Event::ItemDropped { .. })) as u64,
            dropped
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_strategy_keeps_every_batched_item() {
        let step = Arc::new(
            ManyToOne::new("count", |batch: Vec<Value>| async move { Ok(json!(batch.len())) })
                .with_output(BatchOutput::All),
        );
        let config = config(7, 1000).with_backpressure_buffer_capacity(1).unwrap();
        let handle = ConfigHandle::fixed("count", config);
        let flow = Flow::iter((0..50).map(|n| json!(n)).collect::<Vec<_>>());

        let counts = step
            .apply(&ExecCtx::default(), &handle, flow)
            .collect()
            .await
            .unwrap();
        assert_eq!(counts.iter().filter_map(Value::as_u64).sum::<u64>(), 50);
        assert_eq!(step.dropped(), 0);
    }

    #[tokio::test]
    async fn test_null_in_batch_rejected() {
        let step = collect_batches("b");
        let err = step
            .call(&ExecCtx::default(), &StepConfig::default(), vec![json!(1), Value::Null])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NullInput { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_typed_reduce() {
        let step = Arc::new(ManyToOne::typed("sum", |nums: Vec<u64>| async move {
            Ok(nums.iter().sum::<u64>())
        }));
        let handle = ConfigHandle::fixed("sum", config(10, 1000));
        let flow = Flow::iter((1..=4).map(|n| json!(n)).collect::<Vec<_>>());
        let out = step.apply(&ExecCtx::default(), &handle, flow).last().await.unwrap();
        assert_eq!(out, Some(json!(10)));
    }
}
