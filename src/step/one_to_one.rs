use super::contract::{self, Failed};
use super::{decode, encode, StepMeta};
use crate::config::{ConfigHandle, StepConfig};
use crate::error::Result;
use crate::exec_ctx::ExecCtx;
use crate::flow::{skip_dead_letters, BoxFut, Flow};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

pub(crate) const KIND: &str = "one-to-one";

type AsyncFn = Arc<dyn Fn(Value) -> BoxFut<'static, Result<Value>> + Send + Sync>;
type BlockingFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;
type ContextualFn =
    Arc<dyn Fn(ExecCtx, StepConfig, Value) -> BoxFut<'static, Result<Value>> + Send + Sync>;

#[derive(Clone)]
enum Transform {
    Async(AsyncFn),
    Blocking(BlockingFn),
    Contextual(ContextualFn),
}

/// One item in, one item out.
///
/// Over a stream, items are processed one at a time in arrival order, or
/// with `parallel = true` up to `backpressure_buffer_capacity` at once with
/// outputs in completion order.
///
/// # Example
///
/// ```
/// use pipeline_framework::step::OneToOne;
/// use serde_json::{json, Value};
///
/// let upper = OneToOne::new("upper", |item: Value| async move {
///     Ok(json!(item.as_str().unwrap_or_default().to_uppercase()))
/// });
/// assert_eq!(upper.name(), "upper");
/// ```
pub struct OneToOne {
    meta: StepMeta,
    transform: Transform,
}

impl OneToOne {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            meta: StepMeta::new(name),
            transform: Transform::Async(Arc::new(move |item| Box::pin(f(item)))),
        }
    }

    /// A synchronous transformation. With `run_blocking = true` it runs on
    /// the context's blocking pool; otherwise inline.
    pub fn blocking<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            meta: StepMeta::new(name),
            transform: Transform::Blocking(Arc::new(f)),
        }
    }

    /// A transformation that also sees the execution context and the
    /// effective config of the current attempt.
    pub fn contextual<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ExecCtx, StepConfig, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            meta: StepMeta::new(name),
            transform: Transform::Contextual(Arc::new(move |ctx, config, item| {
                Box::pin(f(ctx, config, item))
            })),
        }
    }

    /// A transformation over serde types. Shape mismatches are programmer errors.
    pub fn typed<I, O, F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let name = name.into();
        let step = name.clone();
        let f = Arc::new(f);
        Self::new(name, move |item| {
            let f = f.clone();
            let step = step.clone();
            async move {
                let input: I = decode(&step, item)?;
                encode(&step, f(input).await?)
            }
        })
    }

    super::step_meta_methods!();

    async fn attempt(&self, ctx: &ExecCtx, config: &StepConfig, item: Value) -> Result<Value> {
        match &self.transform {
            Transform::Async(f) => f(item).await,
            Transform::Blocking(f) if config.run_blocking => {
                let f = f.clone();
                ctx.pool.run(move || f(item)).await
            }
            Transform::Blocking(f) => f(item),
            Transform::Contextual(f) => f(ctx.clone(), config.clone(), item).await,
        }
    }

    /// Process one item under the retry contract.
    ///
    /// `Ok(None)` means the item was dead-lettered.
    pub async fn call(&self, ctx: &ExecCtx, config: &StepConfig, item: Value) -> Result<Option<Value>> {
        contract::require_input(&self.meta.name, &item)?;
        if config.debug {
            debug!(step = %self.meta.name, item = %item, "processing item");
        }
        let sink = self.meta.sink();
        contract::invoke(
            ctx,
            &self.meta.name,
            KIND,
            config,
            &sink,
            Failed::Item(&item),
            |_| self.attempt(ctx, config, item.clone()),
        )
        .await
    }

    pub(crate) fn apply(self: &Arc<Self>, ctx: &ExecCtx, handle: &ConfigHandle, flow: Flow) -> Flow {
        let this = self.clone();
        let ctx = ctx.clone();
        let handle = handle.clone();
        match flow {
            Flow::Single(fut) => Flow::Single(Box::pin(async move {
                match fut.await? {
                    Some(item) => this.call(&ctx, &handle.effective(), item).await,
                    None => Ok(None),
                }
            })),
            Flow::Stream(upstream) => {
                let config = handle.effective();
                let calls = upstream.map(move |item| {
                    let this = this.clone();
                    let ctx = ctx.clone();
                    let handle = handle.clone();
                    async move { this.call(&ctx, &handle.effective(), item?).await }
                });
                let results = if config.parallel {
                    calls
                        .buffer_unordered(config.backpressure_buffer_capacity)
                        .boxed()
                } else {
                    calls.buffered(1).boxed()
                };
                Flow::Stream(skip_dead_letters(results))
            }
        }
    }
}

impl std::fmt::Debug for OneToOne {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let transform = match self.transform {
            Transform::Async(_) => "async",
            Transform::Blocking(_) => "blocking",
            Transform::Contextual(_) => "contextual",
        };
        f.debug_struct("OneToOne")
            .field("meta", &self.meta)
            .field("transform", &transform)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::CollectingDeadLetter;
    use crate::PipelineError;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast(retries: u32) -> StepConfig {
        StepConfig::default()
            .with_retry_limit(retries)
            .with_retry_wait(Duration::from_millis(5))
            .unwrap()
    }

    #[tokio::test]
    async fn test_null_input_fails_without_invoking() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let step = OneToOne::new("s", move |v| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(v) }
        });
        let err = step
            .call(&ExecCtx::default(), &fast(3), Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NullInput { ref step } if step == "s"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound_is_n_plus_one() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let step = OneToOne::new("s", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(PipelineError::TransientFailure("503".into())) }
        });
        let err = step
            .call(&ExecCtx::default(), &fast(4), json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::PermanentFailure { attempts: 5, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_routes_to_step_sink() {
        let sink = CollectingDeadLetter::new();
        let step = OneToOne::new("s", |_| async {
            Err(PipelineError::TransientFailure("503".into()))
        })
        .with_dead_letter(sink.clone());
        let config = fast(1).with_recover_on_failure(true);
        let out = step.call(&ExecCtx::default(), &config, json!("a")).await.unwrap();
        assert!(out.is_none());
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_stream_preserves_order() {
        let step = Arc::new(OneToOne::new("s", |v: Value| async move {
            let n = v.as_u64().unwrap_or(0);
            // Later items finish sooner.
            tokio::time::sleep(Duration::from_millis(100 - n * 10)).await;
            Ok(json!(n * 2))
        }));
        let handle = ConfigHandle::fixed("s", StepConfig::default());
        let flow = Flow::iter((0..8).map(|n| json!(n)).collect::<Vec<_>>());
        let out = step
            .apply(&ExecCtx::default(), &handle, flow)
            .collect()
            .await
            .unwrap();
        assert_eq!(out, (0..8).map(|n| json!(n * 2)).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_stream_completes_all() {
        let step = Arc::new(OneToOne::new("s", |v: Value| async move {
            let n = v.as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(100 - n * 10)).await;
            Ok(json!(n))
        }));
        let handle = ConfigHandle::fixed("s", StepConfig::default().with_parallel(true));
        let flow = Flow::iter((0..8).map(|n| json!(n)).collect::<Vec<_>>());
        let mut out = step
            .apply(&ExecCtx::default(), &handle, flow)
            .collect()
            .await
            .unwrap();
        assert_eq!(out.first(), Some(&json!(7)));
        out.sort_by_key(|v| v.as_u64());
        assert_eq!(out, (0..8).map(|n| json!(n)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_blocking_runs_on_pool() {
        let step = Arc::new(OneToOne::blocking("s", |v| {
            std::thread::sleep(Duration::from_millis(1));
            Ok(json!(v.as_i64().unwrap_or(0) + 1))
        }));
        let handle = ConfigHandle::fixed("s", StepConfig::default().with_run_blocking(true));
        let out = step
            .apply(&ExecCtx::default(), &handle, Flow::value(json!(41)))
            .last()
            .await
            .unwrap();
        assert_eq!(out, Some(json!(42)));
    }

    #[derive(Deserialize)]
    struct Amount {
        cents: u64,
    }

    #[derive(Serialize)]
    struct Doubled {
        cents: u64,
    }

    #[tokio::test]
    async fn test_typed_step_and_shape_mismatch() {
        let step = OneToOne::typed("double", |a: Amount| async move {
            Ok(Doubled { cents: a.cents * 2 })
        });
        let ctx = ExecCtx::default();
        let out = step.call(&ctx, &fast(3), json!({"cents": 21})).await.unwrap();
        assert_eq!(out, Some(json!({"cents": 42})));

        let err = step.call(&ctx, &fast(3), json!("nope")).await.unwrap_err();
        assert!(matches!(err, PipelineError::ProgrammerError(_)));
    }

    #[tokio::test]
    async fn test_contextual_sees_effective_config() {
        let step = Arc::new(OneToOne::contextual(
            "ctx",
            |_ctx: ExecCtx, config: StepConfig, item: Value| async move {
                Ok(json!({ "item": item, "auto_persist": config.auto_persist }))
            },
        ));
        assert!(format!("{:?}", step).contains("contextual"));

        let handle = ConfigHandle::fixed("ctx", StepConfig::default().with_auto_persist(true));
        let out = step
            .apply(&ExecCtx::default(), &handle, Flow::value(json!(7)))
            .last()
            .await
            .unwrap();
        assert_eq!(out, Some(json!({ "item": 7, "auto_persist": true })));
    }
}
