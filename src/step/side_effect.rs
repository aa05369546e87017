use super::contract::{self, Failed};
use super::{decode, StepMeta};
use crate::config::{ConfigHandle, StepConfig};
use crate::error::Result;
use crate::exec_ctx::ExecCtx;
use crate::flow::{skip_dead_letters, BoxFut, Flow};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

pub(crate) const KIND: &str = "side-effect";

type AsyncEffect = Arc<dyn Fn(Value) -> BoxFut<'static, Result<()>> + Send + Sync>;
type BlockingEffect = Arc<dyn Fn(Value) -> Result<()> + Send + Sync>;

#[derive(Clone)]
enum Effect {
    Async(AsyncEffect),
    Blocking(BlockingEffect),
}

/// Performs an effect per item and passes the item through unchanged.
///
/// Over a stream at most `concurrency` effects are in flight. Output keeps
/// input order unless `parallel = true`. A dead-lettered item is not passed
/// on.
pub struct SideEffect {
    meta: StepMeta,
    effect: Effect,
}

impl SideEffect {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            meta: StepMeta::new(name),
            effect: Effect::Async(Arc::new(move |item| Box::pin(f(item)))),
        }
    }

    /// A synchronous effect; runs on the blocking pool when `run_blocking = true`.
    pub fn blocking<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            meta: StepMeta::new(name),
            effect: Effect::Blocking(Arc::new(f)),
        }
    }

    pub fn typed<I, F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let step = name.clone();
        let f = Arc::new(f);
        Self::new(name, move |item| {
            let f = f.clone();
            let step = step.clone();
            async move { f(decode::<I>(&step, item)?).await }
        })
    }

    super::step_meta_methods!();

    async fn attempt(&self, ctx: &ExecCtx, config: &StepConfig, item: Value) -> Result<()> {
        match &self.effect {
            Effect::Async(f) => f(item).await,
            Effect::Blocking(f) if config.run_blocking => {
                let f = f.clone();
                ctx.pool.run(move || f(item)).await
            }
            Effect::Blocking(f) => f(item),
        }
    }

    /// Run the effect for one item under the retry contract.
    ///
    /// Returns the item on success, `None` if it was dead-lettered.
    pub async fn call(&self, ctx: &ExecCtx, config: &StepConfig, item: Value) -> Result<Option<Value>> {
        contract::require_input(&self.meta.name, &item)?;
        if config.debug {
            debug!(step = %self.meta.name, item = %item, "running effect");
        }
        let sink = self.meta.sink();
        let done = contract::invoke(
            ctx,
            &self.meta.name,
            KIND,
            config,
            &sink,
            Failed::Item(&item),
            |_| self.attempt(ctx, config, item.clone()),
        )
        .await?;
        Ok(done.map(|()| item))
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
                    calls.buffer_unordered(config.concurrency).boxed()
                } else {
                    calls.buffered(config.concurrency).boxed()
                };
                Flow::Stream(skip_dead_letters(results))
            }
        }
    }
}

impl std::fmt::Debug for SideEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideEffect").field("meta", &self.meta).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PipelineError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_item_passes_through_unchanged() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = written.clone();
        let step = Arc::new(SideEffect::new("store", move |item: Value| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(item);
                Ok(())
            }
        }));
        let handle = ConfigHandle::fixed("store", StepConfig::default());
        let flow = Flow::iter(vec![json!("a"), json!("b")]);
        let out = step
            .apply(&ExecCtx::default(), &handle, flow)
            .collect()
            .await
            .unwrap();
        assert_eq!(out, vec![json!("a"), json!("b")]);
        assert_eq!(*written.lock().unwrap(), vec![json!("a"), json!("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound_respected() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (f, p) = (in_flight.clone(), peak.clone());
        let step = Arc::new(SideEffect::new("slow", move |_| {
            let (f, p) = (f.clone(), p.clone());
            async move {
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                f.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }));
        let handle = ConfigHandle::fixed(
            "slow",
            StepConfig::default().with_concurrency(3).unwrap(),
        );
        let flow = Flow::iter((0..12).map(|n| json!(n)).collect::<Vec<_>>());
        let out = step
            .apply(&ExecCtx::default(), &handle, flow)
            .collect()
            .await
            .unwrap();
        assert_eq!(out, (0..12).map(|n| json!(n)).collect::<Vec<_>>());
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_effect_without_recovery_is_permanent() {
        let step = SideEffect::blocking("audit", |_| {
            Err(PipelineError::TransientFailure("disk full".into()))
        });
        let config = StepConfig::default()
            .with_retry_limit(1)
            .with_retry_wait(Duration::from_millis(5))
            .unwrap();
        let err = step
            .call(&ExecCtx::default(), &config, json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::PermanentFailure { attempts: 2, .. }));
    }
}
