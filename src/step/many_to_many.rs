use super::contract::{self, Failed};
use super::{expansion, StepMeta};
use crate::batch;
use crate::config::{ConfigHandle, StepConfig};
use crate::error::Result;
use crate::exec_ctx::ExecCtx;
use crate::flow::{BoxFut, Flow, ItemStream};
use futures::future;
use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

pub(crate) const KIND: &str = "many-to-many";

type StreamFn = Arc<dyn Fn(ItemStream) -> ItemStream + Send + Sync>;
type KeyFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;
type GroupFn = Arc<dyn Fn(String, Vec<Value>) -> BoxFut<'static, Result<Vec<Value>>> + Send + Sync>;

enum Mode {
    /// The transformation owns the whole stream. It is not retried; errors
    /// it yields are dead-lettered or end the stream.
    Opaque(StreamFn),
    /// Items are windowed, grouped by key within each window, and each
    /// group runs under the full retry contract.
    Grouped { key: KeyFn, per_group: GroupFn },
}

/// A stream in, a stream out.
///
/// Memory stays bounded for unbounded upstreams: output passes through the
/// step's backpressure buffer, and grouping happens per batch window.
///
/// # Example
///
/// ```
/// use pipeline_framework::step::ManyToMany;
/// use serde_json::Value;
///
/// // Group payments by currency and forward each group as one item.
/// let by_currency = ManyToMany::group_by(
///     "by-currency",
///     |item: &Value| item["currency"].as_str().unwrap_or("?").to_string(),
///     |currency, items| async move {
///         Ok(vec![serde_json::json!({ "currency": currency, "count": items.len() })])
///     },
/// );
/// assert_eq!(by_currency.name(), "by-currency");
/// ```
pub struct ManyToMany {
    meta: StepMeta,
    mode: Mode,
}

impl ManyToMany {
    pub fn new<F, S>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ItemStream) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        Self {
            meta: StepMeta::new(name),
            mode: Mode::Opaque(Arc::new(move |items| f(items).boxed())),
        }
    }

    /// Re-key items and process each group. Groups are formed per batch
    /// window (`batch_size` / `batch_timeout`) in first-seen key order.
    pub fn group_by<K, G, Fut>(name: impl Into<String>, key: K, per_group: G) -> Self
    where
        K: Fn(&Value) -> String + Send + Sync + 'static,
        G: Fn(String, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Value>>> + Send + 'static,
    {
        Self {
            meta: StepMeta::new(name),
            mode: Mode::Grouped {
                key: Arc::new(key),
                per_group: Arc::new(move |k, items| Box::pin(per_group(k, items))),
            },
        }
    }

    super::step_meta_methods!();

    async fn run_group(
        &self,
        ctx: &ExecCtx,
        config: &StepConfig,
        per_group: &GroupFn,
        key: String,
        items: Vec<Value>,
    ) -> Result<Option<Vec<Value>>> {
        for item in &items {
            contract::require_input(&self.meta.name, item)?;
        }
        if config.debug {
            debug!(step = %self.meta.name, key = %key, size = items.len(), "processing group");
        }
        let sink = self.meta.sink();
        contract::invoke(
            ctx,
            &self.meta.name,
            KIND,
            config,
            &sink,
            Failed::Batch(&items),
            |_| per_group(key.clone(), items.clone()),
        )
        .await
    }

    pub(crate) fn apply(self: &Arc<Self>, ctx: &ExecCtx, handle: &ConfigHandle, flow: Flow) -> Flow {
        let config = handle.effective();
        let upstream = flow.into_stream();
        let output = match &self.mode {
            Mode::Opaque(f) => self.apply_opaque(ctx, handle, f, upstream),
            Mode::Grouped { key, per_group } => {
                self.apply_grouped(ctx, handle, &config, key.clone(), per_group.clone(), upstream)
            }
        };
        Flow::Stream(self.meta.backpressure(ctx, &config, output))
    }

    fn apply_opaque(
        self: &Arc<Self>,
        ctx: &ExecCtx,
        handle: &ConfigHandle,
        f: &StreamFn,
        upstream: ItemStream,
    ) -> ItemStream {
        let name = self.meta.name.clone();
        let checked = upstream
            .map(move |item| {
                let item = item?;
                contract::require_input(&name, &item)?;
                Ok(item)
            })
            .boxed();

        let this = self.clone();
        let ctx = ctx.clone();
        let handle = handle.clone();
        f(checked)
            .filter_map(move |item| {
                let result = match item {
                    Ok(value) => Some(Ok(value)),
                    Err(error) => {
                        let config = handle.effective();
                        contract::recover_stream_error(&ctx, &this.meta.name, &config, &this.meta.sink(), error)
                            .err()
                            .map(Err)
                    }
                };
                future::ready(result)
            })
            .boxed()
    }

    fn apply_grouped(
        self: &Arc<Self>,
        ctx: &ExecCtx,
        handle: &ConfigHandle,
        config: &StepConfig,
        key: KeyFn,
        per_group: GroupFn,
        upstream: ItemStream,
    ) -> ItemStream {
        let windows = batch::windows(upstream, config.batch_size, config.batch_timeout);
        let this = self.clone();
        let ctx = ctx.clone();
        let handle = handle.clone();
        windows
            .flat_map(move |window| -> ItemStream {
                let window = match window {
                    Ok(window) => window,
                    Err(e) => return stream::once(future::ready(Err(e))).boxed(),
                };
                let groups = group_in_order(&key, window.items);
                let this = this.clone();
                let ctx = ctx.clone();
                let handle = handle.clone();
                let per_group = per_group.clone();
                stream::iter(groups)
                    .then(move |(k, items)| {
                        let this = this.clone();
                        let ctx = ctx.clone();
                        let handle = handle.clone();
                        let per_group = per_group.clone();
                        async move {
                            let config = handle.effective();
                            this.run_group(&ctx, &config, &per_group, k, items).await
                        }
                    })
                    .flat_map(expansion)
                    .boxed()
            })
            .boxed()
    }
}

/// Partition `items` by key, keys in first-seen order, items in arrival order.
fn group_in_order(key: &KeyFn, items: Vec<Value>) -> Vec<(String, Vec<Value>)> {
    let mut groups: Vec<(String, Vec<Value>)> = Vec::new();
    for item in items {
        let k = key(&item);
        match groups.iter_mut().find(|(existing, _)| *existing == k) {
            Some((_, members)) => members.push(item),
            None => groups.push((k, vec![item])),
        }
    }
    groups
}

impl std::fmt::Debug for ManyToMany {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.mode {
            Mode::Opaque(_) => "opaque",
            Mode::Grouped { .. } => "grouped",
        };
        f.debug_struct("ManyToMany")
            .field("meta", &self.meta)
            .field("mode", &mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::CollectingDeadLetter;
    use crate::PipelineError;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_opaque_transform_sees_whole_stream() {
        let step = Arc::new(ManyToMany::new("pairs", |items: ItemStream| {
            items.chunks(2).map(|chunk| {
                let values = chunk.into_iter().collect::<Result<Vec<Value>>>()?;
                Ok(Value::Array(values))
            })
        }));
        let handle = ConfigHandle::fixed("pairs", StepConfig::default());
        let flow = Flow::iter((1..=5).map(|n| json!(n)).collect::<Vec<_>>());
        let out = step
            .apply(&ExecCtx::default(), &handle, flow)
            .collect()
            .await
            .unwrap();
        assert_eq!(out, vec![json!([1, 2]), json!([3, 4]), json!([5])]);
    }

    #[tokio::test]
    async fn test_opaque_errors_dead_lettered_when_recovering() {
        let sink = CollectingDeadLetter::new();
        let step = Arc::new(
            ManyToMany::new("odd-only", |items: ItemStream| {
                items.map(|item| {
                    let item = item?;
                    if item.as_i64().unwrap_or(0) % 2 == 0 {
                        return Err(PipelineError::TransientFailure("even".into()));
                    }
                    Ok(item)
                })
            })
            .with_dead_letter(sink.clone()),
        );
        let handle = ConfigHandle::fixed(
            "odd-only",
            StepConfig::default().with_recover_on_failure(true),
        );
        let flow = Flow::iter((1..=5).map(|n| json!(n)).collect::<Vec<_>>());
        let out = step
            .apply(&ExecCtx::default(), &handle, flow)
            .collect()
            .await
            .unwrap();
        assert_eq!(out, vec![json!(1), json!(3), json!(5)]);
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn test_opaque_error_ends_stream_without_recovery() {
        let step = Arc::new(ManyToMany::new("fail", |items: ItemStream| {
            items.map(|_| Err::<Value, _>(PipelineError::Other("nope".into())))
        }));
        let handle = ConfigHandle::fixed("fail", StepConfig::default());
        let result = step
            .apply(&ExecCtx::default(), &handle, Flow::iter(vec![json!(1)]))
            .collect()
            .await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_by_within_window() {
        let step = Arc::new(ManyToMany::group_by(
            "by-currency",
            |item: &Value| item["ccy"].as_str().unwrap_or_default().to_string(),
            |ccy, items| async move {
                let total: i64 = items.iter().filter_map(|i| i["amount"].as_i64()).sum();
                Ok(vec![json!({ "ccy": ccy, "total": total })])
            },
        ));
        let config = StepConfig::default()
            .with_batch_size(10)
            .and_then(|c| c.with_batch_timeout(Duration::from_millis(100)))
            .unwrap();
        let handle = ConfigHandle::fixed("by-currency", config);
        let flow = Flow::iter(vec![
            json!({"ccy": "EUR", "amount": 5}),
            json!({"ccy": "USD", "amount": 7}),
            json!({"ccy": "EUR", "amount": 10}),
        ]);
        let out = step
            .apply(&ExecCtx::default(), &handle, flow)
            .collect()
            .await
            .unwrap();
        assert_eq!(
            out,
            vec![json!({"ccy": "EUR", "total": 15}), json!({"ccy": "USD", "total": 7})]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_retried_then_succeeds() {
        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = attempts.clone();
        let step = Arc::new(ManyToMany::group_by(
            "g",
            |_: &Value| "all".to_string(),
            move |_, items| {
                let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(PipelineError::TransientFailure("blip".into()))
                    } else {
                        Ok(items)
                    }
                }
            },
        ));
        let config = StepConfig::default()
            .with_retry_wait(Duration::from_millis(5))
            .unwrap();
        let handle = ConfigHandle::fixed("g", config);
        let out = step
            .apply(&ExecCtx::default(), &handle, Flow::iter(vec![json!(1), json!(2)]))
            .collect()
            .await
            .unwrap();
        assert_eq!(out, vec![json!(1), json!(2)]);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
