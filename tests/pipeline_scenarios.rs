//! End-to-end runs through assembled pipelines.

use futures::stream::{self, StreamExt};
use pipeline_framework::events::{Event, EventLog};
use pipeline_framework::remote::{service_fn, InMemoryPersistence, RemoteCallAdapter};
use pipeline_framework::step::{BatchOutput, ManyToOne, OneToMany, OneToOne, SideEffect};
use pipeline_framework::{
    BackpressureStrategy, CollectingDeadLetter, ExecCtx, Flow, LayeredConfig, Pipeline,
    PipelineBuilder, PipelineError, PipelineSettings, StepConfig, StepOverrides, StepRegistry,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn suffixes() -> OneToMany {
    OneToMany::new("suffix", |item: Value| {
        let base = item.as_str().unwrap_or_default().to_string();
        stream::iter((1..=3).map(move |i| Ok(json!(format!("{}-{}", base, i)))))
    })
}

fn fast_retries(limit: u32) -> StepConfig {
    StepConfig::default()
        .with_retry_limit(limit)
        .with_retry_wait(Duration::from_millis(10))
        .unwrap()
}

#[tokio::test]
async fn test_one_to_many_expands_four_items_into_twelve() {
    let pipeline = Pipeline::builder().step(suffixes()).build().unwrap();
    let input = Flow::iter(["item1", "item2", "item3", "item4"].map(|s| json!(s)));
    let out = pipeline.run(&ExecCtx::default(), input).collect().await.unwrap();

    assert_eq!(out.len(), 12);
    for (i, item) in out.iter().enumerate() {
        let expected = format!("item{}-{}", i / 3 + 1, i % 3 + 1);
        assert_eq!(item, &json!(expected));
    }
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_step_is_invoked_retry_limit_plus_one_times() {
    for recover in [false, true] {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let sink = CollectingDeadLetter::new();
        let pipeline = Pipeline::builder()
            .config(LayeredConfig::new(fast_retries(4).with_recover_on_failure(recover)))
            .step(
                OneToOne::new("flaky", move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(PipelineError::TransientFailure("503".into())) }
                })
                .with_dead_letter(sink.clone()),
            )
            .build()
            .unwrap();

        let result = pipeline
            .run(&ExecCtx::default(), Flow::value(json!("x")))
            .last()
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        if recover {
            assert_eq!(assert_ok!(result), None);
            assert_eq!(sink.len(), 1);
        } else {
            let err = assert_err!(result);
            assert!(matches!(err, PipelineError::PermanentFailure { attempts: 5, .. }));
            assert!(sink.is_empty());
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_batches_close_on_size_and_on_timeout() {
    let config = StepConfig::default()
        .with_batch_size(3)
        .and_then(|c| c.with_batch_timeout(Duration::from_millis(250)))
        .unwrap();
    let collect = || {
        ManyToOne::new("collect", |batch: Vec<Value>| async move { Ok(Value::Array(batch)) })
            .with_output(BatchOutput::All)
    };

    let pipeline = Pipeline::builder()
        .config(LayeredConfig::new(config.clone()))
        .step(collect())
        .build()
        .unwrap();
    let input = Flow::iter(["a", "b", "c", "d", "e", "f"].map(|s| json!(s)));
    let out = pipeline.run(&ExecCtx::default(), input).collect().await.unwrap();
    assert_eq!(out, vec![json!(["a", "b", "c"]), json!(["d", "e", "f"])]);

    let log = Arc::new(EventLog::new());
    let ctx = ExecCtx::builder().event_handler(log.clone()).build();
    let pipeline = Pipeline::builder()
        .config(LayeredConfig::new(config))
        .step(collect())
        .build()
        .unwrap();
    let trickle = stream::iter(["p", "q"])
        .then(|s| async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok(json!(s))
        });
    let out = pipeline.run(&ctx, Flow::stream(trickle)).collect().await.unwrap();
    assert_eq!(out, vec![json!(["p"]), json!(["q"])]);
    assert!(log.count(|e| matches!(e, Event::BatchClosed { size: 1, .. })) >= 1);
}

#[tokio::test]
async fn test_batch_step_over_empty_stream_fails() {
    let pipeline = Pipeline::builder()
        .step(ManyToOne::new("total", |batch: Vec<Value>| async move {
            Ok(json!(batch.len()))
        }))
        .build()
        .unwrap();
    let err = pipeline
        .run(&ExecCtx::default(), Flow::iter(Vec::new()))
        .last()
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::EmptyInputNotAllowed { ref step } if step == "total"));
}

fn fan_out(n: u64, strategy: BackpressureStrategy) -> Pipeline {
    let config = StepConfig::default()
        .with_backpressure_strategy(strategy)
        .with_backpressure_buffer_capacity(4)
        .unwrap();
    Pipeline::builder()
        .config(LayeredConfig::new(config))
        .step(OneToMany::new("fan", move |_| {
            stream::iter((0..n).map(|i| Ok(json!(i))))
        }))
        .build()
        .unwrap()
}

async fn drain_slowly(pipeline: &Pipeline, ctx: &ExecCtx) -> Vec<Value> {
    pipeline
        .run(ctx, Flow::value(json!("go")))
        .into_stream()
        .then(|item| async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            item
        })
        .map(|item| item.unwrap())
        .collect()
        .await
}

#[tokio::test(start_paused = true)]
async fn test_buffer_strategy_loses_nothing() {
    let pipeline = fan_out(200, BackpressureStrategy::Buffer);
    let out = drain_slowly(&pipeline, &ExecCtx::default()).await;
    assert_eq!(out.len(), 200);
    assert_eq!(out, (0..200).map(|i| json!(i)).collect::<Vec<_>>());
    assert_eq!(pipeline.steps().map(|s| s.dropped()).sum::<u64>(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_drop_strategy_emits_no_more_than_accepted() {
    let log = Arc::new(EventLog::new());
    let ctx = ExecCtx::builder().event_handler(log.clone()).build();
    let pipeline = fan_out(200, BackpressureStrategy::Drop);
    let out = drain_slowly(&pipeline, &ctx).await;
    let dropped = pipeline.steps().map(|s| s.dropped()).sum::<u64>();

    assert!(out.len() <= 200);
    assert_eq!(out.len() as u64 + dropped, 200);
    assert_eq!(
        log.count(|e| matches!(e, Event::ItemDropped { .. })) as u64,
        dropped
    );
}

#[tokio::test(start_paused = true)]
async fn test_sequential_step_preserves_order_under_varying_latency() {
    let delays = [50u64, 5, 30, 0, 20, 10, 40, 1];
    let pipeline = Pipeline::builder()
        .step(OneToOne::new("jitter", |item: Value| async move {
            let ms = item["delay"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(item["id"].clone())
        }))
        .build()
        .unwrap();
    let input = delays
        .iter()
        .enumerate()
        .map(|(id, delay)| json!({ "id": id, "delay": delay }))
        .collect::<Vec<_>>();
    let out = pipeline.run_items(&ExecCtx::default(), input).await.unwrap();
    assert_eq!(out, (0..delays.len()).map(|i| json!(i)).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_config_precedence_override_then_profile_then_defaults() {
    let layered = LayeredConfig::new(StepConfig::default().with_retry_limit(3));
    layered
        .register_profile("p", StepConfig::default().with_retry_limit(5))
        .unwrap();
    layered.activate_profile("p").unwrap();
    layered.set_overrides("s", StepOverrides::new().retry_limit(1)).unwrap();

    let pipeline = Pipeline::builder()
        .config(layered.clone())
        .step(SideEffect::new("s", |_| async { Ok(()) }))
        .build()
        .unwrap();
    let handle = pipeline.handle("s").unwrap();

    assert_eq!(handle.effective().retry_limit, 1);
    layered.clear_overrides("s");
    assert_eq!(handle.effective().retry_limit, 5);
    layered.deactivate_profile();
    assert_eq!(handle.effective().retry_limit, 3);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TransferRequest {
    account: String,
    cents: i64,
}

#[derive(Debug, Clone, PartialEq)]
struct Transfer {
    account: String,
    cents: i64,
}

#[tokio::test(start_paused = true)]
async fn test_remote_step_persists_input_when_overridden_on() {
    let store = Arc::new(InMemoryPersistence::<Transfer>::new());
    store.fail_next(1);
    let adapter = RemoteCallAdapter::new(
        "transfer",
        |req: TransferRequest| {
            Ok(Transfer {
                account: req.account,
                cents: req.cents,
            })
        },
        |receipt: String| Ok(json!({ "receipt": receipt })),
    )
    .with_persistence(store.clone());
    let service = service_fn(|t: Transfer| async move {
        Ok::<_, PipelineError>(format!("{}:{}", t.account, t.cents))
    });

    let layered = LayeredConfig::default();
    layered
        .set_overrides("transfer", StepOverrides::new().auto_persist(true))
        .unwrap();
    let pipeline = Pipeline::builder()
        .config(layered)
        .step(adapter.into_step(service))
        .build()
        .unwrap();

    let out = pipeline
        .run_items(
            &ExecCtx::default(),
            vec![
                json!({ "account": "acc-1", "cents": 100 }),
                json!({ "account": "acc-2", "cents": 250 }),
            ],
        )
        .await
        .unwrap();
    assert_eq!(
        out,
        vec![json!({ "receipt": "acc-1:100" }), json!({ "receipt": "acc-2:250" })]
    );
    assert_eq!(store.items().len(), 2);
    // one injected refusal, retried
    assert_eq!(store.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_remote_failure_surfaces_as_transport_error() {
    let adapter: RemoteCallAdapter<Value, Value, Value, Value> =
        RemoteCallAdapter::new("lookup", Ok, Ok);
    let service = service_fn(|_: Value| async {
        Err::<Value, _>(PipelineError::ProgrammerError("no such account".into()))
    });
    let pipeline = Pipeline::builder()
        .step(adapter.into_step(service))
        .build()
        .unwrap();
    let err = pipeline
        .run(&ExecCtx::default(), Flow::value(json!({ "id": 1 })))
        .last()
        .await
        .unwrap_err();
    match err {
        PipelineError::Transport { source, .. } => {
            assert!(matches!(*source, PipelineError::ProgrammerError(_)))
        }
        other => panic!("expected transport error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_pipeline_assembled_from_settings() {
    let settings = PipelineSettings::from_json(
        r#"{
            "defaults": { "retry_limit": 2 },
            "profiles": { "bulk": { "batch_size": 2 } },
            "active_profile": "bulk",
            "steps": {
                "words": { "order": 1 },
                "count": { "order": 2, "backpressure_strategy": "bogus" }
            }
        }"#,
    )
    .unwrap();

    let mut registry = StepRegistry::new();
    registry
        .register("words", |name| {
            OneToMany::new(name, |line: Value| {
                let words: Vec<_> = line
                    .as_str()
                    .unwrap_or_default()
                    .split_whitespace()
                    .map(|w| Ok(json!(w)))
                    .collect();
                stream::iter(words)
            })
            .into()
        })
        .register("count", |name| {
            ManyToOne::new(name, |batch: Vec<Value>| async move { Ok(json!(batch.len())) })
                .with_output(BatchOutput::All)
                .into()
        });

    let pipeline = PipelineBuilder::from_settings(&settings, &registry)
        .unwrap()
        .build()
        .unwrap();
    let count = pipeline.handle("count").unwrap().effective();
    assert_eq!(count.batch_size, 2);
    assert_eq!(count.retry_limit, 2);
    assert_eq!(count.backpressure_strategy, BackpressureStrategy::Buffer);
    assert_eq!(count.backpressure_buffer_capacity, 128);

    let out = pipeline
        .run(&ExecCtx::default(), Flow::value(json!("one two three")))
        .collect()
        .await
        .unwrap();
    assert_eq!(out, vec![json!(2), json!(1)]);
}

#[tokio::test]
async fn test_lifecycle_events_cover_every_invocation() {
    let log = Arc::new(EventLog::new());
    let ctx = ExecCtx::builder().event_handler(log.clone()).build();
    let pipeline = Pipeline::builder()
        .step(OneToOne::new("a", |v| async move { Ok(v) }))
        .step(SideEffect::new("b", |_| async { Ok(()) }))
        .build()
        .unwrap();
    pipeline
        .run_items(&ctx, vec![json!(1), json!(2), json!(3)])
        .await
        .unwrap();
    assert_eq!(log.count(|e| matches!(e, Event::StepStart { .. })), 6);
    assert_eq!(log.count(|e| matches!(e, Event::StepEnd { ok: true, .. })), 6);
}
