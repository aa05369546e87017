//! Example: payment instructions from CSV through a remote submission step.
//!
//! ```text
//! csv text ─► lines ─► parse ─► submit (persist, then call the bank) ─► totals per currency
//! ```
//!
//! Records reference each other by id: an acknowledgment carries the
//! `PaymentId` it answers, and the ledger is a map keyed by that id.
//!
//! Run with: `cargo run --example csv_payments`

use futures::stream;
use pipeline_framework::remote::{service_fn, InMemoryPersistence, RemoteCallAdapter};
use pipeline_framework::step::{ManyToMany, OneToMany, OneToOne};
use pipeline_framework::{
    CollectingDeadLetter, ExecCtx, LayeredConfig, Pipeline, PipelineError, StepConfig,
    StepOverrides,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const CSV: &str = "\
id,debtor,creditor,amount,currency
P-1,ACME,Globex,120.50,EUR
P-2,Initech,ACME,99.99,USD
P-3,Globex,Umbrella,not-a-number,EUR
P-4,Umbrella,Initech,10.00,EUR
P-5,ACME,Hooli,2500.00,USD
";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct PaymentId(String);

/// As it travels between steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PaymentInstruction {
    id: PaymentId,
    debtor: String,
    creditor: String,
    amount_cents: i64,
    currency: String,
}

/// As the submission service sees it.
#[derive(Debug, Clone)]
struct Payment {
    id: PaymentId,
    amount_cents: i64,
    currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum PaymentStatus {
    Accepted,
    Held,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Acknowledgment {
    payment: PaymentId,
    status: PaymentStatus,
    amount_cents: i64,
    currency: String,
}

fn parse_line(line: &str) -> Result<PaymentInstruction, PipelineError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let [id, debtor, creditor, amount, currency] = fields[..] else {
        return Err(PipelineError::ProgrammerError(format!("expected 5 fields: {}", line)));
    };
    let amount: f64 = amount
        .parse()
        .map_err(|_| PipelineError::ProgrammerError(format!("bad amount '{}' in {}", amount, id)))?;
    Ok(PaymentInstruction {
        id: PaymentId(id.to_string()),
        debtor: debtor.to_string(),
        creditor: creditor.to_string(),
        amount_cents: (amount * 100.0).round() as i64,
        currency: currency.to_string(),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = LayeredConfig::new(
        StepConfig::default()
            .with_retry_limit(2)
            .with_retry_wait(Duration::from_millis(100))?,
    );
    config.set_overrides("parse", StepOverrides::new().recover_on_failure(true))?;
    config.set_overrides("submit", StepOverrides::new().auto_persist(true))?;

    // Storage refuses the first connection; the adapter retries it.
    let store = Arc::new(InMemoryPersistence::<Payment>::new());
    store.fail_next(1);

    let submit = RemoteCallAdapter::new(
        "submit",
        |p: PaymentInstruction| {
            Ok(Payment {
                id: p.id,
                amount_cents: p.amount_cents,
                currency: p.currency,
            })
        },
        Ok::<Acknowledgment, PipelineError>,
    )
    .with_persistence(store.clone());

    // The bank holds anything over 1000.00 and times out once.
    let bank_calls = Arc::new(AtomicU32::new(0));
    let calls = bank_calls.clone();
    let bank = service_fn(move |p: Payment| {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if call == 1 {
                return Err(PipelineError::TransientFailure("bank timed out".into()));
            }
            let status = if p.amount_cents > 100_000 {
                PaymentStatus::Held
            } else {
                PaymentStatus::Accepted
            };
            Ok(Acknowledgment {
                payment: p.id,
                status,
                amount_cents: p.amount_cents,
                currency: p.currency,
            })
        }
    });

    let rejected = CollectingDeadLetter::new();
    let pipeline = Pipeline::builder()
        .config(config)
        .step(OneToMany::new("lines", |csv: Value| {
            let lines: Vec<_> = csv
                .as_str()
                .unwrap_or_default()
                .lines()
                .skip(1)
                .filter(|l| !l.trim().is_empty())
                .map(|l| Ok(json!(l)))
                .collect();
            stream::iter(lines)
        }))
        .step(
            OneToOne::typed("parse", |line: String| async move { parse_line(&line) })
                .with_dead_letter(rejected.clone()),
        )
        .step(submit.into_step(bank).with_endpoint("http://bank.local:8080"))
        .step(ManyToMany::group_by(
            "totals",
            |ack: &Value| ack["currency"].as_str().unwrap_or("???").to_string(),
            |currency, acks| async move {
                let total: i64 = acks.iter().filter_map(|a| a["amount_cents"].as_i64()).sum();
                Ok(vec![json!({ "currency": currency, "payments": acks.len(), "total_cents": total })])
            },
        ))
        .build()?;

    println!("remote endpoints: {:?}", pipeline.endpoints());

    let totals = pipeline.run_items(&ExecCtx::default(), vec![json!(CSV)]).await?;
    for total in &totals {
        println!("{}", total);
    }

    let ledger: BTreeMap<PaymentId, Payment> = store
        .items()
        .into_iter()
        .map(|p| (p.id.clone(), p))
        .collect();
    println!("persisted {} payment(s):", ledger.len());
    for (id, payment) in &ledger {
        println!("  {} {} {}", id.0, payment.amount_cents, payment.currency);
    }
    for dead in rejected.entries() {
        println!("rejected {}: {}", dead.item, dead.reason);
    }
    println!("bank calls: {}", bank_calls.load(Ordering::SeqCst));
    Ok(())
}
