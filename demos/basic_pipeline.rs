//! Example: a three-step pipeline over a stream of lines.
//!
//! Run with: `RUST_LOG=debug cargo run --example basic_pipeline`

use futures::stream;
use pipeline_framework::step::{OneToMany, OneToOne, SideEffect};
use pipeline_framework::{ExecCtx, Flow, Pipeline};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let pipeline = Pipeline::builder()
        // Split each line into words
        .step(OneToMany::new("split", |line: Value| {
            let words: Vec<_> = line
                .as_str()
                .unwrap_or_default()
                .split_whitespace()
                .map(|w| Ok(json!(w)))
                .collect();
            stream::iter(words)
        }))
        // Normalize
        .step(OneToOne::typed("lowercase", |word: String| async move {
            Ok(word.to_lowercase())
        }))
        // Print, passing the word through
        .step(SideEffect::new("print", |word: Value| async move {
            println!("word: {}", word);
            Ok(())
        }))
        .build()?;

    let lines = vec![
        json!("The quick brown fox"),
        json!("jumps over the lazy dog"),
    ];
    let words = pipeline.run_items(&ExecCtx::default(), lines).await?;
    println!("{} words", words.len());

    // A single item flows through as a single-item result where possible.
    let single = pipeline.run(&ExecCtx::default(), Flow::value(json!("Hello World")));
    println!("collected: {:?}", single.collect().await?);

    Ok(())
}
