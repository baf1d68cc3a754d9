//! Integration tests for readable streams.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ember_engine::{ChannelNotifier, Engine, EngineConfig, Inspector, RetryPolicy};
use ember_workflow::{Registry, Step, StepContext, StepError, Workflow, WorkflowContext, WorkflowError};
use ember_world::{ManualClock, MemoryWorld, World};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;

struct Produce;

#[async_trait]
impl Step for Produce {
  const NAME: &'static str = "produce";
  type Input = Vec<String>;
  type Output = usize;

  async fn run(&self, ctx: &StepContext, words: Vec<String>) -> Result<usize, StepError> {
    let stream = ctx.stream("words");
    for word in &words {
      stream.write(word).await?;
    }
    stream.close().await?;
    Ok(words.len())
  }
}

struct Narrate;

impl Workflow for Narrate {
  const NAME: &'static str = "narrate";
  type Input = Vec<String>;
  type Output = usize;

  fn run(&self, ctx: &mut WorkflowContext, words: Vec<String>) -> Result<usize, WorkflowError> {
    ctx.step::<Produce>(&words)
  }
}

fn test_engine(world: Arc<dyn World>) -> Engine {
  let config = EngineConfig {
    retry: RetryPolicy::immediate(),
    ..EngineConfig::default()
  };
  Engine::builder(world, Registry::new().workflow(Narrate).step(Produce))
    .clock(Arc::new(ManualClock::new(Utc::now())))
    .config(config)
    .build()
}

fn words() -> Vec<String> {
  ["once", "upon", "a", "time"]
    .into_iter()
    .map(String::from)
    .collect()
}

#[tokio::test]
async fn test_reader_follows_live_writes() {
  let engine = test_engine(Arc::new(MemoryWorld::new()));
  let run = engine.start::<Narrate>(&words()).await.unwrap();

  let reader = tokio::spawn(
    run
      .readable("words")
      .map(|chunk| chunk.unwrap())
      .collect::<Vec<Value>>(),
  );
  tokio::task::yield_now().await;
  engine.run_until_idle().await.unwrap();

  let chunks = tokio::time::timeout(Duration::from_secs(5), reader)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(chunks, vec![json!("once"), json!("upon"), json!("a"), json!("time")]);
  assert_eq!(run.wait_for::<usize>().await.unwrap(), 4);
}

#[tokio::test]
async fn test_reader_resumes_from_index() {
  let engine = test_engine(Arc::new(MemoryWorld::new()));
  let run = engine.start::<Narrate>(&words()).await.unwrap();
  engine.run_until_idle().await.unwrap();

  let first: Vec<Value> = run
    .readable("words")
    .take(2)
    .map(|chunk| chunk.unwrap())
    .collect()
    .await;
  assert_eq!(first, vec![json!("once"), json!("upon")]);

  let rest: Vec<Value> = run
    .readable_from("words", first.len() as u64)
    .map(|chunk| chunk.unwrap())
    .collect()
    .await;
  assert_eq!(rest, vec![json!("a"), json!("time")]);

  // Other namespaces end with the run.
  let other: Vec<_> = run.readable("other").collect().await;
  assert!(other.is_empty());
}

#[tokio::test]
async fn test_stream_visible_to_inspector_and_notifier() {
  let world: Arc<dyn World> = Arc::new(MemoryWorld::new());
  let (tx, mut rx) = mpsc::unbounded_channel();
  let engine = Engine::builder(world.clone(), Registry::new().workflow(Narrate).step(Produce))
    .clock(Arc::new(ManualClock::new(Utc::now())))
    .notifier(Arc::new(ChannelNotifier::new(tx)))
    .build();

  let run = engine.start::<Narrate>(&words()).await.unwrap();
  engine.run_until_idle().await.unwrap();

  let inspector = Inspector::new(world);
  let chunks = inspector.stream_chunks(run.id(), "words", 3).await.unwrap();
  assert_eq!(chunks.len(), 1);
  assert_eq!(chunks[0].chunk, json!("time"));

  let steps = inspector.steps(run.id()).await.unwrap();
  assert_eq!(steps.len(), 1);
  assert_eq!(steps[0].status, "completed");

  let mut seqs = Vec::new();
  while let Ok(event) = rx.try_recv() {
    assert_eq!(event.run_id, run.id());
    seqs.push(event.event.seq);
  }
  let logged = run.events().await.unwrap();
  assert_eq!(seqs, logged.iter().map(|e| e.seq).collect::<Vec<_>>());
}
