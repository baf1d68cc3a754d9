//! Readable output streams.

use async_stream::try_stream;
use ember_world::EventKind;
use futures::stream::BoxStream;
use tokio::sync::broadcast::error::RecvError;

use crate::engine::Engine;
use crate::error::EngineError;

impl Engine {
  /// Chunks of stream `namespace` of `run_id`, starting at `start_index`.
  ///
  /// Yields chunks already in the log, then follows new writes until the
  /// stream is closed or the run finishes. Reading again with the index of
  /// the last received chunk plus one resumes without gaps or duplicates.
  pub fn readable(
    &self,
    run_id: &str,
    namespace: &str,
    start_index: u64,
  ) -> BoxStream<'static, Result<serde_json::Value, EngineError>> {
    let engine = self.clone();
    let run_id = run_id.to_string();
    let namespace = namespace.to_string();

    Box::pin(try_stream! {
      // Subscribe before reading so no write falls between the two.
      let mut events = engine.subscribe();
      let mut next = start_index;
      let mut from = 1;

      'read: loop {
        let batch = engine.inner.world.read_events(&run_id, from).await.map_err(EngineError::from)?;
        if from == 1 && batch.is_empty() {
          engine.inner.world.get_run(&run_id).await.map_err(EngineError::from)?;
        }
        for event in batch {
          from = event.seq + 1;
          match event.kind {
            EventKind::StreamWrite { namespace: ns, index, chunk } if ns == namespace => {
              if index >= next {
                next = index + 1;
                yield chunk;
              }
            }
            EventKind::StreamClosed { namespace: ns } if ns == namespace => break 'read,
            kind if kind.is_terminal() => break 'read,
            _ => {}
          }
        }

        loop {
          match events.recv().await {
            Ok(event) if event.run_id == run_id => break,
            Ok(_) => continue,
            Err(RecvError::Lagged(_)) => break,
            Err(RecvError::Closed) => break 'read,
          }
        }
      }
    })
  }
}
