//! Run event notification.
//!
//! Every event the engine appends is published twice: to an internal
//! broadcast channel that drives `RunHandle::wait`, readable streams and
//! webhook responses, and to a user-supplied [`EventNotifier`] for
//! observability.

use ember_world::Event;
use tokio::sync::mpsc;

/// An event appended to a run's log.
#[derive(Debug, Clone)]
pub struct RunEvent {
  pub run_id: String,
  pub event: Event,
}

/// Receives every event the engine appends.
pub trait EventNotifier: Send + Sync {
  fn notify(&self, event: &RunEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl EventNotifier for NoopNotifier {
  fn notify(&self, _event: &RunEvent) {}
}

/// Forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<RunEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<RunEvent>) -> Self {
    Self { sender }
  }
}

impl EventNotifier for ChannelNotifier {
  fn notify(&self, event: &RunEvent) {
    // Receiver may have been dropped.
    let _ = self.sender.send(event.clone());
  }
}
