//! In-process fan-out of `WorkflowEvent`s.
//!
//! The checkpoint store owns one bus and every orchestrator built on that
//! store publishes through it. Followers (the CLI progress bar, tests)
//! subscribe before a run starts; events published earlier are not replayed.

use tokio::sync::broadcast;
use waypoint_types::event::WorkflowEvent;

/// Broadcast channel carrying workflow events for every session.
///
/// Subscribers filter by `WorkflowEvent::session_id`. A follower that falls
/// more than `capacity` events behind sees `Lagged` and skips ahead.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Send to current subscribers. Nobody listening is not an error.
    pub fn publish(&self, event: WorkflowEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("workflow event dropped, no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
