//! Run lifecycle event delivery

use std::sync::Arc;

use parking_lot::Mutex;
use stepwise_common::{RunEvent, RunEventKind};
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out of lifecycle events to any number of subscribers.
///
/// Dropping a receiver unsubscribes it.
#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<RunEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: RunEvent) {
        trace!(run_id = %event.run_id, event = event.name(), "publishing");
        // Nobody listening is not an error
        let _ = self.sender.send(event);
    }

    /// Emitter bound to one run
    pub fn emitter(&self, run_id: impl Into<String>) -> RunEmitter {
        RunEmitter {
            run_id: run_id.into(),
            hub: self.clone(),
            finished: Arc::new(Mutex::new(false)),
        }
    }
}

/// Publishes the events of a single run.
///
/// Clones share state: once any clone has published `run-finished`, every
/// later event for the run is dropped.
#[derive(Clone)]
pub struct RunEmitter {
    run_id: String,
    hub: EventHub,
    finished: Arc<Mutex<bool>>,
}

impl RunEmitter {
    /// Publish an event. Returns false when the run already finished.
    pub fn emit(&self, kind: RunEventKind) -> bool {
        let mut finished = self.finished.lock();
        if *finished {
            return false;
        }
        if matches!(kind, RunEventKind::RunFinished { .. }) {
            *finished = true;
        }
        self.hub.publish(RunEvent::new(self.run_id.clone(), kind));
        true
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_common::{BrowserKind, RunStatus};

    #[test]
    fn test_nothing_follows_run_finished() {
        let hub = EventHub::default();
        let mut rx = hub.subscribe();
        let emitter = hub.emitter("run-1");

        assert!(emitter.emit(RunEventKind::RunStarted {
            test_case_id: "tc".into(),
            browser: BrowserKind::Chromium,
        }));
        assert!(emitter.clone().emit(RunEventKind::RunFinished {
            run_status: RunStatus::Cancelled,
            message: "Run cancelled.".into(),
        }));
        assert!(!emitter.emit(RunEventKind::StepStarted {
            step_id: "s1".into(),
            step_order: 1,
        }));
        assert!(emitter.is_finished());

        assert_eq!(rx.try_recv().unwrap().name(), "run-started");
        let last = rx.try_recv().unwrap();
        assert!(last.is_terminal());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscriber_does_not_block_publish() {
        let hub = EventHub::new(1);
        drop(hub.subscribe());
        hub.emitter("r").emit(RunEventKind::StepStarted {
            step_id: "s".into(),
            step_order: 1,
        });
    }
}
