use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub sequence_no: u64,
    pub timestamp: String,
    pub kind: RunEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum RunEventKind {
    Pipeline(PipelineEvent),
    Stage(StageEvent),
    Plan(PlanEvent),
    Lock(LockEvent),
    Checkpoint(CheckpointEvent),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineEvent {
    Started {
        run_id: String,
    },
    Resumed {
        run_id: String,
        resumed_at_stage: String,
    },
    Completed {
        run_id: String,
        regenerated: usize,
        carried: usize,
    },
    Failed {
        run_id: String,
        stage: Option<String>,
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageEvent {
    Started {
        run_id: String,
        stage: String,
        items: usize,
    },
    Committed {
        run_id: String,
        stage: String,
        items: usize,
    },
    Failed {
        run_id: String,
        stage: String,
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanEvent {
    Full {
        reason: String,
        outputs: usize,
    },
    Incremental {
        regenerate: usize,
        carried: usize,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LockEvent {
    Acquired {
        holder_pid: u32,
        expires_at: u64,
    },
    StaleOverridden {
        previous_pid: u32,
        previous_host: String,
        expired_at: u64,
    },
    Released {
        holder_pid: u32,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointEvent {
    Saved {
        run_id: String,
        stage: String,
        completed_stages: usize,
    },
}

pub trait RunEventObserver: Send + Sync {
    fn on_event(&self, event: &RunEvent);
}

impl<F> RunEventObserver for F
where
    F: Fn(&RunEvent) + Send + Sync,
{
    fn on_event(&self, event: &RunEvent) {
        self(event);
    }
}

pub type SharedRunEventObserver = Arc<dyn RunEventObserver>;
pub type RunEventSender = mpsc::UnboundedSender<RunEvent>;
pub type RunEventReceiver = mpsc::UnboundedReceiver<RunEvent>;

#[derive(Clone, Default)]
pub struct RunEventSink {
    observer: Option<SharedRunEventObserver>,
    sender: Option<RunEventSender>,
}

impl RunEventSink {
    pub fn with_observer(observer: SharedRunEventObserver) -> Self {
        Self {
            observer: Some(observer),
            sender: None,
        }
    }

    pub fn with_sender(sender: RunEventSender) -> Self {
        Self {
            observer: None,
            sender: Some(sender),
        }
    }

    pub fn observer(mut self, observer: SharedRunEventObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn sender(mut self, sender: RunEventSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.observer.is_some() || self.sender.is_some()
    }

    pub fn emit(&self, event: RunEvent) {
        if let Some(observer) = self.observer.as_ref() {
            observer.on_event(&event);
        }
        if let Some(sender) = self.sender.as_ref() {
            let _ = sender.send(event);
        }
    }
}

pub fn run_event_channel() -> (RunEventSender, RunEventReceiver) {
    mpsc::unbounded_channel()
}

/// Sequenced emitter owned by one run; stamps each event with a
/// monotonically increasing sequence number and the wall-clock timestamp.
pub struct EventLog {
    sink: RunEventSink,
    sequence_no: u64,
}

impl EventLog {
    pub fn new(sink: RunEventSink) -> Self {
        Self {
            sink,
            sequence_no: 0,
        }
    }

    pub fn emit(&mut self, kind: RunEventKind) {
        self.sequence_no += 1;
        self.sink.emit(RunEvent {
            sequence_no: self.sequence_no,
            timestamp: weft_store::timestamp_now(),
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn event_log_observer_and_sender_expected_both_receive_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer_seen = Arc::clone(&seen);
        let observer: SharedRunEventObserver = Arc::new(move |event: &RunEvent| {
            observer_seen
                .lock()
                .expect("observer mutex should lock")
                .push(event.sequence_no);
        });
        let (tx, mut rx) = run_event_channel();
        let mut log = EventLog::new(RunEventSink::with_observer(observer).sender(tx));

        log.emit(RunEventKind::Pipeline(PipelineEvent::Started {
            run_id: "run-1".to_string(),
        }));
        log.emit(RunEventKind::Plan(PlanEvent::Full {
            reason: "no previous receipt".to_string(),
            outputs: 3,
        }));

        let first = rx.try_recv().expect("channel should receive first event");
        assert_eq!(first.sequence_no, 1);
        let second = rx.try_recv().expect("channel should receive second event");
        assert_eq!(second.sequence_no, 2);
        assert_eq!(
            seen.lock().expect("observer mutex should lock").as_slice(),
            &[1, 2]
        );
    }

    #[test]
    fn run_event_serde_expected_category_and_kind_tags() {
        let event = RunEvent {
            sequence_no: 3,
            timestamp: "1.000Z".to_string(),
            kind: RunEventKind::Lock(LockEvent::StaleOverridden {
                previous_pid: 99,
                previous_host: "host-b".to_string(),
                expired_at: 1_000,
            }),
        };

        let raw = serde_json::to_string(&event).expect("event should serialize");
        assert!(raw.contains("\"category\":\"lock\""));
        assert!(raw.contains("\"kind\":\"stale_overridden\""));
    }
}
