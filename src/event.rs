//! Structured events emitted by the dispatcher on every transition.
//!
//! The dashboard polls the event log to animate task flow; events are the
//! dispatcher's voice, `tracing` output is the operator's.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::History;
use crate::model::ProvenanceChain;

/// A structured event emitted by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number, starting at 1. Consumers can detect gaps.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    TaskQueued {
        id: u64,
        worker: String,
        provenance: ProvenanceChain,
    },
    TaskStarted {
        id: u64,
        worker: String,
    },
    TaskCompleted {
        id: u64,
        worker: String,
        duration_ms: u64,
    },
    TaskRetried {
        id: u64,
        worker: String,
        retry_count: u32,
        error: String,
    },
    TaskFailed {
        id: u64,
        worker: String,
        retry_count: u32,
        error: String,
    },
    ProvenanceReleased {
        prefix: ProvenanceChain,
    },
    WatcherNotified {
        id: u64,
        worker: String,
        prefix: ProvenanceChain,
    },
    NotifyFailed {
        id: u64,
        worker: String,
        prefix: ProvenanceChain,
        error: String,
    },
}

/// Bounded, sequence-numbered event log.
#[derive(Debug)]
pub(crate) struct EventLog {
    next_seq: u64,
    events: History<Event>,
}

impl EventLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            next_seq: 1,
            events: History::new(capacity),
        }
    }

    pub(crate) fn record(&mut self, kind: EventKind) {
        let event = Event {
            seq: self.next_seq,
            timestamp: Utc::now(),
            kind,
        };
        self.next_seq += 1;
        self.events.push(event);
    }

    pub(crate) fn since(&self, seq: u64) -> Vec<Event> {
        self.events
            .iter()
            .filter(|event| event.seq > seq)
            .cloned()
            .collect()
    }
}
