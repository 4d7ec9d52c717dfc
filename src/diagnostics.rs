//! Bounded record of recent proxy decisions.
//!
//! Entries are written into a fixed ring of slots; once full, the oldest slot
//! is overwritten. Readers get a snapshot copy and never hold the lock while
//! serializing.

use crate::config::DiagnosticsSettings;
use crate::error::NoExampleReason;
use crate::proxy::RequestState;
use crate::request::RequestSummary;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// Relayed from upstream with this status.
    ///
    /// Recorded once the upstream response headers arrive, before the body
    /// is streamed to the client. A body later cut off by the request
    /// deadline or a dropped upstream connection still shows as `Forwarded`.
    Forwarded { status: u16 },
    RejectedNoOperation,
    RejectedNoExample { reason: NoExampleReason },
    RejectedUpstreamFailure { error: String, timeout: bool },
}

/// One recorded request.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsEntry {
    /// Assigned by the recorder, increasing across the process lifetime
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub request: RequestSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_by: Option<String>,
    pub state: RequestState,
    pub outcome: Outcome,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_token: Option<String>,
}

impl DiagnosticsEntry {
    pub fn new(request: RequestSummary, state: RequestState, outcome: Outcome) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            request,
            operation_id: None,
            example: None,
            selected_by: None,
            state,
            outcome,
            elapsed_ms: 0,
            selection_token: None,
        }
    }
}

struct Ring {
    slots: Vec<Option<DiagnosticsEntry>>,
    /// Slot the next entry is written to
    next: usize,
    len: usize,
    sequence: u64,
}

/// Fixed-capacity diagnostics buffer shared by all in-flight requests.
pub struct DiagnosticsRecorder {
    capacity: usize,
    include_selection_token: bool,
    ring: Mutex<Ring>,
}

impl DiagnosticsRecorder {
    pub fn new(settings: &DiagnosticsSettings) -> Self {
        Self::with_capacity(settings.capacity, settings.include_selection_token)
    }

    pub fn with_capacity(capacity: usize, include_selection_token: bool) -> Self {
        Self {
            capacity,
            include_selection_token,
            ring: Mutex::new(Ring {
                slots: vec![None; capacity],
                next: 0,
                len: 0,
                sequence: 0,
            }),
        }
    }

    /// Store an entry, evicting the oldest once full. Capacity 0 drops it.
    pub fn record(&self, mut entry: DiagnosticsEntry) {
        if self.capacity == 0 {
            return;
        }
        if !self.include_selection_token {
            entry.selection_token = None;
        }

        let mut ring = self.ring.lock();
        ring.sequence += 1;
        entry.sequence = ring.sequence;
        let slot = ring.next;
        ring.slots[slot] = Some(entry);
        ring.next = (slot + 1) % self.capacity;
        ring.len = (ring.len + 1).min(self.capacity);
    }

    /// Up to `n` entries, most recent first. Does not consume.
    pub fn last_n(&self, n: usize) -> Vec<DiagnosticsEntry> {
        if self.capacity == 0 {
            return Vec::new();
        }
        let ring = self.ring.lock();
        let take = n.min(ring.len);
        (1..=take)
            .filter_map(|back| {
                let slot = (ring.next + self.capacity - back) % self.capacity;
                ring.slots[slot].clone()
            })
            .collect()
    }

    /// Every retained entry, most recent first.
    pub fn snapshot(&self) -> Vec<DiagnosticsEntry> {
        self.last_n(self.capacity)
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn includes_selection_token(&self) -> bool {
        self.include_selection_token
    }

    /// Drop all entries. Sequence numbers keep increasing.
    pub fn clear(&self) {
        let mut ring = self.ring.lock();
        ring.slots.iter_mut().for_each(|slot| *slot = None);
        ring.next = 0;
        ring.len = 0;
    }
}
