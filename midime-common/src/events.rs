//! Event types for the MiDiMe event system
//!
//! Provides shared event definitions and the EventBus used to observe corpus
//! mutations and background job outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// MiDiMe event types
///
/// Events are broadcast via EventBus and can be serialized for transmission
/// to whatever front end subscribes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MidimeEvent {
    /// A pattern passed the duplicate guard and was inserted into the index
    PatternAdmitted {
        pattern_id: Uuid,
        source_song_id: Uuid,
        instrument_type: String,
        timestamp: DateTime<Utc>,
    },

    /// A submission was rejected by the duplicate guard
    SubmissionRejected {
        user_id: Uuid,
        source_song_id: Uuid,
        /// Rejection reason (`duplicate_section` or `tier_limit_exceeded`)
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The retrieval backend for an instrument shard changed
    BackendChanged {
        instrument_type: String,
        from: String,
        to: String,
        corpus_size: usize,
        timestamp: DateTime<Utc>,
    },

    /// A batch of neighbor lists was written
    NeighborListsPublished {
        instrument_type: String,
        lists: usize,
        timestamp: DateTime<Utc>,
    },

    /// Neighbor precomputation exhausted its retry budget
    ///
    /// Fatal alert: the corpus keeps serving brute-force and ad-hoc queries.
    PrecomputeFailed {
        attempts: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus for MidimeEvent
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MidimeEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the given channel capacity
    ///
    /// Events beyond capacity that no receiver has read are dropped (oldest first).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<MidimeEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: MidimeEvent,
    ) -> Result<usize, broadcast::error::SendError<MidimeEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: MidimeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
