use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a recorded call: OPEN while the stream is live, CLOSED once
/// the final status is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "CLOSED")]
    Closed,
}

/// One message observed on a stream, in real temporal order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// `"recv"` for incoming from the peer, `"send"` for outgoing.
    pub direction: String,
    pub timestamp: DateTime<Utc>,
    /// Whether a schema decode succeeded for this payload.
    pub recognized: bool,
    /// Whether the call was routed through the proxy.
    pub proxified: bool,
    pub payload_string: String,
    pub payload: Option<serde_json::Value>,
}

/// The structured trace of a single RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub full_method: String,
    pub messages: Vec<Message>,
    pub state: CallState,
    pub grpc_code: i32,
    pub grpc_message: String,
}

/// Owns history entries; a single writer (the call trace) updates each entry
/// in place, readers get a consistent sorted snapshot.
#[derive(Default)]
pub struct HistoryRegistry {
    histories: Mutex<Vec<History>>,
}

impl HistoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create-or-update by id.
    pub fn save(&self, history: History) {
        let mut histories = self.histories.lock().expect("history lock poisoned");
        if let Some(existing) = histories.iter_mut().find(|h| h.id == history.id) {
            *existing = history;
        } else {
            histories.push(history);
        }
    }

    /// Snapshot of all entries sorted by start time ascending.
    pub fn list(&self) -> Vec<History> {
        let histories = self.histories.lock().expect("history lock poisoned");
        let mut snapshot = histories.clone();
        snapshot.sort_by_key(|h| h.start_time);
        snapshot
    }

    pub fn clear(&self) {
        let mut histories = self.histories.lock().expect("history lock poisoned");
        histories.clear();
    }
}
