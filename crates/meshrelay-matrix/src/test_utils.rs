//! In-memory homeserver for tests
//!
//! [`FakeMatrix`] implements [`MatrixApi`] without any network: joins and
//! sends are recorded, sync responses are scripted.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use crate::client::MatrixApi;
use crate::error::{MatrixError, Result};
use crate::sync::{JoinedRoom, RoomEvent, SyncResponse, Timeline};

/// One event sent through the fake
#[derive(Debug, Clone)]
pub struct SentEvent {
    /// Target room id
    pub room_id: String,
    /// Event type
    pub event_type: String,
    /// Event content
    pub content: Value,
    /// Event id handed back
    pub event_id: String,
}

#[derive(Default)]
struct FakeState {
    user_id: String,
    aliases: HashMap<String, String>,
    forbidden: HashSet<String>,
    joined: Vec<String>,
    whoami_failures: u32,
    whoami_status: u16,
    display_names: HashMap<String, String>,
    syncs: VecDeque<Result<SyncResponse>>,
    sync_calls: usize,
    batch: u64,
    sent: Vec<SentEvent>,
}

/// Scripted homeserver
pub struct FakeMatrix {
    state: Mutex<FakeState>,
}

fn api_error(status: u16, errcode: &str) -> MatrixError {
    MatrixError::Api {
        status,
        errcode: errcode.to_string(),
        message: "fake homeserver".to_string(),
    }
}

impl FakeMatrix {
    /// Homeserver where the token belongs to `user_id`
    pub fn new(user_id: &str) -> Self {
        Self {
            state: Mutex::new(FakeState {
                user_id: user_id.to_string(),
                ..Default::default()
            }),
        }
    }

    /// Make a room alias resolve to a room id
    pub fn alias(&self, alias: &str, room_id: &str) {
        self.state
            .lock()
            .aliases
            .insert(alias.to_string(), room_id.to_string());
    }

    /// Refuse joins of a room
    pub fn forbid_join(&self, room: &str) {
        self.state.lock().forbidden.insert(room.to_string());
    }

    /// Fail the next `times` whoami calls with `status`
    pub fn fail_whoami(&self, times: u32, status: u16) {
        let mut state = self.state.lock();
        state.whoami_failures = times;
        state.whoami_status = status;
    }

    /// Set a profile display name
    pub fn set_display_name(&self, user_id: &str, name: &str) {
        self.state
            .lock()
            .display_names
            .insert(user_id.to_string(), name.to_string());
    }

    /// Queue a sync result
    pub fn push_sync(&self, result: Result<SyncResponse>) {
        self.state.lock().syncs.push_back(result);
    }

    /// Number of sync calls made
    pub fn sync_calls(&self) -> usize {
        self.state.lock().sync_calls
    }

    /// Rooms joined so far
    pub fn joined(&self) -> Vec<String> {
        self.state.lock().joined.clone()
    }

    /// Events sent so far
    pub fn sent(&self) -> Vec<SentEvent> {
        self.state.lock().sent.clone()
    }
}

#[async_trait]
impl MatrixApi for FakeMatrix {
    async fn whoami(&self) -> Result<String> {
        let mut state = self.state.lock();
        if state.whoami_failures > 0 {
            state.whoami_failures -= 1;
            let errcode = if state.whoami_status == 401 {
                "M_UNKNOWN_TOKEN"
            } else {
                "M_UNKNOWN"
            };
            return Err(api_error(state.whoami_status, errcode));
        }
        Ok(state.user_id.clone())
    }

    async fn join(&self, room: &str) -> Result<String> {
        let mut state = self.state.lock();
        if state.forbidden.contains(room) {
            return Err(api_error(403, "M_FORBIDDEN"));
        }
        let room_id = state
            .aliases
            .get(room)
            .cloned()
            .unwrap_or_else(|| room.to_string());
        state.joined.push(room_id.clone());
        Ok(room_id)
    }

    async fn send_event(&self, room_id: &str, event_type: &str, content: Value) -> Result<String> {
        let mut state = self.state.lock();
        let event_id = format!("$sent{}", state.sent.len() + 1);
        state.sent.push(SentEvent {
            room_id: room_id.to_string(),
            event_type: event_type.to_string(),
            content,
            event_id: event_id.clone(),
        });
        Ok(event_id)
    }

    async fn display_name(&self, user_id: &str) -> Result<Option<String>> {
        match self.state.lock().display_names.get(user_id) {
            Some(name) => Ok(Some(name.clone())),
            None => Err(api_error(404, "M_NOT_FOUND")),
        }
    }

    async fn sync(&self, _since: Option<&str>, timeout: Duration) -> Result<SyncResponse> {
        let scripted = {
            let mut state = self.state.lock();
            state.sync_calls += 1;
            state.syncs.pop_front()
        };
        if let Some(result) = scripted {
            return result;
        }

        // Nothing scripted: behave like an idle long poll
        tokio::time::sleep(timeout).await;
        let mut state = self.state.lock();
        state.batch += 1;
        Ok(SyncResponse {
            next_batch: format!("idle{}", state.batch),
            ..Default::default()
        })
    }
}

/// A text message event
pub fn message_event(event_id: &str, sender: &str, body: &str) -> RoomEvent {
    RoomEvent {
        event_id: event_id.to_string(),
        sender: sender.to_string(),
        kind: "m.room.message".to_string(),
        content: json!({ "msgtype": "m.text", "body": body }),
    }
}

/// A sync response holding `events`, each paired with its room id
pub fn sync_batch(next_batch: &str, events: &[(&str, RoomEvent)]) -> SyncResponse {
    let mut response = SyncResponse {
        next_batch: next_batch.to_string(),
        ..Default::default()
    };
    for (room_id, event) in events {
        response
            .rooms
            .join
            .entry(room_id.to_string())
            .or_insert_with(|| JoinedRoom {
                timeline: Timeline::default(),
            })
            .timeline
            .events
            .push(event.clone());
    }
    response
}
