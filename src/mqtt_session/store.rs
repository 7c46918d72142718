use crate::mqtt_session::client_session::ClientSession;
use crate::mqtt_session::SharedSession;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// In-memory table of sessions keyed by client id.
///
/// Handy for applications that drive several logical clients and want each
/// reconnect to pick up where the previous connection of the same client id
/// stopped. Sessions live until removed or the store is dropped.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SharedSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session for `client_id`, creating an empty one on first use.
    pub fn session(&self, client_id: &str) -> SharedSession {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ClientSession::new(client_id))))
            .clone()
    }

    pub fn remove(&self, client_id: &str) -> Option<SharedSession> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(client_id)
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .map(|s| s.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
