use crate::mqtt_session::delivery::{ContextKey, DeliveryContext, Flow};
use std::collections::HashMap;
use tracing::debug;

/// Client-side session state that outlives a single network connection.
///
/// Holds every QoS 1/2 PUBLISH handshake that has not completed, keyed by
/// message id and flow, plus the message identifier counter so identifiers
/// keep advancing across reconnects.
#[derive(Debug)]
pub struct ClientSession {
    client_id: String,
    // value carries an insertion sequence so restore replays in original order
    inflight_messages: HashMap<ContextKey, (u64, DeliveryContext)>,
    next_seq: u64,
    last_message_id: u16,
}

impl ClientSession {
    pub fn new(client_id: impl Into<String>) -> Self {
        ClientSession {
            client_id: client_id.into(),
            inflight_messages: HashMap::new(),
            next_seq: 0,
            last_message_id: 0,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Inserts a context or refreshes the stored copy of an existing one.
    pub fn upsert(&mut self, ctx: &DeliveryContext) {
        let key = ctx.key();
        match self.inflight_messages.get_mut(&key) {
            Some((_, stored)) => *stored = ctx.clone(),
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.inflight_messages.insert(key, (seq, ctx.clone()));
            }
        }
    }

    pub fn remove(&mut self, key: &ContextKey) -> Option<DeliveryContext> {
        self.inflight_messages.remove(key).map(|(_, ctx)| ctx)
    }

    pub fn get(&self, key: &ContextKey) -> Option<&DeliveryContext> {
        self.inflight_messages.get(key).map(|(_, ctx)| ctx)
    }

    pub fn contains(&self, key: &ContextKey) -> bool {
        self.inflight_messages.contains_key(key)
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight_messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight_messages.is_empty()
    }

    /// Drops all pending handshakes. The message id counter keeps running.
    pub fn clear(&mut self) {
        self.inflight_messages.clear();
    }

    /// Allocates the next message identifier, wrapping 65535 -> 1 and skipping
    /// 0, identifiers of outgoing handshakes stored here, and any identifier
    /// `in_use` still reports as busy.
    ///
    /// Returns `None` when every identifier is taken.
    pub fn next_message_id(&mut self, in_use: impl Fn(u16) -> bool) -> Option<u16> {
        let mut candidate = self.last_message_id;
        for _ in 0..u16::MAX {
            candidate = if candidate == u16::MAX { 1 } else { candidate + 1 };
            let stored = self
                .inflight_messages
                .contains_key(&ContextKey::new(candidate, Flow::ToPublish));
            if !stored && !in_use(candidate) {
                self.last_message_id = candidate;
                return Some(candidate);
            }
        }
        None
    }

    /// Prepares the session for a new connection.
    ///
    /// With `clean_session` the table is emptied and nothing is returned.
    /// Otherwise every stored context comes back, in the order it was first
    /// stored, rewound to the step that must be resent.
    pub fn restore(&mut self, clean_session: bool) -> Vec<DeliveryContext> {
        if clean_session {
            debug!(client_id = %self.client_id, discarded = self.inflight_messages.len(), "clean session requested");
            self.clear();
            return Vec::new();
        }

        let mut entries: Vec<&mut (u64, DeliveryContext)> =
            self.inflight_messages.values_mut().collect();
        entries.sort_by_key(|(seq, _)| *seq);

        let restored: Vec<DeliveryContext> = entries
            .into_iter()
            .map(|(_, ctx)| {
                ctx.rewind_for_resume();
                ctx.clone()
            })
            .collect();
        debug!(client_id = %self.client_id, restored = restored.len(), "resuming session");
        restored
    }
}
