use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::engine::MqttEvent;
use super::error::MqttClientError;
use super::opts::EngineSettings;
use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::mqttv3::{
    puback::MqttPubAck, pubcomp::MqttPubComp, publish::MqttPublish, pubrec::MqttPubRec,
    pubrel::MqttPubRel,
};
use crate::mqtt_session::{ClientSession, ContextKey, DeliveryContext, DeliveryState, Flow};

/// Work produced by one pass over the queue, carried out by the caller once
/// the queue and session locks are released: packets are written in order,
/// then the events are handed to the dispatcher.
#[derive(Debug, Default, PartialEq)]
pub struct InflightOutcome {
    pub outgoing: Vec<MqttPacket>,
    pub events: Vec<MqttEvent>,
}

impl InflightOutcome {
    pub fn is_empty(&self) -> bool {
        self.outgoing.is_empty() && self.events.is_empty()
    }
}

/// What happened to a PUBLISH handed over by the receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingPublish {
    Queued,
    /// The broker resent a message we already hold; no new delivery.
    Duplicate,
}

/// Every delivery in progress on the current connection, in both directions.
///
/// The queue is a sans-I/O state machine: [`process`](Self::process) advances
/// each context by at most one step for a given instant and reports what must
/// be written and delivered, without touching the network.
///
/// - Retries resend the packet of the current step once `retry_delay` passes
///   without an acknowledgment, up to `max_attempts` sends in total.
/// - Exhausted deliveries are dropped from the queue and the session and
///   reported as failed.
/// - Contexts that are not finished go back to the tail after each pass, so
///   only the order of steps within one delivery is guaranteed.
/// - The capacity bounds what the application queues. Messages from the
///   broker are always taken, since dropping one would leave it unanswered
///   for the rest of the connection.
#[derive(Debug)]
pub struct InflightQueue {
    contexts: VecDeque<DeliveryContext>,
    /// Keys of queued contexts that carry an identifier (all but incoming QoS 0).
    index: HashSet<ContextKey>,
    capacity: usize,
    retry_delay: Duration,
    max_attempts: u32,
}

impl InflightQueue {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            contexts: VecDeque::new(),
            index: HashSet::new(),
            capacity: settings.inflight_capacity,
            retry_delay: settings.retry_delay(),
            max_attempts: settings.max_attempts,
        }
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Deliveries we started: publishes, subscribes and unsubscribes.
    pub fn outgoing_len(&self) -> usize {
        self.contexts
            .iter()
            .filter(|ctx| ctx.flow == Flow::ToPublish)
            .count()
    }

    pub fn is_full(&self) -> bool {
        self.outgoing_len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, key: &ContextKey) -> bool {
        self.index.contains(key)
    }

    pub fn get(&self, key: &ContextKey) -> Option<&DeliveryContext> {
        self.position(key).map(|pos| &self.contexts[pos])
    }

    pub fn push(&mut self, ctx: DeliveryContext) -> Result<(), MqttClientError> {
        if ctx.flow == Flow::ToPublish && self.is_full() {
            return Err(MqttClientError::BufferFull {
                buffer_type: "inflight".to_string(),
                capacity: self.capacity,
            });
        }
        if ctx.message_id() != 0 {
            self.index.insert(ctx.key());
        }
        self.contexts.push_back(ctx);
        Ok(())
    }

    /// Queues a PUBLISH received from the broker.
    ///
    /// A QoS 2 message whose identifier is still held is the broker retrying
    /// because our PUBREC did not arrive: the context goes back to resend
    /// PUBREC and nothing new is delivered.
    pub fn accept_incoming(&mut self, publish: MqttPublish) -> IncomingPublish {
        if let Some(message_id) = publish.message_id.filter(|_| publish.qos > 0) {
            let key = ContextKey::new(message_id, Flow::ToAcknowledge);
            if let Some(pos) = self.position(&key) {
                let ctx = &mut self.contexts[pos];
                if ctx.state == DeliveryState::WaitForPubrel {
                    ctx.state = DeliveryState::QueuedQos2;
                }
                debug!(%key, state = ?ctx.state, "duplicate PUBLISH collapsed");
                return IncomingPublish::Duplicate;
            }
        }

        let ctx = DeliveryContext::incoming_publish(publish);
        if ctx.message_id() != 0 {
            self.index.insert(ctx.key());
        }
        self.contexts.push_back(ctx);
        IncomingPublish::Queued
    }

    /// True when `ack` answers a context waiting in this queue. PUBREL looks
    /// for a message we are acknowledging; every other acknowledgment looks
    /// for something we published.
    pub fn awaits(&self, ack: &MqttPacket) -> bool {
        let flow = match ack {
            MqttPacket::PubRel(_) => Flow::ToAcknowledge,
            MqttPacket::PubAck(_)
            | MqttPacket::PubRec(_)
            | MqttPacket::PubComp(_)
            | MqttPacket::SubAck(_)
            | MqttPacket::UnsubAck(_) => Flow::ToPublish,
            _ => return false,
        };
        ack.message_id()
            .map(|id| self.contains(&ContextKey::new(id, flow)))
            .unwrap_or(false)
    }

    /// Appends the contexts resumed from a session behind whatever is queued.
    /// A key that is already queued keeps its current context. Returns how
    /// many were added.
    pub fn load(&mut self, contexts: Vec<DeliveryContext>) -> usize {
        let mut loaded = 0;
        for ctx in contexts {
            let key = ctx.key();
            if self.contains(&key) {
                debug!(%key, "resumed delivery already queued");
                continue;
            }
            match self.push(ctx) {
                Ok(()) => loaded += 1,
                Err(_) => {
                    warn!(%key, capacity = self.capacity, "resumed delivery does not fit the inflight queue")
                }
            }
        }
        loaded
    }

    /// Earliest instant at which a waiting context needs a retry or expires.
    ///
    /// Contexts that are ready to send are not covered: whoever queues them
    /// raises the wake signal.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.contexts
            .iter()
            .filter_map(|ctx| ctx.retry_due_at(self.retry_delay))
            .min()
    }

    /// Applies the acknowledgments received since the last pass, then moves
    /// every context one step forward.
    pub fn process(
        &mut self,
        acks: Vec<MqttPacket>,
        session: &mut ClientSession,
        now: Instant,
    ) -> InflightOutcome {
        let mut out = InflightOutcome::default();
        for ack in acks {
            self.apply_ack(ack, session, &mut out);
        }

        let pending = std::mem::take(&mut self.contexts);
        for ctx in pending {
            let key = ctx.key();
            match self.step(ctx, session, now, &mut out) {
                Some(ctx) => self.contexts.push_back(ctx),
                None => {
                    self.index.remove(&key);
                }
            }
        }
        out
    }

    fn position(&self, key: &ContextKey) -> Option<usize> {
        if !self.index.contains(key) {
            return None;
        }
        self.contexts.iter().position(|ctx| ctx.key() == *key)
    }

    fn take(&mut self, pos: usize) -> Option<DeliveryContext> {
        let ctx = self.contexts.remove(pos)?;
        self.index.remove(&ctx.key());
        Some(ctx)
    }

    fn apply_ack(&mut self, ack: MqttPacket, session: &mut ClientSession, out: &mut InflightOutcome) {
        use DeliveryState::*;

        let Some(message_id) = ack.message_id() else {
            debug!(packet = ?ack.packet_type(), "not an acknowledgment, ignored");
            return;
        };
        let (flow, expected): (Flow, &[DeliveryState]) = match &ack {
            MqttPacket::PubAck(_) => (Flow::ToPublish, &[WaitForPuback]),
            MqttPacket::PubRec(_) => (Flow::ToPublish, &[WaitForPubrec, WaitForPubcomp]),
            MqttPacket::PubComp(_) => (Flow::ToPublish, &[WaitForPubcomp]),
            MqttPacket::SubAck(_) => (Flow::ToPublish, &[WaitForSuback]),
            MqttPacket::UnsubAck(_) => (Flow::ToPublish, &[WaitForUnsuback]),
            MqttPacket::PubRel(_) => (Flow::ToAcknowledge, &[WaitForPubrel, QueuedQos2]),
            _ => {
                debug!(packet = ?ack.packet_type(), "not an acknowledgment, ignored");
                return;
            }
        };
        let key = ContextKey::new(message_id, flow);

        let matched = self
            .position(&key)
            .filter(|&pos| expected.contains(&self.contexts[pos].state));
        let Some(pos) = matched else {
            if let MqttPacket::PubRel(_) = ack {
                // handshake already finished on our side; answer again
                out.outgoing
                    .push(MqttPacket::PubComp(MqttPubComp::new(message_id)));
            }
            debug!(%key, packet = ?ack.packet_type(), "stale acknowledgment dropped");
            return;
        };

        if let MqttPacket::PubRec(_) = ack {
            let max_attempts = self.max_attempts;
            let ctx = &mut self.contexts[pos];
            if ctx.state == WaitForPubrec {
                ctx.attempt = 0;
                ctx.state = SendPubrel;
                trace!(%key, "PUBREC matched, releasing");
            } else if ctx.attempt < max_attempts {
                // repeated PUBREC spends the same attempts as a timed out PUBREL
                ctx.state = SendPubrel;
                debug!(%key, attempt = ctx.attempt, "PUBREC repeated, releasing again");
            } else {
                debug!(%key, "PUBREC repeated after the last PUBREL attempt, ignored");
            }
            return;
        }

        let Some(ctx) = self.take(pos) else {
            return;
        };
        session.remove(&key);
        trace!(%key, packet = ?ack.packet_type(), "handshake complete");

        match ack {
            MqttPacket::PubRel(_) => {
                out.outgoing
                    .push(MqttPacket::PubComp(MqttPubComp::new(message_id)));
                if let MqttPacket::Publish(publish) = ctx.packet {
                    out.events.push(MqttEvent::MessageReceived(publish));
                }
            }
            MqttPacket::SubAck(suback) => out.events.push(MqttEvent::Subscribed {
                message_id,
                granted_qos: suback.return_codes,
            }),
            MqttPacket::UnsubAck(_) => out.events.push(MqttEvent::Unsubscribed { message_id }),
            _ => out.events.push(MqttEvent::Published {
                message_id,
                success: true,
            }),
        }
    }

    fn step(
        &mut self,
        mut ctx: DeliveryContext,
        session: &mut ClientSession,
        now: Instant,
        out: &mut InflightOutcome,
    ) -> Option<DeliveryContext> {
        use DeliveryState::*;

        let message_id = ctx.message_id();
        match (ctx.flow, ctx.state) {
            (Flow::ToPublish, QueuedQos0) => {
                out.outgoing.push(ctx.packet);
                out.events.push(MqttEvent::Published {
                    message_id,
                    success: true,
                });
                None
            }
            (Flow::ToPublish, QueuedQos1) => {
                self.transmit(&mut ctx, WaitForPuback, session, now, out);
                Some(ctx)
            }
            (Flow::ToPublish, QueuedQos2) => {
                self.transmit(&mut ctx, WaitForPubrec, session, now, out);
                Some(ctx)
            }
            (Flow::ToPublish, SendPubrel) => {
                self.transmit(&mut ctx, WaitForPubcomp, session, now, out);
                Some(ctx)
            }
            (Flow::ToPublish, SendSubscribe) => {
                self.transmit(&mut ctx, WaitForSuback, session, now, out);
                Some(ctx)
            }
            (Flow::ToPublish, SendUnsubscribe) => {
                self.transmit(&mut ctx, WaitForUnsuback, session, now, out);
                Some(ctx)
            }
            (Flow::ToPublish, _) => self.retry_or_expire(ctx, session, now, out),

            (Flow::ToAcknowledge, QueuedQos0) => {
                if let MqttPacket::Publish(publish) = ctx.packet {
                    out.events.push(MqttEvent::MessageReceived(publish));
                }
                None
            }
            (Flow::ToAcknowledge, QueuedQos1) => {
                out.outgoing
                    .push(MqttPacket::PubAck(MqttPubAck::new(message_id)));
                if let MqttPacket::Publish(publish) = ctx.packet {
                    out.events.push(MqttEvent::MessageReceived(publish));
                }
                None
            }
            (Flow::ToAcknowledge, QueuedQos2) => {
                out.outgoing
                    .push(MqttPacket::PubRec(MqttPubRec::new(message_id)));
                ctx.mark_sent(WaitForPubrel, now);
                session.upsert(&ctx);
                Some(ctx)
            }
            // PUBREL is the broker's move; there is nothing to resend
            (Flow::ToAcknowledge, _) => Some(ctx),
        }
    }

    /// Sends the packet for the current step and moves to `next`.
    fn transmit(
        &self,
        ctx: &mut DeliveryContext,
        next: DeliveryState,
        session: &mut ClientSession,
        now: Instant,
        out: &mut InflightOutcome,
    ) {
        out.outgoing.push(Self::wire_packet(ctx, next));
        ctx.mark_sent(next, now);
        if ctx.is_session_tracked() {
            session.upsert(ctx);
        }
        trace!(key = %ctx.key(), state = ?ctx.state, attempt = ctx.attempt, "sent");
    }

    fn retry_or_expire(
        &self,
        mut ctx: DeliveryContext,
        session: &mut ClientSession,
        now: Instant,
        out: &mut InflightOutcome,
    ) -> Option<DeliveryContext> {
        let Some(due) = ctx.retry_due_at(self.retry_delay) else {
            return Some(ctx);
        };
        if now < due {
            return Some(ctx);
        }

        let key = ctx.key();
        if ctx.attempt < self.max_attempts {
            debug!(%key, state = ?ctx.state, attempt = ctx.attempt + 1, "no acknowledgment, resending");
            if let MqttPacket::Publish(publish) = &mut ctx.packet {
                publish.dup = true;
            }
            let state = ctx.state;
            self.transmit(&mut ctx, state, session, now, out);
            return Some(ctx);
        }

        warn!(%key, attempts = ctx.attempt, "delivery abandoned after exhausting retries");
        session.remove(&key);
        let message_id = ctx.message_id();
        out.events.push(match ctx.packet {
            MqttPacket::Subscribe(_) => MqttEvent::SubscribeFailed { message_id },
            MqttPacket::Unsubscribe(_) => MqttEvent::UnsubscribeFailed { message_id },
            _ => MqttEvent::Published {
                message_id,
                success: false,
            },
        });
        None
    }

    /// The packet that puts a context into `next`. Only the PUBREL step sends
    /// something other than the stored packet.
    fn wire_packet(ctx: &DeliveryContext, next: DeliveryState) -> MqttPacket {
        match next {
            DeliveryState::WaitForPubcomp => {
                MqttPacket::PubRel(MqttPubRel::new(ctx.message_id()))
            }
            _ => ctx.packet.clone(),
        }
    }
}
