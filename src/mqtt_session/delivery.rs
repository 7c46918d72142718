use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::mqttv3::publish::MqttPublish;
use crate::mqtt_serde::mqttv3::subscribe::MqttSubscribe;
use crate::mqtt_serde::mqttv3::unsubscribe::MqttUnsubscribe;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Which side owes the next step of a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Flow {
    /// We sent the packet and must drive it to completion.
    ToPublish,
    /// The broker sent it and we must acknowledge.
    ToAcknowledge,
}

/// Position of a delivery within its QoS handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryState {
    QueuedQos0,
    QueuedQos1,
    QueuedQos2,
    WaitForPuback,
    WaitForPubrec,
    WaitForPubrel,
    WaitForPubcomp,
    SendPubrel,
    SendSubscribe,
    SendUnsubscribe,
    WaitForSuback,
    WaitForUnsuback,
}

impl DeliveryState {
    /// States in which we have sent something and are waiting on the broker.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            DeliveryState::WaitForPuback
                | DeliveryState::WaitForPubrec
                | DeliveryState::WaitForPubrel
                | DeliveryState::WaitForPubcomp
                | DeliveryState::WaitForSuback
                | DeliveryState::WaitForUnsuback
        )
    }
}

/// Identity of a delivery. Broker-assigned and client-assigned identifiers
/// live in separate spaces, so the flow is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextKey {
    pub message_id: u16,
    pub flow: Flow,
}

impl ContextKey {
    pub fn new(message_id: u16, flow: Flow) -> Self {
        Self { message_id, flow }
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.message_id, self.flow)
    }
}

/// One packet and its progress through the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryContext {
    pub packet: MqttPacket,
    pub state: DeliveryState,
    pub flow: Flow,
    /// Number of times the packet for the current step has been sent.
    pub attempt: u32,
    pub last_sent_at: Option<Instant>,
    message_id: u16,
}

impl DeliveryContext {
    /// Outgoing PUBLISH. QoS 0 messages still get an identifier so completion
    /// can be reported, but it never reaches the wire.
    pub fn outgoing_publish(message_id: u16, mut publish: MqttPublish) -> Self {
        let state = match publish.qos {
            0 => DeliveryState::QueuedQos0,
            1 => DeliveryState::QueuedQos1,
            _ => DeliveryState::QueuedQos2,
        };
        publish.message_id = (publish.qos > 0).then_some(message_id);
        Self::new(message_id, MqttPacket::Publish(publish), state, Flow::ToPublish)
    }

    pub fn outgoing_subscribe(subscribe: MqttSubscribe) -> Self {
        let message_id = subscribe.message_id;
        Self::new(
            message_id,
            MqttPacket::Subscribe(subscribe),
            DeliveryState::SendSubscribe,
            Flow::ToPublish,
        )
    }

    pub fn outgoing_unsubscribe(unsubscribe: MqttUnsubscribe) -> Self {
        let message_id = unsubscribe.message_id;
        Self::new(
            message_id,
            MqttPacket::Unsubscribe(unsubscribe),
            DeliveryState::SendUnsubscribe,
            Flow::ToPublish,
        )
    }

    /// PUBLISH received from the broker.
    pub fn incoming_publish(publish: MqttPublish) -> Self {
        let state = match publish.qos {
            0 => DeliveryState::QueuedQos0,
            1 => DeliveryState::QueuedQos1,
            _ => DeliveryState::QueuedQos2,
        };
        let message_id = publish.message_id.unwrap_or(0);
        Self::new(
            message_id,
            MqttPacket::Publish(publish),
            state,
            Flow::ToAcknowledge,
        )
    }

    fn new(message_id: u16, packet: MqttPacket, state: DeliveryState, flow: Flow) -> Self {
        Self {
            packet,
            state,
            flow,
            attempt: 0,
            last_sent_at: None,
            message_id,
        }
    }

    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    pub fn key(&self) -> ContextKey {
        ContextKey::new(self.message_id, self.flow)
    }

    pub fn publish(&self) -> Option<&MqttPublish> {
        match &self.packet {
            MqttPacket::Publish(p) => Some(p),
            _ => None,
        }
    }

    pub fn qos(&self) -> u8 {
        self.publish().map(|p| p.qos).unwrap_or(1)
    }

    /// QoS 1/2 PUBLISH handshakes survive reconnects; everything else does not.
    pub fn is_session_tracked(&self) -> bool {
        self.publish().map(|p| p.qos > 0).unwrap_or(false)
    }

    /// When the current wait times out, if the context is waiting on the broker
    /// for something we can resend.
    pub fn retry_due_at(&self, retry_delay: Duration) -> Option<Instant> {
        if self.flow != Flow::ToPublish || !self.state.is_waiting() {
            return None;
        }
        self.last_sent_at.map(|sent| sent + retry_delay)
    }

    pub(crate) fn mark_sent(&mut self, next: DeliveryState, now: Instant) {
        self.state = next;
        self.attempt += 1;
        self.last_sent_at = Some(now);
    }

    /// Rewinds an interrupted handshake to the step that has to be sent again
    /// on a new connection. A PUBLISH whose delivery may already have reached
    /// the broker goes out again flagged as a duplicate.
    pub(crate) fn rewind_for_resume(&mut self) {
        if self.flow == Flow::ToPublish {
            let rewound = match self.state {
                DeliveryState::WaitForPuback => Some(DeliveryState::QueuedQos1),
                DeliveryState::WaitForPubrec => Some(DeliveryState::QueuedQos2),
                DeliveryState::WaitForPubcomp => Some(DeliveryState::SendPubrel),
                _ => None,
            };
            if let Some(state) = rewound {
                if let MqttPacket::Publish(p) = &mut self.packet {
                    p.dup = state != DeliveryState::SendPubrel;
                }
                self.state = state;
            }
        }
        self.attempt = 0;
        self.last_sent_at = None;
    }
}
