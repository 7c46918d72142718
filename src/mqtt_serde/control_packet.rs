use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

use super::encode_variable_length;
use super::parser::packet_type;
use super::parser::{ParseError, ParseOk};
use super::{MQTT_V31, MQTT_V311};

use crate::mqtt_serde::mqttv3::*;

/// Closed set of MQTT 3.1/3.1.1 control packets.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MqttPacket {
    Connect(connect::MqttConnect),
    ConnAck(connack::MqttConnAck),
    Publish(publish::MqttPublish),
    PubAck(puback::MqttPubAck),
    PubRec(pubrec::MqttPubRec),
    PubRel(pubrel::MqttPubRel),
    PubComp(pubcomp::MqttPubComp),
    Subscribe(subscribe::MqttSubscribe),
    SubAck(suback::MqttSubAck),
    Unsubscribe(unsubscribe::MqttUnsubscribe),
    UnsubAck(unsuback::MqttUnsubAck),
    PingReq(pingreq::MqttPingReq),
    PingResp(pingresp::MqttPingResp),
    Disconnect(disconnect::MqttDisconnect),
}

impl MqttPacket {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        match self {
            MqttPacket::Connect(p) => p.to_bytes(),
            MqttPacket::ConnAck(p) => p.to_bytes(),
            MqttPacket::Publish(p) => p.to_bytes(),
            MqttPacket::PubAck(p) => p.to_bytes(),
            MqttPacket::PubRec(p) => p.to_bytes(),
            MqttPacket::PubRel(p) => p.to_bytes(),
            MqttPacket::PubComp(p) => p.to_bytes(),
            MqttPacket::Subscribe(p) => p.to_bytes(),
            MqttPacket::SubAck(p) => p.to_bytes(),
            MqttPacket::Unsubscribe(p) => p.to_bytes(),
            MqttPacket::UnsubAck(p) => p.to_bytes(),
            MqttPacket::PingReq(p) => p.to_bytes(),
            MqttPacket::PingResp(p) => p.to_bytes(),
            MqttPacket::Disconnect(p) => p.to_bytes(),
        }
    }

    /// Decodes against a negotiated protocol level; both 3.1 and 3.1.1 share one wire layout.
    pub fn from_bytes_with_version(buffer: &[u8], mqtt_version: u8) -> Result<ParseOk, ParseError> {
        match mqtt_version {
            MQTT_V31 | MQTT_V311 => Self::from_bytes(buffer),
            _ => Err(ParseError::UnSuppProtoVsn),
        }
    }

    pub fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        let packet_type_byte = packet_type(buffer)?;
        let packet_type = ControlPacketType::try_from(packet_type_byte)?;

        match packet_type {
            ControlPacketType::CONNECT => connect::MqttConnect::from_bytes(buffer),
            ControlPacketType::CONNACK => connack::MqttConnAck::from_bytes(buffer),
            ControlPacketType::PUBLISH => publish::MqttPublish::from_bytes(buffer),
            ControlPacketType::PUBACK => puback::MqttPubAck::from_bytes(buffer),
            ControlPacketType::PUBREC => pubrec::MqttPubRec::from_bytes(buffer),
            ControlPacketType::PUBREL => pubrel::MqttPubRel::from_bytes(buffer),
            ControlPacketType::PUBCOMP => pubcomp::MqttPubComp::from_bytes(buffer),
            ControlPacketType::SUBSCRIBE => subscribe::MqttSubscribe::from_bytes(buffer),
            ControlPacketType::SUBACK => suback::MqttSubAck::from_bytes(buffer),
            ControlPacketType::UNSUBSCRIBE => unsubscribe::MqttUnsubscribe::from_bytes(buffer),
            ControlPacketType::UNSUBACK => unsuback::MqttUnsubAck::from_bytes(buffer),
            ControlPacketType::PINGREQ => pingreq::MqttPingReq::from_bytes(buffer),
            ControlPacketType::PINGRESP => pingresp::MqttPingResp::from_bytes(buffer),
            ControlPacketType::DISCONNECT => disconnect::MqttDisconnect::from_bytes(buffer),
        }
    }

    pub fn packet_type(&self) -> ControlPacketType {
        match self {
            MqttPacket::Connect(_) => ControlPacketType::CONNECT,
            MqttPacket::ConnAck(_) => ControlPacketType::CONNACK,
            MqttPacket::Publish(_) => ControlPacketType::PUBLISH,
            MqttPacket::PubAck(_) => ControlPacketType::PUBACK,
            MqttPacket::PubRec(_) => ControlPacketType::PUBREC,
            MqttPacket::PubRel(_) => ControlPacketType::PUBREL,
            MqttPacket::PubComp(_) => ControlPacketType::PUBCOMP,
            MqttPacket::Subscribe(_) => ControlPacketType::SUBSCRIBE,
            MqttPacket::SubAck(_) => ControlPacketType::SUBACK,
            MqttPacket::Unsubscribe(_) => ControlPacketType::UNSUBSCRIBE,
            MqttPacket::UnsubAck(_) => ControlPacketType::UNSUBACK,
            MqttPacket::PingReq(_) => ControlPacketType::PINGREQ,
            MqttPacket::PingResp(_) => ControlPacketType::PINGRESP,
            MqttPacket::Disconnect(_) => ControlPacketType::DISCONNECT,
        }
    }

    /// Message identifier carried by the packet, if any. QoS 0 PUBLISH has none.
    pub fn message_id(&self) -> Option<u16> {
        match self {
            MqttPacket::Publish(p) => p.message_id,
            MqttPacket::PubAck(p) => Some(p.message_id),
            MqttPacket::PubRec(p) => Some(p.message_id),
            MqttPacket::PubRel(p) => Some(p.message_id),
            MqttPacket::PubComp(p) => Some(p.message_id),
            MqttPacket::Subscribe(p) => Some(p.message_id),
            MqttPacket::SubAck(p) => Some(p.message_id),
            MqttPacket::Unsubscribe(p) => Some(p.message_id),
            MqttPacket::UnsubAck(p) => Some(p.message_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPacketType {
    CONNECT = 1,
    CONNACK = 2,
    PUBLISH = 3,
    PUBACK = 4,
    PUBREC = 5,
    PUBREL = 6,
    PUBCOMP = 7,
    SUBSCRIBE = 8,
    SUBACK = 9,
    UNSUBSCRIBE = 10,
    UNSUBACK = 11,
    PINGREQ = 12,
    PINGRESP = 13,
    DISCONNECT = 14,
}

impl TryFrom<u8> for ControlPacketType {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ControlPacketType::CONNECT),
            2 => Ok(ControlPacketType::CONNACK),
            3 => Ok(ControlPacketType::PUBLISH),
            4 => Ok(ControlPacketType::PUBACK),
            5 => Ok(ControlPacketType::PUBREC),
            6 => Ok(ControlPacketType::PUBREL),
            7 => Ok(ControlPacketType::PUBCOMP),
            8 => Ok(ControlPacketType::SUBSCRIBE),
            9 => Ok(ControlPacketType::SUBACK),
            10 => Ok(ControlPacketType::UNSUBSCRIBE),
            11 => Ok(ControlPacketType::UNSUBACK),
            12 => Ok(ControlPacketType::PINGREQ),
            13 => Ok(ControlPacketType::PINGRESP),
            14 => Ok(ControlPacketType::DISCONNECT),
            // 0 and 15 are reserved in 3.1.1
            _ => Err(ParseError::InvalidPacketType),
        }
    }
}

pub trait MqttControlPacket {
    // 2.2.1, MQTT control packet type
    fn control_packet_type(&self) -> u8;

    // 2.2.2, Flags in the fixed header
    fn flags(&self) -> u8 {
        0u8
    }

    // Default implementations
    // Constructs the fixed header for the MQTT packet.
    // The fixed header consists of a control packet type, flags, and the remaining length.
    fn fixed_header(&self, len: usize) -> Vec<u8> {
        let byte1: u8 = (self.control_packet_type()) << 4 | self.flags();
        let variable_length = encode_variable_length(len);
        let mut hdr = vec![byte1];
        hdr.extend(variable_length);
        hdr
    }

    // return variable header
    fn variable_header(&self) -> Result<Vec<u8>, ParseError>;

    // return payload
    fn payload(&self) -> Result<Vec<u8>, ParseError>;

    // decoder
    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError>;

    // encoder, fails before producing any bytes if a field is invalid
    fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        let vhdr = self.variable_header()?;
        let payload = self.payload()?;
        let remaining_length = vhdr.len() + payload.len();
        if remaining_length > crate::mqtt_serde::base_data::MAX_REMAINING_LENGTH {
            return Err(ParseError::InvalidLength);
        }

        let mut bytes = self.fixed_header(remaining_length);
        bytes.reserve(remaining_length);
        bytes.extend(vhdr);
        bytes.extend(payload);
        Ok(bytes)
    }
}
