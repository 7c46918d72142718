// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{continue_hint, parse_empty_packet, ParseError, ParseOk};

/// PINGREQ, sent by the keep-alive timer when the connection has been idle
/// for a full keep-alive period.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, Default)]
pub struct MqttPingReq;

impl MqttPingReq {
    pub fn new() -> Self {
        Self
    }
}

impl MqttControlPacket for MqttPingReq {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::PINGREQ as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        match parse_empty_packet(buffer, ControlPacketType::PINGREQ as u8, "PINGREQ")? {
            Some(consumed) => Ok(ParseOk::Packet(MqttPacket::PingReq(MqttPingReq::new()), consumed)),
            None => Ok(continue_hint(buffer)),
        }
    }
}
