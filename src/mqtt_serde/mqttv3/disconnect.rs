// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{continue_hint, parse_empty_packet, ParseError, ParseOk};

/// DISCONNECT, the last packet a client sends before closing the connection.
/// The broker discards the will message when it receives it.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, Default)]
pub struct MqttDisconnect {}

impl MqttDisconnect {
    pub fn new() -> Self {
        Self {}
    }
}

impl MqttControlPacket for MqttDisconnect {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::DISCONNECT as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        match parse_empty_packet(buffer, ControlPacketType::DISCONNECT as u8, "DISCONNECT")? {
            Some(consumed) => Ok(ParseOk::Packet(MqttPacket::Disconnect(MqttDisconnect::new()), consumed)),
            None => Ok(continue_hint(buffer)),
        }
    }
}
