// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{
    continue_hint, expect_fixed_header, packet_type, ParseError, ParseOk,
};

pub const CONNECTION_ACCEPTED: u8 = 0x00;

/// CONNACK, the broker's answer to CONNECT.
///
/// `return_code` is 0 on success; 1 to 5 are the refusal reasons listed in
/// [`connack_description`].
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttConnAck {
    /// Always false when the CONNECT asked for a clean session.
    pub session_present: bool,
    pub return_code: u8,
}

impl MqttConnAck {
    pub fn new(session_present: bool, return_code: u8) -> Self {
        Self {
            session_present,
            return_code,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.return_code == CONNECTION_ACCEPTED
    }
}

/// Human readable text for a CONNACK return code.
pub fn connack_description(return_code: u8) -> &'static str {
    match return_code {
        0x00 => "Connection accepted",
        0x01 => "Connection refused: unacceptable protocol version",
        0x02 => "Connection refused: identifier rejected",
        0x03 => "Connection refused: server unavailable",
        0x04 => "Connection refused: bad user name or password",
        0x05 => "Connection refused: not authorized",
        _ => "Connection refused: unknown return code",
    }
}

impl MqttControlPacket for MqttConnAck {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::CONNACK as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        if self.return_code > 5 {
            return Err(ParseError::ParseError(
                "Invalid CONNACK return code".to_string(),
            ));
        }
        Ok(vec![self.session_present as u8, self.return_code])
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        Ok(Vec::new())
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        if packet_type(buffer)? != ControlPacketType::CONNACK as u8 {
            return Err(ParseError::InvalidPacketType);
        }
        let Some((offset, size)) = expect_fixed_header(buffer, "CONNACK", 0x00)? else {
            return Ok(continue_hint(buffer));
        };

        if size != 2 {
            return Err(ParseError::ParseError(
                "CONNACK packet must have a remaining length of 2".to_string(),
            ));
        }

        let ack_flags = buffer[offset];
        if ack_flags & 0xFE != 0 {
            return Err(ParseError::ParseError(
                "CONNACK session present flags reserved bits must be 0".to_string(),
            ));
        }

        let return_code = buffer[offset + 1];
        if return_code > 5 {
            return Err(ParseError::ParseError(
                "Invalid CONNACK return code".to_string(),
            ));
        }

        Ok(ParseOk::Packet(
            MqttPacket::ConnAck(MqttConnAck::new(ack_flags == 0x01, return_code)),
            offset + size,
        ))
    }
}
