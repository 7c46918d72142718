use serde::{Deserialize, Serialize};

use crate::mqtt_serde::base_data::TwoByteInteger;
use crate::mqtt_serde::control_packet::{ControlPacketType, MqttControlPacket, MqttPacket};
use crate::mqtt_serde::parser::{
    continue_hint, expect_fixed_header, parse_binary_data, parse_utf8_string, ParseError, ParseOk,
};
use crate::mqtt_serde::{
    encode_binary_data, encode_utf8_string, validate_qos, MQTT_V31, MQTT_V311,
};

const PROTOCOL_NAME_V31: &str = "MQIsdp";
const PROTOCOL_NAME_V311: &str = "MQTT";

// Connect flags, 3.1.2.3
const FLAG_USERNAME: u8 = 0x80;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_WILL_RETAIN: u8 = 0x20;
const FLAG_WILL_QOS: u8 = 0x18;
const FLAG_WILL: u8 = 0x04;
const FLAG_CLEAN_SESSION: u8 = 0x02;
const FLAG_RESERVED: u8 = 0x01;

/// Message the broker publishes on our behalf if the connection drops uncleanly.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Will {
    pub retain: bool,
    pub qos: u8,
    pub topic: String,
    pub message: Vec<u8>,
}

impl Will {
    pub fn new(topic: impl Into<String>, message: impl Into<Vec<u8>>, qos: u8, retain: bool) -> Self {
        Self {
            retain,
            qos,
            topic: topic.into(),
            message: message.into(),
        }
    }
}

/// CONNECT, the first packet a client sends on a new connection.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MqttConnect {
    /// 3 for MQTT 3.1, 4 for MQTT 3.1.1.
    pub protocol_version: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

impl MqttConnect {
    pub fn new(client_id: String, keep_alive: u16, clean_session: bool) -> Self {
        Self {
            protocol_version: MQTT_V311,
            clean_session,
            keep_alive,
            client_id,
            will: None,
            username: None,
            password: None,
        }
    }

    fn protocol_name(&self) -> Result<&'static str, ParseError> {
        match self.protocol_version {
            MQTT_V31 => Ok(PROTOCOL_NAME_V31),
            MQTT_V311 => Ok(PROTOCOL_NAME_V311),
            _ => Err(ParseError::UnSuppProtoVsn),
        }
    }

    fn connect_flags(&self) -> Result<u8, ParseError> {
        let mut flags = 0u8;
        if self.clean_session {
            flags |= FLAG_CLEAN_SESSION;
        }
        if let Some(will) = &self.will {
            flags |= FLAG_WILL;
            flags |= validate_qos(will.qos)? << 3;
            if will.retain {
                flags |= FLAG_WILL_RETAIN;
            }
        }
        if self.username.is_some() {
            flags |= FLAG_USERNAME;
        }
        if self.password.is_some() {
            flags |= FLAG_PASSWORD;
        }
        Ok(flags)
    }
}

impl MqttControlPacket for MqttConnect {
    fn control_packet_type(&self) -> u8 {
        ControlPacketType::CONNECT as u8
    }

    fn variable_header(&self) -> Result<Vec<u8>, ParseError> {
        let mut vh = encode_utf8_string(self.protocol_name()?)?;
        vh.push(self.protocol_version);
        vh.push(self.connect_flags()?);
        vh.extend_from_slice(&TwoByteInteger::encode(self.keep_alive));
        Ok(vh)
    }

    fn payload(&self) -> Result<Vec<u8>, ParseError> {
        let mut payload = encode_utf8_string(&self.client_id)?;

        if let Some(will) = &self.will {
            payload.extend(encode_utf8_string(&will.topic)?);
            payload.extend(encode_binary_data(&will.message)?);
        }

        if let Some(username) = &self.username {
            payload.extend(encode_utf8_string(username)?);
        }

        if let Some(password) = &self.password {
            payload.extend(encode_binary_data(password)?);
        }

        Ok(payload)
    }

    fn from_bytes(buffer: &[u8]) -> Result<ParseOk, ParseError> {
        let Some((mut offset, size)) = expect_fixed_header(buffer, "CONNECT", 0x00)? else {
            return Ok(continue_hint(buffer));
        };
        let total_len = offset + size;
        let body = &buffer[..total_len];

        let (proto_name, consumed) = parse_utf8_string(&body[offset..])?;
        offset += consumed;

        let protocol_version = *body.get(offset).ok_or(ParseError::BufferTooShort)?;
        offset += 1;
        match (proto_name.as_str(), protocol_version) {
            (PROTOCOL_NAME_V311, MQTT_V311) | (PROTOCOL_NAME_V31, MQTT_V31) => {}
            (PROTOCOL_NAME_V311, _) | (PROTOCOL_NAME_V31, _) => {
                return Err(ParseError::UnSuppProtoVsn)
            }
            _ => {
                return Err(ParseError::ParseError(format!(
                    "Invalid protocol name: {}",
                    proto_name
                )))
            }
        }

        let flags = *body.get(offset).ok_or(ParseError::BufferTooShort)?;
        offset += 1;
        if flags & FLAG_RESERVED != 0 {
            return Err(ParseError::ParseError(
                "CONNECT reserved flag bit is not 0".to_string(),
            ));
        }
        let will_flag = flags & FLAG_WILL != 0;
        let username_flag = flags & FLAG_USERNAME != 0;
        let password_flag = flags & FLAG_PASSWORD != 0;
        if !will_flag && flags & (FLAG_WILL_QOS | FLAG_WILL_RETAIN) != 0 {
            return Err(ParseError::ParseError(
                "Will QoS and retain must be 0 without will flag".to_string(),
            ));
        }
        if password_flag && !username_flag {
            return Err(ParseError::ParseError(
                "Password flag requires username flag".to_string(),
            ));
        }

        let (keep_alive, consumed) = TwoByteInteger::decode(&body[offset..])?;
        offset += consumed;

        let (client_id, consumed) = parse_utf8_string(&body[offset..])?;
        offset += consumed;

        let will = if will_flag {
            let (topic, consumed) = parse_utf8_string(&body[offset..])?;
            offset += consumed;
            let (message, consumed) = parse_binary_data(&body[offset..])?;
            offset += consumed;
            Some(Will {
                retain: flags & FLAG_WILL_RETAIN != 0,
                qos: validate_qos((flags & FLAG_WILL_QOS) >> 3)?,
                topic,
                message,
            })
        } else {
            None
        };

        let username = if username_flag {
            let (u, consumed) = parse_utf8_string(&body[offset..])?;
            offset += consumed;
            Some(u)
        } else {
            None
        };

        let password = if password_flag {
            let (p, consumed) = parse_binary_data(&body[offset..])?;
            offset += consumed;
            Some(p)
        } else {
            None
        };

        if offset != total_len {
            return Err(ParseError::InvalidLength);
        }

        Ok(ParseOk::Packet(
            MqttPacket::Connect(MqttConnect {
                protocol_version,
                clean_session: flags & FLAG_CLEAN_SESSION != 0,
                keep_alive,
                client_id,
                will,
                username,
                password,
            }),
            total_len,
        ))
    }
}
