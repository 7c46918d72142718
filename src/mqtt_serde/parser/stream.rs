use crate::mqtt_serde::base_data::VariableByteIntegerDecoder;
use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::parser::{ParseError, ParseOk};
use crate::mqtt_serde::MQTT_V311;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest slice of payload read at once. The frame buffer grows with the
/// bytes that actually arrive, never with the length the peer declares.
const READ_CHUNK: usize = 4096;

/// A stateful parser for a stream of MQTT data.
/// It internally buffers data from a stream and yields complete packets.
#[derive(Debug)]
pub struct MqttParser {
    buffer: BytesMut,
    mqtt_version: u8,
}

impl Default for MqttParser {
    fn default() -> Self {
        Self::new(16384, MQTT_V311)
    }
}

impl MqttParser {
    pub fn new(buffer_size: usize, mqtt_version: u8) -> Self {
        MqttParser {
            buffer: BytesMut::with_capacity(buffer_size),
            mqtt_version,
        }
    }

    pub fn mqtt_version(&self) -> u8 {
        self.mqtt_version
    }

    /// Appends new data from the stream to the internal buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet returned as a packet.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Attempts to parse a single MQTT packet from the internal buffer.
    ///
    /// - If a full packet is available, it returns `Ok(Some(MqttPacket))`,
    ///   and the corresponding bytes are removed from the buffer.
    /// - If the buffer does not contain a full packet, it returns `Ok(None)`.
    /// - If the data in the buffer is malformed, it returns `Err(ParseError)`.
    pub fn next_packet(&mut self) -> Result<Option<MqttPacket>, ParseError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        match MqttPacket::from_bytes_with_version(&self.buffer, self.mqtt_version)? {
            ParseOk::Packet(packet, consumed) => {
                self.buffer.advance(consumed);
                Ok(Some(packet))
            }
            ParseOk::Continue(_, _) => Ok(None),
        }
    }
}

/// Reads the rest of a packet whose first header byte has already been taken
/// off `reader` and decodes it.
///
/// Every read after the first byte is bounded by `read_timeout`; the peer
/// closing the stream mid-packet yields [`ParseError::ConnectionClosed`].
pub async fn read_packet<R>(
    first_byte: u8,
    reader: &mut R,
    read_timeout: Duration,
) -> Result<MqttPacket, ParseError>
where
    R: AsyncRead + Unpin,
{
    let frame = read_frame(first_byte, reader, read_timeout).await?;
    decode_frame(&frame)
}

/// Reads one complete frame, fixed header included, without decoding it.
///
/// The remaining length is consumed one byte at a time since its size is only
/// known once the terminating byte arrives.
pub async fn read_frame<R>(
    first_byte: u8,
    reader: &mut R,
    read_timeout: Duration,
) -> Result<Bytes, ParseError>
where
    R: AsyncRead + Unpin,
{
    let mut frame = BytesMut::with_capacity(64);
    frame.put_u8(first_byte);

    let mut decoder = VariableByteIntegerDecoder::default();
    let remaining = loop {
        let byte = with_timeout(read_timeout, reader.read_u8()).await?;
        frame.put_u8(byte);
        if let Some(len) = decoder.push(byte)? {
            break len;
        }
    };

    let mut chunk = [0u8; READ_CHUNK];
    let mut left = remaining;
    while left > 0 {
        let want = left.min(READ_CHUNK);
        let n = with_timeout(read_timeout, reader.read(&mut chunk[..want])).await?;
        if n == 0 {
            return Err(ParseError::ConnectionClosed);
        }
        frame.extend_from_slice(&chunk[..n]);
        left -= n;
    }
    Ok(frame.freeze())
}

/// Decodes a frame produced by [`read_frame`].
pub fn decode_frame(frame: &[u8]) -> Result<MqttPacket, ParseError> {
    match MqttPacket::from_bytes(frame)? {
        ParseOk::Packet(packet, _) => Ok(packet),
        ParseOk::Continue(needed, _) => Err(ParseError::InternalError(format!(
            "complete frame reported {} missing bytes",
            needed
        ))),
    }
}

async fn with_timeout<T, F>(read_timeout: Duration, fut: F) -> Result<T, ParseError>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(read_timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) if e.kind() == ErrorKind::UnexpectedEof => Err(ParseError::ConnectionClosed),
        Ok(Err(e)) => Err(ParseError::IoError(e)),
        Err(_) => Err(ParseError::Timeout),
    }
}
