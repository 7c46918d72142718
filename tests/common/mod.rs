#![allow(dead_code)]

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

use flowmqtt::mqtt_client::transport::{Transport, TransportError};
use flowmqtt::mqtt_client::{EngineSettings, MqttClient, MqttClientOptions, MqttEventHandler};
use flowmqtt::mqtt_serde::control_packet::MqttPacket;
use flowmqtt::mqtt_serde::mqttv3::{connack::MqttConnAck, publish::MqttPublish};
use flowmqtt::mqtt_serde::read_packet;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Client end of an in-memory connection.
pub struct DuplexTransport {
    stream: DuplexStream,
}

#[async_trait]
impl Transport for DuplexTransport {
    async fn connect(addr: &str) -> Result<Self, TransportError> {
        Err(TransportError::NotSupported(format!(
            "in-memory transport cannot dial {}",
            addr
        )))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.shutdown().await.map_err(TransportError::Io)
    }

    fn peer_addr(&self) -> Result<String, TransportError> {
        Ok("memory".to_string())
    }
}

impl AsyncRead for DuplexTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for DuplexTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Broker end of an in-memory connection, driven step by step by a test.
pub struct MockBroker {
    stream: DuplexStream,
}

pub fn pair() -> (DuplexTransport, MockBroker) {
    let (client, broker) = tokio::io::duplex(64 * 1024);
    (
        DuplexTransport { stream: client },
        MockBroker { stream: broker },
    )
}

impl MockBroker {
    /// Next packet from the client. Panics if none arrives within ten minutes
    /// of (possibly paused) time.
    pub async fn recv(&mut self) -> MqttPacket {
        let read = async {
            let first = self.stream.read_u8().await?;
            read_packet(first, &mut self.stream, Duration::from_secs(5))
                .await
                .map_err(std::io::Error::other)
        };
        match tokio::time::timeout(Duration::from_secs(600), read).await {
            Ok(Ok(packet)) => packet,
            Ok(Err(e)) => panic!("broker read failed: {}", e),
            Err(_) => panic!("client sent nothing"),
        }
    }

    pub async fn send(&mut self, packet: MqttPacket) {
        let bytes = packet.to_bytes().unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Reads CONNECT and answers with `return_code`.
    pub async fn accept_with(&mut self, session_present: bool, return_code: u8) -> MqttPacket {
        let connect = self.recv().await;
        assert!(matches!(connect, MqttPacket::Connect(_)), "{:?}", connect);
        self.send(MqttPacket::ConnAck(MqttConnAck::new(
            session_present,
            return_code,
        )))
        .await;
        connect
    }

    /// Asserts that the client writes nothing for `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        let mut byte = [0u8; 1];
        if let Ok(result) = tokio::time::timeout(window, self.stream.read(&mut byte)).await {
            panic!("expected silence, got {:?}", result.map(|_| byte[0]));
        }
    }

    /// Waits for the client to close its end.
    pub async fn expect_eof(&mut self) {
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(600), self.stream.read_to_end(&mut rest))
            .await
            .expect("client never closed")
            .expect("read failed");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Received(MqttPublish),
    Published(u16, bool),
    Subscribed(u16, Vec<u8>),
    SubscribeFailed(u16),
    Unsubscribed(u16),
    UnsubscribeFailed(u16),
    Closed,
}

/// Handler that writes every callback into a shared log.
#[derive(Clone, Default)]
pub struct Recorder {
    records: Arc<Mutex<Vec<Record>>>,
}

impl Recorder {
    pub fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }

    pub fn count(&self, record: &Record) -> usize {
        self.records().iter().filter(|r| *r == record).count()
    }

    /// Polls until `done` holds for the log, advancing time in small steps.
    pub async fn wait_until(&self, done: impl Fn(&[Record]) -> bool) {
        for _ in 0..2000 {
            if done(&self.records()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never met; got {:?}", self.records());
    }

    pub async fn wait_for(&self, record: Record) {
        self.wait_until(|records| records.contains(&record)).await;
    }

    pub fn received(&self) -> Vec<MqttPublish> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                Record::Received(publish) => Some(publish),
                _ => None,
            })
            .collect()
    }

    fn push(&self, record: Record) {
        self.records.lock().unwrap().push(record);
    }
}

#[async_trait]
impl MqttEventHandler for Recorder {
    async fn on_message_received(&mut self, publish: &MqttPublish) {
        self.push(Record::Received(publish.clone()));
    }

    async fn on_message_published(&mut self, message_id: u16, success: bool) {
        self.push(Record::Published(message_id, success));
    }

    async fn on_subscribed(&mut self, message_id: u16, granted_qos: &[u8]) {
        self.push(Record::Subscribed(message_id, granted_qos.to_vec()));
    }

    async fn on_subscribe_failed(&mut self, message_id: u16) {
        self.push(Record::SubscribeFailed(message_id));
    }

    async fn on_unsubscribed(&mut self, message_id: u16) {
        self.push(Record::Unsubscribed(message_id));
    }

    async fn on_unsubscribe_failed(&mut self, message_id: u16) {
        self.push(Record::UnsubscribeFailed(message_id));
    }

    async fn on_connection_closed(&mut self) {
        self.push(Record::Closed);
    }
}

/// One-second retries, three attempts.
pub fn settings() -> EngineSettings {
    EngineSettings::builder()
        .retry_delay_ms(1000)
        .max_attempts(3)
        .inflight_capacity(16)
        .response_timeout_ms(5000)
        .build()
        .unwrap()
}

/// Options with keep-alive off, so only the packets a test expects appear.
pub fn options(client_id: &str) -> MqttClientOptions {
    MqttClientOptions::builder()
        .client_id(client_id)
        .keep_alive(0)
        .build()
}

/// Like [`options`], but the session survives the connection.
pub fn persistent_options(client_id: &str) -> MqttClientOptions {
    MqttClientOptions::builder()
        .client_id(client_id)
        .keep_alive(0)
        .clean_session(false)
        .build()
}

pub fn client() -> (MqttClient, Recorder) {
    let recorder = Recorder::default();
    let client = MqttClient::new(settings(), recorder.clone()).unwrap();
    (client, recorder)
}

/// Connects `client` to a fresh mock broker that accepts the session.
pub async fn connect(client: &MqttClient, options: MqttClientOptions) -> MockBroker {
    let (transport, mut broker) = pair();
    let (result, _) = tokio::join!(
        client.connect_with(transport, options),
        broker.accept_with(false, 0)
    );
    result.expect("connect failed");
    broker
}
