use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::mqttv3::{
    connack::{connack_description, MqttConnAck},
    connect::MqttConnect,
    disconnect::MqttDisconnect,
    publish::MqttPublish,
    subscribe::SubscriptionTopic,
};
use crate::mqtt_serde::{validate_topic_filter, validate_topic_name};
use crate::mqtt_session::{ClientSession, SharedSession};

use super::engine::{ConnectionState, MqttEngine, SharedHandler};
use super::error::{MqttClientError, MqttClientResult};
use super::opts::{EngineSettings, MqttClientOptions};
use super::transport::{BoxedTransport, TcpTransport, Transport};

/// Outcome of an accepted CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionResult {
    pub return_code: u8,
    pub session_present: bool,
}

impl ConnectionResult {
    pub fn is_accepted(&self) -> bool {
        self.return_code == 0
    }

    pub fn description(&self) -> &'static str {
        connack_description(self.return_code)
    }
}

impl From<&MqttConnAck> for ConnectionResult {
    fn from(connack: &MqttConnAck) -> Self {
        Self {
            return_code: connack.return_code,
            session_present: connack.session_present,
        }
    }
}

/// Application callbacks, invoked one at a time from the dispatch task in the
/// order the engine produced them.
///
/// Every method has an empty default. Do not call
/// [`MqttClient::disconnect`] from inside a callback: disconnect waits for
/// the dispatch task, which is the one running the callback.
#[async_trait]
pub trait MqttEventHandler: Send + Sync {
    /// A message from the broker, after its QoS handshake allows delivery.
    async fn on_message_received(&mut self, publish: &MqttPublish) {
        let _ = publish;
    }

    /// Final outcome of a publish: acknowledged (or written, for QoS 0) or
    /// abandoned after the last retry.
    async fn on_message_published(&mut self, message_id: u16, success: bool) {
        let _ = (message_id, success);
    }

    /// Called when SUBACK arrives; `granted_qos` holds one entry per filter,
    /// 0x80 for a rejected one.
    async fn on_subscribed(&mut self, message_id: u16, granted_qos: &[u8]) {
        let _ = (message_id, granted_qos);
    }

    /// SUBSCRIBE got no SUBACK after the last retry.
    async fn on_subscribe_failed(&mut self, message_id: u16) {
        let _ = message_id;
    }

    async fn on_unsubscribed(&mut self, message_id: u16) {
        let _ = message_id;
    }

    async fn on_unsubscribe_failed(&mut self, message_id: u16) {
        let _ = message_id;
    }

    /// Called exactly once per established connection, after every other
    /// notification of that connection.
    async fn on_connection_closed(&mut self) {}
}

struct ActiveConnection {
    engine: Arc<MqttEngine>,
    dispatcher: JoinHandle<()>,
}

/// MQTT 3.1/3.1.1 client.
///
/// One client drives at most one connection at a time. The [`ClientSession`]
/// outlives connections, so QoS 1/2 deliveries left unfinished by a dropped
/// connection resume on the next `connect` with `clean_session` off.
pub struct MqttClient {
    settings: EngineSettings,
    session: SharedSession,
    handler: SharedHandler,
    state: Arc<Mutex<ConnectionState>>,
    connection: tokio::sync::Mutex<Option<ActiveConnection>>,
}

impl MqttClient {
    pub fn new<H>(settings: EngineSettings, handler: H) -> MqttClientResult<Self>
    where
        H: MqttEventHandler + 'static,
    {
        Self::with_session(
            settings,
            Arc::new(Mutex::new(ClientSession::new(""))),
            handler,
        )
    }

    /// Uses a session owned by the caller, for instance one taken from a
    /// [`SessionStore`](crate::mqtt_session::SessionStore).
    pub fn with_session<H>(
        settings: EngineSettings,
        session: SharedSession,
        handler: H,
    ) -> MqttClientResult<Self>
    where
        H: MqttEventHandler + 'static,
    {
        settings.validate()?;
        let handler: Box<dyn MqttEventHandler> = Box::new(handler);
        Ok(Self {
            settings,
            session,
            handler: Arc::new(tokio::sync::Mutex::new(handler)),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            connection: tokio::sync::Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn session(&self) -> SharedSession {
        self.session.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Opens a TCP connection to `addr` and performs the MQTT handshake.
    pub async fn connect(
        &self,
        addr: &str,
        options: MqttClientOptions,
    ) -> MqttClientResult<ConnectionResult> {
        options.validate()?;
        let transport = TcpTransport::connect(addr).await?;
        self.connect_with(transport, options).await
    }

    /// Performs the MQTT handshake over an already connected transport.
    ///
    /// Returns once CONNACK arrives. A refusal, a timeout or a transport
    /// failure leaves the client disconnected and the transport closed.
    pub async fn connect_with<T>(
        &self,
        transport: T,
        options: MqttClientOptions,
    ) -> MqttClientResult<ConnectionResult>
    where
        T: Transport + 'static,
    {
        options.validate()?;
        let mut slot = self.connection.lock().await;
        if let Some(previous) = slot.take() {
            if self.state() == ConnectionState::Connected && !previous.engine.is_closing() {
                *slot = Some(previous);
                return Err(MqttClientError::AlreadyConnected);
            }
            // closed by the broker or a failure; let its teardown finish
            if let Err(e) = previous.dispatcher.await {
                warn!(error = %e, "previous dispatcher failed");
            }
        }

        let peer = transport
            .peer_addr()
            .unwrap_or_else(|_| "unknown".to_string());
        let boxed: BoxedTransport = Box::new(transport);
        let (reader, writer) = tokio::io::split(boxed);
        let engine = MqttEngine::new(
            self.settings.clone(),
            self.session.clone(),
            self.state.clone(),
            writer,
        );
        engine.set_state(ConnectionState::Connecting);
        let connack_rx = engine.expect_connack()?;
        let receiver = tokio::spawn(engine.clone().receive_loop(reader));

        let connack = match Self::handshake(&engine, &options, connack_rx).await {
            Ok(connack) => connack,
            Err(e) => {
                engine.abort(&e.to_string(), receiver).await;
                return Err(e);
            }
        };
        if !connack.is_accepted() {
            let error = MqttClientError::connection_refused(connack.return_code);
            warn!(client_id = %options.client_id, return_code = connack.return_code, "connection refused");
            engine.abort(&error.to_string(), receiver).await;
            return Err(error);
        }

        let resumed = match engine.resume_session(&options.client_id, options.clean_session) {
            Ok(resumed) => resumed,
            Err(e) => {
                engine.abort(&e.to_string(), receiver).await;
                return Err(e);
            }
        };
        info!(
            client_id = %options.client_id,
            %peer,
            session_present = connack.session_present,
            resumed,
            "connected"
        );
        engine.set_state(ConnectionState::Connected);

        let mut workers = vec![tokio::spawn(engine.clone().inflight_loop())];
        if let Some(period) = options.keep_alive_period() {
            workers.push(tokio::spawn(engine.clone().keep_alive_loop(period)));
        }
        let dispatcher = tokio::spawn(engine.clone().dispatch_loop(
            self.handler.clone(),
            workers,
            receiver,
        ));
        *slot = Some(ActiveConnection { engine, dispatcher });

        Ok(ConnectionResult::from(&connack))
    }

    async fn handshake(
        engine: &MqttEngine,
        options: &MqttClientOptions,
        connack_rx: tokio::sync::oneshot::Receiver<MqttConnAck>,
    ) -> MqttClientResult<MqttConnAck> {
        engine
            .send_packet(&MqttPacket::Connect(connect_packet(options)))
            .await?;

        let timeout = engine.settings().response_timeout();
        match tokio::time::timeout(timeout, connack_rx).await {
            Ok(Ok(connack)) => Ok(connack),
            Ok(Err(_)) => Err(MqttClientError::ConnectionLost {
                reason: "connection closed before CONNACK".to_string(),
            }),
            Err(_) => Err(MqttClientError::OperationTimeout {
                operation: "CONNECT".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Sends DISCONNECT and waits until the connection is torn down and
    /// `on_connection_closed` has run.
    ///
    /// Returns [`MqttClientError::NotConnected`] when there is no connection
    /// or it was already closing, after waiting for that teardown to finish.
    pub async fn disconnect(&self) -> MqttClientResult<()> {
        let mut slot = self.connection.lock().await;
        let Some(active) = slot.take() else {
            return Err(MqttClientError::NotConnected);
        };

        let already_closing = active.engine.is_closing();
        if self.state() == ConnectionState::Connected && !already_closing {
            active.engine.set_state(ConnectionState::Closing);
            let disconnect = MqttPacket::Disconnect(MqttDisconnect::new());
            if let Err(e) = active.engine.send_packet(&disconnect).await {
                debug!(error = %e, "DISCONNECT not sent");
            }
        }
        active.engine.begin_close("disconnect requested");
        active
            .dispatcher
            .await
            .map_err(|e| MqttClientError::InternalError {
                message: format!("dispatcher task failed: {}", e),
            })?;
        if already_closing {
            return Err(MqttClientError::NotConnected);
        }
        Ok(())
    }

    /// Queues a PUBLISH and returns its message identifier.
    ///
    /// Completion is reported through
    /// [`MqttEventHandler::on_message_published`]; QoS 0 completes as soon
    /// as the packet is written.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: u8,
        retain: bool,
    ) -> MqttClientResult<u16> {
        validate_topic_name(topic)
            .map_err(|e| MqttClientError::invalid_argument("topic", e.to_string()))?;
        check_qos("qos", qos)?;
        let engine = self.active_engine().await?;
        engine.enqueue_publish(MqttPublish::new(
            topic.to_string(),
            qos,
            payload.into(),
            None,
            retain,
            false,
        ))
    }

    /// Queues a SUBSCRIBE for `topics`, each paired with the QoS level at the
    /// same position in `qos_levels`.
    pub async fn subscribe<S: AsRef<str>>(
        &self,
        topics: &[S],
        qos_levels: &[u8],
    ) -> MqttClientResult<u16> {
        if topics.is_empty() {
            return Err(MqttClientError::invalid_argument(
                "topics",
                "at least one topic filter is required",
            ));
        }
        if topics.len() != qos_levels.len() {
            return Err(MqttClientError::invalid_argument(
                "qos_levels",
                format!(
                    "{} topic filters but {} QoS levels",
                    topics.len(),
                    qos_levels.len()
                ),
            ));
        }
        let mut subscriptions = Vec::with_capacity(topics.len());
        for (topic, &qos) in topics.iter().zip(qos_levels) {
            validate_topic_filter(topic.as_ref())
                .map_err(|e| MqttClientError::invalid_argument("topics", e.to_string()))?;
            check_qos("qos_levels", qos)?;
            subscriptions.push(SubscriptionTopic::new(topic.as_ref(), qos));
        }

        let engine = self.active_engine().await?;
        engine.enqueue_subscribe(subscriptions)
    }

    pub async fn unsubscribe<S: AsRef<str>>(&self, topics: &[S]) -> MqttClientResult<u16> {
        if topics.is_empty() {
            return Err(MqttClientError::invalid_argument(
                "topics",
                "at least one topic filter is required",
            ));
        }
        let mut filters = Vec::with_capacity(topics.len());
        for topic in topics {
            validate_topic_filter(topic.as_ref())
                .map_err(|e| MqttClientError::invalid_argument("topics", e.to_string()))?;
            filters.push(topic.as_ref().to_string());
        }

        let engine = self.active_engine().await?;
        engine.enqueue_unsubscribe(filters)
    }

    async fn active_engine(&self) -> MqttClientResult<Arc<MqttEngine>> {
        let slot = self.connection.lock().await;
        match slot.as_ref() {
            Some(active) if self.is_connected() && !active.engine.is_closing() => {
                Ok(active.engine.clone())
            }
            _ => Err(MqttClientError::NotConnected),
        }
    }
}

fn check_qos(name: &str, qos: u8) -> MqttClientResult<()> {
    if qos > 2 {
        return Err(MqttClientError::invalid_argument(
            name,
            format!("{} is not a QoS level", qos),
        ));
    }
    Ok(())
}

fn connect_packet(options: &MqttClientOptions) -> MqttConnect {
    let mut connect = MqttConnect::new(
        options.client_id.clone(),
        options.keep_alive,
        options.clean_session,
    );
    connect.protocol_version = options.protocol_version;
    connect.will = options.will.clone();
    connect.username = options.username.clone();
    connect.password = options.password.clone();
    connect
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_serde::mqttv3::connect::Will;

    struct Silent;

    #[async_trait]
    impl MqttEventHandler for Silent {}

    #[test]
    fn test_connect_packet_from_options() {
        let options = MqttClientOptions::builder()
            .client_id("dev-1")
            .username("u")
            .password(b"p".to_vec())
            .will(Will::new("dev/1/status", b"gone".to_vec(), 1, true))
            .keep_alive(30)
            .protocol_version(3)
            .clean_session(false)
            .build();
        let connect = connect_packet(&options);
        assert_eq!(connect.client_id, "dev-1");
        assert_eq!(connect.protocol_version, 3);
        assert_eq!(connect.keep_alive, 30);
        assert!(!connect.clean_session);
        assert_eq!(connect.will.as_ref().map(|w| w.qos), Some(1));
        assert_eq!(connect.password.as_deref(), Some(&b"p"[..]));
    }

    #[test]
    fn test_connection_result() {
        let result = ConnectionResult::from(&MqttConnAck::new(true, 0));
        assert!(result.is_accepted());
        assert!(result.session_present);
        assert_eq!(result.description(), "Connection accepted");
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let settings = EngineSettings {
            max_attempts: 0,
            ..EngineSettings::default()
        };
        assert!(MqttClient::new(settings, Silent).is_err());
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let client = MqttClient::new(EngineSettings::default(), Silent).unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(
            client.publish("a/b", b"x".to_vec(), 1, false).await,
            Err(MqttClientError::NotConnected)
        ));
        assert!(matches!(
            client.disconnect().await,
            Err(MqttClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_arguments_checked_before_connection() {
        let client = MqttClient::new(EngineSettings::default(), Silent).unwrap();
        let invalid = |r: MqttClientResult<u16>| matches!(r, Err(MqttClientError::InvalidArgument { .. }));

        assert!(invalid(client.publish("a/+", b"x".to_vec(), 0, false).await));
        assert!(invalid(client.publish("", b"x".to_vec(), 0, false).await));
        assert!(invalid(client.publish("a", b"x".to_vec(), 3, false).await));
        assert!(invalid(client.subscribe::<&str>(&[], &[]).await));
        assert!(invalid(client.subscribe(&["a/#"], &[1, 2]).await));
        assert!(invalid(client.subscribe(&["a/#/b"], &[1]).await));
        assert!(invalid(client.subscribe(&["a"], &[4]).await));
        assert!(invalid(client.unsubscribe::<&str>(&[]).await));
    }
}
