use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::mqttv3::{
    connack::MqttConnAck, pingreq::MqttPingReq, pubcomp::MqttPubComp, publish::MqttPublish,
    subscribe::{MqttSubscribe, SubscriptionTopic},
    unsubscribe::MqttUnsubscribe,
};
use crate::mqtt_serde::parser::stream::{decode_frame, read_frame};
use crate::mqtt_session::{ClientSession, ContextKey, DeliveryContext, Flow, SharedSession};

use super::client::MqttEventHandler;
use super::error::{MqttClientError, MqttClientResult};
use super::inflight::InflightQueue;
use super::opts::EngineSettings;
use super::transport::BoxedTransport;

/// Notifications queued for the application, delivered in order by the
/// dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttEvent {
    MessageReceived(MqttPublish),
    Published { message_id: u16, success: bool },
    Subscribed { message_id: u16, granted_qos: Vec<u8> },
    SubscribeFailed { message_id: u16 },
    Unsubscribed { message_id: u16 },
    UnsubscribeFailed { message_id: u16 },
}

impl MqttEvent {
    async fn dispatch(self, handler: &mut dyn MqttEventHandler) {
        match self {
            MqttEvent::MessageReceived(publish) => handler.on_message_received(&publish).await,
            MqttEvent::Published {
                message_id,
                success,
            } => handler.on_message_published(message_id, success).await,
            MqttEvent::Subscribed {
                message_id,
                granted_qos,
            } => handler.on_subscribed(message_id, &granted_qos).await,
            MqttEvent::SubscribeFailed { message_id } => {
                handler.on_subscribe_failed(message_id).await
            }
            MqttEvent::Unsubscribed { message_id } => handler.on_unsubscribed(message_id).await,
            MqttEvent::UnsubscribeFailed { message_id } => {
                handler.on_unsubscribe_failed(message_id).await
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

pub(crate) type SharedHandler = Arc<tokio::sync::Mutex<Box<dyn MqttEventHandler>>>;

/// Everything the four loops of one connection share.
///
/// Locks are taken one access at a time and never held across an await,
/// except the writer, which serializes whole packets onto the transport.
/// When two are needed the order is inflight, then acks or session.
pub(crate) struct MqttEngine {
    settings: EngineSettings,
    session: SharedSession,
    state: Arc<Mutex<ConnectionState>>,

    inflight: Mutex<InflightQueue>,
    acks: Mutex<VecDeque<MqttPacket>>,
    events: Mutex<VecDeque<MqttEvent>>,

    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedTransport>>>,
    last_sent: Mutex<Instant>,

    inflight_wake: Notify,
    event_wake: Notify,
    /// Raised once the session is back in the inflight queue; the receive
    /// loop routes nothing after CONNACK until then.
    resumed: Notify,
    connack: Mutex<Option<oneshot::Sender<MqttConnAck>>>,
    pingresp: Mutex<Option<oneshot::Sender<()>>>,
    closing: CancellationToken,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MqttClientResult<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| MqttClientError::poisoned(what))
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl MqttEngine {
    pub(crate) fn new(
        settings: EngineSettings,
        session: SharedSession,
        state: Arc<Mutex<ConnectionState>>,
        writer: WriteHalf<BoxedTransport>,
    ) -> Arc<Self> {
        let inflight = InflightQueue::new(&settings);
        Arc::new(Self {
            settings,
            session,
            state,
            inflight: Mutex::new(inflight),
            acks: Mutex::new(VecDeque::new()),
            events: Mutex::new(VecDeque::new()),
            writer: tokio::sync::Mutex::new(Some(writer)),
            last_sent: Mutex::new(Instant::now()),
            inflight_wake: Notify::new(),
            event_wake: Notify::new(),
            resumed: Notify::new(),
            connack: Mutex::new(None),
            pingresp: Mutex::new(None),
            closing: CancellationToken::new(),
        })
    }

    pub(crate) fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *current != state {
            debug!(from = ?*current, to = ?state, "connection state");
            *current = state;
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    fn last_sent(&self) -> Instant {
        *self.last_sent.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers interest in the next CONNACK. Must be called before the
    /// receive loop starts.
    pub(crate) fn expect_connack(&self) -> MqttClientResult<oneshot::Receiver<MqttConnAck>> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.connack, "connack")? = Some(tx);
        Ok(rx)
    }

    /// Starts the closing sequence. Safe to call from any loop, any number of
    /// times; only the first call has an effect.
    pub(crate) fn begin_close(&self, reason: &str) {
        if self.closing.is_cancelled() {
            return;
        }
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Closing;
            }
        }
        info!(reason, "closing connection");
        self.closing.cancel();
    }

    /// Writes one packet. Fails instead of waiting on the transport once the
    /// connection is closing.
    pub(crate) async fn send_packet(&self, packet: &MqttPacket) -> MqttClientResult<()> {
        let bytes = packet.to_bytes()?;
        tokio::select! {
            biased;
            _ = self.closing.cancelled() => Err(MqttClientError::ConnectionLost {
                reason: "connection closing".to_string(),
            }),
            result = self.write_bytes(&bytes) => result,
        }?;
        trace!(packet = ?packet.packet_type(), message_id = ?packet.message_id(), len = bytes.len(), "sent");
        Ok(())
    }

    async fn write_bytes(&self, bytes: &[u8]) -> MqttClientResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(MqttClientError::NotConnected)?;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| MqttClientError::from_io_error(e, "write"))?;
        writer
            .flush()
            .await
            .map_err(|e| MqttClientError::from_io_error(e, "flush"))?;
        *self.last_sent.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        Ok(())
    }

    /// Loads whatever the session still owes into the inflight queue, then
    /// lets the receive loop route what the broker sent after CONNACK.
    ///
    /// A session kept for a different client id is discarded first.
    pub(crate) fn resume_session(
        &self,
        client_id: &str,
        clean_session: bool,
    ) -> MqttClientResult<usize> {
        let loaded = {
            let mut queue = lock(&self.inflight, "inflight")?;
            let mut session = lock(&self.session, "session")?;
            if session.client_id() != client_id {
                debug!(
                    previous = session.client_id(),
                    client_id, "session belongs to another client id, starting fresh"
                );
                *session = ClientSession::new(client_id);
            }
            queue.load(session.restore(clean_session))
        };
        self.resumed.notify_one();
        if loaded > 0 {
            self.inflight_wake.notify_one();
        }
        Ok(loaded)
    }

    pub(crate) fn enqueue_publish(&self, publish: MqttPublish) -> MqttClientResult<u16> {
        self.enqueue(|id| DeliveryContext::outgoing_publish(id, publish))
    }

    pub(crate) fn enqueue_subscribe(
        &self,
        subscriptions: Vec<SubscriptionTopic>,
    ) -> MqttClientResult<u16> {
        self.enqueue(|id| DeliveryContext::outgoing_subscribe(MqttSubscribe::new(id, subscriptions)))
    }

    pub(crate) fn enqueue_unsubscribe(&self, topic_filters: Vec<String>) -> MqttClientResult<u16> {
        self.enqueue(|id| {
            DeliveryContext::outgoing_unsubscribe(MqttUnsubscribe::new(id, topic_filters))
        })
    }

    fn enqueue(&self, build: impl FnOnce(u16) -> DeliveryContext) -> MqttClientResult<u16> {
        let message_id = {
            let mut queue = lock(&self.inflight, "inflight")?;
            if queue.is_full() {
                return Err(MqttClientError::BufferFull {
                    buffer_type: "inflight".to_string(),
                    capacity: queue.capacity(),
                });
            }
            let mut session = lock(&self.session, "session")?;
            let message_id = session
                .next_message_id(|id| queue.contains(&ContextKey::new(id, Flow::ToPublish)))
                .ok_or(MqttClientError::PacketIdExhausted)?;

            let ctx = build(message_id);
            if ctx.is_session_tracked() {
                session.upsert(&ctx);
            }
            queue.push(ctx)?;
            message_id
        };
        self.inflight_wake.notify_one();
        Ok(message_id)
    }

    fn push_events(&self, events: Vec<MqttEvent>) -> MqttClientResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        lock(&self.events, "events")?.extend(events);
        self.event_wake.notify_one();
        Ok(())
    }

    /// One pass of the inflight state machine, then the resulting writes and
    /// notifications in that order.
    ///
    /// The events are queued even when a write fails: the pass already
    /// removed finished handshakes from the session.
    async fn process_inflight(&self) -> MqttClientResult<()> {
        let outcome = {
            let mut queue = lock(&self.inflight, "inflight")?;
            let acks: Vec<MqttPacket> = lock(&self.acks, "acks")?.drain(..).collect();
            let mut session = lock(&self.session, "session")?;
            queue.process(acks, &mut session, Instant::now())
        };
        let mut written = Ok(());
        for packet in &outcome.outgoing {
            if let Err(e) = self.send_packet(packet).await {
                written = Err(e);
                break;
            }
        }
        self.push_events(outcome.events)?;
        written
    }

    /// Hands one packet from the broker to whoever waits for it.
    async fn route(&self, packet: MqttPacket) -> MqttClientResult<()> {
        trace!(packet = ?packet.packet_type(), message_id = ?packet.message_id(), "received");
        let awaiting_connack = lock(&self.connack, "connack")?.is_some();
        if awaiting_connack && !matches!(packet, MqttPacket::ConnAck(_)) {
            return Err(MqttClientError::ProtocolViolation {
                message: format!("broker sent {:?} before CONNACK", packet.packet_type()),
            });
        }
        match packet {
            MqttPacket::ConnAck(connack) => {
                let waiter = lock(&self.connack, "connack")?.take();
                let Some(waiter) = waiter else {
                    return Err(MqttClientError::ProtocolViolation {
                        message: "CONNACK received on an established connection".to_string(),
                    });
                };
                let _ = waiter.send(connack);
                // later packets may answer deliveries the session restores
                self.resumed.notified().await;
                Ok(())
            }
            MqttPacket::PingResp(_) => {
                match lock(&self.pingresp, "pingresp")?.take() {
                    Some(waiter) => {
                        let _ = waiter.send(());
                    }
                    None => debug!("unsolicited PINGRESP ignored"),
                }
                Ok(())
            }
            MqttPacket::Publish(publish) => {
                let accepted = lock(&self.inflight, "inflight")?.accept_incoming(publish);
                trace!(?accepted, "incoming PUBLISH");
                self.inflight_wake.notify_one();
                Ok(())
            }
            ack @ (MqttPacket::PubAck(_)
            | MqttPacket::PubRec(_)
            | MqttPacket::PubRel(_)
            | MqttPacket::PubComp(_)
            | MqttPacket::SubAck(_)
            | MqttPacket::UnsubAck(_)) => {
                let unmatched = {
                    let queue = lock(&self.inflight, "inflight")?;
                    if queue.awaits(&ack) {
                        lock(&self.acks, "acks")?.push_back(ack);
                        None
                    } else {
                        Some(ack)
                    }
                };
                match unmatched {
                    None => self.inflight_wake.notify_one(),
                    Some(MqttPacket::PubRel(pubrel)) => {
                        debug!(message_id = pubrel.message_id, "PUBREL for a finished handshake, answering again");
                        self.send_packet(&MqttPacket::PubComp(MqttPubComp::new(
                            pubrel.message_id,
                        )))
                        .await?;
                    }
                    Some(stale) => {
                        debug!(packet = ?stale.packet_type(), message_id = ?stale.message_id(), "stale acknowledgment ignored")
                    }
                }
                Ok(())
            }
            other => Err(MqttClientError::ProtocolViolation {
                message: format!("broker sent {:?}, which only a client may send", other.packet_type()),
            }),
        }
    }

    async fn receive_one(
        &self,
        reader: &mut ReadHalf<BoxedTransport>,
        read_timeout: Duration,
    ) -> MqttClientResult<()> {
        let first = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(MqttClientError::ConnectionLost {
                    reason: "connection closed by broker".to_string(),
                })
            }
            Err(e) => return Err(MqttClientError::from_io_error(e, "read")),
        };
        let frame = read_frame(first, reader, read_timeout).await?;
        let packet = decode_frame(&frame)
            .map_err(|e| MqttClientError::from_parse_error_with_data(e, frame.to_vec()))?;
        self.route(packet).await
    }

    /// Reads and routes packets until the connection closes. Hands the read
    /// half back so the transport can be reassembled and closed.
    pub(crate) async fn receive_loop(
        self: Arc<Self>,
        mut reader: ReadHalf<BoxedTransport>,
    ) -> ReadHalf<BoxedTransport> {
        let read_timeout = self.settings.response_timeout();
        loop {
            let result = tokio::select! {
                _ = self.closing.cancelled() => break,
                result = self.receive_one(&mut reader, read_timeout) => result,
            };
            if let Err(e) = result {
                match &e {
                    MqttClientError::ConnectionLost { .. } => info!(error = %e, "receive stopped"),
                    _ => warn!(error = %e, "receive failed"),
                }
                self.begin_close(&e.to_string());
                break;
            }
        }
        // nothing can answer a pending CONNECT or PINGREQ any more
        self.connack.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.pingresp.lock().unwrap_or_else(|e| e.into_inner()).take();
        debug!("receive loop stopped");
        reader
    }

    pub(crate) async fn inflight_loop(self: Arc<Self>) {
        loop {
            let deadline = match lock(&self.inflight, "inflight") {
                Ok(queue) => queue.next_deadline(),
                Err(e) => {
                    self.begin_close(&e.to_string());
                    break;
                }
            };
            tokio::select! {
                _ = self.closing.cancelled() => break,
                _ = self.inflight_wake.notified() => {}
                _ = sleep_until_opt(deadline) => {}
            }
            // a pass runs to the end; its writes fail fast once closing
            if let Err(e) = self.process_inflight().await {
                if !self.is_closing() {
                    warn!(error = %e, "inflight processing failed");
                    self.begin_close(&e.to_string());
                }
                break;
            }
        }
        debug!("inflight loop stopped");
    }

    /// Sends PINGREQ whenever nothing else went out for a whole period and
    /// closes the connection when PINGRESP does not follow within another.
    pub(crate) async fn keep_alive_loop(self: Arc<Self>, period: Duration) {
        loop {
            let due = self.last_sent() + period;
            tokio::select! {
                _ = self.closing.cancelled() => break,
                _ = tokio::time::sleep_until(due) => {}
            }
            if self.last_sent() + period > Instant::now() {
                continue;
            }
            let result = tokio::select! {
                _ = self.closing.cancelled() => break,
                result = self.ping(period) => result,
            };
            if let Err(e) = result {
                warn!(error = %e, "keep-alive failed");
                self.begin_close(&e.to_string());
                break;
            }
        }
        debug!("keep-alive loop stopped");
    }

    async fn ping(&self, wait: Duration) -> MqttClientResult<()> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.pingresp, "pingresp")? = Some(tx);
        self.send_packet(&MqttPacket::PingReq(MqttPingReq::new()))
            .await?;
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(MqttClientError::ConnectionLost {
                reason: "connection closed while waiting for PINGRESP".to_string(),
            }),
            Err(_) => Err(MqttClientError::OperationTimeout {
                operation: "PINGRESP".to_string(),
                timeout_ms: wait.as_millis() as u64,
            }),
        }
    }

    async fn deliver_pending(&self, handler: &SharedHandler) {
        loop {
            let next = self
                .events
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            let Some(event) = next else {
                break;
            };
            let mut guard = handler.lock().await;
            event.dispatch(&mut **guard).await;
        }
    }

    /// Delivers events until the connection closes, then tears it down: the
    /// other loops are joined, the last events delivered, the transport
    /// closed, and `on_connection_closed` raised once.
    pub(crate) async fn dispatch_loop(
        self: Arc<Self>,
        handler: SharedHandler,
        workers: Vec<JoinHandle<()>>,
        receiver: JoinHandle<ReadHalf<BoxedTransport>>,
    ) {
        loop {
            self.deliver_pending(&handler).await;
            tokio::select! {
                _ = self.closing.cancelled() => break,
                _ = self.event_wake.notified() => {}
            }
        }

        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "engine task failed");
            }
        }
        let reader = match receiver.await {
            Ok(reader) => Some(reader),
            Err(e) => {
                warn!(error = %e, "receive task failed");
                None
            }
        };
        self.deliver_pending(&handler).await;
        self.shutdown_transport(reader).await;
        self.set_state(ConnectionState::Disconnected);
        info!("connection closed");
        handler.lock().await.on_connection_closed().await;
    }

    /// Teardown for a connection that never got past CONNECT.
    pub(crate) async fn abort(&self, reason: &str, receiver: JoinHandle<ReadHalf<BoxedTransport>>) {
        self.begin_close(reason);
        let reader = receiver.await.ok();
        self.shutdown_transport(reader).await;
        self.set_state(ConnectionState::Disconnected);
    }

    async fn shutdown_transport(&self, reader: Option<ReadHalf<BoxedTransport>>) {
        let writer = self.writer.lock().await.take();
        match (reader, writer) {
            (Some(reader), Some(writer)) => {
                let mut transport = reader.unsplit(writer);
                if let Err(e) = transport.close().await {
                    debug!(error = %e, "transport close failed");
                }
            }
            (_, Some(mut writer)) => {
                if let Err(e) = writer.shutdown().await {
                    debug!(error = %e, "transport shutdown failed");
                }
            }
            _ => {}
        }
    }
}
