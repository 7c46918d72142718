//! End-to-end delivery flows against a scripted broker on an in-memory
//! transport. Time is paused, so retry and keep-alive timers fire instantly.

mod common;

use std::time::Duration;

use common::{connect, options, pair, Record, Recorder};
use flowmqtt::mqtt_client::{EngineSettings, MqttClient, MqttClientError};
use flowmqtt::mqtt_serde::control_packet::MqttPacket;
use flowmqtt::mqtt_serde::mqttv3::{
    connack::MqttConnAck, puback::MqttPubAck, pubcomp::MqttPubComp, publish::MqttPublish,
    pubrec::MqttPubRec, pubrel::MqttPubRel, suback::MqttSubAck, unsuback::MqttUnsubAck,
};
use flowmqtt::mqtt_session::{ContextKey, Flow, SessionStore};

fn expect_publish(packet: MqttPacket) -> MqttPublish {
    match packet {
        MqttPacket::Publish(publish) => publish,
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

/// CONNACK and whatever follows it, in a single write.
fn connack_then(session_present: bool, next: &[MqttPacket]) -> Vec<u8> {
    let mut bytes = MqttPacket::ConnAck(MqttConnAck::new(session_present, 0))
        .to_bytes()
        .unwrap();
    for packet in next {
        bytes.extend(packet.to_bytes().unwrap());
    }
    bytes
}

fn incoming(message_id: Option<u16>, qos: u8, payload: &[u8]) -> MqttPacket {
    MqttPacket::Publish(MqttPublish::new(
        "sensors/temp".to_string(),
        qos,
        payload.to_vec(),
        message_id,
        false,
        false,
    ))
}

#[tokio::test(start_paused = true)]
async fn test_qos0_publish_completes_once_written() {
    common::init_tracing();
    let (client, recorder) = common::client();
    let mut broker = connect(&client, options("qos0")).await;

    let id = client.publish("a/b", b"hello".to_vec(), 0, false).await.unwrap();
    let publish = expect_publish(broker.recv().await);
    assert_eq!(publish.qos, 0);
    assert_eq!(publish.message_id, None);
    assert_eq!(publish.payload, b"hello");

    recorder.wait_for(Record::Published(id, true)).await;
    broker.expect_silence(Duration::from_secs(10)).await;
    assert!(client.session().lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_qos1_publish_acknowledged() {
    common::init_tracing();
    let (client, recorder) = common::client();
    let mut broker = connect(&client, options("qos1")).await;

    let id = client.publish("a/b", b"x".to_vec(), 1, true).await.unwrap();
    let publish = expect_publish(broker.recv().await);
    assert_eq!(publish.message_id, Some(id));
    assert!(publish.retain);
    assert!(!publish.dup);
    assert_eq!(client.session().lock().unwrap().inflight_count(), 1);

    broker.send(MqttPacket::PubAck(MqttPubAck::new(id))).await;
    recorder.wait_for(Record::Published(id, true)).await;
    assert!(client.session().lock().unwrap().is_empty());

    // a second PUBACK for the same id is ignored
    broker.send(MqttPacket::PubAck(MqttPubAck::new(id))).await;
    broker.expect_silence(Duration::from_secs(5)).await;
    assert_eq!(recorder.count(&Record::Published(id, true)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_qos1_retries_then_fails_once() {
    common::init_tracing();
    let (client, recorder) = common::client();
    let mut broker = connect(&client, options("retry")).await;

    let id = client.publish("a/b", b"x".to_vec(), 1, false).await.unwrap();
    let first = expect_publish(broker.recv().await);
    assert!(!first.dup);
    for _ in 1..client.settings().max_attempts {
        let retry = expect_publish(broker.recv().await);
        assert!(retry.dup);
        assert_eq!(retry.message_id, Some(id));
    }

    recorder.wait_for(Record::Published(id, false)).await;
    broker.expect_silence(Duration::from_secs(10)).await;
    assert_eq!(recorder.count(&Record::Published(id, false)), 1);
    assert!(!recorder.records().contains(&Record::Published(id, true)));
    assert!(client.session().lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_qos2_publish_handshake() {
    common::init_tracing();
    let (client, recorder) = common::client();
    let mut broker = connect(&client, options("qos2")).await;

    let id = client.publish("a/b", b"x".to_vec(), 2, false).await.unwrap();
    assert_eq!(expect_publish(broker.recv().await).qos, 2);

    broker.send(MqttPacket::PubRec(MqttPubRec::new(id))).await;
    assert_eq!(
        broker.recv().await,
        MqttPacket::PubRel(MqttPubRel::new(id))
    );
    assert_eq!(client.session().lock().unwrap().inflight_count(), 1);
    assert!(recorder.records().is_empty());

    broker.send(MqttPacket::PubComp(MqttPubComp::new(id))).await;
    recorder.wait_for(Record::Published(id, true)).await;
    assert!(client.session().lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pubrel_retried_until_pubcomp() {
    common::init_tracing();
    let (client, recorder) = common::client();
    let mut broker = connect(&client, options("pubrel-retry")).await;

    let id = client.publish("a/b", b"x".to_vec(), 2, false).await.unwrap();
    broker.recv().await;
    broker.send(MqttPacket::PubRec(MqttPubRec::new(id))).await;
    assert_eq!(broker.recv().await, MqttPacket::PubRel(MqttPubRel::new(id)));
    // no PUBCOMP: PUBREL goes out again after the retry delay
    assert_eq!(broker.recv().await, MqttPacket::PubRel(MqttPubRel::new(id)));

    broker.send(MqttPacket::PubComp(MqttPubComp::new(id))).await;
    recorder.wait_for(Record::Published(id, true)).await;
}

#[tokio::test(start_paused = true)]
async fn test_resume_after_broker_drop_sends_only_pubrel() {
    common::init_tracing();
    let (client, recorder) = common::client();
    let opts = common::persistent_options("resume");
    let mut broker = connect(&client, opts.clone()).await;

    let id = client.publish("a/b", b"x".to_vec(), 2, false).await.unwrap();
    broker.recv().await;
    broker.send(MqttPacket::PubRec(MqttPubRec::new(id))).await;
    assert_eq!(broker.recv().await, MqttPacket::PubRel(MqttPubRel::new(id)));

    drop(broker);
    recorder.wait_for(Record::Closed).await;
    assert!(!client.is_connected());

    let mut broker = connect(&client, opts).await;
    // the PUBLISH step is finished; only the release is repeated
    assert_eq!(broker.recv().await, MqttPacket::PubRel(MqttPubRel::new(id)));
    broker.send(MqttPacket::PubComp(MqttPubComp::new(id))).await;
    recorder.wait_for(Record::Published(id, true)).await;
    assert!(client.session().lock().unwrap().is_empty());
    assert_eq!(recorder.count(&Record::Closed), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resume_republishes_unacknowledged_qos1_with_dup() {
    common::init_tracing();
    let (client, recorder) = common::client();
    let opts = common::persistent_options("resume-qos1");
    let mut broker = connect(&client, opts.clone()).await;

    let id = client.publish("a/b", b"x".to_vec(), 1, false).await.unwrap();
    assert!(!expect_publish(broker.recv().await).dup);
    drop(broker);
    recorder.wait_for(Record::Closed).await;

    let mut broker = connect(&client, opts).await;
    let resent = expect_publish(broker.recv().await);
    assert_eq!(resent.message_id, Some(id));
    assert!(resent.dup);
    broker.send(MqttPacket::PubAck(MqttPubAck::new(id))).await;
    recorder.wait_for(Record::Published(id, true)).await;
}

#[tokio::test(start_paused = true)]
async fn test_clean_session_discards_unfinished_deliveries() {
    common::init_tracing();
    let (client, recorder) = common::client();
    let mut broker = connect(&client, common::persistent_options("clean")).await;

    client.publish("a/b", b"x".to_vec(), 1, false).await.unwrap();
    broker.recv().await;
    drop(broker);
    recorder.wait_for(Record::Closed).await;

    let mut broker = connect(&client, options("clean")).await;
    broker.expect_silence(Duration::from_secs(30)).await;
    assert!(client.session().lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_publish_arriving_with_connack_is_delivered() {
    common::init_tracing();
    let (client, recorder) = common::client();
    let (transport, mut broker) = pair();

    let broker_side = async {
        assert!(matches!(broker.recv().await, MqttPacket::Connect(_)));
        broker
            .send_raw(&connack_then(false, &[incoming(Some(7), 1, b"early")]))
            .await;
    };
    let (result, _) = tokio::join!(client.connect_with(transport, options("early")), broker_side);
    result.unwrap();

    assert_eq!(broker.recv().await, MqttPacket::PubAck(MqttPubAck::new(7)));
    recorder.wait_until(|r| r.len() == 1).await;
    assert_eq!(recorder.received()[0].payload, b"early");
}

#[tokio::test(start_paused = true)]
async fn test_incoming_qos2_released_after_reconnect() {
    common::init_tracing();
    let (client, recorder) = common::client();
    let opts = common::persistent_options("resume-incoming");
    let mut broker = connect(&client, opts.clone()).await;

    broker.send(incoming(Some(5), 2, b"exactly-once")).await;
    assert_eq!(broker.recv().await, MqttPacket::PubRec(MqttPubRec::new(5)));
    let key = ContextKey::new(5, Flow::ToAcknowledge);
    assert!(client.session().lock().unwrap().contains(&key));
    drop(broker);
    recorder.wait_for(Record::Closed).await;
    assert!(recorder.received().is_empty());

    // the broker releases the message right behind CONNACK
    let (transport, mut broker) = pair();
    let broker_side = async {
        assert!(matches!(broker.recv().await, MqttPacket::Connect(_)));
        broker
            .send_raw(&connack_then(true, &[MqttPacket::PubRel(MqttPubRel::new(5))]))
            .await;
    };
    let (result, _) = tokio::join!(client.connect_with(transport, opts), broker_side);
    assert!(result.unwrap().session_present);

    assert_eq!(broker.recv().await, MqttPacket::PubComp(MqttPubComp::new(5)));
    recorder.wait_until(|r| r.iter().any(|rec| matches!(rec, Record::Received(_)))).await;
    let received = recorder.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload, b"exactly-once");
    assert!(client.session().lock().unwrap().is_empty());
    broker.expect_silence(Duration::from_secs(30)).await;
}

#[tokio::test(start_paused = true)]
async fn test_incoming_qos0_and_qos1() {
    common::init_tracing();
    let (client, recorder) = common::client();
    let mut broker = connect(&client, options("incoming")).await;

    broker.send(incoming(None, 0, b"zero")).await;
    broker.send(incoming(Some(11), 1, b"one")).await;
    assert_eq!(broker.recv().await, MqttPacket::PubAck(MqttPubAck::new(11)));

    recorder.wait_until(|r| r.len() == 2).await;
    let payloads: Vec<Vec<u8>> = recorder.received().into_iter().map(|p| p.payload).collect();
    assert_eq!(payloads, vec![b"zero".to_vec(), b"one".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn test_incoming_qos2_duplicate_delivered_once() {
    common::init_tracing();
    let (client, recorder) = common::client();
    let mut broker = connect(&client, options("incoming-qos2")).await;

    broker.send(incoming(Some(7), 2, b"once")).await;
    assert_eq!(broker.recv().await, MqttPacket::PubRec(MqttPubRec::new(7)));
    assert!(recorder.records().is_empty());

    // broker missed the PUBREC and retransmits
    broker.send(incoming(Some(7), 2, b"once")).await;
    assert_eq!(broker.recv().await, MqttPacket::PubRec(MqttPubRec::new(7)));

    broker.send(MqttPacket::PubRel(MqttPubRel::new(7))).await;
    assert_eq!(broker.recv().await, MqttPacket::PubComp(MqttPubComp::new(7)));
    recorder.wait_until(|r| !r.is_empty()).await;

    // a late PUBREL is answered again, without a second delivery
    broker.send(MqttPacket::PubRel(MqttPubRel::new(7))).await;
    assert_eq!(broker.recv().await, MqttPacket::PubComp(MqttPubComp::new(7)));
    broker.expect_silence(Duration::from_secs(5)).await;

    let received = recorder.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload, b"once");
    assert!(client.session().lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_incoming_qos2_waits_for_pubrel_without_timeout() {
    common::init_tracing();
    let (client, recorder) = common::client();
    let mut broker = connect(&client, options("no-timeout")).await;

    broker.send(incoming(Some(3), 2, b"slow")).await;
    assert_eq!(broker.recv().await, MqttPacket::PubRec(MqttPubRec::new(3)));
    broker.expect_silence(Duration::from_secs(60)).await;
    assert!(recorder.records().is_empty());

    broker.send(MqttPacket::PubRel(MqttPubRel::new(3))).await;
    assert_eq!(broker.recv().await, MqttPacket::PubComp(MqttPubComp::new(3)));
    recorder.wait_until(|r| r.len() == 1).await;
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_and_unsubscribe() {
    common::init_tracing();
    let (client, recorder) = common::client();
    let mut broker = connect(&client, options("subs")).await;

    let sub_id = client.subscribe(&["a/+", "b/#"], &[1, 2]).await.unwrap();
    let MqttPacket::Subscribe(subscribe) = broker.recv().await else {
        panic!("expected SUBSCRIBE");
    };
    assert_eq!(subscribe.message_id, sub_id);
    assert_eq!(subscribe.subscriptions.len(), 2);
    assert_eq!(subscribe.subscriptions[1].topic_filter, "b/#");
    broker
        .send(MqttPacket::SubAck(MqttSubAck::new(sub_id, vec![1, 0x80])))
        .await;
    recorder
        .wait_for(Record::Subscribed(sub_id, vec![1, 0x80]))
        .await;

    let unsub_id = client.unsubscribe(&["a/+"]).await.unwrap();
    assert_ne!(unsub_id, sub_id);
    let MqttPacket::Unsubscribe(unsubscribe) = broker.recv().await else {
        panic!("expected UNSUBSCRIBE");
    };
    assert_eq!(unsubscribe.topic_filters, vec!["a/+".to_string()]);
    broker
        .send(MqttPacket::UnsubAck(MqttUnsubAck::new(unsub_id)))
        .await;
    recorder.wait_for(Record::Unsubscribed(unsub_id)).await;
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_subscribe_fails() {
    common::init_tracing();
    let (client, recorder) = common::client();
    let mut broker = connect(&client, options("sub-fail")).await;

    let id = client.subscribe(&["a"], &[0]).await.unwrap();
    for _ in 0..client.settings().max_attempts {
        assert!(matches!(broker.recv().await, MqttPacket::Subscribe(_)));
    }
    recorder.wait_for(Record::SubscribeFailed(id)).await;

    let id = client.unsubscribe(&["a"]).await.unwrap();
    for _ in 0..client.settings().max_attempts {
        assert!(matches!(broker.recv().await, MqttPacket::Unsubscribe(_)));
    }
    recorder.wait_for(Record::UnsubscribeFailed(id)).await;
}

#[tokio::test(start_paused = true)]
async fn test_inflight_capacity() {
    common::init_tracing();
    let recorder = Recorder::default();
    let settings = EngineSettings::builder()
        .retry_delay_ms(1000)
        .inflight_capacity(1)
        .build()
        .unwrap();
    let client = MqttClient::new(settings, recorder.clone()).unwrap();
    let mut broker = connect(&client, options("full")).await;

    let id = client.publish("a/b", b"1".to_vec(), 1, false).await.unwrap();
    assert!(matches!(
        client.publish("a/b", b"2".to_vec(), 1, false).await,
        Err(MqttClientError::BufferFull { capacity: 1, .. })
    ));

    broker.recv().await;
    // the limit is on our own deliveries; the broker's still get answered
    broker.send(incoming(Some(21), 1, b"in")).await;
    broker.send(incoming(Some(22), 2, b"in")).await;
    assert_eq!(broker.recv().await, MqttPacket::PubAck(MqttPubAck::new(21)));
    assert_eq!(broker.recv().await, MqttPacket::PubRec(MqttPubRec::new(22)));
    recorder.wait_until(|r| r.len() == 1).await;

    broker.send(MqttPacket::PubAck(MqttPubAck::new(id))).await;
    recorder.wait_for(Record::Published(id, true)).await;
    client.publish("a/b", b"2".to_vec(), 1, false).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_session_store_carries_deliveries_between_clients() {
    common::init_tracing();
    let store = SessionStore::new();

    let first = Recorder::default();
    let client = MqttClient::with_session(common::settings(), store.session("shared"), first.clone())
        .unwrap();
    let opts = common::persistent_options("shared");
    let mut broker = connect(&client, opts.clone()).await;
    let id = client.publish("a/b", b"x".to_vec(), 1, false).await.unwrap();
    broker.recv().await;
    client.disconnect().await.unwrap();
    assert_eq!(store.session("shared").lock().unwrap().inflight_count(), 1);

    let second = Recorder::default();
    let client = MqttClient::with_session(
        common::settings(),
        store.session("shared"),
        second.clone(),
    )
    .unwrap();
    let mut broker = connect(&client, opts).await;
    assert_eq!(expect_publish(broker.recv().await).message_id, Some(id));
    broker.send(MqttPacket::PubAck(MqttPubAck::new(id))).await;
    second.wait_for(Record::Published(id, true)).await;
    assert!(!first.records().contains(&Record::Published(id, true)));
    assert!(store.session("shared").lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_handler_sees_events_in_order() {
    common::init_tracing();
    let (client, recorder) = common::client();
    let mut broker = connect(&client, options("order")).await;

    let ids: Vec<u16> = {
        let mut ids = Vec::new();
        for n in 0..3u8 {
            ids.push(client.publish("a/b", vec![n], 1, false).await.unwrap());
        }
        ids
    };
    for _ in &ids {
        broker.recv().await;
    }
    for id in &ids {
        broker.send(MqttPacket::PubAck(MqttPubAck::new(*id))).await;
    }
    recorder.wait_until(|r| r.len() == 3).await;
    let expected: Vec<Record> = ids.iter().map(|id| Record::Published(*id, true)).collect();
    assert_eq!(recorder.records(), expected);
}
