// SPDX-License-Identifier: MPL-2.0

//! MQTT 3.1/3.1.1 client protocol engine.
//!
//! - [`mqtt_serde`]: control packet codec, plus a streaming parser.
//! - [`mqtt_session`]: delivery contexts and the session that carries
//!   unfinished QoS 1/2 handshakes across connections.
//! - [`mqtt_client`]: the client, its inflight state machine and the tasks
//!   that drive a connection.

pub mod mqtt_client;
pub mod mqtt_serde;
pub mod mqtt_session;

pub use mqtt_client::{
    ConnectionResult, ConnectionState, EngineSettings, MqttClient, MqttClientError,
    MqttClientOptions, MqttEventHandler,
};
