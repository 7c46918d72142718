pub mod client;
pub mod engine;
pub mod error;
pub mod inflight;
pub mod opts;
pub mod transport;

pub use self::client::{ConnectionResult, MqttClient, MqttEventHandler};
pub use self::engine::{ConnectionState, MqttEvent};
pub use self::error::{MqttClientError, MqttClientResult};
pub use self::inflight::{IncomingPublish, InflightOutcome, InflightQueue};
pub use self::opts::{EngineSettings, MqttClientOptions};
pub use self::transport::{TcpTransport, Transport, TransportError};
