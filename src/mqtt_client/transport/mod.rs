//! Byte channels the engine runs over.
//!
//! MQTT needs an ordered, reliable stream that can be read and written at the
//! same time. Readiness of [`AsyncRead`] stands in for polling for available
//! data, so a transport only adds dialing and an orderly close. TLS belongs
//! in a transport implementation, never in the engine.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod tcp;

pub use tcp::TcpTransport;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectionFailed(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("channel closed")]
    Closed,

    #[error("channel timed out")]
    Timeout,

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("bad address {0:?}")]
    InvalidAddress(String),
}

#[async_trait]
pub trait Transport: AsyncRead + AsyncWrite + Send + Sync + Unpin {
    /// Dials `addr`. The address format is up to the implementation.
    async fn connect(addr: &str) -> Result<Self, TransportError>
    where
        Self: Sized;

    /// Flushes and shuts the channel down. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Remote end, for logs.
    fn peer_addr(&self) -> Result<String, TransportError>;
}

/// What the engine holds once the concrete transport type is erased.
pub type BoxedTransport = Box<dyn Transport>;
