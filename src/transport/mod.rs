//! Message broker abstraction
//!
//! A `Broker` produces `BrokerSession`s; a session is one live connection.
//! When a session dies, `closed()` resolves and every unacknowledged delivery
//! taken through it goes back to its queue. The connection supervisor owns
//! the only session of the process and replaces it after a loss.
//!
//! Two implementations exist: AMQP on `lapin` and an in-process broker used
//! by tests and local runs.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::BrokerBackend;

#[cfg(feature = "broker-amqp")]
pub mod amqp;
pub mod memory;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The broker could not be reached or refused the handshake
    ConnectFailed(String),

    /// The session is gone; nothing can be published or acknowledged on it
    ConnectionClosed,

    PublishFailed(String),

    /// The broker negatively confirmed a publish
    Nacked,

    Declare(String),

    Consume(String),

    Ack(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectFailed(msg) => write!(f, "failed to connect to broker: {msg}"),
            TransportError::ConnectionClosed => write!(f, "broker connection is closed"),
            TransportError::PublishFailed(msg) => write!(f, "publish failed: {msg}"),
            TransportError::Nacked => write!(f, "broker did not confirm the publish"),
            TransportError::Declare(msg) => write!(f, "queue declaration failed: {msg}"),
            TransportError::Consume(msg) => write!(f, "consume failed: {msg}"),
            TransportError::Ack(msg) => write!(f, "acknowledgement failed: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Settles one delivery with the broker
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> TransportResult<()>;

    async fn reject(&self, requeue: bool) -> TransportResult<()>;
}

/// One message taken from a queue, not yet settled
pub struct Delivery {
    pub payload: Vec<u8>,

    /// Set when the broker has handed this message out before
    pub redelivered: bool,

    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, redelivered: bool, acker: Box<dyn Acker>) -> Self {
        Self {
            payload,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> TransportResult<()> {
        self.acker.ack().await
    }

    pub async fn reject(self, requeue: bool) -> TransportResult<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, TransportResult<Delivery>>;

/// One live broker connection
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Declare a durable queue; idempotent
    async fn declare_queue(&self, queue: &str) -> TransportResult<()>;

    /// Publish a persistent message and wait for the broker to confirm it
    async fn publish(&self, queue: &str, payload: &[u8]) -> TransportResult<()>;

    /// Start consuming; the stream ends when the session dies
    async fn consume(&self, queue: &str, consumer_tag: &str) -> TransportResult<DeliveryStream>;

    /// Resolves once the session is lost or closed
    async fn closed(&self);

    fn is_connected(&self) -> bool;

    async fn close(&self) -> TransportResult<()>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> TransportResult<Arc<dyn BrokerSession>>;

    /// Connection target for log output
    fn describe(&self) -> String;
}

/// Build the configured broker
pub fn build_broker(backend: &BrokerBackend) -> anyhow::Result<Arc<dyn Broker>> {
    match backend {
        #[cfg(feature = "broker-amqp")]
        BrokerBackend::Amqp(settings) => Ok(Arc::new(amqp::AmqpBroker::new(settings.clone()))),
        #[cfg(not(feature = "broker-amqp"))]
        BrokerBackend::Amqp(_) => anyhow::bail!("built without the broker-amqp feature"),
        BrokerBackend::Memory => Ok(Arc::new(memory::MemoryBroker::new())),
    }
}
