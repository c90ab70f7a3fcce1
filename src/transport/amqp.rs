//! AMQP 0.9.1 transport on `lapin`
//!
//! Each session opens two channels on one connection: a publisher channel
//! in confirm mode and a consumer channel with a prefetch of one, so the
//! broker hands out the next telemetry batch only after the previous one was
//! settled.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{Acker, Broker, BrokerSession, Delivery, DeliveryStream, TransportError, TransportResult};
use crate::config::AmqpSettings;

const PERSISTENT: u8 = 2;

pub struct AmqpBroker {
    settings: AmqpSettings,
}

impl AmqpBroker {
    pub fn new(settings: AmqpSettings) -> Self {
        Self { settings }
    }

    fn uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.settings.user.clone(),
                    password: self.settings.password.clone(),
                },
                host: self.settings.host.clone(),
                port: self.settings.port,
            },
            vhost: self.settings.vhost.clone(),
            ..AMQPUri::default()
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> TransportResult<Arc<dyn BrokerSession>> {
        debug!("connecting to {}", self.describe());

        let connection = Connection::connect_uri(self.uri(), ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let closed = Arc::new(watch::Sender::new(false));
        let on_error = closed.clone();
        connection.on_error(move |err| {
            warn!("AMQP connection error: {err}");
            on_error.send_replace(true);
        });

        let publisher = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let consumer = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        consumer
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        info!("connected to {}", self.describe());

        Ok(Arc::new(AmqpSession {
            connection,
            publisher,
            consumer,
            closed,
        }))
    }

    fn describe(&self) -> String {
        self.settings.display_url()
    }
}

struct AmqpSession {
    connection: Connection,
    publisher: Channel,
    consumer: Channel,
    closed: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn declare_queue(&self, queue: &str) -> TransportResult<()> {
        self.publisher
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Declare(e.to_string()))?;
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }

        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into());

        let confirmation = self
            .publisher
            .basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(TransportError::Nacked);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> TransportResult<DeliveryStream> {
        let consumer = self
            .consumer
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Consume(e.to_string()))?;

        let stream = consumer.map(|item| {
            item.map(|delivery| {
                Delivery::new(
                    delivery.data,
                    delivery.redelivered,
                    Box::new(AmqpAcker(delivery.acker)),
                )
            })
            .map_err(|e| TransportError::Consume(e.to_string()))
        });

        Ok(stream.boxed())
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // a dropped sender also means the session is gone
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn is_connected(&self) -> bool {
        !*self.closed.borrow() && self.connection.status().connected()
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.send_replace(true);
        if self.connection.status().connected() {
            if let Err(e) = self.connection.close(200, "shutdown").await {
                debug!("error while closing AMQP connection: {e}");
            }
        }
        Ok(())
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> TransportResult<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> TransportResult<()> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }
}
