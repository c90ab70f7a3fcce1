//! Connection supervisor
//!
//! Owns the process's single broker session. The actor loop connects,
//! declares both durable queues, starts the ingestion consumer and publishes
//! the session for the dispatcher. When the session dies (or the consumer
//! stops) it withdraws the session, waits the fixed reconnect delay and starts
//! over, without limit. Connection loss is never surfaced as an error: the
//! dispatcher simply sees no session and fails fast.
//!
//! The consumer is never cancelled mid-message. On loss or shutdown it is
//! told to stop and awaited; whatever it was handling runs to completion
//! first, and an ack that no longer reaches the broker means a redelivery.
//!
//! ```text
//!   Disconnected ──► Connecting ──► Connected
//!        ▲               │              │
//!        └── delay ◄─────┴── failure ◄──┘
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::BrokerConfig;
use crate::ingest::IngestionConsumer;
use crate::transport::{Broker, BrokerSession, DeliveryStream, TransportResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// The live session, if any; `None` while disconnected
pub type SessionReceiver = watch::Receiver<Option<Arc<dyn BrokerSession>>>;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub data_queue: String,
    pub command_queue: String,
    pub reconnect_delay: Duration,
    pub consumer_tag: String,
}

impl From<&BrokerConfig> for SupervisorSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            data_queue: config.data_queue.clone(),
            command_queue: config.command_queue.clone(),
            reconnect_delay: config.reconnect_delay(),
            consumer_tag: "fleet-hub".to_string(),
        }
    }
}

#[derive(Debug)]
enum SupervisorCommand {
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Outcome of waiting for something while staying responsive to shutdown
enum Interrupted {
    Shutdown(Option<oneshot::Sender<()>>),
}

struct ConnectionSupervisor {
    broker: Arc<dyn Broker>,
    consumer: IngestionConsumer,
    settings: SupervisorSettings,
    command_rx: mpsc::Receiver<SupervisorCommand>,
    state_tx: watch::Sender<ConnectionState>,
    session_tx: watch::Sender<Option<Arc<dyn BrokerSession>>>,
    connections: Arc<AtomicU64>,
}

impl ConnectionSupervisor {
    #[instrument(skip(self), fields(broker = %self.broker.describe()))]
    async fn run(mut self) {
        debug!("starting connection supervisor");

        let responder = loop {
            let (session, deliveries) = match self.establish().await {
                Ok(established) => established,
                Err(Interrupted::Shutdown(responder)) => break responder,
            };

            let (stop_tx, stop_rx) = oneshot::channel::<()>();
            let consumer = self.consumer.clone();
            let mut consumer_task: JoinHandle<()> = tokio::spawn(async move {
                let stop = async move {
                    let _ = stop_rx.await;
                };
                consumer.run_until(deliveries, stop).await
            });

            self.session_tx.send_replace(Some(session.clone()));
            self.state_tx.send_replace(ConnectionState::Connected);
            let count = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
            info!("broker connection established (connection #{count})");

            let (shutdown, consumer_stopped) = tokio::select! {
                _ = session.closed() => {
                    warn!("broker connection lost");
                    (None, false)
                }
                _ = &mut consumer_task => {
                    warn!("ingestion consumer stopped, recycling the connection");
                    (None, true)
                }
                cmd = self.command_rx.recv() => (Some(Self::responder_of(cmd)), false),
            };

            self.session_tx.send_replace(None);
            self.state_tx.send_replace(ConnectionState::Disconnected);

            // the consumer finishes the message in hand before it stops
            if !consumer_stopped {
                let _ = stop_tx.send(());
                if let Err(e) = consumer_task.await {
                    warn!("ingestion consumer task failed: {e}");
                }
            }
            if let Err(e) = session.close().await {
                debug!("error closing broker session: {e}");
            }

            if let Some(responder) = shutdown {
                break responder;
            }

            if let Err(Interrupted::Shutdown(responder)) = self.backoff().await {
                break responder;
            }
        };

        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!("connection supervisor stopped");

        if let Some(responder) = responder {
            let _ = responder.send(());
        }
    }

    fn responder_of(cmd: Option<SupervisorCommand>) -> Option<oneshot::Sender<()>> {
        match cmd {
            Some(SupervisorCommand::Shutdown { respond_to }) => Some(respond_to),
            // every handle is gone, nobody is waiting for a reply
            None => None,
        }
    }

    /// Connect until it works, honouring shutdown between attempts
    async fn establish(
        &mut self,
    ) -> Result<(Arc<dyn BrokerSession>, DeliveryStream), Interrupted> {
        loop {
            self.state_tx.send_replace(ConnectionState::Connecting);

            let attempt = tokio::select! {
                attempt = Self::try_connect(&self.broker, &self.settings) => attempt,
                cmd = self.command_rx.recv() => {
                    return Err(Interrupted::Shutdown(Self::responder_of(cmd)));
                }
            };

            match attempt {
                Ok(established) => return Ok(established),
                Err(e) => {
                    warn!(
                        "could not connect to broker: {e}, retrying in {:?}",
                        self.settings.reconnect_delay
                    );
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    self.backoff().await?;
                }
            }
        }
    }

    async fn try_connect(
        broker: &Arc<dyn Broker>,
        settings: &SupervisorSettings,
    ) -> TransportResult<(Arc<dyn BrokerSession>, DeliveryStream)> {
        let session = broker.connect().await?;

        match Self::prepare(session.as_ref(), settings).await {
            Ok(deliveries) => Ok((session, deliveries)),
            Err(e) => {
                let _ = session.close().await;
                Err(e)
            }
        }
    }

    /// Redeclare the queues and re-arm the consumer on a fresh session
    async fn prepare(
        session: &dyn BrokerSession,
        settings: &SupervisorSettings,
    ) -> TransportResult<DeliveryStream> {
        session.declare_queue(&settings.data_queue).await?;
        session.declare_queue(&settings.command_queue).await?;
        session
            .consume(&settings.data_queue, &settings.consumer_tag)
            .await
    }

    async fn backoff(&mut self) -> Result<(), Interrupted> {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.reconnect_delay) => Ok(()),
            cmd = self.command_rx.recv() => Err(Interrupted::Shutdown(Self::responder_of(cmd))),
        }
    }
}

/// Handle to the connection supervisor actor
#[derive(Clone)]
pub struct SupervisorHandle {
    sender: mpsc::Sender<SupervisorCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    session_rx: SessionReceiver,
    connections: Arc<AtomicU64>,
}

impl SupervisorHandle {
    /// Spawn the supervisor; it starts connecting immediately
    pub fn spawn(
        broker: Arc<dyn Broker>,
        consumer: IngestionConsumer,
        settings: SupervisorSettings,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (session_tx, session_rx) = watch::channel(None);
        let connections = Arc::new(AtomicU64::new(0));

        let actor = ConnectionSupervisor {
            broker,
            consumer,
            settings,
            command_rx: cmd_rx,
            state_tx,
            session_tx,
            connections: connections.clone(),
        };

        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            state_rx,
            session_rx,
            connections,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Receiver for the live session, handed to the dispatcher
    pub fn sessions(&self) -> SessionReceiver {
        self.session_rx.clone()
    }

    /// Number of sessions established since start
    pub fn connections_established(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }

    /// Wait until the supervisor reports `target`
    pub async fn wait_for(&self, target: ConnectionState) -> anyhow::Result<()> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|state| *state == target).await?;
        Ok(())
    }

    /// Stop the supervisor, closing the session and the consumer
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorCommand::Shutdown { respond_to: tx })
            .await?;

        rx.await?;
        Ok(())
    }
}
