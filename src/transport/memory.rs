//! In-process broker
//!
//! Queues live in the `MemoryBroker` and outlive sessions, like durable
//! queues on a real broker. Each `connect()` starts a new session generation;
//! `sever()` ends the current one, which returns its unacknowledged deliveries
//! to the head of their queue flagged as redelivered. `set_online(false)`
//! severs and refuses further connects until the broker is back online.
//!
//! Agents are simulated from tests with `inject` (telemetry in) and
//! `drain` (commands out), which bypass sessions entirely.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::stream;
use tokio::sync::{Mutex, Notify, watch};
use tracing::{debug, trace};

use super::{Acker, Broker, BrokerSession, Delivery, DeliveryStream, TransportError, TransportResult};

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    generation: u64,
    queue: String,
    message: Message,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Message>>,
    unacked: HashMap<u64, Unacked>,
    discarded: Vec<Vec<u8>>,
    next_tag: u64,
}

impl BrokerState {
    fn requeue_generation(&mut self, generation: u64) -> usize {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.generation == generation)
            .map(|(tag, _)| *tag)
            .collect();

        let mut requeued = 0;
        // highest tag first so the oldest delivery ends up at the head
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                self.queues
                    .entry(unacked.queue)
                    .or_default()
                    .push_front(message);
                requeued += 1;
            }
        }
        requeued
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    arrivals: Notify,
    generation: watch::Sender<u64>,
    online: AtomicBool,
    nack_publishes: AtomicBool,
    connect_attempts: AtomicUsize,
}

/// In-process broker; clones share the same queues
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                arrivals: Notify::new(),
                generation: watch::Sender::new(0),
                online: AtomicBool::new(true),
                nack_publishes: AtomicBool::new(false),
                connect_attempts: AtomicUsize::new(0),
            }),
        }
    }

    /// Drop the current session, as a network failure would
    pub async fn sever(&self) {
        let mut state = self.shared.state.lock().await;
        let ended = *self.shared.generation.borrow();
        let requeued = state.requeue_generation(ended);
        self.shared.generation.send_replace(ended + 1);
        drop(state);

        debug!("memory broker severed session {ended} ({requeued} deliveries requeued)");
        self.shared.arrivals.notify_waiters();
    }

    /// Going offline severs the current session and refuses new ones
    pub async fn set_online(&self, online: bool) {
        self.shared.online.store(online, Ordering::SeqCst);
        if !online {
            self.sever().await;
        }
    }

    /// Make every publish come back negatively confirmed
    pub fn set_nack_publishes(&self, nack: bool) {
        self.shared.nack_publishes.store(nack, Ordering::SeqCst);
    }

    /// Enqueue a message from outside the hub (an agent publishing)
    pub async fn inject(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        let mut state = self.shared.state.lock().await;
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(Message {
                payload: payload.into(),
                redelivered: false,
            });
        drop(state);
        self.shared.arrivals.notify_waiters();
    }

    /// Take every ready message off a queue (an agent consuming)
    pub async fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        let mut state = self.shared.state.lock().await;
        state
            .queues
            .get_mut(queue)
            .map(|q| q.drain(..).map(|m| m.payload).collect())
            .unwrap_or_default()
    }

    /// Ready messages on a queue, without removing them
    pub async fn queue_snapshot(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = self.shared.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn queue_exists(&self, queue: &str) -> bool {
        self.shared.state.lock().await.queues.contains_key(queue)
    }

    pub async fn unacked_count(&self) -> usize {
        self.shared.state.lock().await.unacked.len()
    }

    /// Payloads rejected without requeue
    pub async fn discarded(&self) -> Vec<Vec<u8>> {
        self.shared.state.lock().await.discarded.clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn is_online(&self) -> bool {
        self.shared.online.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> TransportResult<Arc<dyn BrokerSession>> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if !self.is_online() {
            return Err(TransportError::ConnectFailed(
                "memory broker is offline".to_string(),
            ));
        }

        let generation = *self.shared.generation.borrow();
        trace!("memory broker session {generation} opened");

        Ok(Arc::new(MemorySession {
            shared: self.shared.clone(),
            generation,
        }))
    }

    fn describe(&self) -> String {
        "memory://local".to_string()
    }
}

struct MemorySession {
    shared: Arc<Shared>,
    generation: u64,
}

impl MemorySession {
    fn is_current(shared: &Shared, generation: u64) -> bool {
        *shared.generation.borrow() == generation && shared.online.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn declare_queue(&self, queue: &str) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }
        self.shared
            .state
            .lock()
            .await
            .queues
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }
        if self.shared.nack_publishes.load(Ordering::SeqCst) {
            return Err(TransportError::Nacked);
        }

        let mut state = self.shared.state.lock().await;
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(Message {
                payload: payload.to_vec(),
                redelivered: false,
            });
        drop(state);

        self.shared.arrivals.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> TransportResult<DeliveryStream> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }

        let shared = self.shared.clone();
        let generation = self.generation;
        let queue = queue.to_string();

        let deliveries = stream::unfold((), move |()| {
            let shared = shared.clone();
            let queue = queue.clone();
            async move {
                loop {
                    let arrivals = shared.arrivals.notified();
                    tokio::pin!(arrivals);
                    arrivals.as_mut().enable();

                    {
                        let mut state = shared.state.lock().await;
                        // generation only changes under this lock
                        if !MemorySession::is_current(&shared, generation) {
                            return None;
                        }
                        let next = state.queues.get_mut(&queue).and_then(|q| q.pop_front());
                        if let Some(message) = next {
                            let tag = state.next_tag;
                            state.next_tag += 1;
                            state.unacked.insert(
                                tag,
                                Unacked {
                                    generation,
                                    queue: queue.clone(),
                                    message: message.clone(),
                                },
                            );

                            let acker = MemoryAcker {
                                shared: shared.clone(),
                                tag,
                            };
                            let delivery =
                                Delivery::new(message.payload, message.redelivered, Box::new(acker));
                            return Some((Ok::<_, TransportError>(delivery), ()));
                        }
                    }

                    arrivals.await;
                }
            }
        });

        Ok(Box::pin(deliveries))
    }

    async fn closed(&self) {
        let mut rx = self.shared.generation.subscribe();
        let generation = self.generation;
        let _ = rx.wait_for(|current| *current != generation).await;
    }

    fn is_connected(&self) -> bool {
        Self::is_current(&self.shared, self.generation)
    }

    async fn close(&self) -> TransportResult<()> {
        let mut state = self.shared.state.lock().await;
        if *self.shared.generation.borrow() == self.generation {
            state.requeue_generation(self.generation);
            self.shared.generation.send_replace(self.generation + 1);
        }
        drop(state);
        self.shared.arrivals.notify_waiters();
        Ok(())
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    tag: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> TransportResult<()> {
        let mut state = self.shared.state.lock().await;
        match state.unacked.remove(&self.tag) {
            Some(_) => Ok(()),
            // the session died first and the message went back to the queue
            None => Err(TransportError::ConnectionClosed),
        }
    }

    async fn reject(&self, requeue: bool) -> TransportResult<()> {
        let mut state = self.shared.state.lock().await;
        let Some(unacked) = state.unacked.remove(&self.tag) else {
            return Err(TransportError::ConnectionClosed);
        };

        if requeue {
            let mut message = unacked.message;
            message.redelivered = true;
            state
                .queues
                .entry(unacked.queue)
                .or_default()
                .push_front(message);
            drop(state);
            self.shared.arrivals.notify_waiters();
        } else {
            state.discarded.push(unacked.message.payload);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_then_consume_and_ack() {
        let broker = MemoryBroker::new();
        let session = broker.connect().await.unwrap();
        session.declare_queue("q").await.unwrap();
        session.publish("q", b"hello").await.unwrap();

        let mut stream = session.consume("q", "t").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"hello");
        assert!(!delivery.redelivered);
        assert_eq!(broker.unacked_count().await, 1);

        delivery.ack().await.unwrap();
        assert_eq!(broker.unacked_count().await, 0);
        assert!(broker.queue_snapshot("q").await.is_empty());
    }

    #[tokio::test]
    async fn test_sever_requeues_unacked_as_redelivered() {
        let broker = MemoryBroker::new();
        broker.inject("q", "first").await;
        broker.inject("q", "second").await;

        let session = broker.connect().await.unwrap();
        let mut stream = session.consume("q", "t").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"first");

        broker.sever().await;
        assert!(!session.is_connected());
        assert!(stream.next().await.is_none());
        assert!(delivery.ack().await.is_err());

        let session = broker.connect().await.unwrap();
        let mut stream = session.consume("q", "t").await.unwrap();
        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.payload, b"first");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_reject_without_requeue_discards() {
        let broker = MemoryBroker::new();
        broker.inject("q", "garbage").await;

        let session = broker.connect().await.unwrap();
        let mut stream = session.consume("q", "t").await.unwrap();
        stream.next().await.unwrap().unwrap().reject(false).await.unwrap();

        assert_eq!(broker.discarded().await, vec![b"garbage".to_vec()]);
        assert!(broker.queue_snapshot("q").await.is_empty());
    }

    #[tokio::test]
    async fn test_consumer_wakes_on_arrival() {
        let broker = MemoryBroker::new();
        let session = broker.connect().await.unwrap();
        let mut stream = session.consume("q", "t").await.unwrap();

        let pending = tokio::spawn(async move { stream.next().await.map(|d| d.map(|d| d.payload)) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.inject("q", "late").await;

        let payload = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, Some(Ok(b"late".to_vec())));
    }

    #[tokio::test]
    async fn test_offline_broker_refuses_connects() {
        let broker = MemoryBroker::new();
        let session = broker.connect().await.unwrap();

        broker.set_online(false).await;
        assert!(!session.is_connected());
        assert_eq!(
            session.publish("q", b"x").await,
            Err(TransportError::ConnectionClosed)
        );
        assert!(broker.connect().await.is_err());

        broker.set_online(true).await;
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_closed_resolves_on_sever() {
        let broker = MemoryBroker::new();
        let session = broker.connect().await.unwrap();

        let waiter = tokio::spawn(async move { session.closed().await });
        broker.sever().await;

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
