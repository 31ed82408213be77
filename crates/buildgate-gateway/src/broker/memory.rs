//! In-process broker used by the local backplane and in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{Broker, BrokerConnection, BrokerError, Message};

/// Point-in-time counters of broker activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections_opened: u64,
    pub open_connections: usize,
    pub published: u64,
}

struct Inner {
    queues: Mutex<HashMap<String, VecDeque<Message>>>,
    published: Notify,
    max_depth: usize,
    connections_opened: AtomicU64,
    open_connections: AtomicUsize,
    messages_published: AtomicU64,
}

/// FIFO queues held in memory, one per queue name.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MemoryBroker {
    /// Broker whose queues each hold at most `max_depth` pending messages.
    pub fn new(max_depth: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                published: Notify::new(),
                max_depth,
                connections_opened: AtomicU64::new(0),
                open_connections: AtomicUsize::new(0),
                messages_published: AtomicU64::new(0),
            }),
        }
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            connections_opened: self.inner.connections_opened.load(Ordering::Acquire),
            open_connections: self.inner.open_connections.load(Ordering::Acquire),
            published: self.inner.messages_published.load(Ordering::Acquire),
        }
    }

    /// Number of messages waiting on `queue`.
    pub fn depth(&self, queue: &str) -> usize {
        self.inner.lock().get(queue).map_or(0, VecDeque::len)
    }

    /// Take the oldest message on `queue`, waiting up to `wait` for one to arrive.
    pub async fn claim(&self, queue: &str, wait: Duration) -> Option<Message> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.inner.published.notified();
            tokio::pin!(notified);
            // Register before checking so a publish in between is not missed.
            notified.as_mut().enable();

            if let Some(message) = self.inner.pop(queue) {
                return Some(message);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Message>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&self, queue: &str) -> Option<Message> {
        self.lock().get_mut(queue).and_then(VecDeque::pop_front)
    }

    fn push(&self, queue: &str, message: Message) -> Result<(), BrokerError> {
        let mut queues = self.lock();
        let pending = queues.entry(queue.to_string()).or_default();
        if pending.len() >= self.max_depth {
            return Err(BrokerError::QueueFull {
                queue: queue.to_string(),
                depth: pending.len(),
            });
        }
        pending.push_back(message);
        drop(queues);

        self.messages_published.fetch_add(1, Ordering::AcqRel);
        self.published.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, queue: &str) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        if queue.is_empty() {
            return Err(BrokerError::Connect("queue name is empty".into()));
        }
        self.inner.connections_opened.fetch_add(1, Ordering::AcqRel);
        self.inner.open_connections.fetch_add(1, Ordering::AcqRel);
        debug!(queue, "Broker connection opened");
        Ok(Box::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
            queue: queue.to_string(),
        }))
    }
}

struct MemoryConnection {
    inner: Arc<Inner>,
    queue: String,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn publish(&mut self, queue: &str, message: Message) -> Result<(), BrokerError> {
        let id = message.id.clone();
        self.inner.push(queue, message)?;
        debug!(queue, message_id = %id, "Message published");
        Ok(())
    }

    async fn disconnect(self: Box<Self>) {
        debug!(queue = %self.queue, "Broker connection closed");
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.inner.open_connections.fetch_sub(1, Ordering::AcqRel);
    }
}
