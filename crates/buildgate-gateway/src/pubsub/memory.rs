//! In-process pub/sub hub used by the local backplane and in tests.
//!
//! A worker may start publishing before the gateway has subscribed (the job
//! is on the queue before the subscription opens). Until a channel gets its
//! first subscriber the hub keeps a bounded backlog for it, and remembers a
//! close, so a late subscriber still sees the whole log followed by the end of
//! the stream. Channels that are closed without ever being subscribed are
//! retained up to a fixed count, oldest evicted first.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::debug;

use super::{PubSub, PubSubError, RawMessage, Subscription};

const DEFAULT_CAPACITY: usize = 256;
const DEFAULT_MAX_ORPHANS: usize = 256;

#[derive(Default)]
struct ChannelState {
    subscribers: Vec<(u64, mpsc::Sender<RawMessage>)>,
    backlog: VecDeque<RawMessage>,
    ever_subscribed: bool,
    closed: bool,
}

#[derive(Default)]
struct Channels {
    states: HashMap<String, ChannelState>,
    /// Closed, never-subscribed channels in close order.
    orphans: VecDeque<String>,
}

struct Inner {
    channels: Mutex<Channels>,
    subscribed: Notify,
    next_id: AtomicU64,
    capacity: usize,
    max_orphans: usize,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Channels> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unsubscribe(&self, channel: &str, id: u64) {
        let mut channels = self.lock();
        let Some(state) = channels.states.get_mut(channel) else {
            return;
        };
        state.subscribers.retain(|(sid, _)| *sid != id);
        if state.ever_subscribed && state.subscribers.is_empty() {
            channels.states.remove(channel);
        }
    }
}

/// Channel hub held in memory.
#[derive(Clone)]
pub struct MemoryPubSub {
    inner: Arc<Inner>,
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MemoryPubSub {
    /// Hub whose subscriptions buffer up to `capacity` undelivered messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                channels: Mutex::new(Channels::default()),
                subscribed: Notify::new(),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                max_orphans: DEFAULT_MAX_ORPHANS,
            }),
        }
    }

    /// Publish `payload` on `channel`, returning how many subscribers received it.
    ///
    /// Before the first subscription the payload is kept in the channel backlog
    /// (dropping the oldest entry when full). Publishing on a closed channel is
    /// a no-op.
    pub async fn publish(&self, channel: &str, payload: RawMessage) -> usize {
        let senders: Vec<_> = {
            let mut channels = self.inner.lock();
            let state = channels.states.entry(channel.to_string()).or_default();
            if state.closed {
                return 0;
            }
            if !state.ever_subscribed {
                if state.backlog.len() >= self.inner.capacity {
                    state.backlog.pop_front();
                }
                state.backlog.push_back(payload);
                return 0;
            }
            state
                .subscribers
                .iter()
                .map(|(_, tx)| tx.clone())
                .collect()
        };

        let mut delivered = 0;
        for tx in senders {
            if tx.send(payload.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Close `channel`: current subscriptions end once drained.
    pub fn close(&self, channel: &str) {
        let mut channels = self.inner.lock();
        let Some(state) = channels.states.get_mut(channel) else {
            // Never published nor subscribed; remember the close for a late subscriber.
            channels.states.insert(
                channel.to_string(),
                ChannelState {
                    closed: true,
                    ..ChannelState::default()
                },
            );
            retain_orphan(&mut channels, channel, self.inner.max_orphans);
            return;
        };

        if state.ever_subscribed {
            channels.states.remove(channel);
        } else if !state.closed {
            state.closed = true;
            retain_orphan(&mut channels, channel, self.inner.max_orphans);
        }
        debug!(channel, "Channel closed");
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .lock()
            .states
            .get(channel)
            .map_or(0, |s| s.subscribers.len())
    }

    /// Wait until `channel` has at least one subscriber. Returns `false` on timeout.
    pub async fn wait_for_subscriber(&self, channel: &str, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.inner.subscribed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.subscriber_count(channel) > 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }
}

fn retain_orphan(channels: &mut Channels, channel: &str, max_orphans: usize) {
    channels.orphans.push_back(channel.to_string());
    while channels.orphans.len() > max_orphans {
        if let Some(evicted) = channels.orphans.pop_front() {
            channels.states.remove(&evicted);
        }
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, PubSubError> {
        if channel.is_empty() {
            return Err(PubSubError::InvalidChannel(channel.to_string()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::AcqRel);
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        {
            let mut channels = self.inner.lock();
            let state = channels.states.entry(channel.to_string()).or_default();
            // The backlog never exceeds the capacity, so these cannot fail.
            for payload in state.backlog.drain(..) {
                let _ = tx.try_send(payload);
            }
            if state.closed {
                channels.states.remove(channel);
                channels.orphans.retain(|c| c != channel);
                drop(tx);
            } else {
                state.ever_subscribed = true;
                state.subscribers.push((id, tx));
            }
        }
        self.inner.subscribed.notify_waiters();
        debug!(channel, subscriber = id, "Subscribed");

        Ok(Box::new(MemorySubscription {
            id,
            channel: channel.to_string(),
            rx,
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemorySubscription {
    id: u64,
    channel: String,
    rx: mpsc::Receiver<RawMessage>,
    inner: Arc<Inner>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn next_message(&mut self) -> Option<RawMessage> {
        self.rx.recv().await
    }

    async fn close(self: Box<Self>) {
        debug!(channel = %self.channel, subscriber = self.id, "Unsubscribed");
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.inner.unsubscribe(&self.channel, self.id);
    }
}
