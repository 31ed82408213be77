//! Job queue publishing.
//!
//! Sessions follow a publish-and-disconnect pattern: a [`BrokerConnection`]
//! is opened for a single publish and released straight after.

mod memory;

pub use memory::{BrokerStats, MemoryBroker};

use std::collections::HashMap;

use async_trait::async_trait;

/// Header carrying the session id.
pub const HEADER_ID: &str = "id";
/// Header carrying the artifact key the job builds from.
pub const HEADER_UPLOAD_KEY: &str = "upload_key";

/// Envelope published on a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Message broker client.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a connection bound to `queue`.
    async fn connect(&self, queue: &str) -> Result<Box<dyn BrokerConnection>, BrokerError>;
}

/// A live broker connection.
#[async_trait]
pub trait BrokerConnection: Send {
    async fn publish(&mut self, queue: &str, message: Message) -> Result<(), BrokerError>;

    /// Release the connection.
    async fn disconnect(self: Box<Self>);
}

/// Errors from broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker connection failed: {0}")]
    Connect(String),

    #[error("Broker transport error: {0}")]
    Transport(String),

    #[error("Queue {queue} is full ({depth} pending jobs)")]
    QueueFull { queue: String, depth: usize },
}
