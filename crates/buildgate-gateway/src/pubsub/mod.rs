//! Log channel subscription.
//!
//! A worker publishes serialized [`JobResponse`] records on
//! `"{queue_name}/log-{session_id}"` and closes the channel when the build is
//! over. Records that do not decode are skipped; they never end the stream.

mod memory;

pub use memory::MemoryPubSub;

use async_trait::async_trait;
use buildgate_core::model::JobResponse;

/// Raw payload as published on a channel.
pub type RawMessage = Vec<u8>;

/// Pub/sub client.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, PubSubError>;
}

/// An open subscription: a lazy sequence of raw messages.
#[async_trait]
pub trait Subscription: Send {
    fn channel(&self) -> &str;

    /// Next message, or `None` once the publisher closed the channel.
    async fn next_message(&mut self) -> Option<RawMessage>;

    /// Unsubscribe and release the connection.
    async fn close(self: Box<Self>);
}

/// Errors from pub/sub operations.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    #[error("Pub/sub connection failed: {0}")]
    Connect(String),

    #[error("Invalid channel name: {0:?}")]
    InvalidChannel(String),
}

/// Outcome of decoding one inbound record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Response(JobResponse),
    Skip(String),
}

/// Decode a channel payload into a [`JobResponse`].
pub fn decode(payload: &[u8]) -> Decoded {
    match serde_json::from_slice(payload) {
        Ok(response) => Decoded::Response(response),
        Err(e) => Decoded::Skip(e.to_string()),
    }
}

/// Channel a worker publishes the log of session `session_id` on.
pub fn log_channel(queue_name: &str, session_id: &str) -> String {
    format!("{queue_name}/log-{session_id}")
}

#[cfg(test)]
mod tests {
    use buildgate_core::model::ResponseKind;

    use super::*;

    #[test]
    fn channel_name_convention() {
        assert_eq!(log_channel("rai_docker", "abc"), "rai_docker/log-abc");
    }

    #[test]
    fn valid_payload_decodes() {
        let decoded = decode(br#"{"kind":"stdout","body":"aGk="}"#);
        let Decoded::Response(resp) = decoded else {
            unreachable!("expected a response, got {decoded:?}");
        };
        assert_eq!(resp.kind, ResponseKind::Stdout);
        assert_eq!(resp.body, b"hi");
    }

    #[test]
    fn garbage_is_skipped_with_reason() {
        assert!(matches!(decode(b"\x00not json"), Decoded::Skip(reason) if !reason.is_empty()));
        assert!(matches!(decode(br#"{"body":"aGk="}"#), Decoded::Skip(_)));
    }
}
