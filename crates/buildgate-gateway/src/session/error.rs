use std::time::Duration;

use buildgate_core::archive::TranscodeError;

use crate::broker::BrokerError;
use crate::pubsub::PubSubError;
use crate::storage::StorageError;

/// Errors that end a build session.
///
/// The `Display` text is what the client receives as the terminal message.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to decode submitted files: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Failed to examine submitted files: {0}")]
    Transcode(#[from] TranscodeError),

    #[error("Failed to upload docker build session: {0}")]
    Upload(#[from] StorageError),

    #[error("Failed to encode docker build request: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to submit docker build request: {0}")]
    Publish(#[from] BrokerError),

    #[error("Build submitted but its log could not be followed: {0}")]
    Subscribe(#[from] PubSubError),

    #[error("No build output received for {idle:?}, giving up")]
    IdleTimeout { idle: Duration },

    #[error("Client disconnected")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}
