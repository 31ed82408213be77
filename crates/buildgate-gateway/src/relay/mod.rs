//! Single-writer relay onto a client's `Build` response stream.
//!
//! Progress narration from the session and log lines from the worker both go
//! through one bounded queue. A single forwarding task drains it and is the
//! only writer to the gRPC stream, so the client sees messages in exactly the
//! order they were enqueued.

mod filter;
mod palette;

#[cfg(test)]
mod tests;

pub use filter::output_line;
pub use palette::Palette;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tonic::Status;
use tracing::{debug, warn};

use buildgate_proto::v1::{DockerBuildResponse, ErrorStatus};

/// Sending half of a `Build` response stream.
pub type ResponseSink = mpsc::Sender<Result<DockerBuildResponse, Status>>;

/// One unit written to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Content(String),
    Error(String),
}

impl OutboundMessage {
    fn into_response(self) -> DockerBuildResponse {
        let id = uuid::Uuid::new_v4().to_string();
        match self {
            Self::Content(content) => DockerBuildResponse {
                id,
                content,
                error: None,
            },
            Self::Error(message) => DockerBuildResponse {
                id,
                content: String::new(),
                error: Some(ErrorStatus { message }),
            },
        }
    }
}

/// What the forwarder did with the messages it was handed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub delivered: u64,
    /// Messages discarded because the client stream was gone.
    pub dropped: u64,
}

/// The forwarding task of one session.
pub struct StreamRelay {
    tx: mpsc::Sender<OutboundMessage>,
    gone: watch::Receiver<bool>,
    task: JoinHandle<RelayStats>,
}

impl StreamRelay {
    /// Start forwarding into `sink`, queueing at most `capacity` messages.
    pub fn spawn(sink: ResponseSink, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (gone_tx, gone) = watch::channel(false);
        let task = tokio::spawn(forward(rx, sink, gone_tx));
        Self { tx, gone, task }
    }

    /// A producer handle onto the relay queue.
    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            tx: self.tx.clone(),
        }
    }

    /// Signal raised once the client stream is observed closed.
    pub fn client_gone(&self) -> ClientGone {
        ClientGone {
            rx: self.gone.clone(),
        }
    }

    /// Close the queue and wait for everything already enqueued to be written.
    ///
    /// Outstanding [`RelayHandle`]s keep the forwarder alive, so drop them first.
    pub async fn finish(self) -> RelayStats {
        drop(self.tx);
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "Relay forwarder task failed");
                RelayStats::default()
            }
        }
    }
}

async fn forward(
    mut rx: mpsc::Receiver<OutboundMessage>,
    sink: ResponseSink,
    gone_tx: watch::Sender<bool>,
) -> RelayStats {
    let mut stats = RelayStats::default();
    let mut gone = false;

    loop {
        tokio::select! {
            biased;
            message = rx.recv() => {
                let Some(message) = message else { break };
                if gone {
                    stats.dropped += 1;
                    continue;
                }
                if sink.send(Ok(message.into_response())).await.is_err() {
                    warn!("Client stream closed, discarding relay output");
                    stats.dropped += 1;
                    gone = true;
                    gone_tx.send_replace(true);
                } else {
                    stats.delivered += 1;
                }
            }
            () = sink.closed(), if !gone => {
                debug!("Client stream closed");
                gone = true;
                gone_tx.send_replace(true);
            }
        }
    }

    debug!(
        delivered = stats.delivered,
        dropped = stats.dropped,
        "Relay drained"
    );
    stats
}

/// Producer side of the relay queue.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<OutboundMessage>,
}

impl RelayHandle {
    pub async fn content(&self, text: impl Into<String>) {
        self.send(OutboundMessage::Content(text.into())).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.send(OutboundMessage::Error(message.into())).await;
    }

    async fn send(&self, message: OutboundMessage) {
        // The forwarder only exits once every handle is gone.
        if self.tx.send(message).await.is_err() {
            warn!("Relay forwarder stopped, message discarded");
        }
    }
}

/// Cancellation signal raised when the client stops listening.
#[derive(Clone)]
pub struct ClientGone {
    rx: watch::Receiver<bool>,
}

impl ClientGone {
    pub fn is_gone(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the client is gone. Never resolves if the relay finished
    /// without the client leaving.
    pub async fn wait(&mut self) {
        if self.rx.wait_for(|gone| *gone).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
