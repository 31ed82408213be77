//! `WorkerService` gRPC implementation.
//!
//! Lets an out-of-process build worker reach the gateway's local broker,
//! artifact store and log hub.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, instrument, warn};

use buildgate_proto::v1::worker_service_server::WorkerService;
use buildgate_proto::v1::{
    ClaimJobRequest, ClaimJobResponse, FetchArtifactRequest, FetchArtifactResponse, LogRecord,
    PublishLogsResponse, QueuedMessage,
};

use crate::broker::MemoryBroker;
use crate::pubsub::MemoryPubSub;
use crate::storage::{FsArtifactStore, StorageError};

/// Longest long-poll a worker may ask for.
pub const MAX_CLAIM_WAIT: Duration = Duration::from_secs(60);

pub struct WorkerServiceImpl {
    broker: MemoryBroker,
    store: FsArtifactStore,
    pubsub: MemoryPubSub,
}

impl WorkerServiceImpl {
    pub const fn new(broker: MemoryBroker, store: FsArtifactStore, pubsub: MemoryPubSub) -> Self {
        Self {
            broker,
            store,
            pubsub,
        }
    }
}

#[tonic::async_trait]
impl WorkerService for WorkerServiceImpl {
    #[instrument(skip(self, request), fields(rpc = "ClaimJob"))]
    async fn claim_job(
        &self,
        request: Request<ClaimJobRequest>,
    ) -> Result<Response<ClaimJobResponse>, Status> {
        let req = request.into_inner();
        if req.queue_name.is_empty() {
            return Err(Status::invalid_argument("queue_name is required"));
        }

        let wait = Duration::from_secs(u64::from(req.wait_secs)).min(MAX_CLAIM_WAIT);
        let message = self.broker.claim(&req.queue_name, wait).await;
        if let Some(message) = &message {
            info!(queue = %req.queue_name, job_id = %message.id, "Job claimed");
        }

        Ok(Response::new(ClaimJobResponse {
            message: message.map(|m| QueuedMessage {
                id: m.id,
                headers: m.headers,
                body: m.body,
            }),
        }))
    }

    #[instrument(skip(self, request), fields(rpc = "FetchArtifact"))]
    async fn fetch_artifact(
        &self,
        request: Request<FetchArtifactRequest>,
    ) -> Result<Response<FetchArtifactResponse>, Status> {
        let req = request.into_inner();
        let (content, meta) = self.store.fetch(&req.key).await.map_err(|e| match e {
            StorageError::NotFound(key) => Status::not_found(format!("Artifact not found: {key}")),
            StorageError::InvalidKey(key) => {
                Status::invalid_argument(format!("Invalid artifact key: {key:?}"))
            }
            other => Status::internal(format!("Failed to read artifact: {other}")),
        })?;

        debug!(key = %req.key, bytes = content.len(), "Artifact fetched");
        Ok(Response::new(FetchArtifactResponse {
            content,
            content_type: meta.content_type,
            metadata: meta.metadata.into_iter().collect(),
        }))
    }

    #[instrument(skip(self, request), fields(rpc = "PublishLogs"))]
    async fn publish_logs(
        &self,
        request: Request<Streaming<LogRecord>>,
    ) -> Result<Response<PublishLogsResponse>, Status> {
        let records = self.publish_records(request.into_inner()).await?;
        Ok(Response::new(PublishLogsResponse { records }))
    }
}

impl WorkerServiceImpl {
    /// Publish every record of `in_stream`, then close the channels it wrote to.
    pub async fn publish_records<S>(&self, mut in_stream: S) -> Result<u64, Status>
    where
        S: Stream<Item = Result<LogRecord, Status>> + Unpin,
    {
        let mut channels = BTreeSet::new();
        let mut records = 0u64;

        let outcome = loop {
            match in_stream.next().await {
                Some(Ok(record)) => {
                    if record.channel.is_empty() {
                        break Err(Status::invalid_argument("channel is required"));
                    }
                    if !channels.contains(&record.channel) {
                        channels.insert(record.channel.clone());
                    }
                    self.pubsub.publish(&record.channel, record.payload).await;
                    records += 1;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Log stream from worker failed");
                    break Err(e);
                }
                None => break Ok(()),
            }
        };

        // Every channel this stream wrote to ends with it, on error too.
        for channel in &channels {
            self.pubsub.close(channel);
        }
        info!(records, channels = channels.len(), "Worker log stream ended");

        outcome.map(|()| records)
    }
}
