//! gRPC server of the buildgate gateway.
//!
//! Serves `DockerService` to clients, `WorkerService` to build workers and the
//! standard `grpc.health.v1.Health` for load balancers.

pub mod build_svc;
pub mod worker_svc;

#[cfg(test)]
mod test_helpers;

pub use build_svc::BuildServiceImpl;
pub use worker_svc::WorkerServiceImpl;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::info;

use buildgate_core::Config;
use buildgate_proto::v1::docker_service_server::DockerServiceServer;
use buildgate_proto::v1::worker_service_server::WorkerServiceServer;

use crate::broker::MemoryBroker;
use crate::pubsub::MemoryPubSub;
use crate::session::{SessionDeps, SessionSettings};
use crate::storage::FsArtifactStore;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Local collaborators shared by the client and worker facing services.
#[derive(Clone)]
pub struct Backends {
    pub store: FsArtifactStore,
    pub broker: MemoryBroker,
    pub pubsub: MemoryPubSub,
}

impl Backends {
    pub fn from_config(config: &Config) -> Self {
        Self {
            store: FsArtifactStore::new(&config.storage.data_dir, &config.storage.bucket),
            broker: MemoryBroker::default(),
            pubsub: MemoryPubSub::default(),
        }
    }

    pub fn session_deps(&self, settings: SessionSettings) -> SessionDeps {
        SessionDeps {
            store: Arc::new(self.store.clone()),
            broker: Arc::new(self.broker.clone()),
            pubsub: Arc::new(self.pubsub.clone()),
            settings: Arc::new(settings),
        }
    }
}

/// Largest `Build` request accepted for archives of up to `max_archive_bytes`.
///
/// Base64 grows the archive by a third; the rest of the message is small.
pub fn max_request_bytes(max_archive_bytes: u64) -> usize {
    let encoded = max_archive_bytes.div_ceil(3).saturating_mul(4);
    usize::try_from(encoded.saturating_add(64 * 1024)).unwrap_or(usize::MAX)
}

/// gRPC server handle.
pub struct GatewayServer {
    config: Config,
    backends: Backends,
}

impl GatewayServer {
    pub fn new(config: Config) -> Self {
        let backends = Backends::from_config(&config);
        Self { config, backends }
    }

    pub const fn with_backends(config: Config, backends: Backends) -> Self {
        Self { config, backends }
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn backends(&self) -> &Backends {
        &self.backends
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn serve_tcp(
        self,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.server.addr).await?;
        self.serve_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve_listener(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        let deps = self
            .backends
            .session_deps(SessionSettings::from_config(&self.config));
        let build = DockerServiceServer::new(BuildServiceImpl::new(deps))
            .max_decoding_message_size(max_request_bytes(self.config.relay.max_archive_bytes));
        let worker = WorkerServiceServer::new(WorkerServiceImpl::new(
            self.backends.broker.clone(),
            self.backends.store.clone(),
            self.backends.pubsub.clone(),
        ));

        let (health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<DockerServiceServer<BuildServiceImpl>>()
            .await;
        health_reporter
            .set_serving::<WorkerServiceServer<WorkerServiceImpl>>()
            .await;

        info!(%addr, queue = %self.config.broker.queue_name, "Starting gRPC server on TCP");

        Server::builder()
            .http2_keepalive_interval(Some(Duration::from_secs(30)))
            .http2_keepalive_timeout(Some(Duration::from_secs(10)))
            .add_service(health_service)
            .add_service(build)
            .add_service(worker)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
            .await?;

        info!("gRPC server stopped");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio_stream::StreamExt;

    use buildgate_proto::v1::docker_service_client::DockerServiceClient;

    use super::test_helpers::{backends, build_request, claim_job, publish_log};
    use super::*;

    #[tokio::test]
    async fn serves_build_over_tcp_until_shutdown() {
        let (backends, _dir) = backends();
        let mut config = Config::default();
        config.relay.colored = false;
        let server = GatewayServer::with_backends(config, backends.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let serving = tokio::spawn(server.serve_listener(listener, async move {
            let _ = stop_rx.await;
        }));

        let mut client = DockerServiceClient::connect(format!("http://{addr}"))
            .await
            .unwrap();
        let stream = client
            .build(build_request("req-tcp"))
            .await
            .unwrap()
            .into_inner();

        let (_message, job) = claim_job(&backends).await;
        publish_log(&backends, &job.id, &["Successfully built"]).await;

        let responses: Vec<_> = tokio::time::timeout(
            Duration::from_secs(10),
            stream.map(Result::unwrap).collect::<Vec<_>>(),
        )
        .await
        .unwrap();
        assert_eq!(
            responses.last().map(|r| r.content.as_str()),
            Some("Successfully built")
        );
        assert!(responses.iter().all(|r| r.error.is_none()));

        drop(client);
        stop_tx.send(()).unwrap();
        serving.await.unwrap().unwrap();
    }

    #[test]
    fn request_limit_covers_base64_of_the_archive() {
        assert!(max_request_bytes(3) >= 4);
        assert!(max_request_bytes(512 * 1024 * 1024) >= 512 * 1024 * 1024 / 3 * 4);
        assert_eq!(max_request_bytes(u64::MAX), usize::MAX);
    }
}
