//! `DockerService` gRPC implementation.

use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{Instrument, instrument};

use buildgate_proto::v1::docker_service_server::DockerService;
use buildgate_proto::v1::{DockerBuildRequest, DockerBuildResponse};

use crate::session::{self, SessionDeps};

type BuildResponseStream =
    Pin<Box<dyn tokio_stream::Stream<Item = Result<DockerBuildResponse, Status>> + Send>>;

/// Runs one build session per `Build` call.
pub struct BuildServiceImpl {
    deps: SessionDeps,
}

impl BuildServiceImpl {
    pub const fn new(deps: SessionDeps) -> Self {
        Self { deps }
    }
}

#[tonic::async_trait]
impl DockerService for BuildServiceImpl {
    type BuildStream = BuildResponseStream;

    #[instrument(skip(self, request), fields(rpc = "Build"))]
    async fn build(
        &self,
        request: Request<DockerBuildRequest>,
    ) -> Result<Response<Self::BuildStream>, Status> {
        let req = request.into_inner();
        let capacity = self.deps.settings.relay_capacity.max(1);
        let (tx, rx) = mpsc::channel::<Result<DockerBuildResponse, Status>>(capacity);
        let deps = self.deps.clone();

        tokio::spawn(
            async move {
                session::run(deps, req, tx).await;
            }
            .in_current_span(),
        );

        let out_stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(out_stream)))
    }
}
