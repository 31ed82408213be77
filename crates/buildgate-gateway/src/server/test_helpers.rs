//! Shared test helpers for the service test modules.

use std::io::Write;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use buildgate_core::model::{JobRequest, JobResponse, ResponseKind};
use buildgate_proto::v1::{DockerBuildRequest, PushOptions};

use super::Backends;
use crate::broker::Message;
use crate::pubsub::log_channel;
use crate::session::SessionSettings;

pub const QUEUE: &str = "rai_docker";

/// Backends rooted in a fresh temporary directory.
pub fn backends() -> (Backends, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let backends = Backends {
        store: crate::storage::FsArtifactStore::new(dir.path(), "uploads"),
        broker: crate::broker::MemoryBroker::default(),
        pubsub: crate::pubsub::MemoryPubSub::default(),
    };
    (backends, dir)
}

/// Session settings with plain output and a short idle timeout.
pub fn settings() -> SessionSettings {
    SessionSettings {
        queue_name: QUEUE.into(),
        palette: crate::relay::Palette::plain(),
        idle_timeout: Some(Duration::from_secs(5)),
        ..SessionSettings::default()
    }
}

/// A zip holding a one-line Dockerfile, base64 encoded.
pub fn dockerfile_zip_b64() -> String {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    writer
        .start_file("Dockerfile", SimpleFileOptions::default())
        .unwrap();
    writer.write_all(b"FROM alpine\n").unwrap();
    STANDARD.encode(writer.finish().unwrap().into_inner())
}

pub fn build_request(id: &str) -> DockerBuildRequest {
    DockerBuildRequest {
        id: id.into(),
        content: dockerfile_zip_b64(),
        image_name: "user/app:latest".into(),
        push_options: Some(PushOptions::default()),
    }
}

/// Claim the next job and decode its body.
pub async fn claim_job(backends: &Backends) -> (Message, JobRequest) {
    let message = backends
        .broker
        .claim(QUEUE, Duration::from_secs(5))
        .await
        .unwrap();
    let job = serde_json::from_slice(&message.body).unwrap();
    (message, job)
}

/// Play the worker side: publish `lines` as stdout records, then close the channel.
pub async fn publish_log(backends: &Backends, session_id: &str, lines: &[&str]) {
    let channel = log_channel(QUEUE, session_id);
    for line in lines {
        let record = JobResponse::new(ResponseKind::Stdout, *line);
        backends
            .pubsub
            .publish(&channel, serde_json::to_vec(&record).unwrap())
            .await;
    }
    backends.pubsub.close(&channel);
}
