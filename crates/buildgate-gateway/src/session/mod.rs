//! Build session orchestration.
//!
//! One session per `Build` call: decode and transcode the submitted archive,
//! upload it, publish the job, then relay the worker's log channel back to the
//! client until the worker closes it. Every acquired resource (storage
//! session, broker connection, subscription) is released on every exit path,
//! and a failure is reported to the client as exactly one terminal error.

mod error;

pub use error::SessionError;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use tracing::{Instrument, debug, error, info, info_span, warn};

use buildgate_core::Config;
use buildgate_core::archive::{self, TranscodeLimits};
use buildgate_core::model::{BuildSpecification, JobRequest, Push};
use buildgate_proto::v1::DockerBuildRequest;

use crate::broker::{Broker, HEADER_ID, HEADER_UPLOAD_KEY, Message};
use crate::pubsub::{self, Decoded, PubSub, RawMessage, Subscription};
use crate::relay::{
    self, ClientGone, Palette, RelayHandle, RelayStats, ResponseSink, StreamRelay,
};
use crate::storage::{ArtifactStore, UploadOptions};

/// Content type of uploaded build contexts.
pub const ARCHIVE_CONTENT_TYPE: &str = "application/x-gzip";
/// `type` metadata tag of uploaded build contexts.
pub const ARTIFACT_TYPE: &str = "dockerfile-builder";

/// Steps a session moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decoding,
    Uploading,
    Publishing,
    Subscribing,
    Relaying,
    Closed,
}

/// Per-session settings derived from the gateway configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub upload_dir: String,
    pub artifact_lifetime: Duration,
    pub queue_name: String,
    pub architecture: String,
    /// Longest wait between two log channel messages; `None` waits forever.
    pub idle_timeout: Option<Duration>,
    pub palette: Palette,
    pub limits: TranscodeLimits,
    pub relay_capacity: usize,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            upload_dir: config.storage.upload_destination_dir.clone(),
            artifact_lifetime: config.storage.artifact_lifetime(),
            queue_name: config.broker.queue_name.clone(),
            architecture: config.broker.architecture.clone(),
            idle_timeout: config.relay.log_idle_timeout(),
            palette: Palette::new(config.relay.colored),
            limits: TranscodeLimits {
                max_uncompressed_bytes: config.relay.max_archive_bytes,
            },
            relay_capacity: config.relay.queue_capacity,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub store: Arc<dyn ArtifactStore>,
    pub broker: Arc<dyn Broker>,
    pub pubsub: Arc<dyn PubSub>,
    pub settings: Arc<SessionSettings>,
}

/// How a session ended.
#[derive(Debug)]
pub struct SessionReport {
    pub session_id: String,
    pub result: Result<(), SessionError>,
    pub relay: RelayStats,
}

/// Object key of the uploaded build context of `session_id`.
pub fn upload_key(upload_dir: &str, session_id: &str) -> String {
    let dir = upload_dir.trim_end_matches('/');
    if dir.is_empty() {
        format!("{session_id}.tar.gz")
    } else {
        format!("{dir}/{session_id}.tar.gz")
    }
}

/// Run one build session, writing its output into `sink`.
///
/// Returns once the relay has drained; the client stream closes when `sink`
/// and its clones are dropped.
pub async fn run(
    deps: SessionDeps,
    request: DockerBuildRequest,
    sink: ResponseSink,
) -> SessionReport {
    let session_id = uuid::Uuid::new_v4().to_string();
    let span = info_span!("build_session", session_id = %session_id, request_id = %request.id);

    async move {
        let relay = StreamRelay::spawn(sink, deps.settings.relay_capacity);
        let handle = relay.handle();
        let mut session = BuildSession {
            deps: &deps,
            id: &session_id,
            relay: handle.clone(),
            gone: relay.client_gone(),
            stage: Stage::Decoding,
        };

        info!(image = %request.image_name, "Build session started");
        let result = session.drive(&request).await;
        let stage = session.stage;
        drop(session);

        match &result {
            Ok(()) => info!("Build session completed"),
            Err(SessionError::Cancelled) => {
                warn!(?stage, "Client disconnected, build session abandoned");
            }
            Err(e) => {
                error!(?stage, error = %e, "Build session failed");
                handle.error(e.to_string()).await;
            }
        }
        drop(handle);

        let relay = relay.finish().await;
        SessionReport {
            session_id,
            result,
            relay,
        }
    }
    .instrument(span)
    .await
}

struct BuildSession<'a> {
    deps: &'a SessionDeps,
    id: &'a str,
    relay: RelayHandle,
    gone: ClientGone,
    stage: Stage,
}

impl BuildSession<'_> {
    async fn drive(&mut self, request: &DockerBuildRequest) -> Result<(), SessionError> {
        self.progress("Submitting your docker build").await;
        self.progress("Processing submitted files").await;

        let raw = decode_content(&request.content)?;
        self.progress("Examining submitted files").await;
        let archive = self.transcode(raw).await?;

        self.enter(Stage::Uploading);
        self.progress("Creating docker build session").await;
        let key = self.upload(archive, &request.id).await?;

        self.enter(Stage::Publishing);
        self.publish(request, &key).await?;
        self.progress("Uploaded your docker build request").await;

        self.enter(Stage::Subscribing);
        let channel = pubsub::log_channel(&self.deps.settings.queue_name, self.id);
        let mut subscription = tokio::select! {
            biased;
            () = self.gone.wait() => return Err(SessionError::Cancelled),
            subscribed = self.deps.pubsub.subscribe(&channel) => subscribed?,
        };

        self.enter(Stage::Relaying);
        let relayed = self.relay_log(subscription.as_mut()).await;
        subscription.close().await;
        self.enter(Stage::Closed);
        relayed
    }

    async fn transcode(&self, raw: Vec<u8>) -> Result<Vec<u8>, SessionError> {
        let limits = self.deps.settings.limits;
        let converted =
            tokio::task::spawn_blocking(move || archive::transcode_with_limits(&raw, limits))
                .await
                .map_err(|e| SessionError::Internal(format!("transcode task failed: {e}")))??;
        debug!(bytes = converted.len(), "Archive transcoded");
        Ok(converted)
    }

    async fn upload(&self, archive: Vec<u8>, request_id: &str) -> Result<String, SessionError> {
        let settings = &self.deps.settings;
        let mut storage = self.deps.store.open_session(self.id).await?;
        self.progress("Uploading docker build session").await;

        let key = upload_key(&settings.upload_dir, self.id);
        let options = UploadOptions {
            content_type: ARCHIVE_CONTENT_TYPE.to_string(),
            lifetime: settings.artifact_lifetime,
            metadata: BTreeMap::from([
                ("id".to_string(), request_id.to_string()),
                ("type".to_string(), ARTIFACT_TYPE.to_string()),
                ("created_at".to_string(), Utc::now().to_rfc3339()),
            ]),
        };
        let uploaded = storage.upload(archive, &key, &options).await;
        storage.close().await;

        let key = uploaded?;
        info!(key = %key, "Build context uploaded");
        Ok(key)
    }

    async fn publish(&self, request: &DockerBuildRequest, key: &str) -> Result<(), SessionError> {
        let settings = &self.deps.settings;
        let push = request
            .push_options
            .as_ref()
            .map(|o| Push::from_options(&o.image_name, &o.username, &o.password))
            .unwrap_or_default();
        let specification =
            BuildSpecification::docker_build(&settings.architecture, &request.image_name, push);
        let job = JobRequest::new(self.id, key, specification);
        let message = Message {
            id: self.id.to_string(),
            headers: HashMap::from([
                (HEADER_ID.to_string(), self.id.to_string()),
                (HEADER_UPLOAD_KEY.to_string(), key.to_string()),
            ]),
            body: serde_json::to_vec(&job)?,
        };

        let mut connection = self.deps.broker.connect(&settings.queue_name).await?;
        let published = connection.publish(&settings.queue_name, message).await;
        connection.disconnect().await;

        published?;
        info!(queue = %settings.queue_name, "Build job published");
        Ok(())
    }

    async fn relay_log(&mut self, subscription: &mut dyn Subscription) -> Result<(), SessionError> {
        let idle = self.deps.settings.idle_timeout;
        let palette = self.deps.settings.palette;
        let mut relayed = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                () = self.gone.wait() => return Err(SessionError::Cancelled),
                next = next_within(subscription, idle) => next,
            };
            let payload = match next {
                Some(Some(payload)) => payload,
                Some(None) => break,
                None => {
                    return Err(SessionError::IdleTimeout {
                        idle: idle.unwrap_or_default(),
                    });
                }
            };

            match pubsub::decode(&payload) {
                Decoded::Skip(reason) => {
                    debug!(
                        channel = subscription.channel(),
                        %reason,
                        "Skipping undecodable log record"
                    );
                }
                Decoded::Response(response) => {
                    if let Some(line) = relay::output_line(&response) {
                        self.relay.content(palette.log_line(&line)).await;
                        relayed += 1;
                    }
                }
            }
        }

        debug!(relayed, "Log channel closed");
        Ok(())
    }

    async fn progress(&self, text: &str) {
        self.relay
            .content(self.deps.settings.palette.progress(text))
            .await;
    }

    fn enter(&mut self, stage: Stage) {
        debug!(from = ?self.stage, to = ?stage, "Session stage");
        self.stage = stage;
    }
}

/// Standard base64 with line breaks ignored, so MIME-wrapped content is accepted.
fn decode_content(content: &str) -> Result<Vec<u8>, base64::DecodeError> {
    if content.contains(['\r', '\n']) {
        let unwrapped: String = content
            .chars()
            .filter(|c| !matches!(c, '\r' | '\n'))
            .collect();
        STANDARD.decode(unwrapped)
    } else {
        STANDARD.decode(content)
    }
}

/// Next message, or `None` if `idle` elapsed first.
async fn next_within(
    subscription: &mut dyn Subscription,
    idle: Option<Duration>,
) -> Option<Option<RawMessage>> {
    match idle {
        Some(limit) => tokio::time::timeout(limit, subscription.next_message())
            .await
            .ok(),
        None => Some(subscription.next_message().await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_key_joins_dir_and_session_id() {
        assert_eq!(upload_key("userdata", "abc"), "userdata/abc.tar.gz");
        assert_eq!(upload_key("userdata/", "abc"), "userdata/abc.tar.gz");
        assert_eq!(upload_key("", "abc"), "abc.tar.gz");
    }

    #[test]
    fn wrapped_content_decodes_like_unwrapped() {
        let encoded = STANDARD.encode([7u8; 100]);
        let wrapped = encoded
            .as_bytes()
            .chunks(76)
            .map(|line| std::str::from_utf8(line).unwrap())
            .collect::<Vec<_>>()
            .join("\r\n");
        assert!(wrapped.contains("\r\n"));
        assert_eq!(decode_content(&wrapped).unwrap(), vec![7u8; 100]);
        assert_eq!(decode_content(&format!("{encoded}\n")).unwrap(), vec![7u8; 100]);
        assert!(decode_content("not base64 at all!").is_err());
    }

    #[test]
    fn idle_timeout_message_keeps_subsecond_precision() {
        let err = SessionError::IdleTimeout {
            idle: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "No build output received for 250ms, giving up");
        let err = SessionError::IdleTimeout {
            idle: Duration::from_secs(1800),
        };
        assert_eq!(err.to_string(), "No build output received for 1800s, giving up");
    }

    #[test]
    fn settings_follow_config() {
        let mut config = Config::default();
        config.relay.log_idle_timeout_secs = 0;
        config.relay.colored = false;
        config.broker.queue_name = "builds".into();

        let settings = SessionSettings::from_config(&config);
        assert_eq!(settings.idle_timeout, None);
        assert_eq!(settings.palette, Palette::plain());
        assert_eq!(settings.queue_name, "builds");
        assert_eq!(settings.upload_dir, "userdata");
    }
}
