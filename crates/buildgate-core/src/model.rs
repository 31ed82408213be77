//! Build job model shared with remote workers.
//!
//! These types travel as JSON: a [`JobRequest`] is the body of the queue
//! message, a [`JobResponse`] is one record on the per-job log channel.

use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version tag of the build specification format understood by workers.
pub const BUILD_SPEC_VERSION: &str = "2.0";

/// Dockerfile location inside the uploaded build context.
pub const DEFAULT_DOCKERFILE: &str = "./Dockerfile";

/// Registry credentials used when pushing the built image.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field(
                "password",
                &if self.password.is_empty() { "" } else { "<redacted>" },
            )
            .finish()
    }
}

/// Push parameters for the built image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Push {
    pub push: bool,
    pub image_name: String,
    pub credentials: Credentials,
}

impl Push {
    /// Build push parameters from client supplied options.
    ///
    /// Pushing is enabled only when image name, username and password are all
    /// non-empty. Values are copied verbatim either way.
    pub fn from_options(image_name: &str, username: &str, password: &str) -> Self {
        Self {
            push: !image_name.is_empty() && !username.is_empty() && !password.is_empty(),
            image_name: image_name.to_string(),
            credentials: Credentials {
                username: username.to_string(),
                password: password.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaiBuildSpecification {
    pub version: String,
    pub container_image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuResources {
    pub architecture: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: CpuResources,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildImageSpecification {
    pub image_name: String,
    pub dockerfile: String,
    pub no_cache: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<Push>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandsBuildSpecification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_image: Option<BuildImageSpecification>,
}

/// Structured description of one image build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpecification {
    pub rai: RaiBuildSpecification,
    pub resources: Resources,
    pub commands: CommandsBuildSpecification,
}

impl BuildSpecification {
    /// Uncached build of `./Dockerfile` for `architecture`, tagged `image_name`.
    pub fn docker_build(architecture: &str, image_name: &str, push: Push) -> Self {
        Self {
            rai: RaiBuildSpecification {
                version: BUILD_SPEC_VERSION.to_string(),
                container_image: String::new(),
            },
            resources: Resources {
                cpu: CpuResources {
                    architecture: architecture.to_string(),
                },
            },
            commands: CommandsBuildSpecification {
                build_image: Some(BuildImageSpecification {
                    image_name: image_name.to_string(),
                    dockerfile: DEFAULT_DOCKERFILE.to_string(),
                    no_cache: true,
                    push: Some(push),
                }),
            },
        }
    }

    pub fn push(&self) -> Option<&Push> {
        self.commands
            .build_image
            .as_ref()
            .and_then(|b| b.push.as_ref())
    }
}

/// Queue payload: the build specification plus the key of the uploaded context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub upload_key: String,
    pub build_specification: BuildSpecification,
}

impl JobRequest {
    pub fn new(
        id: impl Into<String>,
        upload_key: impl Into<String>,
        build_specification: BuildSpecification,
    ) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            upload_key: upload_key.into(),
            build_specification,
        }
    }
}

/// Kind of a record published by a worker on the log channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    Stdout,
    Stderr,
    End,
    #[serde(other)]
    Other,
}

/// One record from a worker's log channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResponse {
    #[serde(default)]
    pub id: String,
    pub kind: ResponseKind,
    /// Raw output bytes; base64 on the JSON wire.
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl JobResponse {
    pub fn new(kind: ResponseKind, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: String::new(),
            kind,
            body: body.into(),
            created_at: None,
        }
    }

    /// Whether the record carries build output meant for the client.
    pub const fn is_output(&self) -> bool {
        matches!(self.kind, ResponseKind::Stdout | ResponseKind::Stderr)
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    // Workers with nothing to say send `null`.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(Vec::new()),
            Some(encoded) => STANDARD.decode(encoded).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn push_disabled_when_any_option_missing() {
        let push = Push::from_options("", "", "");
        assert!(!push.push);

        let push = Push::from_options("me/app", "me", "");
        assert!(!push.push);
        assert_eq!(push.image_name, "me/app");
        assert_eq!(push.credentials.username, "me");
    }

    #[test]
    fn push_enabled_copies_credentials_verbatim() {
        let push = Push::from_options("me/app:1", " me ", "s3cr3t");
        assert!(push.push);
        assert_eq!(push.image_name, "me/app:1");
        assert_eq!(push.credentials.username, " me ");
        assert_eq!(push.credentials.password, "s3cr3t");
    }

    #[test]
    fn credentials_debug_hides_password() {
        let push = Push::from_options("me/app", "me", "hunter2");
        let rendered = format!("{push:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn docker_build_spec_shape() {
        let spec = BuildSpecification::docker_build("ppc64le", "me/app", Push::default());
        assert_eq!(spec.rai.version, "2.0");
        assert_eq!(spec.resources.cpu.architecture, "ppc64le");
        let build = spec.commands.build_image.as_ref().unwrap();
        assert_eq!(build.dockerfile, "./Dockerfile");
        assert!(build.no_cache);
        assert_eq!(spec.push(), Some(&Push::default()));
    }

    #[test]
    fn job_request_json_round_trip() {
        let spec = BuildSpecification::docker_build(
            "amd64",
            "me/app",
            Push::from_options("me/app", "me", "pw"),
        );
        let job = JobRequest::new("job-1", "userdata/abc.tar.gz", spec);

        let json = serde_json::to_vec(&job).unwrap();
        let back: JobRequest = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, job);

        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["upload_key"], "userdata/abc.tar.gz");
        assert_eq!(value["build_specification"]["rai"]["version"], "2.0");
        assert_eq!(
            value["build_specification"]["commands"]["build_image"]["push"]["credentials"]["password"],
            "pw"
        );
    }

    #[test]
    fn job_response_body_is_base64_on_the_wire() {
        let resp = JobResponse::new(ResponseKind::Stdout, "Step 1/3 : FROM alpine\n");
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["kind"], "stdout");
        assert_eq!(value["body"], "U3RlcCAxLzMgOiBGUk9NIGFscGluZQo=");

        let back: JobResponse = serde_json::from_value(value).unwrap();
        assert_eq!(back.body_text(), "Step 1/3 : FROM alpine\n");
    }

    #[test]
    fn unknown_kind_and_null_body_decode() {
        let resp: JobResponse =
            serde_json::from_str(r#"{"id":"x","kind":"progress","body":null}"#).unwrap();
        assert_eq!(resp.kind, ResponseKind::Other);
        assert!(resp.body.is_empty());
        assert!(!resp.is_output());
    }

    #[test]
    fn stderr_counts_as_output() {
        let resp: JobResponse = serde_json::from_str(r#"{"kind":"stderr","body":""}"#).unwrap();
        assert!(resp.is_output());
    }
}
