/// ECS task metadata discovery (task metadata endpoint v4).
use crate::retry::RetryPolicy;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::Deserialize;

/// Environment variable the ECS agent injects into every container.
pub const METADATA_URI_ENV: &str = "ECS_CONTAINER_METADATA_URI_V4";

/// The fields of `${ECS_CONTAINER_METADATA_URI_V4}/task` this tool needs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskMetadata {
    pub cluster: String,
    #[serde(rename = "TaskARN")]
    pub task_arn: String,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub revision: String,
}

impl TaskMetadata {
    /// `arn:aws:ecs:<region>:<account>:task-definition/<family>:<revision>`
    pub fn task_definition_arn(&self) -> String {
        let prefix = self.task_arn.split('/').next().unwrap_or_default();
        format!("{}-definition/{}:{}", prefix, self.family, self.revision)
    }
}

#[derive(Debug)]
pub enum MetadataError {
    InvalidUrl { url: String, reason: String },
    Request(reqwest::Error),
    Status(StatusCode),
    Decode(reqwest::Error),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::InvalidUrl { url, reason } => {
                write!(f, "invalid metadata endpoint {:?}: {}", url, reason)
            }
            MetadataError::Request(e) => write!(f, "metadata request failed: {}", e),
            MetadataError::Status(status) => write!(f, "unexpected status code: {}", status),
            MetadataError::Decode(e) => write!(f, "failed to decode task metadata: {}", e),
        }
    }
}

impl std::error::Error for MetadataError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MetadataError::Request(e) | MetadataError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetadataClient {
    task_url: reqwest::Url,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl MetadataClient {
    /// `base` is the value of `ECS_CONTAINER_METADATA_URI_V4`.
    pub fn new(base: &str) -> Result<Self, MetadataError> {
        let joined = format!("{}/task", base.trim_end_matches('/'));
        let task_url = reqwest::Url::parse(&joined).map_err(|e| MetadataError::InvalidUrl {
            url: base.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            task_url,
            http: reqwest::Client::new(),
            retry: RetryPolicy::default(),
        })
    }

    #[allow(dead_code)]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn detect(&self) -> Result<TaskMetadata, MetadataError> {
        tracing::debug!(url = %self.task_url, "detecting ecs meta");
        let meta = self
            .retry
            .run("task metadata request", || self.fetch_once())
            .await?;
        tracing::debug!(?meta, task_definition = %meta.task_definition_arn(), "detected ecs meta");
        Ok(meta)
    }

    async fn fetch_once(&self) -> Result<TaskMetadata, MetadataError> {
        let resp = self
            .http
            .get(self.task_url.clone())
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(MetadataError::Request)?;
        if resp.status() != StatusCode::OK {
            return Err(MetadataError::Status(resp.status()));
        }
        resp.json().await.map_err(MetadataError::Decode)
    }
}

/// Discover task metadata when running on ECS.
///
/// `base` is the metadata endpoint, normally taken from `METADATA_URI_ENV`;
/// without it there is nothing to discover and `Ok(None)` is returned.
pub async fn discover(base: Option<&str>) -> Result<Option<TaskMetadata>, MetadataError> {
    let Some(base) = base else {
        tracing::warn!("{} is not set", METADATA_URI_ENV);
        return Ok(None);
    };
    MetadataClient::new(base)?.detect().await.map(Some)
}
