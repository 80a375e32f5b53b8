use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub type Result<T> = std::result::Result<T, CloudError>;

/// Opens authenticated connections to one cloud account.
///
/// `profile` is the raw `clouds.yaml` entry for `cloud_name`; each provider
/// interprets its own keys.
#[async_trait]
pub trait CloudConnector: Send + Sync {
    async fn connect(
        &self,
        cloud_name: &str,
        profile: &serde_yaml::Value,
    ) -> Result<Box<dyn CloudConnection>>;
}

/// A live, short-lived handle to the cloud control plane.
#[async_trait]
pub trait CloudConnection: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<inventory::Project>>;

    /// Images whose name or id equals `name_or_id`. Several images may share a name.
    async fn search_images(&self, name_or_id: &str) -> Result<Vec<inventory::Image>>;

    /// Delete an image by id. Returns `Ok(false)` when the image does not exist.
    /// With `wait`, returns only once the image is gone from the catalog.
    async fn delete_image(&self, image_id: &str, wait: bool) -> Result<bool>;

    /// Create an image and upload `filename` as its data.
    /// With `wait`, returns only once the image is `active`.
    async fn create_image(&self, name: &str, filename: &Path, wait: bool)
        -> Result<inventory::Image>;

    /// With `request.wait`, returns only once the server is `ACTIVE`.
    async fn create_server(&self, request: &CreateServerRequest) -> Result<inventory::Server>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateServerRequest {
    pub name: String,
    pub image_id: String,
    pub flavor: String,
    pub user_data: String,
    pub wait: bool,
}

/// Polling parameters for the `wait` variants of cloud calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("{method} {url} failed: status={status} body={body}")]
    Api {
        method: String,
        url: String,
        status: u16,
        body: String,
    },
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid cloud profile {cloud}: {reason}")]
    InvalidProfile { cloud: String, reason: String },
    #[error("{resource} {name} not found")]
    NotFound { resource: &'static str, name: String },
    #[error("no {service} endpoint in service catalog")]
    MissingEndpoint { service: String },
    #[error("{resource} {id} entered {status} state")]
    ResourceFailed {
        resource: &'static str,
        id: String,
        status: String,
    },
    #[error("timed out after {waited:?} waiting for {resource} {id}")]
    Timeout {
        resource: &'static str,
        id: String,
        waited: Duration,
    },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl CloudError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, CloudError::Unauthorized(_))
    }
}

pub mod inventory {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Image {
        pub id: String,
        pub name: String,
        pub status: String,
        #[serde(default)]
        pub created_at: Option<DateTime<Utc>>,
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Server {
        pub id: String,
        pub name: String,
        pub status: String,
        #[serde(default)]
        pub image_id: Option<String>,
        #[serde(default)]
        pub flavor: Option<String>,
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Project {
        pub id: String,
        pub name: String,
        #[serde(default)]
        pub domain_id: Option<String>,
        #[serde(default = "default_enabled")]
        pub enabled: bool,
    }

    fn default_enabled() -> bool {
        true
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "openstack")]
pub mod openstack;
