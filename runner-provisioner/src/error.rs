use runner_providers::CloudError;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CloudConnectionError {
    #[error("unauthorized to connect to OpenStack")]
    Unauthorized(#[source] CloudError),
    #[error("{0}")]
    InvalidConfig(String),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Cloud(CloudError),
}

impl CloudConnectionError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, CloudConnectionError::Unauthorized(_))
    }
}

impl From<CloudError> for CloudConnectionError {
    fn from(err: CloudError) -> Self {
        if err.is_unauthorized() {
            CloudConnectionError::Unauthorized(err)
        } else {
            CloudConnectionError::Cloud(err)
        }
    }
}

/// Template failure, passed through with tera's own message.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct RenderError(#[from] pub tera::Error);

#[derive(Debug, thiserror::Error)]
pub enum GithubClientError {
    #[error("no {os}/{arch} runner application published for {path}")]
    RunnerBinary {
        path: String,
        os: String,
        arch: String,
    },
    #[error("GitHub API {method} {url} failed: status={status} body={body}")]
    Api {
        method: String,
        url: String,
        status: u16,
        body: String,
    },
    #[error("GitHub token is not configured")]
    MissingToken,
    #[error("GitHub transport error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum BuildScriptError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("build script exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ImageBuildError {
    #[error("failed to fetch runner application")]
    FetchRunnerApplication(#[source] GithubClientError),
    #[error("failed to render image build configuration")]
    Render(#[source] RenderError),
    #[error("failed to build image")]
    Build(#[source] BuildScriptError),
    #[error("failed to delete duplicate image {image_id}")]
    DeleteDuplicate {
        image_id: String,
        #[source]
        source: Option<CloudConnectionError>,
    },
    #[error("failed to upload image")]
    Upload(#[source] CloudConnectionError),
}

#[derive(Debug, thiserror::Error)]
pub enum InstanceConfigError {
    #[error("invalid unit name {0:?}, expected <app>/<number>")]
    InvalidUnitName(String),
    #[error("failed to get registration token")]
    RegistrationToken(#[source] GithubClientError),
}

#[derive(Debug, thiserror::Error)]
pub enum InstanceLaunchError {
    #[error("failed to launch instance")]
    Launch(#[source] CloudConnectionError),
    #[error(transparent)]
    Unauthorized(CloudConnectionError),
    #[error(transparent)]
    Render(#[from] RenderError),
}

impl InstanceLaunchError {
    /// Only cloud-side launch failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, InstanceLaunchError::Launch(_))
    }
}

impl From<CloudConnectionError> for InstanceLaunchError {
    fn from(err: CloudConnectionError) -> Self {
        if err.is_unauthorized() {
            InstanceLaunchError::Unauthorized(err)
        } else {
            InstanceLaunchError::Launch(err)
        }
    }
}
