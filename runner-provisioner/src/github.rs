use crate::error::GithubClientError;
use async_trait::async_trait;
use reqwest::{Client, Method};
use runner_common::{Arch, GithubPath, RunnerApplication};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

const RUNNER_OS: &str = "linux";

/// The source-hosting service runners register against.
#[async_trait]
pub trait SourceHostingClient: Send + Sync {
    /// Latest runner agent build for `arch` on Linux.
    async fn get_runner_application(
        &self,
        path: &GithubPath,
        arch: Arch,
    ) -> Result<RunnerApplication, GithubClientError>;

    /// Single-use token that lets one runner register.
    async fn get_registration_token(&self, path: &GithubPath) -> Result<String, GithubClientError>;
}

#[derive(Deserialize)]
struct RegistrationToken {
    token: String,
}

pub struct GithubClient {
    client: Client,
    api_url: String,
    token: String,
}

impl GithubClient {
    pub fn new(token: impl Into<String>) -> Result<Self, GithubClientError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(GithubClientError::MissingToken);
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("runner-provisioner/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_url: DEFAULT_GITHUB_API_URL.to_string(),
            token,
        })
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }

    fn runners_url(&self, path: &GithubPath, suffix: &str) -> String {
        let scope = match path {
            GithubPath::Org { org, .. } => format!("orgs/{org}"),
            GithubPath::Repo { owner, repo } => format!("repos/{owner}/{repo}"),
        };
        format!("{}/{}/actions/runners/{}", self.api_url, scope, suffix)
    }

    async fn send(&self, method: Method, url: &str) -> Result<reqwest::Response, GithubClientError> {
        let resp = self
            .client
            .request(method.clone(), url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GithubClientError::Api {
                method: method.to_string(),
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        debug!("[GitHub API] {} {} succeeded: status={}", method, url, status);
        Ok(resp)
    }
}

#[async_trait]
impl SourceHostingClient for GithubClient {
    async fn get_runner_application(
        &self,
        path: &GithubPath,
        arch: Arch,
    ) -> Result<RunnerApplication, GithubClientError> {
        let url = self.runners_url(path, "downloads");
        let applications: Vec<RunnerApplication> = self.send(Method::GET, &url).await?.json().await?;

        let application = applications
            .into_iter()
            .find(|app| app.os == RUNNER_OS && app.architecture == arch.as_str())
            .ok_or_else(|| GithubClientError::RunnerBinary {
                path: path.path(),
                os: RUNNER_OS.to_string(),
                arch: arch.to_string(),
            })?;
        info!(
            "[GitHub API] runner application for {}: {}",
            arch, application.download_url
        );
        Ok(application)
    }

    async fn get_registration_token(&self, path: &GithubPath) -> Result<String, GithubClientError> {
        let url = self.runners_url(path, "registration-token");
        let token: RegistrationToken = self.send(Method::POST, &url).await?.json().await?;
        info!("[GitHub API] issued registration token for {}", path);
        Ok(token.token)
    }
}
