use crate::cloud::{CloudResolver, CloudsConfig};
use crate::error::{CloudConnectionError, InstanceConfigError, InstanceLaunchError};
use crate::github::SourceHostingClient;
use crate::image::IMAGE_NAME;
use crate::retry::RetryPolicy;
use crate::templates::TemplateRenderer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use runner_common::{GithubPath, ProxyConfig, SshDebugConnection};
use runner_providers::inventory::{Image, Server};
use runner_providers::CreateServerRequest;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::info;

pub const DEFAULT_FLAVOR: &str = "m1.small";

/// Everything needed to boot and register one runner.
#[derive(Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    pub name: String,
    pub labels: Vec<String>,
    pub registration_token: String,
    pub github_path: GithubPath,
    pub image: Image,
}

impl fmt::Debug for InstanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceConfig")
            .field("name", &self.name)
            .field("labels", &self.labels)
            .field("registration_token", &"<redacted>")
            .field("github_path", &self.github_path)
            .field("image", &self.image)
            .finish()
    }
}

fn random_suffix() -> String {
    let bytes: [u8; 12] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Build the config for a new runner of unit `app/N`.
///
/// Each call asks for a new registration token; tokens are single-use.
pub async fn create_instance_config(
    unit_name: &str,
    image: Image,
    path: &GithubPath,
    github: &dyn SourceHostingClient,
) -> Result<InstanceConfig, InstanceConfigError> {
    let (app_name, unit_num) = unit_name
        .rsplit_once('/')
        .filter(|(app, num)| !app.is_empty() && !num.is_empty())
        .ok_or_else(|| InstanceConfigError::InvalidUnitName(unit_name.to_string()))?;
    let name = format!("{app_name}-{unit_num}-{}", random_suffix());

    let registration_token = github
        .get_registration_token(path)
        .await
        .map_err(InstanceConfigError::RegistrationToken)?;

    Ok(InstanceConfig {
        name,
        labels: vec![app_name.to_string(), IMAGE_NAME.to_string()],
        registration_token,
        github_path: path.clone(),
        image,
    })
}

/// Per-launch settings that are not part of the instance identity.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub proxies: ProxyConfig,
    pub dockerhub_mirror: Option<String>,
    pub ssh_debug_connections: Vec<SshDebugConnection>,
}

pub struct InstanceProvisioner {
    resolver: CloudResolver,
    renderer: Arc<TemplateRenderer>,
    retry: RetryPolicy,
    flavor: String,
    wait: bool,
    rng: Mutex<StdRng>,
}

impl InstanceProvisioner {
    pub fn new(resolver: CloudResolver, renderer: Arc<TemplateRenderer>) -> Self {
        Self {
            resolver,
            renderer,
            retry: RetryPolicy::instance_launch(),
            flavor: DEFAULT_FLAVOR.to_string(),
            wait: true,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_flavor(mut self, flavor: impl Into<String>) -> Self {
        self.flavor = flavor.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Random source for choosing the SSH debug endpoint.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    /// Launch an instance, retrying the whole attempt on cloud failures.
    /// Rejected credentials and template errors surface on the first attempt.
    pub async fn create_instance(
        &self,
        clouds: &CloudsConfig,
        config: &InstanceConfig,
        options: &LaunchOptions,
    ) -> Result<Server, InstanceLaunchError> {
        self.retry
            .run_when(
                "create_instance",
                || self.create_instance_once(clouds, config, options),
                InstanceLaunchError::is_retryable,
            )
            .await
    }

    pub async fn create_instance_once(
        &self,
        clouds: &CloudsConfig,
        config: &InstanceConfig,
        options: &LaunchOptions,
    ) -> Result<Server, InstanceLaunchError> {
        let user_data = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            self.renderer.render_user_data(
                config,
                &options.proxies,
                options.dockerhub_mirror.as_deref(),
                &options.ssh_debug_connections,
                &mut *rng,
            )?
        };

        let conn = self
            .resolver
            .connect(clouds)
            .await?;

        info!(
            "[instance-launch] creating server {} from image {} ({})",
            config.name, config.image.name, config.image.id
        );
        let server = conn
            .create_server(&CreateServerRequest {
                name: config.name.clone(),
                image_id: config.image.id.clone(),
                flavor: self.flavor.clone(),
                user_data,
                wait: self.wait,
            })
            .await
            .map_err(CloudConnectionError::from)?;
        info!(
            "[instance-launch] server {} is {} (id {})",
            server.name, server.status, server.id
        );
        Ok(server)
    }
}
