pub mod cloud;
pub mod error;
pub mod github;
pub mod image;
pub mod instance;
pub mod retry;
pub mod settings;
pub mod templates;

pub use cloud::{initialize, CloudResolver, CloudsConfig};
pub use error::{
    BuildScriptError, CloudConnectionError, GithubClientError, ImageBuildError,
    InstanceConfigError, InstanceLaunchError, RenderError,
};
pub use github::{GithubClient, SourceHostingClient};
pub use image::{ImagePipeline, RunnerImageBuilder, ScriptImageBuilder, IMAGE_NAME};
pub use instance::{create_instance_config, InstanceConfig, InstanceProvisioner, LaunchOptions};
pub use retry::RetryPolicy;
pub use settings::Settings;
pub use templates::TemplateRenderer;
