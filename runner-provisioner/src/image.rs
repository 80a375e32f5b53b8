use crate::cloud::{CloudResolver, CloudsConfig};
use crate::error::{BuildScriptError, CloudConnectionError, ImageBuildError};
use crate::github::SourceHostingClient;
use crate::templates::{docker_client_proxy_json, TemplateRenderer};
use async_trait::async_trait;
use runner_common::{Arch, GithubPath, ProxyConfig};
use runner_providers::inventory::Image;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Canonical name of the runner image in the cloud catalog.
pub const IMAGE_NAME: &str = "jammy";

pub const BUILD_IMAGE_SCRIPT: &str = "scripts/build-openstack-image.sh";

const BUILD_IMAGE_SHELL: &str = "/usr/bin/bash";

/// File the build script leaves behind for `architecture`, as reported by the
/// runner downloads API. `x64` is amd64; anything else is treated as arm64.
pub fn image_file_name(architecture: &str) -> String {
    let image_arch = if architecture == Arch::X64.as_str() {
        "amd64"
    } else {
        "arm64"
    };
    format!("jammy-server-cloudimg-{image_arch}-compressed.img")
}

/// Positional arguments of the image build script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildImageArgs {
    pub download_url: String,
    pub http_proxy: String,
    pub https_proxy: String,
    pub no_proxy: String,
    pub docker_proxy_service_conf: String,
    pub docker_client_proxy_json: String,
}

impl BuildImageArgs {
    pub fn to_args(&self) -> [&str; 6] {
        [
            &self.download_url,
            &self.http_proxy,
            &self.https_proxy,
            &self.no_proxy,
            &self.docker_proxy_service_conf,
            &self.docker_client_proxy_json,
        ]
    }
}

/// Produces the image file on local disk.
#[async_trait]
pub trait RunnerImageBuilder: Send + Sync {
    async fn build(&self, args: &BuildImageArgs) -> Result<(), BuildScriptError>;
}

/// Runs the external build script and waits for it to exit.
#[derive(Debug, Clone)]
pub struct ScriptImageBuilder {
    program: PathBuf,
    script: PathBuf,
}

impl ScriptImageBuilder {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            program: PathBuf::from(BUILD_IMAGE_SHELL),
            script: script.into(),
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }
}

impl Default for ScriptImageBuilder {
    fn default() -> Self {
        Self::new(BUILD_IMAGE_SCRIPT)
    }
}

#[async_trait]
impl RunnerImageBuilder for ScriptImageBuilder {
    async fn build(&self, args: &BuildImageArgs) -> Result<(), BuildScriptError> {
        info!(
            "[image-build] running {} {}",
            self.program.display(),
            self.script.display()
        );
        let output = Command::new(&self.program)
            .arg(&self.script)
            .args(args.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| BuildScriptError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stdout.lines() {
            debug!("[image-build] {}", line);
        }
        if !output.status.success() {
            error!(
                "[image-build] build script exited with {}: {}",
                output.status,
                stderr.trim()
            );
            return Err(BuildScriptError::Exit {
                code: output.status.code(),
                stderr: stderr.trim().to_string(),
            });
        }
        if !stderr.trim().is_empty() {
            warn!("[image-build] build script stderr: {}", stderr.trim());
        }
        Ok(())
    }
}

/// Builds the runner image and publishes it as the only `jammy` image.
///
/// Concurrent `build_image` calls against the same cloud are not serialized
/// here; callers must not overlap them.
pub struct ImagePipeline {
    resolver: CloudResolver,
    renderer: Arc<TemplateRenderer>,
    builder: Arc<dyn RunnerImageBuilder>,
    image_dir: PathBuf,
    wait: bool,
}

impl ImagePipeline {
    pub fn new(
        resolver: CloudResolver,
        renderer: Arc<TemplateRenderer>,
        builder: Arc<dyn RunnerImageBuilder>,
    ) -> Self {
        Self {
            resolver,
            renderer,
            builder,
            image_dir: PathBuf::from("."),
            wait: true,
        }
    }

    /// Directory the build script writes the image file into.
    pub fn with_image_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.image_dir = dir.into();
        self
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    pub async fn build_image(
        &self,
        arch: Arch,
        clouds: &CloudsConfig,
        github: &dyn SourceHostingClient,
        path: &GithubPath,
        proxies: &ProxyConfig,
    ) -> Result<Image, ImageBuildError> {
        let runner_application = github
            .get_runner_application(path, arch)
            .await
            .map_err(ImageBuildError::FetchRunnerApplication)?;
        info!(
            "[image-build] building {} image with runner {}",
            runner_application.architecture, runner_application.filename
        );

        let args = BuildImageArgs {
            download_url: runner_application.download_url.clone(),
            http_proxy: proxies.http_or_empty().to_string(),
            https_proxy: proxies.https_or_empty().to_string(),
            no_proxy: proxies.no_proxy_or_empty().to_string(),
            docker_proxy_service_conf: self
                .renderer
                .render_docker_proxy_service(proxies)
                .map_err(ImageBuildError::Render)?,
            docker_client_proxy_json: docker_client_proxy_json(proxies),
        };
        self.builder
            .build(&args)
            .await
            .map_err(ImageBuildError::Build)?;

        let conn = self
            .resolver
            .connect(clouds)
            .await
            .map_err(ImageBuildError::Upload)?;
        let image_file = self
            .image_dir
            .join(image_file_name(&runner_application.architecture));

        let existing = conn
            .search_images(IMAGE_NAME)
            .await
            .map_err(|e| ImageBuildError::Upload(e.into()))?;
        for image in existing {
            info!("[image-build] deleting previous {} image {}", IMAGE_NAME, image.id);
            match conn.delete_image(&image.id, self.wait).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(ImageBuildError::DeleteDuplicate {
                        image_id: image.id,
                        source: None,
                    })
                }
                Err(e) => {
                    return Err(ImageBuildError::DeleteDuplicate {
                        image_id: image.id,
                        source: Some(CloudConnectionError::from(e)),
                    })
                }
            }
        }

        let image = conn
            .create_image(IMAGE_NAME, &image_file, self.wait)
            .await
            .map_err(|e| ImageBuildError::Upload(e.into()))?;
        info!(
            "[image-build] published {} image {} from {}",
            IMAGE_NAME,
            image.id,
            image_file.display()
        );
        Ok(image)
    }

    /// The published runner image, if any.
    pub async fn current_image(
        &self,
        clouds: &CloudsConfig,
    ) -> Result<Option<Image>, CloudConnectionError> {
        let conn = self.resolver.connect(clouds).await?;
        let mut images = conn.search_images(IMAGE_NAME).await?;
        if images.len() > 1 {
            warn!(
                "[image-build] {} images named {}, using the most recent",
                images.len(),
                IMAGE_NAME
            );
        }
        images.sort_by_key(|image| image.created_at);
        Ok(images.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_file_follows_architecture() {
        assert_eq!(
            image_file_name("x64"),
            "jammy-server-cloudimg-amd64-compressed.img"
        );
        for other in ["arm64", "arm", ""] {
            assert_eq!(
                image_file_name(other),
                "jammy-server-cloudimg-arm64-compressed.img"
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_builder_passes_positional_args() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("build.sh");
        let out = dir.path().join("args.txt");
        std::fs::write(
            &script,
            format!("printf '%s\\n' \"$@\" > {}\n", out.display()),
        )
        .unwrap();

        let args = BuildImageArgs {
            download_url: "http://x/runner.tgz".to_string(),
            http_proxy: "http://proxy:3128".to_string(),
            https_proxy: String::new(),
            no_proxy: String::new(),
            docker_proxy_service_conf: "[Service]".to_string(),
            docker_client_proxy_json: r#"{"proxies":{"default":{}}}"#.to_string(),
        };
        ScriptImageBuilder::new(&script)
            .with_program("/bin/sh")
            .build(&args)
            .await
            .unwrap();

        let written = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines, args.to_args());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_builder_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("build.sh");
        std::fs::write(&script, "echo 'no space left' >&2\nexit 3\n").unwrap();

        let args = BuildImageArgs {
            download_url: "http://x/runner.tgz".to_string(),
            http_proxy: String::new(),
            https_proxy: String::new(),
            no_proxy: String::new(),
            docker_proxy_service_conf: String::new(),
            docker_client_proxy_json: String::new(),
        };
        let err = ScriptImageBuilder::new(&script)
            .with_program("/bin/sh")
            .build(&args)
            .await
            .unwrap_err();
        match err {
            BuildScriptError::Exit { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "no space left");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let err = ScriptImageBuilder::new("build.sh")
            .with_program("/nonexistent/bash")
            .build(&BuildImageArgs {
                download_url: String::new(),
                http_proxy: String::new(),
                https_proxy: String::new(),
                no_proxy: String::new(),
                docker_proxy_service_conf: String::new(),
                docker_client_proxy_json: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BuildScriptError::Spawn { .. }));
    }
}
