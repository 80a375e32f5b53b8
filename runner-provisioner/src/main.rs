use anyhow::{bail, Context};
use runner_providers::openstack::OpenStackConnector;
use runner_provisioner::{
    create_instance_config, initialize, CloudResolver, CloudsConfig, GithubClient, ImagePipeline,
    InstanceProvisioner, LaunchOptions, ScriptImageBuilder, Settings, TemplateRenderer,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: runner-provisioner <list-projects|build-image|launch>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let Some(command) = std::env::args().nth(1) else {
        bail!(USAGE);
    };

    let settings = Settings::from_env().context("invalid settings")?;
    let clouds = match &settings.clouds_yaml {
        Some(raw) => {
            let clouds = CloudsConfig::from_yaml_str(raw)?;
            initialize(&clouds, &settings.clouds_yaml_path).await?;
            clouds
        }
        None => CloudsConfig::load(&settings.clouds_yaml_path)
            .await
            .with_context(|| format!("failed to load {}", settings.clouds_yaml_path.display()))?,
    };

    let connector = OpenStackConnector::new().context("failed to create OpenStack client")?;
    let resolver =
        CloudResolver::new(Arc::new(connector)).with_strict_profile_selection(settings.strict_cloud_profile);
    let renderer = Arc::new(match &settings.templates_dir {
        Some(dir) => TemplateRenderer::from_dir(dir)?,
        None => TemplateRenderer::from_embedded()?,
    });

    match command.as_str() {
        "list-projects" => {
            let projects = resolver.list_projects(&clouds).await?;
            for project in projects {
                println!("{}\t{}", project.id, project.name);
            }
        }
        "build-image" => {
            let github = github_client(&settings)?;
            let builder = Arc::new(ScriptImageBuilder::new(&settings.build_image_script));
            let pipeline = ImagePipeline::new(resolver, renderer, builder);
            let image = pipeline
                .build_image(
                    settings.runner_arch,
                    &clouds,
                    &github,
                    &settings.github_path,
                    &settings.proxies,
                )
                .await?;
            println!("{}", image.id);
        }
        "launch" => {
            let github = github_client(&settings)?;
            let pipeline = ImagePipeline::new(
                resolver.clone(),
                renderer.clone(),
                Arc::new(ScriptImageBuilder::new(&settings.build_image_script)),
            );
            let Some(image) = pipeline.current_image(&clouds).await? else {
                bail!("no runner image published yet, run build-image first");
            };

            let config =
                create_instance_config(&settings.unit_name, image, &settings.github_path, &github)
                    .await?;
            let provisioner = InstanceProvisioner::new(resolver, renderer).with_flavor(&settings.flavor);
            let options = LaunchOptions {
                proxies: settings.proxies.clone(),
                dockerhub_mirror: settings.dockerhub_mirror.clone(),
                ssh_debug_connections: settings.ssh_debug_connections.clone(),
            };
            let server = provisioner.create_instance(&clouds, &config, &options).await?;
            println!("{}\t{}", server.id, server.name);
        }
        other => bail!("unknown command {other:?}\n{USAGE}"),
    }

    Ok(())
}

fn github_client(settings: &Settings) -> anyhow::Result<GithubClient> {
    let token = settings.github_token.clone().context("GITHUB_TOKEN is required")?;
    Ok(GithubClient::new(token)?.with_api_url(settings.github_api_url.clone()))
}
