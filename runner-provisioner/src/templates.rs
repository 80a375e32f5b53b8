use crate::error::RenderError;
use crate::instance::InstanceConfig;
use rand::seq::SliceRandom;
use rand::Rng;
use runner_common::{ProxyConfig, SshDebugConnection};
use serde_json::{json, Map, Value};
use std::path::Path;
use tera::{Context, Tera};

pub const ENV_TEMPLATE: &str = "env.j2";
pub const USER_DATA_TEMPLATE: &str = "openstack-userdata.sh.j2";
pub const DOCKER_PROXY_SERVICE_TEMPLATE: &str = "systemd-docker-proxy.j2";

const EMBEDDED_TEMPLATES: [(&str, &str); 3] = [
    (ENV_TEMPLATE, include_str!("../templates/env.j2")),
    (USER_DATA_TEMPLATE, include_str!("../templates/openstack-userdata.sh.j2")),
    (
        DOCKER_PROXY_SERVICE_TEMPLATE,
        include_str!("../templates/systemd-docker-proxy.j2"),
    ),
];

/// Renders boot payloads and image-build configuration.
///
/// The outputs are shell scripts and systemd units, so autoescaping is off.
pub struct TemplateRenderer {
    tera: Tera,
}

impl TemplateRenderer {
    /// Templates compiled into the binary.
    pub fn from_embedded() -> Result<Self, RenderError> {
        Self::from_raw(EMBEDDED_TEMPLATES)
    }

    /// Every `*.j2` file under `dir`, named by its path relative to `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self, RenderError> {
        let glob = format!("{}/**/*.j2", dir.display());
        let mut tera = Tera::new(&glob)?;
        tera.autoescape_on(vec![]);
        Ok(Self { tera })
    }

    pub fn from_raw<I, N, C>(templates: I) -> Result<Self, RenderError>
    where
        I: IntoIterator<Item = (N, C)>,
        N: AsRef<str>,
        C: AsRef<str>,
    {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        tera.add_raw_templates(templates)?;
        Ok(Self { tera })
    }

    fn render(&self, name: &str, context: &Context) -> Result<String, RenderError> {
        Ok(self.tera.render(name, context)?)
    }

    /// systemd drop-in that passes the proxies to the Docker daemon.
    pub fn render_docker_proxy_service(&self, proxies: &ProxyConfig) -> Result<String, RenderError> {
        let mut context = Context::new();
        context.insert("proxies", proxies);
        self.render(DOCKER_PROXY_SERVICE_TEMPLATE, &context)
    }

    pub fn render_env(
        &self,
        proxies: &ProxyConfig,
        dockerhub_mirror: Option<&str>,
        ssh_debug_info: Option<&SshDebugConnection>,
    ) -> Result<String, RenderError> {
        let mut context = Context::new();
        context.insert("proxies", proxies);
        context.insert("pre_job_script", "");
        context.insert("dockerhub_mirror", &dockerhub_mirror.filter(|m| !m.is_empty()));
        context.insert("ssh_debug_info", &ssh_debug_info);
        self.render(ENV_TEMPLATE, &context)
    }

    /// First-boot script for one runner instance.
    ///
    /// Output depends only on the inputs and on which debug endpoint `rng` picks.
    pub fn render_user_data<R: Rng + ?Sized>(
        &self,
        config: &InstanceConfig,
        proxies: &ProxyConfig,
        dockerhub_mirror: Option<&str>,
        ssh_debug_connections: &[SshDebugConnection],
        rng: &mut R,
    ) -> Result<String, RenderError> {
        let ssh_debug_info = choose_debug_connection(ssh_debug_connections, rng);
        let env_contents = self.render_env(proxies, dockerhub_mirror, ssh_debug_info)?;

        let mut context = Context::new();
        context.insert("github_url", &format!("https://github.com/{}", config.github_path.path()));
        context.insert("token", &config.registration_token);
        context.insert("instance_labels", &config.labels.join(","));
        context.insert("instance_name", &config.name);
        context.insert("env_contents", &env_contents);
        self.render(USER_DATA_TEMPLATE, &context)
    }
}

/// Docker client `config.json` proxy section. Only the configured keys appear.
pub fn docker_client_proxy_json(proxies: &ProxyConfig) -> String {
    let mut default = Map::new();
    let fields = [
        ("httpProxy", &proxies.http),
        ("httpsProxy", &proxies.https),
        ("noProxy", &proxies.no_proxy),
    ];
    for (key, value) in fields {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            default.insert(key.to_string(), Value::String(value.to_string()));
        }
    }
    json!({ "proxies": { "default": default } }).to_string()
}

pub fn choose_debug_connection<'a, R: Rng + ?Sized>(
    candidates: &'a [SshDebugConnection],
    rng: &mut R,
) -> Option<&'a SshDebugConnection> {
    candidates.choose(rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use runner_common::GithubPath;
    use runner_providers::inventory::Image;

    fn renderer() -> TemplateRenderer {
        TemplateRenderer::from_embedded().unwrap()
    }

    fn instance_config() -> InstanceConfig {
        InstanceConfig {
            name: "github-runner-0-0123456789abcdef01234567".to_string(),
            labels: vec!["github-runner".to_string(), "jammy".to_string()],
            registration_token: "AABBCC".to_string(),
            github_path: GithubPath::parse("canonical/runner", None).unwrap(),
            image: Image {
                id: "img-1".to_string(),
                name: "jammy".to_string(),
                status: "active".to_string(),
                created_at: None,
            },
        }
    }

    fn tmate(last_octet: u8) -> SshDebugConnection {
        SshDebugConnection {
            host: format!("10.0.0.{last_octet}").parse().unwrap(),
            port: 10022,
            rsa_fingerprint: format!("SHA256:rsa{last_octet}"),
            ed25519_fingerprint: format!("SHA256:ed{last_octet}"),
        }
    }

    #[test]
    fn proxy_json_only_has_configured_keys() {
        let proxies = ProxyConfig::new(Some("http://proxy:3128".into()), None, Some("".into()));
        assert_eq!(
            docker_client_proxy_json(&proxies),
            r#"{"proxies":{"default":{"httpProxy":"http://proxy:3128"}}}"#
        );
        assert_eq!(
            docker_client_proxy_json(&ProxyConfig::default()),
            r#"{"proxies":{"default":{}}}"#
        );
    }

    #[test]
    fn docker_proxy_service_lists_proxies() {
        let proxies = ProxyConfig::new(
            Some("http://proxy:3128".into()),
            Some("http://proxy:3129".into()),
            None,
        );
        let rendered = renderer().render_docker_proxy_service(&proxies).unwrap();
        assert_eq!(
            rendered,
            "[Service]\nEnvironment=\"HTTP_PROXY=http://proxy:3128\"\nEnvironment=\"HTTPS_PROXY=http://proxy:3129\"\n"
        );
    }

    #[test]
    fn env_without_optional_settings() {
        let env = renderer()
            .render_env(&ProxyConfig::default(), None, None)
            .unwrap();
        assert!(!env.contains("PROXY"));
        assert!(!env.contains("DOCKERHUB_MIRROR"));
        assert!(!env.contains("TMATE_SERVER"));
        assert!(env.contains("LANG=C.UTF-8\n"));
    }

    #[test]
    fn env_with_mirror_and_tmate() {
        let proxies = ProxyConfig::new(None, None, Some("10.0.0.0/8".into()));
        let env = renderer()
            .render_env(&proxies, Some("https://mirror.local"), Some(&tmate(5)))
            .unwrap();
        assert!(env.contains("NO_PROXY=10.0.0.0/8\nno_proxy=10.0.0.0/8\n"));
        assert!(env.contains("DOCKERHUB_MIRROR=https://mirror.local\n"));
        assert!(env.contains("CONTAINER_REGISTRY_URL=https://mirror.local\n"));
        assert!(env.contains("TMATE_SERVER_HOST=10.0.0.5\n"));
        assert!(env.contains("TMATE_SERVER_PORT=10022\n"));
        assert!(env.contains("TMATE_SERVER_ED25519_FINGERPRINT=SHA256:ed5\n"));
    }

    #[test]
    fn user_data_registers_runner() {
        let mut rng = StdRng::seed_from_u64(7);
        let user_data = renderer()
            .render_user_data(
                &instance_config(),
                &ProxyConfig::default(),
                None,
                &[],
                &mut rng,
            )
            .unwrap();
        assert!(user_data.starts_with("#!/bin/sh\n"));
        assert!(user_data.contains("--url https://github.com/canonical/runner"));
        assert!(user_data.contains("--token AABBCC"));
        assert!(user_data.contains("--labels github-runner,jammy"));
        assert!(user_data.contains("--name github-runner-0-0123456789abcdef01234567"));
        assert!(user_data.contains("ACTIONS_RUNNER_HOOK_JOB_STARTED=\nRUNNER_ENV_EOF\n"));
        assert!(!user_data.contains("TMATE_SERVER"));
    }

    #[test]
    fn user_data_is_deterministic_for_a_seed() {
        let candidates = [tmate(1), tmate(2), tmate(3)];
        let render = |seed| {
            renderer()
                .render_user_data(
                    &instance_config(),
                    &ProxyConfig::default(),
                    Some("https://mirror.local"),
                    &candidates,
                    &mut StdRng::seed_from_u64(seed),
                )
                .unwrap()
        };
        assert_eq!(render(42), render(42));
    }

    #[test]
    fn debug_connection_choice() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(choose_debug_connection(&[], &mut rng), None);

        let only = [tmate(9)];
        for _ in 0..10 {
            assert_eq!(choose_debug_connection(&only, &mut rng), Some(&only[0]));
        }

        let many = [tmate(1), tmate(2), tmate(3)];
        let picks: std::collections::HashSet<_> = (0..64)
            .filter_map(|_| choose_debug_connection(&many, &mut rng))
            .map(|c| c.host)
            .collect();
        assert!(picks.len() > 1);
        assert!(picks.iter().all(|host| many.iter().any(|c| c.host == *host)));
    }

    #[test]
    fn raw_templates_are_not_escaped() {
        let renderer = TemplateRenderer::from_raw([("t.j2", "{{ value }}")]).unwrap();
        let mut context = Context::new();
        context.insert("value", "a&b<c>");
        assert_eq!(renderer.render("t.j2", &context).unwrap(), "a&b<c>");
    }

    #[test]
    fn template_errors_propagate() {
        let renderer = TemplateRenderer::from_raw([(ENV_TEMPLATE, "{{ missing.field }}")]).unwrap();
        let err = renderer
            .render_env(&ProxyConfig::default(), None, None)
            .unwrap_err();
        assert!(err.to_string().contains(ENV_TEMPLATE), "got {err}");
    }
}
