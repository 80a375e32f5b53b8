use crate::cloud::default_clouds_yaml_path;
use crate::github::DEFAULT_GITHUB_API_URL;
use crate::image::BUILD_IMAGE_SCRIPT;
use crate::instance::DEFAULT_FLAVOR;
use runner_common::{Arch, GithubPath, ProxyConfig, SshDebugConnection};
use std::path::PathBuf;

pub const DEFAULT_UNIT_NAME: &str = "github-runner/0";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub clouds_yaml_path: PathBuf,
    /// Inline `clouds.yaml`; written to `clouds_yaml_path` on startup when set.
    pub clouds_yaml: Option<String>,
    pub github_path: GithubPath,
    pub github_token: Option<String>,
    pub github_api_url: String,
    pub unit_name: String,
    pub runner_arch: Arch,
    pub proxies: ProxyConfig,
    pub dockerhub_mirror: Option<String>,
    pub ssh_debug_connections: Vec<SshDebugConnection>,
    pub build_image_script: PathBuf,
    pub templates_dir: Option<PathBuf>,
    pub flavor: String,
    pub strict_cloud_profile: bool,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let github_path = get("GITHUB_PATH").ok_or(SettingsError::Missing("GITHUB_PATH"))?;
        let github_path = GithubPath::parse(&github_path, get("RUNNER_GROUP").as_deref())
            .map_err(|e| invalid("GITHUB_PATH", e))?;

        let runner_arch = match get("RUNNER_ARCH") {
            Some(arch) => arch.parse::<Arch>().map_err(|e| invalid("RUNNER_ARCH", e))?,
            None => Arch::X64,
        };

        let ssh_debug_connections: Vec<SshDebugConnection> = match get("SSH_DEBUG_CONNECTIONS") {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| invalid("SSH_DEBUG_CONNECTIONS", e))?,
            None => Vec::new(),
        };

        let strict_cloud_profile = match get("STRICT_CLOUD_PROFILE") {
            Some(raw) => parse_bool(&raw).ok_or_else(|| SettingsError::Invalid {
                name: "STRICT_CLOUD_PROFILE",
                reason: format!("expected a boolean, got {raw:?}"),
            })?,
            None => false,
        };

        Ok(Self {
            clouds_yaml_path: get("CLOUDS_YAML_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_clouds_yaml_path),
            clouds_yaml: get("OPENSTACK_CLOUDS_YAML"),
            github_path,
            github_token: get("GITHUB_TOKEN"),
            github_api_url: get("GITHUB_API_URL").unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_string()),
            unit_name: get("UNIT_NAME").unwrap_or_else(|| DEFAULT_UNIT_NAME.to_string()),
            runner_arch,
            proxies: ProxyConfig::new(get("HTTP_PROXY"), get("HTTPS_PROXY"), get("NO_PROXY")),
            dockerhub_mirror: get("DOCKERHUB_MIRROR"),
            ssh_debug_connections,
            build_image_script: get("BUILD_IMAGE_SCRIPT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(BUILD_IMAGE_SCRIPT)),
            templates_dir: get("TEMPLATES_DIR").map(PathBuf::from),
            flavor: get("OPENSTACK_FLAVOR").unwrap_or_else(|| DEFAULT_FLAVOR.to_string()),
            strict_cloud_profile,
        })
    }
}

fn invalid(name: &'static str, err: impl std::fmt::Display) -> SettingsError {
    SettingsError::Invalid {
        name,
        reason: err.to_string(),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings, SettingsError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let settings = settings(&[("GITHUB_PATH", "canonical/runner")]).unwrap();
        assert_eq!(settings.unit_name, DEFAULT_UNIT_NAME);
        assert_eq!(settings.runner_arch, Arch::X64);
        assert_eq!(settings.flavor, "m1.small");
        assert_eq!(settings.github_api_url, "https://api.github.com");
        assert!(settings.proxies.is_empty());
        assert!(settings.ssh_debug_connections.is_empty());
        assert!(!settings.strict_cloud_profile);
        assert!(settings.clouds_yaml_path.ends_with(".config/openstack/clouds.yaml"));
    }

    #[test]
    fn github_path_is_required() {
        assert!(matches!(
            settings(&[("GITHUB_PATH", "  ")]),
            Err(SettingsError::Missing("GITHUB_PATH"))
        ));
    }

    #[test]
    fn parses_optional_values() {
        let settings = settings(&[
            ("GITHUB_PATH", "canonical"),
            ("RUNNER_GROUP", "ci"),
            ("RUNNER_ARCH", "arm64"),
            ("HTTP_PROXY", "http://proxy:3128"),
            ("NO_PROXY", ""),
            ("STRICT_CLOUD_PROFILE", "yes"),
            (
                "SSH_DEBUG_CONNECTIONS",
                r#"[{"host":"10.0.0.5","port":10022,"rsa_fingerprint":"r","ed25519_fingerprint":"e"}]"#,
            ),
        ])
        .unwrap();
        assert_eq!(
            settings.github_path,
            GithubPath::Org {
                org: "canonical".into(),
                group: "ci".into()
            }
        );
        assert_eq!(settings.runner_arch, Arch::Arm64);
        assert_eq!(settings.proxies.http.as_deref(), Some("http://proxy:3128"));
        assert_eq!(settings.proxies.no_proxy, None);
        assert!(settings.strict_cloud_profile);
        assert_eq!(settings.ssh_debug_connections.len(), 1);
    }

    #[test]
    fn rejects_bad_values() {
        let err = settings(&[("GITHUB_PATH", "canonical"), ("RUNNER_ARCH", "riscv")]).unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { name: "RUNNER_ARCH", .. }));

        let err = settings(&[("GITHUB_PATH", "canonical"), ("STRICT_CLOUD_PROFILE", "maybe")])
            .unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { name: "STRICT_CLOUD_PROFILE", .. }));
    }
}
