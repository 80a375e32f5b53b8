use crate::error::CloudConnectionError;
use runner_providers::inventory::Project;
use runner_providers::{CloudConnection, CloudConnector};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Location of `clouds.yaml` relative to the home directory.
pub const CLOUDS_YAML_RELATIVE_PATH: &str = ".config/openstack/clouds.yaml";

pub fn default_clouds_yaml_path() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(CLOUDS_YAML_RELATIVE_PATH)
}

/// Parsed `clouds.yaml`. Profiles keep their document order.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudsConfig {
    raw: serde_yaml::Value,
    clouds: Vec<(String, serde_yaml::Value)>,
}

impl CloudsConfig {
    pub fn from_yaml_str(contents: &str) -> Result<Self, CloudConnectionError> {
        let value: serde_yaml::Value = serde_yaml::from_str(contents)
            .map_err(|e| CloudConnectionError::InvalidConfig(format!("invalid clouds.yaml: {e}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: serde_yaml::Value) -> Result<Self, CloudConnectionError> {
        let mapping = value
            .get("clouds")
            .and_then(|clouds| clouds.as_mapping())
            .ok_or_else(|| CloudConnectionError::InvalidConfig("invalid clouds.yaml".to_string()))?;
        if mapping.is_empty() {
            return Err(CloudConnectionError::InvalidConfig(
                "no clouds defined in clouds.yaml".to_string(),
            ));
        }

        let mut clouds = Vec::with_capacity(mapping.len());
        for (name, profile) in mapping {
            let name = name.as_str().ok_or_else(|| {
                CloudConnectionError::InvalidConfig(format!(
                    "invalid clouds.yaml: cloud name {name:?} is not a string"
                ))
            })?;
            clouds.push((name.to_string(), profile.clone()));
        }

        Ok(Self { raw: value, clouds })
    }

    pub async fn load(path: &Path) -> Result<Self, CloudConnectionError> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            CloudConnectionError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn cloud_names(&self) -> impl Iterator<Item = &str> {
        self.clouds.iter().map(|(name, _)| name.as_str())
    }

    pub fn to_yaml_string(&self) -> Result<String, CloudConnectionError> {
        serde_yaml::to_string(&self.raw)
            .map_err(|e| CloudConnectionError::InvalidConfig(format!("invalid clouds.yaml: {e}")))
    }
}

/// Write the cloud credentials where OpenStack tooling looks for them.
pub async fn initialize(config: &CloudsConfig, path: &Path) -> Result<(), CloudConnectionError> {
    let contents = config.to_yaml_string()?;
    let write_err = |source| CloudConnectionError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    tokio::fs::write(path, contents).await.map_err(write_err)?;
    info!("[cloud] wrote clouds.yaml to {}", path.display());
    Ok(())
}

/// Picks one profile out of a `CloudsConfig` and opens a connection with it.
#[derive(Clone)]
pub struct CloudResolver {
    connector: Arc<dyn CloudConnector>,
    strict_profile_selection: bool,
}

impl CloudResolver {
    pub fn new(connector: Arc<dyn CloudConnector>) -> Self {
        Self {
            connector,
            strict_profile_selection: false,
        }
    }

    /// Refuse configs with more than one cloud instead of using the first one.
    pub fn with_strict_profile_selection(mut self, strict: bool) -> Self {
        self.strict_profile_selection = strict;
        self
    }

    pub fn select_profile<'a>(
        &self,
        config: &'a CloudsConfig,
    ) -> Result<(&'a str, &'a serde_yaml::Value), CloudConnectionError> {
        let (name, profile) = config.clouds.first().ok_or_else(|| {
            CloudConnectionError::InvalidConfig("no clouds defined in clouds.yaml".to_string())
        })?;
        if config.clouds.len() > 1 {
            let names: Vec<&str> = config.cloud_names().collect();
            if self.strict_profile_selection {
                return Err(CloudConnectionError::InvalidConfig(format!(
                    "multiple clouds defined in clouds.yaml: {}",
                    names.join(", ")
                )));
            }
            warn!(
                "[cloud] multiple clouds defined in clouds.yaml ({}), using the first one: {}",
                names.join(", "),
                name
            );
        }
        Ok((name.as_str(), profile))
    }

    pub async fn connect(
        &self,
        config: &CloudsConfig,
    ) -> Result<Box<dyn CloudConnection>, CloudConnectionError> {
        let (name, profile) = self.select_profile(config)?;
        Ok(self.connector.connect(name, profile).await?)
    }

    /// Diagnostic call: proves the credentials work.
    pub async fn list_projects(
        &self,
        config: &CloudsConfig,
    ) -> Result<Vec<Project>, CloudConnectionError> {
        let conn = self.connect(config).await?;
        Ok(conn.list_projects().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_CLOUDS: &str = r#"
clouds:
  zeta:
    auth:
      auth_url: http://zeta:5000
  alpha:
    auth:
      auth_url: http://alpha:5000
"#;

    #[test]
    fn clouds_keep_document_order() {
        let config = CloudsConfig::from_yaml_str(TWO_CLOUDS).unwrap();
        assert_eq!(config.cloud_names().collect::<Vec<_>>(), ["zeta", "alpha"]);
    }

    #[test]
    fn rejects_missing_or_empty_clouds() {
        let err = CloudsConfig::from_yaml_str("foo: bar").unwrap_err();
        assert_eq!(err.to_string(), "invalid clouds.yaml");

        let err = CloudsConfig::from_yaml_str("clouds: {}").unwrap_err();
        assert_eq!(err.to_string(), "no clouds defined in clouds.yaml");

        assert!(CloudsConfig::from_yaml_str("clouds: [a, b]").is_err());
    }

    #[test]
    fn strict_selection_refuses_ambiguity() {
        let config = CloudsConfig::from_yaml_str(TWO_CLOUDS).unwrap();
        let connector: Arc<dyn CloudConnector> = Arc::new(runner_providers::mock::MockCloud::new());

        let lenient = CloudResolver::new(connector.clone());
        let (name, profile) = lenient.select_profile(&config).unwrap();
        assert_eq!(name, "zeta");
        assert_eq!(
            profile["auth"]["auth_url"].as_str(),
            Some("http://zeta:5000")
        );

        let strict = CloudResolver::new(connector).with_strict_profile_selection(true);
        assert!(matches!(
            strict.select_profile(&config),
            Err(CloudConnectionError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn initialize_writes_clouds_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CLOUDS_YAML_RELATIVE_PATH);
        let config = CloudsConfig::from_yaml_str(TWO_CLOUDS).unwrap();

        initialize(&config, &path).await.unwrap();

        let reloaded = CloudsConfig::load(&path).await.unwrap();
        assert_eq!(reloaded, config);
    }
}
