use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

// --- Enums ---

/// Runner agent architectures published by GitHub.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X64,
    Arm64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X64 => "x64",
            Arch::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x64" | "x86_64" | "amd64" => Ok(Arch::X64),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            other => Err(ParseError::UnsupportedArch(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unsupported architecture: {0}")]
    UnsupportedArch(String),
    #[error("invalid GitHub path: {0:?}")]
    InvalidGithubPath(String),
}

// --- GitHub ---

pub const DEFAULT_RUNNER_GROUP: &str = "default";

/// Organization or repository the runner registers against.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GithubPath {
    Org { org: String, group: String },
    Repo { owner: String, repo: String },
}

impl GithubPath {
    /// Parse `owner/repo` as a repository, anything else as an organization.
    pub fn parse(path: &str, runner_group: Option<&str>) -> Result<Self, ParseError> {
        let path = path.trim();
        if path.is_empty() {
            return Err(ParseError::InvalidGithubPath(path.to_string()));
        }
        match path.split_once('/') {
            Some((owner, repo)) => {
                if owner.is_empty() || repo.is_empty() || repo.contains('/') {
                    return Err(ParseError::InvalidGithubPath(path.to_string()));
                }
                Ok(GithubPath::Repo {
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                })
            }
            None => Ok(GithubPath::Org {
                org: path.to_string(),
                group: runner_group
                    .map(|g| g.trim())
                    .filter(|g| !g.is_empty())
                    .unwrap_or(DEFAULT_RUNNER_GROUP)
                    .to_string(),
            }),
        }
    }

    pub fn path(&self) -> String {
        match self {
            GithubPath::Org { org, .. } => org.clone(),
            GithubPath::Repo { owner, repo } => format!("{owner}/{repo}"),
        }
    }
}

impl fmt::Display for GithubPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Downloadable runner agent build, as listed by the runner downloads API.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RunnerApplication {
    pub os: String,
    pub architecture: String,
    pub download_url: String,
    pub filename: String,
    #[serde(default)]
    pub sha256_checksum: Option<String>,
}

// --- Instance configuration inputs ---

/// HTTP proxy settings. Empty strings are stored as `None`.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    pub http: Option<String>,
    pub https: Option<String>,
    pub no_proxy: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl ProxyConfig {
    pub fn new(http: Option<String>, https: Option<String>, no_proxy: Option<String>) -> Self {
        Self {
            http: non_empty(http),
            https: non_empty(https),
            no_proxy: non_empty(no_proxy),
        }
    }

    pub fn http_or_empty(&self) -> &str {
        self.http.as_deref().unwrap_or("")
    }

    pub fn https_or_empty(&self) -> &str {
        self.https.as_deref().unwrap_or("")
    }

    pub fn no_proxy_or_empty(&self) -> &str {
        self.no_proxy.as_deref().unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.http.is_none() && self.https.is_none() && self.no_proxy.is_none()
    }
}

/// Reachable tmate SSH relay used by debug workflows.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SshDebugConnection {
    pub host: IpAddr,
    pub port: u16,
    pub rsa_fingerprint: String,
    pub ed25519_fingerprint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_parse() {
        assert_eq!("x64".parse::<Arch>(), Ok(Arch::X64));
        assert_eq!("X86_64".parse::<Arch>(), Ok(Arch::X64));
        assert_eq!("aarch64".parse::<Arch>(), Ok(Arch::Arm64));
        assert_eq!(Arch::Arm64.as_str(), "arm64");
        assert!(matches!(
            "riscv64".parse::<Arch>(),
            Err(ParseError::UnsupportedArch(_))
        ));
    }

    #[test]
    fn github_path_repo_and_org() {
        let repo = GithubPath::parse("canonical/runner", None).unwrap();
        assert_eq!(
            repo,
            GithubPath::Repo {
                owner: "canonical".into(),
                repo: "runner".into()
            }
        );
        assert_eq!(repo.path(), "canonical/runner");

        let org = GithubPath::parse("canonical", Some("  ")).unwrap();
        assert_eq!(
            org,
            GithubPath::Org {
                org: "canonical".into(),
                group: DEFAULT_RUNNER_GROUP.into()
            }
        );
        assert_eq!(org.path(), "canonical");
    }

    #[test]
    fn github_path_rejects_malformed() {
        for bad in ["", "/repo", "owner/", "a/b/c"] {
            assert!(GithubPath::parse(bad, None).is_err(), "{bad:?} should fail");
        }
    }

    #[test]
    fn proxy_config_normalizes_empty_fields() {
        let proxies = ProxyConfig::new(Some("http://proxy:3128".into()), Some(" ".into()), None);
        assert_eq!(proxies.http.as_deref(), Some("http://proxy:3128"));
        assert_eq!(proxies.https, None);
        assert_eq!(proxies.https_or_empty(), "");
        assert!(!proxies.is_empty());
        assert!(ProxyConfig::default().is_empty());
    }

    #[test]
    fn ssh_debug_connection_from_json() {
        let conn: SshDebugConnection = serde_json::from_str(
            r#"{"host":"10.0.0.5","port":10022,"rsa_fingerprint":"SHA256:rsa","ed25519_fingerprint":"SHA256:ed"}"#,
        )
        .unwrap();
        assert_eq!(conn.host.to_string(), "10.0.0.5");
        assert_eq!(conn.port, 10022);
    }
}
