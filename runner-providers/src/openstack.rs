use crate::{inventory, CloudConnection, CloudConnector, CloudError, CreateServerRequest, Result, WaitSettings};
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";
const DEFAULT_DOMAIN: &str = "Default";
const DEFAULT_INTERFACE: &str = "public";
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(3600);

/// The parts of a `clouds.yaml` entry needed for Keystone v3 password auth.
#[derive(Debug, Clone, Deserialize)]
struct CloudProfile {
    auth: CloudAuth,
    #[serde(default)]
    region_name: Option<String>,
    #[serde(default)]
    interface: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CloudAuth {
    auth_url: String,
    username: String,
    password: String,
    project_name: String,
    #[serde(default = "default_domain")]
    user_domain_name: String,
    #[serde(default = "default_domain")]
    project_domain_name: String,
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
struct CatalogEndpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct GlanceImage {
    id: String,
    #[serde(default)]
    name: Option<String>,
    status: String,
    #[serde(default)]
    created_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<GlanceImage> for inventory::Image {
    fn from(image: GlanceImage) -> Self {
        Self {
            id: image.id,
            name: image.name.unwrap_or_default(),
            status: image.status,
            created_at: image.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GlanceImageList {
    #[serde(default)]
    images: Vec<GlanceImage>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProjectList {
    #[serde(default)]
    projects: Vec<inventory::Project>,
}

#[derive(Debug, Deserialize)]
struct Flavor {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct FlavorList {
    #[serde(default)]
    flavors: Vec<Flavor>,
}

#[derive(Debug, Deserialize)]
struct NovaServerEnvelope {
    server: NovaServer,
}

#[derive(Debug, Deserialize)]
struct NovaServer {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    // `image` is an object, or "" when booted from volume.
    #[serde(default)]
    image: serde_json::Value,
    #[serde(default)]
    flavor: serde_json::Value,
    #[serde(default)]
    fault: Option<NovaFault>,
}

#[derive(Debug, Deserialize)]
struct NovaFault {
    #[serde(default)]
    message: Option<String>,
}

impl NovaServer {
    fn into_inventory(self, fallback_name: &str) -> inventory::Server {
        inventory::Server {
            name: self.name.unwrap_or_else(|| fallback_name.to_string()),
            status: self.status.unwrap_or_else(|| "BUILD".to_string()),
            image_id: self.image["id"].as_str().map(|s| s.to_string()),
            flavor: self.flavor["id"]
                .as_str()
                .or_else(|| self.flavor["original_name"].as_str())
                .map(|s| s.to_string()),
            id: self.id,
        }
    }
}

/// Connects to OpenStack through the Keystone v3, Glance v2 and Nova REST APIs.
pub struct OpenStackConnector {
    client: Client,
    image_wait: WaitSettings,
    server_wait: WaitSettings,
}

impl OpenStackConnector {
    pub fn new() -> Result<Self> {
        // reqwest sets no overall timeout by default.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            image_wait: WaitSettings::default(),
            server_wait: WaitSettings {
                poll_interval: Duration::from_secs(2),
                timeout: Duration::from_secs(300),
            },
        }
    }

    pub fn with_wait_settings(mut self, image_wait: WaitSettings, server_wait: WaitSettings) -> Self {
        self.image_wait = image_wait;
        self.server_wait = server_wait;
        self
    }
}

fn identity_url(auth_url: &str) -> String {
    let trimmed = auth_url.trim().trim_end_matches('/');
    if trimmed.ends_with("/v3") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v3")
    }
}

fn select_endpoint(
    catalog: &[CatalogEntry],
    service_type: &str,
    interface: &str,
    region: Option<&str>,
) -> Result<String> {
    catalog
        .iter()
        .filter(|entry| entry.service_type == service_type)
        .flat_map(|entry| entry.endpoints.iter())
        .find(|endpoint| {
            endpoint.interface == interface
                && region.map_or(true, |r| {
                    endpoint.region.as_deref() == Some(r) || endpoint.region_id.as_deref() == Some(r)
                })
        })
        .map(|endpoint| endpoint.url.trim_end_matches('/').to_string())
        .ok_or_else(|| CloudError::MissingEndpoint {
            service: service_type.to_string(),
        })
}

#[async_trait]
impl CloudConnector for OpenStackConnector {
    async fn connect(
        &self,
        cloud_name: &str,
        profile: &serde_yaml::Value,
    ) -> Result<Box<dyn CloudConnection>> {
        let profile: CloudProfile =
            serde_yaml::from_value(profile.clone()).map_err(|e| CloudError::InvalidProfile {
                cloud: cloud_name.to_string(),
                reason: e.to_string(),
            })?;
        let identity = identity_url(&profile.auth.auth_url);
        let url = format!("{identity}/auth/tokens");
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": profile.auth.username,
                            "domain": { "name": profile.auth.user_domain_name },
                            "password": profile.auth.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": profile.auth.project_name,
                        "domain": { "name": profile.auth.project_domain_name },
                    }
                }
            }
        });

        info!(
            "[OpenStack API] POST {} - Authenticating: cloud={}, user={}, project={}",
            url, cloud_name, profile.auth.username, profile.auth.project_name
        );
        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            let text = resp.text().await.unwrap_or_default();
            warn!("[OpenStack API] POST {} rejected credentials: {}", url, text);
            return Err(CloudError::Unauthorized(format!(
                "keystone rejected credentials for cloud {cloud_name}"
            )));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CloudError::Api {
                method: "POST".to_string(),
                url,
                status: status.as_u16(),
                body: text,
            });
        }

        let token = resp
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| CloudError::UnexpectedResponse("no X-Subject-Token in auth response".to_string()))?;
        let token_resp: TokenResponse = resp.json().await?;

        let interface = profile.interface.as_deref().unwrap_or(DEFAULT_INTERFACE);
        let region = profile.region_name.as_deref();
        let image_endpoint = select_endpoint(&token_resp.token.catalog, "image", interface, region)?;
        let image_endpoint = image_endpoint.trim_end_matches("/v2").to_string();
        let compute_endpoint =
            select_endpoint(&token_resp.token.catalog, "compute", interface, region)?;

        info!(
            "[OpenStack API] Authenticated to cloud {}: image={}, compute={}",
            cloud_name, image_endpoint, compute_endpoint
        );

        Ok(Box::new(OpenStackConnection {
            client: self.client.clone(),
            token,
            identity_endpoint: identity,
            image_endpoint,
            compute_endpoint,
            image_wait: self.image_wait,
            server_wait: self.server_wait,
        }))
    }
}

pub struct OpenStackConnection {
    client: Client,
    token: String,
    identity_endpoint: String,
    image_endpoint: String,
    compute_endpoint: String,
    image_wait: WaitSettings,
    server_wait: WaitSettings,
}

impl OpenStackConnection {
    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header(AUTH_TOKEN_HEADER, &self.token)
    }

    /// Send and turn 401 and other non-success statuses into errors.
    async fn send(&self, method: Method, url: &str, builder: RequestBuilder) -> Result<Response> {
        let resp = builder.send().await?;
        check_status(&method, url, resp).await
    }

    async fn get_image(&self, image_id: &str) -> Result<Option<GlanceImage>> {
        let url = format!("{}/v2/images/{}", self.image_endpoint, image_id);
        let resp = self.request(Method::GET, &url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status(&Method::GET, &url, resp).await?;
        Ok(Some(resp.json().await?))
    }

    async fn get_server(&self, server_id: &str) -> Result<NovaServer> {
        let url = format!("{}/servers/{}", self.compute_endpoint, server_id);
        let resp = self.send(Method::GET, &url, self.request(Method::GET, &url)).await?;
        let envelope: NovaServerEnvelope = resp.json().await?;
        Ok(envelope.server)
    }

    /// Best-effort removal of a server that never became usable.
    async fn discard_server(&self, server_id: &str) {
        let url = format!("{}/servers/{}", self.compute_endpoint, server_id);
        info!("[OpenStack API] DELETE {} - Removing failed server", url);
        let resp = match self.request(Method::DELETE, &url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("[OpenStack API] Failed to remove server {}: {}", server_id, e);
                return;
            }
        };
        if resp.status() == StatusCode::NOT_FOUND {
            return;
        }
        if let Err(e) = check_status(&Method::DELETE, &url, resp).await {
            warn!("[OpenStack API] Failed to remove server {}: {}", server_id, e);
        }
    }

    async fn resolve_flavor_id(&self, flavor: &str) -> Result<String> {
        let url = format!("{}/flavors", self.compute_endpoint);
        let resp = self.send(Method::GET, &url, self.request(Method::GET, &url)).await?;
        let list: FlavorList = resp.json().await?;
        list.flavors
            .into_iter()
            .find(|f| f.name == flavor || f.id == flavor)
            .map(|f| f.id)
            .ok_or_else(|| CloudError::NotFound {
                resource: "flavor",
                name: flavor.to_string(),
            })
    }
}

async fn check_status(method: &Method, url: &str, resp: Response) -> Result<Response> {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(CloudError::Unauthorized(format!("{method} {url}")));
    }
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        warn!(
            "[OpenStack API] {} {} failed: status={}, response={}",
            method,
            url,
            status.as_u16(),
            text
        );
        return Err(CloudError::Api {
            method: method.to_string(),
            url: url.to_string(),
            status: status.as_u16(),
            body: text,
        });
    }
    debug!("[OpenStack API] {} {} succeeded: status={}", method, url, status.as_u16());
    Ok(resp)
}

/// Poll `check` until it yields a value, the check fails, or `settings.timeout` elapses.
async fn poll_until<T, F, Fut>(
    settings: WaitSettings,
    resource: &'static str,
    id: &str,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();
    loop {
        if let Some(value) = check().await? {
            return Ok(value);
        }
        if start.elapsed() >= settings.timeout {
            return Err(CloudError::Timeout {
                resource,
                id: id.to_string(),
                waited: start.elapsed(),
            });
        }
        sleep(settings.poll_interval).await;
    }
}

#[async_trait]
impl CloudConnection for OpenStackConnection {
    async fn list_projects(&self) -> Result<Vec<inventory::Project>> {
        let url = format!("{}/auth/projects", self.identity_endpoint);
        let resp = self.send(Method::GET, &url, self.request(Method::GET, &url)).await?;
        let list: ProjectList = resp.json().await?;
        debug!("[OpenStack API] Listed {} project(s)", list.projects.len());
        Ok(list.projects)
    }

    async fn search_images(&self, name_or_id: &str) -> Result<Vec<inventory::Image>> {
        let mut images = Vec::new();
        let mut url = format!("{}/v2/images", self.image_endpoint);
        let mut builder = self
            .request(Method::GET, &url)
            .query(&[("name", name_or_id)]);
        loop {
            let resp = self.send(Method::GET, &url, builder).await?;
            let page: GlanceImageList = resp.json().await?;
            images.extend(page.images.into_iter().map(inventory::Image::from));
            match page.next {
                // `next` is a path relative to the endpoint root and carries the query.
                Some(next) => {
                    url = format!("{}{}", self.image_endpoint, next);
                    builder = self.request(Method::GET, &url);
                }
                None => break,
            }
        }

        if images.is_empty() && uuid::Uuid::parse_str(name_or_id).is_ok() {
            if let Some(image) = self.get_image(name_or_id).await? {
                images.push(image.into());
            }
        }
        info!(
            "[OpenStack API] Found {} image(s) matching {}",
            images.len(),
            name_or_id
        );
        Ok(images)
    }

    async fn delete_image(&self, image_id: &str, wait: bool) -> Result<bool> {
        let url = format!("{}/v2/images/{}", self.image_endpoint, image_id);
        info!("[OpenStack API] DELETE {} - Deleting image", url);
        let resp = self.request(Method::DELETE, &url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            warn!("[OpenStack API] Image {} not found, nothing deleted", image_id);
            return Ok(false);
        }
        check_status(&Method::DELETE, &url, resp).await?;

        if wait {
            let this = self;
            poll_until(self.image_wait, "image", image_id, || async move {
                Ok::<_, CloudError>(match this.get_image(image_id).await? {
                    None => Some(()),
                    Some(image) if image.status == "deleted" => Some(()),
                    Some(_) => None,
                })
            })
            .await?;
        }
        info!("[OpenStack API] Image {} deleted", image_id);
        Ok(true)
    }

    async fn create_image(
        &self,
        name: &str,
        filename: &Path,
        wait: bool,
    ) -> Result<inventory::Image> {
        let file = tokio::fs::File::open(filename)
            .await
            .map_err(|source| CloudError::Io {
                path: filename.to_path_buf(),
                source,
            })?;

        let url = format!("{}/v2/images", self.image_endpoint);
        let body = json!({
            "name": name,
            "disk_format": "qcow2",
            "container_format": "bare",
        });
        info!(
            "[OpenStack API] POST {} - Creating image: name={}, file={}",
            url,
            name,
            filename.display()
        );
        let resp = self
            .send(Method::POST, &url, self.request(Method::POST, &url).json(&body))
            .await?;
        let created: GlanceImage = resp.json().await?;
        let image_id: &str = &created.id;

        let upload_url = format!("{}/v2/images/{}/file", self.image_endpoint, image_id);
        info!("[OpenStack API] PUT {} - Uploading image data", upload_url);
        let upload = self
            .request(Method::PUT, &upload_url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .timeout(UPLOAD_TIMEOUT)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));
        self.send(Method::PUT, &upload_url, upload).await?;

        if !wait {
            return Ok(created.into());
        }

        let this = self;
        let image = poll_until(self.image_wait, "image", image_id, || async move {
            match this.get_image(image_id).await? {
                Some(image) if image.status == "active" => Ok(Some(image)),
                Some(image) if image.status == "killed" || image.status == "deleted" => {
                    Err(CloudError::ResourceFailed {
                        resource: "image",
                        id: image_id.to_string(),
                        status: image.status,
                    })
                }
                _ => Ok(None),
            }
        })
        .await?;
        info!("[OpenStack API] Image {} ({}) is active", name, image.id);
        Ok(image.into())
    }

    async fn create_server(&self, request: &CreateServerRequest) -> Result<inventory::Server> {
        let flavor_id = self.resolve_flavor_id(&request.flavor).await?;
        let url = format!("{}/servers", self.compute_endpoint);
        let body = json!({
            "server": {
                "name": request.name,
                "imageRef": request.image_id,
                "flavorRef": flavor_id,
                "user_data": base64::engine::general_purpose::STANDARD.encode(&request.user_data),
            }
        });
        info!(
            "[OpenStack API] POST {} - Creating server: name={}, image={}, flavor={}",
            url, request.name, request.image_id, request.flavor
        );
        let resp = self
            .send(Method::POST, &url, self.request(Method::POST, &url).json(&body))
            .await?;
        let created: NovaServerEnvelope = resp.json().await?;
        if !request.wait {
            return Ok(created.server.into_inventory(&request.name));
        }

        let this = self;
        let server_id: &str = &created.server.id;
        let waited = poll_until(self.server_wait, "server", server_id, || async move {
            let server = this.get_server(server_id).await?;
            let status = server.status.clone().unwrap_or_default();
            match status.as_str() {
                "ACTIVE" => Ok(Some(server)),
                "ERROR" => Err(CloudError::ResourceFailed {
                    resource: "server",
                    id: server_id.to_string(),
                    status: match server.fault.and_then(|f| f.message) {
                        Some(message) => format!("ERROR ({message})"),
                        None => "ERROR".to_string(),
                    },
                }),
                _ => Ok(None),
            }
        })
        .await;
        let server = match waited {
            Ok(server) => server,
            Err(e @ (CloudError::ResourceFailed { .. } | CloudError::Timeout { .. })) => {
                warn!("[OpenStack API] Server {} did not become ACTIVE: {}", server_id, e);
                self.discard_server(server_id).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        info!("[OpenStack API] Server {} ({}) is ACTIVE", request.name, server_id);
        Ok(server.into_inventory(&request.name))
    }
}
