use crate::{inventory, CloudConnection, CloudConnector, CloudError, CreateServerRequest, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Default)]
struct MockState {
    images: Vec<inventory::Image>,
    servers: Vec<inventory::Server>,
    projects: Vec<inventory::Project>,
    connected_clouds: Vec<String>,
    deleted_images: Vec<String>,
    created_image_files: Vec<PathBuf>,
    server_requests: Vec<CreateServerRequest>,
    reject_credentials: bool,
    reject_project_listing: bool,
    failing_server_creates: u32,
    fail_image_creates: bool,
    refuse_image_deletes: bool,
}

/// In-memory cloud. Every connection shares the same catalog, so tests can
/// inspect what the pipeline left behind and inject control-plane failures.
#[derive(Clone, Default)]
pub struct MockCloud {
    state: Arc<Mutex<MockState>>,
}

impl MockCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed an `active` image directly into the catalog.
    pub fn insert_image(&self, name: &str) -> inventory::Image {
        let image = inventory::Image {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            status: "active".to_string(),
            created_at: Some(chrono::Utc::now()),
        };
        self.state().images.push(image.clone());
        image
    }

    pub fn set_projects(&self, projects: Vec<inventory::Project>) {
        self.state().projects = projects;
    }

    pub fn reject_credentials(&self, reject: bool) {
        self.state().reject_credentials = reject;
    }

    pub fn reject_project_listing(&self, reject: bool) {
        self.state().reject_project_listing = reject;
    }

    /// The next `count` server creations fail with a 500 from the compute API.
    pub fn fail_next_server_creates(&self, count: u32) {
        self.state().failing_server_creates = count;
    }

    pub fn fail_image_creates(&self, fail: bool) {
        self.state().fail_image_creates = fail;
    }

    /// `delete_image` reports `false` (nothing deleted) for every image.
    pub fn refuse_image_deletes(&self, refuse: bool) {
        self.state().refuse_image_deletes = refuse;
    }

    pub fn images(&self) -> Vec<inventory::Image> {
        self.state().images.clone()
    }

    pub fn images_named(&self, name: &str) -> Vec<inventory::Image> {
        self.state()
            .images
            .iter()
            .filter(|image| image.name == name)
            .cloned()
            .collect()
    }

    pub fn servers(&self) -> Vec<inventory::Server> {
        self.state().servers.clone()
    }

    pub fn server_requests(&self) -> Vec<CreateServerRequest> {
        self.state().server_requests.clone()
    }

    pub fn connected_clouds(&self) -> Vec<String> {
        self.state().connected_clouds.clone()
    }

    pub fn deleted_images(&self) -> Vec<String> {
        self.state().deleted_images.clone()
    }

    pub fn created_image_files(&self) -> Vec<PathBuf> {
        self.state().created_image_files.clone()
    }
}

#[async_trait]
impl CloudConnector for MockCloud {
    async fn connect(
        &self,
        cloud_name: &str,
        _profile: &serde_yaml::Value,
    ) -> Result<Box<dyn CloudConnection>> {
        let mut state = self.state();
        state.connected_clouds.push(cloud_name.to_string());
        if state.reject_credentials {
            return Err(CloudError::Unauthorized(format!(
                "mock cloud {cloud_name} rejected credentials"
            )));
        }
        debug!("[Mock Cloud] connected to {}", cloud_name);
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl CloudConnection for MockCloud {
    async fn list_projects(&self) -> Result<Vec<inventory::Project>> {
        let state = self.state();
        if state.reject_project_listing {
            return Err(CloudError::Unauthorized("GET /v3/auth/projects".to_string()));
        }
        Ok(state.projects.clone())
    }

    async fn search_images(&self, name_or_id: &str) -> Result<Vec<inventory::Image>> {
        Ok(self
            .state()
            .images
            .iter()
            .filter(|image| image.name == name_or_id || image.id == name_or_id)
            .cloned()
            .collect())
    }

    async fn delete_image(&self, image_id: &str, _wait: bool) -> Result<bool> {
        let mut state = self.state();
        if state.refuse_image_deletes {
            return Ok(false);
        }
        let before = state.images.len();
        state.images.retain(|image| image.id != image_id);
        if state.images.len() == before {
            return Ok(false);
        }
        state.deleted_images.push(image_id.to_string());
        Ok(true)
    }

    async fn create_image(
        &self,
        name: &str,
        filename: &Path,
        _wait: bool,
    ) -> Result<inventory::Image> {
        let mut state = self.state();
        if state.fail_image_creates {
            return Err(CloudError::Api {
                method: "POST".to_string(),
                url: "mock://image/v2/images".to_string(),
                status: 503,
                body: "image service unavailable".to_string(),
            });
        }
        let image = inventory::Image {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            status: "active".to_string(),
            created_at: Some(chrono::Utc::now()),
        };
        state.created_image_files.push(filename.to_path_buf());
        state.images.push(image.clone());
        Ok(image)
    }

    async fn create_server(&self, request: &CreateServerRequest) -> Result<inventory::Server> {
        let mut state = self.state();
        state.server_requests.push(request.clone());
        if state.failing_server_creates > 0 {
            state.failing_server_creates -= 1;
            return Err(CloudError::Api {
                method: "POST".to_string(),
                url: "mock://compute/servers".to_string(),
                status: 500,
                body: "no valid host was found".to_string(),
            });
        }
        let server = inventory::Server {
            id: uuid::Uuid::new_v4().to_string(),
            name: request.name.clone(),
            status: "ACTIVE".to_string(),
            image_id: Some(request.image_id.clone()),
            flavor: Some(request.flavor.clone()),
        };
        state.servers.push(server.clone());
        Ok(server)
    }
}
