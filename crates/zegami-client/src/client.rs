// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    ClientConfig, Error, FileTokenStorage, MemoryTokenStorage, TokenStorage, Workspace,
    transport::{HttpRequest, HttpResponse, Method, ReqwestTransport, Transport},
};
use log::{debug, warn};
use serde::{Deserialize, de::DeserializeOwned};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;

/// Filters items by name and sorts by match quality.
///
/// Match quality priority (best to worst):
/// 1. Exact match (case-sensitive)
/// 2. Exact match (case-insensitive)
/// 3. Substring match (shorter names first, then alphabetically)
pub(crate) fn filter_and_sort_by_name<T, F>(items: Vec<T>, filter: &str, get_name: F) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    let filter_lower = filter.to_lowercase();
    let mut filtered: Vec<T> = items
        .into_iter()
        .filter(|item| get_name(item).to_lowercase().contains(&filter_lower))
        .collect();

    filtered.sort_by(|a, b| {
        let name_a = get_name(a);
        let name_b = get_name(b);

        let exact_a = name_a == filter;
        let exact_b = name_b == filter;
        if exact_a != exact_b {
            return exact_b.cmp(&exact_a);
        }

        let exact_ci_a = name_a.to_lowercase() == filter_lower;
        let exact_ci_b = name_b.to_lowercase() == filter_lower;
        if exact_ci_a != exact_ci_b {
            return exact_ci_b.cmp(&exact_ci_a);
        }

        name_a.len().cmp(&name_b.len()).then_with(|| name_a.cmp(name_b))
    });

    filtered
}

/// REST API generation used to build a project URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Api {
    V0,
    V1,
}

impl std::fmt::Display for Api {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Api::V0 => write!(f, "api/v0"),
            Api::V1 => write!(f, "api/v1"),
        }
    }
}

#[derive(Deserialize)]
struct LoginResult {
    token: String,
}

#[derive(Deserialize)]
struct SignedBlobUrls {
    ids: Vec<String>,
    signed_urls: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WorkspaceRecord {
    pub(crate) id: String,
    pub(crate) name: String,
}

/// The authenticated user as reported by `oauth/userinfo`.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    name: String,
    #[serde(default)]
    email: String,
    #[serde(default, rename = "projects")]
    workspaces: Vec<WorkspaceRecord>,
}

impl UserInfo {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    /// `(id, name)` of every workspace the user can access.
    pub fn workspaces(&self) -> Vec<(&str, &str)> {
        self.workspaces
            .iter()
            .map(|ws| (ws.id.as_str(), ws.name.as_str()))
            .collect()
    }
}

/// Client for the Zegami platform.
///
/// A `Client` holds the server URL, the bearer token and the HTTP
/// [`Transport`]. It is cheap to clone; clones share the token, so a login
/// through one clone is visible to all of them.
///
/// # Examples
///
/// ```rust,no_run
/// use zegami_client::Client;
///
/// # async fn example() -> Result<(), zegami_client::Error> {
/// let client = Client::new()?
///     .with_login("user@example.com", "password")
///     .await?;
///
/// let workspace = client.workspace_by_name("My Workspace").await?;
/// for collection in workspace.collections().await? {
///     println!("{}", collection.name());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
    url: String,
    token: Arc<RwLock<String>>,
    storage: Option<Arc<dyn TokenStorage>>,
    /// True while `storage` is the default per-host token file.
    host_storage: bool,
    config: Arc<ClientConfig>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.url)
            .field("has_storage", &self.storage.is_some())
            .field("config", &self.config)
            .finish()
    }
}

fn load_token(storage: &dyn TokenStorage) -> String {
    match storage.load() {
        Ok(Some(token)) => token,
        Ok(None) => String::new(),
        Err(e) => {
            warn!(
                "Failed to load token from storage: {}. Starting with empty token.",
                e
            );
            String::new()
        }
    }
}

impl Client {
    /// Create a new client from the layered [`ClientConfig`].
    ///
    /// The token is loaded from the per-host [`FileTokenStorage`] when one
    /// exists. Use [`with_login`][Self::with_login] or
    /// [`with_token`][Self::with_token] to authenticate.
    pub fn new() -> Result<Self, Error> {
        Self::from_config(ClientConfig::load()?)
    }

    /// Create a new client from an explicit configuration.
    pub fn from_config(config: ClientConfig) -> Result<Self, Error> {
        let config = ClientConfig {
            home: config.home.trim_end_matches('/').to_string(),
            ..config
        };
        let transport = ReqwestTransport::new(&config)?;

        let storage: Option<Arc<dyn TokenStorage>> = match FileTokenStorage::for_host(&config.home)
        {
            Ok(storage) => Some(Arc::new(storage)),
            Err(e) => {
                warn!("Token file storage unavailable: {}", e);
                None
            }
        };
        let token = storage
            .as_deref()
            .map(load_token)
            .unwrap_or_default();

        Ok(Client {
            transport: Arc::new(transport),
            url: config.home.clone(),
            token: Arc::new(RwLock::new(token)),
            host_storage: storage.is_some(),
            storage,
            config: Arc::new(config),
        })
    }

    /// Create a client over an explicit transport, with no token storage and
    /// no token.
    pub fn from_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Client {
            transport,
            url: config.home.trim_end_matches('/').to_string(),
            token: Arc::new(RwLock::new(String::new())),
            storage: None,
            host_storage: false,
            config: Arc::new(config),
        }
    }

    /// Returns a new client talking to another deployment.
    ///
    /// With the default per-host storage, the token file of the new host is
    /// loaded. Otherwise the token is dropped since tokens are only valid on
    /// the server that issued them.
    pub fn with_home(&self, home: &str) -> Result<Self, Error> {
        let home = home.trim_end_matches('/').to_string();
        url::Url::parse(&home)?;

        let (storage, token) = if self.host_storage {
            let storage = FileTokenStorage::for_host(&home)?;
            let token = load_token(&storage);
            (Some(Arc::new(storage) as Arc<dyn TokenStorage>), token)
        } else {
            (self.storage.clone(), String::new())
        };

        Ok(Client {
            url: home.clone(),
            token: Arc::new(RwLock::new(token)),
            storage,
            config: Arc::new(ClientConfig {
                home,
                ..(*self.config).clone()
            }),
            ..self.clone()
        })
    }

    /// Returns a new client with the specified token storage backend.
    pub fn with_storage(self, storage: Arc<dyn TokenStorage>) -> Self {
        let token = load_token(storage.as_ref());

        Client {
            token: Arc::new(RwLock::new(token)),
            storage: Some(storage),
            host_storage: false,
            ..self
        }
    }

    /// Returns a new client with in-memory token storage (no persistence).
    pub fn with_memory_storage(self) -> Self {
        Client {
            token: Arc::new(RwLock::new(String::new())),
            storage: Some(Arc::new(MemoryTokenStorage::new())),
            host_storage: false,
            ..self
        }
    }

    /// Returns a new client with no token storage.
    pub fn with_no_storage(self) -> Self {
        Client {
            storage: None,
            host_storage: false,
            ..self
        }
    }

    /// Returns a new client sending its requests through `transport`.
    pub fn with_transport(self, transport: Arc<dyn Transport>) -> Self {
        Client { transport, ..self }
    }

    /// Returns a new client authenticated with the provided username and
    /// password.
    ///
    /// The token is requested without expiry and persisted to storage (if
    /// configured).
    pub async fn with_login(&self, username: &str, password: &str) -> Result<Self, Error> {
        let url = format!("{}/oauth/token/", self.url);
        let body = serde_json::json!({
            "username": username,
            "password": password,
            "noexpire": true,
        });
        let login: LoginResult = self.post_json(&url, body).await?;

        if login.token.is_empty() {
            return Err(Error::EmptyToken);
        }

        if let Some(ref storage) = self.storage
            && let Err(e) = storage.store(&login.token)
        {
            warn!("Failed to persist token to storage: {}", e);
        }

        Ok(Client {
            token: Arc::new(RwLock::new(login.token)),
            ..self.clone()
        })
    }

    /// Returns a new client using an existing token.
    ///
    /// An empty token leaves the client unchanged.
    pub fn with_token(&self, token: &str) -> Self {
        let token = token.trim();
        if token.is_empty() {
            return self.clone();
        }

        if let Some(ref storage) = self.storage
            && let Err(e) = storage.store(token)
        {
            warn!("Failed to persist token to storage: {}", e);
        }

        Client {
            token: Arc::new(RwLock::new(token.to_string())),
            ..self.clone()
        }
    }

    /// Persist the current token to storage.
    pub async fn save_token(&self) -> Result<(), Error> {
        let token = self.token.read().await;
        match self.storage {
            Some(ref storage) => {
                storage.store(&token)?;
                debug!("Token saved to storage");
                Ok(())
            }
            None => Err(Error::InvalidParameters(
                "Client has no token storage configured".to_string(),
            )),
        }
    }

    /// Clear the token from memory and from storage (if configured).
    pub async fn logout(&self) -> Result<(), Error> {
        {
            let mut token = self.token.write().await;
            token.clear();
        }

        if let Some(ref storage) = self.storage
            && let Err(e) = storage.clear()
        {
            warn!("Failed to clear token from storage: {}", e);
        }

        Ok(())
    }

    /// Return the token used to authenticate the client with the server.
    pub async fn token(&self) -> String {
        self.token.read().await.clone()
    }

    /// Base URL of the deployment, without a trailing slash.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Fetch the authenticated user's name, email and workspaces.
    pub async fn user_info(&self) -> Result<UserInfo, Error> {
        let url = format!("{}/oauth/userinfo/", self.url);
        self.get_json(&url).await
    }

    /// List every workspace available to the authenticated user.
    pub async fn workspaces(&self) -> Result<Vec<Workspace>, Error> {
        let info = self.user_info().await?;
        Ok(info
            .workspaces
            .into_iter()
            .map(|record| Workspace::new(self.clone(), record))
            .collect())
    }

    /// Find a workspace by name, ignoring case.
    pub async fn workspace_by_name(&self, name: &str) -> Result<Workspace, Error> {
        let workspaces = self.workspaces().await?;
        let wanted = name.to_lowercase();
        let names = workspaces
            .iter()
            .map(|ws| ws.name().to_string())
            .collect::<Vec<_>>();

        workspaces
            .into_iter()
            .find(|ws| ws.name().to_lowercase() == wanted)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "workspace '{}', available: [{}]",
                    name,
                    names.join(", ")
                ))
            })
    }

    /// Find a workspace by id.
    pub async fn workspace_by_id(&self, id: &str) -> Result<Workspace, Error> {
        let workspaces = self.workspaces().await?;
        let ids = workspaces
            .iter()
            .map(|ws| ws.id().to_string())
            .collect::<Vec<_>>();

        workspaces
            .into_iter()
            .find(|ws| ws.id() == id)
            .ok_or_else(|| {
                Error::NotFound(format!("workspace id '{}', available: [{}]", id, ids.join(", ")))
            })
    }

    /// Builds `{home}/{api}/project/{workspace_id}/{resource}`.
    pub fn project_url(&self, api: Api, workspace_id: &str, resource: &str) -> String {
        format!(
            "{}/{}/project/{}/{}",
            self.url,
            api,
            workspace_id,
            resource.trim_start_matches('/')
        )
    }

    /// Sends a request, attaching the bearer token to platform URLs only.
    pub(crate) async fn send(&self, mut request: HttpRequest) -> Result<HttpResponse, Error> {
        if request.url.starts_with(&self.url) {
            let token = self.token.read().await;
            if !token.is_empty() {
                request = request.header("Authorization", format!("Bearer {}", token));
            }
        }

        debug!("{} {}", request.method, request.url);
        let platform = request.url.starts_with(&self.url);
        let resp = self.transport.send(request).await?;

        if platform && resp.status == 401 {
            return Err(Error::Unauthorized(
                String::from_utf8_lossy(&resp.body).into_owned(),
            ));
        }

        resp.error_for_status()
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, Error> {
        let resp = self.send(HttpRequest::new(Method::GET, url)).await?;
        decode(&resp)
    }

    pub(crate) async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<T, Error> {
        let resp = self
            .send(HttpRequest::new(Method::POST, url).json(body))
            .await?;
        decode(&resp)
    }

    pub(crate) async fn put_json<T: DeserializeOwned>(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<T, Error> {
        let resp = self
            .send(HttpRequest::new(Method::PUT, url).json(body))
            .await?;
        decode(&resp)
    }

    pub(crate) async fn delete(&self, url: &str) -> Result<(), Error> {
        self.send(HttpRequest::new(Method::DELETE, url)).await?;
        Ok(())
    }

    /// GET raw bytes together with the response content type.
    pub(crate) async fn get_bytes(&self, url: &str) -> Result<(Vec<u8>, Option<String>), Error> {
        let resp = self.send(HttpRequest::new(Method::GET, url)).await?;
        Ok((resp.body, resp.content_type))
    }

    /// Request `count` signed blob upload URLs, optionally under `blob_path`.
    ///
    /// Returns the id to URL map and the ids in server order.
    pub async fn signed_blob_urls(
        &self,
        workspace_id: &str,
        count: usize,
        blob_path: Option<&str>,
    ) -> Result<(HashMap<String, String>, Vec<String>), Error> {
        if count == 0 {
            return Err(Error::InvalidParameters(
                "signed blob URL count must be at least 1".to_string(),
            ));
        }

        let mut url = self.project_url(
            Api::V1,
            workspace_id,
            &format!("signed_blob_url?count={}", count),
        );
        if let Some(path) = blob_path {
            url.push_str("&blob_path=");
            url.push_str(path);
        }

        let signed: SignedBlobUrls = self.get_json(&url).await?;
        if signed.ids.len() != count || signed.ids.iter().any(|id| !signed.signed_urls.contains_key(id))
        {
            return Err(Error::MalformedRecord(format!(
                "expected {} signed blob URLs, got {} ids and {} urls",
                count,
                signed.ids.len(),
                signed.signed_urls.len()
            )));
        }

        Ok((signed.signed_urls, signed.ids))
    }

    /// Upload bytes to a signed blob URL as a block blob.
    pub async fn upload_to_signed_url(
        &self,
        data: Vec<u8>,
        url: &str,
        mime_type: &str,
    ) -> Result<(), Error> {
        let size = data.len();
        let request = HttpRequest::new(Method::PUT, url)
            .header("x-ms-blob-type", "BlockBlob")
            .header("Content-Type", mime_type)
            .bytes(data);

        self.send(request).await?;
        debug!("Uploaded {} bytes ({})", size, mime_type);
        Ok(())
    }
}

/// Decodes a JSON body; an empty body decodes as `null`.
fn decode<T: DeserializeOwned>(resp: &HttpResponse) -> Result<T, Error> {
    if resp.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::from_value(serde_json::Value::Null)?);
    }
    resp.json()
}
