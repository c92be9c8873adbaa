// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    Client, Collection, Error, NodeManager,
    client::{Api, WorkspaceRecord, filter_and_sort_by_name},
    transfer::sniff_mime,
};
use log::{debug, warn};
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

/// Parameters of [`Workspace::create_empty_collection`].
#[derive(Debug, Clone)]
pub struct NewCollection {
    pub name: String,
    pub description: String,
    pub dynamic: bool,
    pub version: u32,
    /// Names of the image sources to declare, version 2 and later only.
    pub image_sources: Vec<String>,
}

impl NewCollection {
    pub fn new(name: &str) -> Self {
        NewCollection {
            name: name.to_string(),
            description: String::new(),
            dynamic: false,
            version: 2,
            image_sources: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_source(mut self, name: &str) -> Self {
        self.image_sources.push(name.to_string());
        self
    }

    fn body(&self) -> Result<Value, Error> {
        if self.name.is_empty() {
            return Err(Error::InvalidParameters("collection name is empty".to_string()));
        }

        let mut body = json!({
            "name": self.name,
            "description": self.description,
            "dynamic": self.dynamic,
            "version": self.version,
            "upload_dataset": {"source": {"upload": {}}},
        });

        if !self.image_sources.is_empty() {
            if self.version < 2 {
                return Err(Error::InvalidParameters(format!(
                    "version {} collections have a single image source",
                    self.version
                )));
            }
            let mut seen = std::collections::HashSet::new();
            if let Some(dup) = self.image_sources.iter().find(|name| !seen.insert(*name)) {
                return Err(Error::InvalidParameters(format!(
                    "image source name '{}' is used twice",
                    dup
                )));
            }
            body["image_sources"] = self
                .image_sources
                .iter()
                .map(|name| json!({ "name": name }))
                .collect();
        }

        Ok(body)
    }
}

#[derive(Deserialize)]
struct StorageSignedUrl {
    id: String,
    signedurl: String,
}

/// A workspace (project) the user has access to.
#[derive(Debug, Clone)]
pub struct Workspace {
    client: Client,
    id: String,
    name: String,
}

impl std::fmt::Display for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.id, self.name)
    }
}

impl Workspace {
    pub(crate) fn new(client: Client, record: WorkspaceRecord) -> Self {
        Workspace {
            client,
            id: record.id,
            name: record.name,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Every collection of the workspace. Records that fail validation are
    /// skipped with a warning.
    pub async fn collections(&self) -> Result<Vec<Collection>, Error> {
        let url = self.client.project_url(Api::V0, &self.id, "collections/");
        let resp: Value = self.client.get_json(&url).await?;
        let records = match resp.get("collections") {
            Some(Value::Array(records)) => records.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(_) => return Err(Error::InvalidResponse),
        };

        let mut collections = Vec::with_capacity(records.len());
        for record in records {
            match Collection::from_record(self.client.clone(), &self.id, record) {
                Ok(collection) => collections.push(collection),
                Err(e) => warn!("Skipping collection in workspace {}: {}", self.id, e),
            }
        }
        debug!("Workspace {} has {} collection(s)", self.id, collections.len());
        Ok(collections)
    }

    /// Collections whose name contains `filter`, best matches first.
    pub async fn find_collections(&self, filter: &str) -> Result<Vec<Collection>, Error> {
        let collections = self.collections().await?;
        Ok(filter_and_sort_by_name(collections, filter, |c| c.name()))
    }

    /// The collection named `name`, ignoring case.
    pub async fn get_collection_by_name(&self, name: &str) -> Result<Collection, Error> {
        let collections = self.collections().await?;
        let wanted = name.to_lowercase();
        let names = collections
            .iter()
            .map(|c| c.name().to_string())
            .collect::<Vec<_>>();

        collections
            .into_iter()
            .find(|c| c.name().to_lowercase() == wanted)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "collection '{}' in workspace {}, available: [{}]",
                    name,
                    self.name,
                    names.join(", ")
                ))
            })
    }

    pub async fn get_collection_by_id(&self, id: &str) -> Result<Collection, Error> {
        let url = self
            .client
            .project_url(Api::V0, &self.id, &format!("collections/{}", id));
        let resp: Value = match self.client.get_json(&url).await {
            Ok(resp) => resp,
            Err(Error::HttpStatus(404, _, _)) => {
                return Err(Error::NotFound(format!(
                    "collection id '{}' in workspace {}",
                    id, self.name
                )));
            }
            Err(e) => return Err(e),
        };
        let record = resp.get("collection").cloned().ok_or(Error::InvalidResponse)?;
        Collection::from_record(self.client.clone(), &self.id, record)
    }

    /// Creates a collection without images or data, to be filled with
    /// [`Collection::add_images`] and [`Collection::replace_data`].
    pub async fn create_empty_collection(&self, new: &NewCollection) -> Result<Collection, Error> {
        let body = new.body()?;
        let url = self.client.project_url(Api::V0, &self.id, "collections");
        let resp: Value = self.client.post_json(&url, body).await?;
        let record = resp.get("collection").cloned().ok_or(Error::InvalidResponse)?;
        let collection = Collection::from_record(self.client.clone(), &self.id, record)?;
        debug!("Created collection {} ({})", collection.name(), collection.id());
        Ok(collection)
    }

    /// Stores an arbitrary blob in the workspace and returns its id.
    ///
    /// The MIME type is sniffed from the content when not given.
    pub async fn create_storage_item(
        &self,
        data: Vec<u8>,
        mime_type: Option<&str>,
    ) -> Result<String, Error> {
        let mime_type = mime_type
            .map(str::to_string)
            .unwrap_or_else(|| sniff_mime(&data));

        let url = self.client.project_url(Api::V1, &self.id, "storage/signedurl");
        let signed: StorageSignedUrl = self.client.get_json(&url).await?;
        let blob_url = storage_blob_url(&signed.signedurl, &signed.id)?;

        self.client
            .upload_to_signed_url(data, &blob_url, &mime_type)
            .await?;
        debug!("Created storage item {} ({})", signed.id, mime_type);
        Ok(signed.id)
    }

    /// Contents and content type of a storage item.
    pub async fn get_storage_item(
        &self,
        storage_id: &str,
    ) -> Result<(Vec<u8>, Option<String>), Error> {
        let url = self
            .client
            .project_url(Api::V1, &self.id, &format!("storage/{}", storage_id));
        self.client.get_bytes(&url).await
    }

    pub async fn delete_storage_item(&self, storage_id: &str) -> Result<(), Error> {
        let url = self
            .client
            .project_url(Api::V1, &self.id, &format!("storage/{}", storage_id));
        self.client.delete(&url).await
    }

    /// Processing node helper of this workspace.
    pub fn nodes(&self) -> NodeManager {
        NodeManager::new(self.client.clone(), &self.id)
    }
}

/// Blob address of storage item `id` under the container of a signed
/// container URL, keeping its signature.
fn storage_blob_url(signed: &str, id: &str) -> Result<String, Error> {
    let mut url = Url::parse(signed)?;
    let container = url
        .path_segments()
        .and_then(|mut segments| segments.find(|s| !s.is_empty()))
        .map(str::to_string)
        .ok_or_else(|| Error::MalformedRecord(format!("signed url {} has no container", signed)))?;
    url.set_path(&format!("{}/storage/{}", container, id));
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_support::{MockTransport, test_client},
        transport::Method,
    };
    use std::sync::Arc;

    fn workspace(mock: Arc<MockTransport>) -> Workspace {
        Workspace::new(
            test_client(mock),
            WorkspaceRecord {
                id: "ws".to_string(),
                name: "Research".to_string(),
            },
        )
    }

    #[test]
    fn test_storage_blob_url() {
        let url = storage_blob_url("https://acct.blob.test/container/tmp?sv=1&sig=abc", "item7").unwrap();
        assert_eq!(url, "https://acct.blob.test/container/storage/item7?sv=1&sig=abc");
    }

    #[test]
    fn test_new_collection_body() {
        let body = NewCollection::new("Dogs")
            .with_source("A")
            .with_source("B")
            .body()
            .unwrap();
        assert_eq!(body["version"], 2);
        assert_eq!(body["upload_dataset"], json!({"source": {"upload": {}}}));
        assert_eq!(body["image_sources"], json!([{"name": "A"}, {"name": "B"}]));

        assert!(NewCollection::new("Dogs").with_source("A").with_source("A").body().is_err());
        assert!(NewCollection::new("").body().is_err());
    }

    #[tokio::test]
    async fn test_collections_skip_malformed_records() {
        let mock = Arc::new(MockTransport::new());
        mock.route(
            Method::GET,
            "collections/",
            json!({"collections": [
                {"id": "c1", "name": "Dogs", "imageset_id": "is1"},
                {"id": "c2", "name": "Broken", "version": 2},
                {"id": "c3", "name": "dogs and cats", "imageset_id": "is3"}
            ]}),
        );
        let ws = workspace(mock);

        assert_eq!(ws.collections().await.unwrap().len(), 2);
        assert_eq!(ws.get_collection_by_name("DOGS").await.unwrap().id(), "c1");
        match ws.get_collection_by_name("Birds").await {
            Err(Error::NotFound(msg)) => assert!(msg.contains("Dogs")),
            other => panic!("unexpected result: {:?}", other.map(|c| c.id().to_string())),
        }

        let found = ws.find_collections("dogs").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id(), "c1");
    }

    #[tokio::test]
    async fn test_storage_item_lifecycle() {
        let mock = Arc::new(MockTransport::new());
        mock.route(
            Method::GET,
            "storage/signedurl",
            json!({"id": "item7", "signedurl": "https://acct.blob.test/container/x?sig=abc"}),
        );
        mock.route(Method::PUT, "https://acct.blob.test/", json!(null));
        mock.route_bytes(Method::GET, "storage/item7", b"hello".to_vec(), "text/plain");
        mock.route(Method::DELETE, "storage/item7", json!(null));
        let ws = workspace(mock.clone());

        let id = ws.create_storage_item(b"hello".to_vec(), None).await.unwrap();
        assert_eq!(id, "item7");
        let put = mock
            .calls()
            .into_iter()
            .find(|c| c.method == Method::PUT)
            .unwrap();
        assert_eq!(put.url, "https://acct.blob.test/container/storage/item7?sig=abc");
        assert_eq!(put.header_value("content-type"), Some("application/octet-stream"));

        let (bytes, mime) = ws.get_storage_item("item7").await.unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(mime.as_deref(), Some("text/plain"));
        ws.delete_storage_item("item7").await.unwrap();
    }

    #[tokio::test]
    async fn test_collection_by_id_not_found() {
        let mock = Arc::new(MockTransport::new());
        let ws = workspace(mock);
        assert!(matches!(
            ws.get_collection_by_id("nope").await,
            Err(Error::NotFound(_))
        ));
    }
}
