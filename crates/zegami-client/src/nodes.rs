// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Processing nodes of a workspace.
//!
//! Datasets and imagesets are nodes of the server-side processing graph. A
//! node names an action with its parameters and lists its parent nodes.

use crate::{Client, Error, client::Api};
use log::{debug, info};
use serde_json::{Map, Value, json};
use std::str::FromStr;

/// Node fields the server owns and rejects on update.
const READONLY_NODE_FIELDS: [&str; 5] = [
    "data_link",
    "id",
    "parent_versioning_values",
    "schema",
    "total_rows",
];

/// Kinds of node that can be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Dataset,
    Imageset,
}

impl NodeType {
    pub const ALL: [NodeType; 2] = [NodeType::Dataset, NodeType::Imageset];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Dataset => "dataset",
            NodeType::Imageset => "imageset",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                Error::InvalidParameters(format!(
                    "node type should be one of [{}], not '{}'",
                    NodeType::ALL.map(|t| t.as_str()).join(", "),
                    s
                ))
            })
    }
}

/// Definition of a node for [`NodeManager::add_node`].
#[derive(Debug, Clone)]
pub struct NewNode {
    name: String,
    node_type: NodeType,
    action: String,
    params: Map<String, Value>,
    dataset_parents: Vec<String>,
    imageset_parents: Vec<String>,
    node_group: Option<String>,
    processing_category: Option<String>,
}

impl NewNode {
    pub fn new(action: &str, node_type: NodeType) -> Self {
        NewNode {
            name: "New node".to_string(),
            node_type,
            action: action.to_string(),
            params: Map::new(),
            dataset_parents: Vec::new(),
            imageset_parents: Vec::new(),
            node_group: None,
            processing_category: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn with_dataset_parent(mut self, id: &str) -> Self {
        self.dataset_parents.push(id.to_string());
        self
    }

    pub fn with_imageset_parent(mut self, id: &str) -> Self {
        self.imageset_parents.push(id.to_string());
        self
    }

    pub fn with_node_group(mut self, group: &str) -> Self {
        self.node_group = Some(group.to_string());
        self
    }

    pub fn with_processing_category(mut self, category: &str) -> Self {
        self.processing_category = Some(category.to_string());
        self
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    fn body(&self) -> Result<Value, Error> {
        if self.action.is_empty() {
            return Err(Error::InvalidParameters("node action is empty".to_string()));
        }

        let mut source = Map::new();
        source.insert(self.action.clone(), Value::Object(self.params.clone()));
        if !self.dataset_parents.is_empty() {
            source.insert("dataset_id".to_string(), json!(self.dataset_parents));
        }
        if !self.imageset_parents.is_empty() {
            source.insert("imageset_id".to_string(), json!(self.imageset_parents));
        }

        let mut body = json!({
            "name": self.name,
            "source": source,
        });
        if let Some(group) = &self.node_group {
            body["node_groups"] = json!([group]);
        }
        if let Some(category) = &self.processing_category {
            body["processing_category"] = json!(category);
        }
        Ok(body)
    }
}

/// Creates and edits the processing nodes of one workspace.
#[derive(Debug, Clone)]
pub struct NodeManager {
    client: Client,
    workspace_id: String,
}

impl NodeManager {
    pub fn new(client: Client, workspace_id: &str) -> Self {
        NodeManager {
            client,
            workspace_id: workspace_id.to_string(),
        }
    }

    fn node_url(&self, node_type: NodeType, node_id: Option<&str>) -> String {
        let resource = match node_id {
            Some(id) => format!("{}s/{}", node_type, id),
            None => format!("{}s", node_type),
        };
        self.client
            .project_url(Api::V0, &self.workspace_id, &resource)
    }

    /// Creates a node and returns the server response, which holds the new
    /// node under its type name.
    pub async fn add_node(&self, node: &NewNode) -> Result<Value, Error> {
        let url = self.node_url(node.node_type, None);
        let resp: Value = self.client.post_json(&url, node.body()?).await?;
        let id = resp
            .get(node.node_type.as_str())
            .and_then(|n| n.get("id"))
            .and_then(Value::as_str)
            .ok_or(Error::InvalidResponse)?;
        info!("Created {} node {}", node.node_type, id);
        Ok(resp)
    }

    /// Appends `parent_id` to the parents of an existing node.
    pub async fn add_parent(
        &self,
        node_id: &str,
        parent_id: &str,
        node_type: NodeType,
    ) -> Result<(), Error> {
        let url = self.node_url(node_type, Some(node_id));
        let mut resp: Value = self.client.get_json(&url).await?;
        let mut node = match resp.get_mut(node_type.as_str()).map(Value::take) {
            Some(Value::Object(map)) => map,
            _ => return Err(Error::InvalidResponse),
        };
        for field in READONLY_NODE_FIELDS {
            node.remove(field);
        }

        let key = format!("{}_id", node_type);
        let parents = node
            .get_mut("source")
            .and_then(|source| source.as_object_mut())
            .map(|source| source.entry(key.as_str()).or_insert_with(|| json!([])))
            .and_then(Value::as_array_mut)
            .ok_or_else(|| {
                Error::MalformedRecord(format!("{} node {} has no {} list", node_type, node_id, key))
            })?;
        parents.push(json!(parent_id));

        let _: Value = self.client.put_json(&url, Value::Object(node)).await?;
        debug!("Added parent {} to {} node {}", parent_id, node_type, node_id);
        Ok(())
    }

    /// Image info entries of an imageset node, `null` for missing entries.
    pub async fn imageset_images(&self, node_id: &str) -> Result<Vec<Value>, Error> {
        let url = self.client.project_url(
            Api::V1,
            &self.workspace_id,
            &format!("nodes/{}/images", node_id),
        );
        let mut resp: Value = self.client.get_json(&url).await?;
        match resp.get_mut("images").map(Value::take) {
            Some(Value::Array(images)) => Ok(images),
            _ => Err(Error::InvalidResponse),
        }
    }

    /// Positions of the null entries of an imageset node.
    pub async fn null_imageset_entries(&self, node_id: &str) -> Result<Vec<usize>, Error> {
        let images = self.imageset_images(node_id).await?;
        Ok(images
            .iter()
            .enumerate()
            .filter(|(_, info)| info.is_null())
            .map(|(i, _)| i)
            .collect())
    }

    /// Asks the server to reprocess the null entries of an imageset node.
    pub async fn create_tasks_for_null_entries(&self, node_id: &str) -> Result<(), Error> {
        let url = self.client.project_url(
            Api::V1,
            &self.workspace_id,
            &format!("nodes/{}/create_tasks_for_null", node_id),
        );
        let _: Value = self.client.post_json(&url, json!({})).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_support::{MockTransport, test_client},
        transport::Method,
    };
    use std::sync::Arc;

    #[test]
    fn test_node_type_parse() {
        assert_eq!("imageset".parse::<NodeType>().unwrap(), NodeType::Imageset);
        match "collection".parse::<NodeType>() {
            Err(Error::InvalidParameters(msg)) => assert!(msg.contains("dataset, imageset")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_node_body() {
        let body = NewNode::new("mapping", NodeType::Dataset)
            .with_name("Joined")
            .with_param("columns", json!(["a"]))
            .with_dataset_parent("d1")
            .with_node_group("g1")
            .body()
            .unwrap();
        assert_eq!(body["name"], "Joined");
        assert_eq!(body["source"]["mapping"]["columns"], json!(["a"]));
        assert_eq!(body["source"]["dataset_id"], json!(["d1"]));
        assert!(body["source"].get("imageset_id").is_none());
        assert_eq!(body["node_groups"], json!(["g1"]));
        assert!(body.get("processing_category").is_none());
    }

    #[tokio::test]
    async fn test_add_node_posts_to_type_collection() {
        let mock = Arc::new(MockTransport::new());
        mock.route(Method::POST, "project/ws/imagesets", json!({"imageset": {"id": "n1"}}));
        let nodes = NodeManager::new(test_client(mock.clone()), "ws");

        let resp = nodes
            .add_node(&NewNode::new("file", NodeType::Imageset))
            .await
            .unwrap();
        assert_eq!(resp["imageset"]["id"], "n1");
        assert_eq!(mock.count(Method::POST, "api/v0/project/ws/imagesets"), 1);
    }

    #[tokio::test]
    async fn test_add_parent_strips_readonly_fields() {
        let mock = Arc::new(MockTransport::new());
        mock.route(
            Method::GET,
            "datasets/n1",
            json!({"dataset": {
                "id": "n1", "name": "node", "schema": {}, "data_link": "x",
                "source": {"mapping": {}, "dataset_id": ["p1"]}
            }}),
        );
        mock.route(Method::PUT, "datasets/n1", json!({}));
        let nodes = NodeManager::new(test_client(mock.clone()), "ws");

        nodes.add_parent("n1", "p2", NodeType::Dataset).await.unwrap();

        let put = mock
            .calls()
            .into_iter()
            .find(|c| c.method == Method::PUT)
            .unwrap();
        let body = put.json_body().unwrap();
        assert_eq!(body["source"]["dataset_id"], json!(["p1", "p2"]));
        assert!(body.get("id").is_none());
        assert!(body.get("data_link").is_none());
        assert_eq!(body["name"], "node");
    }

    #[tokio::test]
    async fn test_null_entries() {
        let mock = Arc::new(MockTransport::new());
        mock.route(
            Method::GET,
            "nodes/n1/images",
            json!({"images": [{"name": "a"}, null, {"name": "c"}, null]}),
        );
        mock.route(Method::POST, "nodes/n1/create_tasks_for_null", json!(null));
        let nodes = NodeManager::new(test_client(mock.clone()), "ws");

        assert_eq!(nodes.null_imageset_entries("n1").await.unwrap(), vec![1, 3]);
        nodes.create_tasks_for_null_entries("n1").await.unwrap();
        assert_eq!(mock.count(Method::POST, "create_tasks_for_null"), 1);
    }
}
