// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! # Zegami Client Library
//!
//! A Rust client for the Zegami platform, where collections join a table of
//! rows to one or more sequences of images.
//!
//! ## Features
//!
//! - **Authentication**: token login with per-host token persistence
//! - **Browsing**: workspaces, collections and their image sources
//! - **Rows**: collection data as Polars DataFrames, filtered by column
//!   values or by tags
//! - **Images**: row to image index mapping, plain and signed image URLs,
//!   concurrent ordered downloads
//! - **Uploads**: chunked, concurrent image upload into a source and
//!   replacement of the row data
//! - **Annotations**: upload, listing and deletion, with a 1-bit mask codec
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use zegami_client::{Client, Error, RowFilter, SourceRef, UrlOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let client = Client::new()?.with_login("username", "password").await?;
//!
//!     let ws = client.workspace_by_name("Research").await?;
//!     let collection = ws.get_collection_by_name("Dogs").await?;
//!
//!     let rows = collection
//!         .get_rows_by_filter(&RowFilter::new().column("breed", ["Cairn"]))
//!         .await?;
//!     let urls = collection
//!         .get_image_urls(&rows, SourceRef::default(), &UrlOptions::default())
//!         .await?;
//!     println!("Found {} images", urls.len());
//!
//!     Ok(())
//! }
//! ```

mod annotation;
mod client;
mod collection;
mod config;
mod error;
mod lookup;
mod nodes;
mod retry;
mod source;
mod storage;
mod table;
mod transfer;
mod transport;
mod uploadable;
mod workspace;

#[cfg(test)]
mod test_support;

pub use crate::{
    annotation::{Annotation, MASK_FORMAT, MASK_TYPE, Mask, Uploadable},
    client::{Api, Client, UserInfo},
    collection::{
        Collection, DEFAULT_SIGNED_EXPIRY_DAYS, ProcessingState, ReplaceData, Rows, UrlOptions,
    },
    config::{ClientConfig, DEFAULT_HOME},
    error::{BatchFailure, Error},
    lookup::IndexLookup,
    nodes::{NewNode, NodeManager, NodeType},
    retry::{RetryScope, classify_url, create_retry_policy},
    source::{Source, SourceRef, SourceRegistry},
    storage::{FileTokenStorage, MemoryTokenStorage, StorageError, TokenStorage, token_file_name},
    table::{FilterValue, RowFilter, RowSubset, TagIndex, parse_rows, write_tsv},
    transfer::{
        BatchOptions, Progress, UPLOAD_CONCURRENCY, UploadSummary, chunk_size, download_batch,
        download_image, mime_for_extension, save_image_batch, sniff_mime, upload_images,
    },
    transport::{HttpRequest, HttpResponse, Method, RequestBody, ReqwestTransport, Transport},
    uploadable::UploadableSource,
    workspace::{NewCollection, Workspace},
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockTransport, png_bytes, test_client};
    use polars::prelude::*;
    use serde_json::json;
    use std::{path::PathBuf, sync::Arc};
    use tempfile::TempDir;

    #[ctor::ctor]
    fn init() {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    fn two_source_record() -> serde_json::Value {
        json!({
            "id": "c1",
            "name": "Pairs",
            "version": 2,
            "dataset_id": "d1",
            "upload_dataset_id": "u1",
            "status": {"progress": 100},
            "image_sources": [
                {"source_id": "s1", "name": "A", "imageset_id": "isA"},
                {"source_id": "s2", "name": "B", "imageset_id": "isB"}
            ]
        })
    }

    fn write_images(dir: &std::path::Path, prefix: &str, count: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let path = dir.join(format!("{}{:02}.png", prefix, i));
                std::fs::write(&path, png_bytes(4, 4, (i * 10) as u8)).unwrap();
                path
            })
            .collect()
    }

    #[tokio::test]
    async fn test_two_source_upload() {
        let mock = Arc::new(MockTransport::new());
        mock.route(
            Method::POST,
            "project/ws/collections",
            json!({"collection": two_source_record()}),
        );
        mock.route(Method::POST, "imagesets/isA/extend", json!({"new_size": 10}));
        mock.route(Method::POST, "imagesets/isB/extend", json!({"new_size": 10}));
        mock.route(
            Method::GET,
            "signed_blob_url",
            json!({"ids": ["blob"], "signed_urls": {"blob": "https://blob.test/blob?sig"}}),
        );
        mock.route(Method::PUT, "https://blob.test/", json!(null));
        mock.route(Method::POST, "images_bulk", json!({}));
        let client = test_client(mock.clone());

        let workspace = Workspace::new(
            client.clone(),
            crate::client::WorkspaceRecord {
                id: "ws".to_string(),
                name: "Research".to_string(),
            },
        );
        let collection = workspace
            .create_empty_collection(&NewCollection::new("Pairs").with_source("A").with_source("B"))
            .await
            .unwrap();
        assert_eq!(collection.sources().len(), 2);

        let dir = TempDir::new().unwrap();
        let dir_a = dir.path().join("A");
        let dir_b = dir.path().join("B");
        std::fs::create_dir_all(&dir_a).unwrap();
        std::fs::create_dir_all(&dir_b).unwrap();
        let files_a = write_images(&dir_a, "a", 10);
        let files_b = write_images(&dir_b, "b", 10);

        let names = files_a
            .iter()
            .chain(files_b.iter())
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        let data = df!("Filename" => names).unwrap();

        let mut uploads = [
            UploadableSource::new("A", &[&dir_a], "Filename").unwrap(),
            UploadableSource::new("B", &[&dir_b], "Filename").unwrap(),
        ];
        for (index, upload) in uploads.iter_mut().enumerate() {
            upload.register(collection.source(index).unwrap(), index).unwrap();
            upload.check_in_data(&data).unwrap();
        }
        for upload in uploads.iter_mut() {
            let summary = upload
                .upload(&client, workspace.id(), &BatchOptions::new())
                .await
                .unwrap();
            assert_eq!(summary.first_index, 0);
            assert_eq!(summary.uploaded, 10);
        }

        let calls = mock.calls();
        for imageset in ["isA", "isB"] {
            let extend = calls
                .iter()
                .find(|c| c.url.contains(&format!("imagesets/{}/extend", imageset)))
                .unwrap();
            assert_eq!(extend.json_body().unwrap()["delta"], 10);

            let mut starts = calls
                .iter()
                .filter(|c| c.url.contains(&format!("imagesets/{}/images_bulk", imageset)))
                .map(|c| {
                    assert_eq!(c.json_body().unwrap()["images"].as_array().unwrap().len(), 1);
                    c.url.rsplit("start=").next().unwrap().parse::<usize>().unwrap()
                })
                .collect::<Vec<_>>();
            starts.sort();
            assert_eq!(starts, (0..10).collect::<Vec<_>>());
        }
        assert_eq!(mock.count(Method::PUT, "https://blob.test/"), 20);
    }

    #[tokio::test]
    async fn test_add_images_binds_by_name_and_replaces_data() {
        let mock = Arc::new(MockTransport::new());
        mock.route(Method::GET, "collections/c1", json!({"collection": two_source_record()}));
        mock.route(Method::POST, "imagesets/isA/extend", json!({"new_size": 3}));
        mock.route(Method::POST, "imagesets/isB/extend", json!({"new_size": 5}));
        mock.route(
            Method::GET,
            "signed_blob_url",
            json!({"ids": ["blob"], "signed_urls": {"blob": "https://blob.test/blob?sig"}}),
        );
        mock.route(Method::PUT, "https://blob.test/", json!(null));
        mock.route(Method::POST, "images_bulk", json!({}));
        mock.route(
            Method::GET,
            "datasets/u1",
            json!({"dataset": {"id": "u1", "source": {"upload": {}}}}),
        );
        mock.route(Method::PUT, "datasets/u1", json!({}));
        let collection = Collection::from_record(
            test_client(mock.clone()),
            "ws",
            two_source_record(),
        )
        .unwrap();

        let dir = TempDir::new().unwrap();
        write_images(dir.path(), "x", 2);
        let data = df!("Filename" => ["x00.png", "x01.png"]).unwrap();

        // Declared in the opposite order of the collection's sources.
        let mut uploads = [
            UploadableSource::new("B", &[dir.path()], "Filename").unwrap(),
            UploadableSource::new("A", &[dir.path()], "Filename").unwrap(),
        ];
        let summaries = collection
            .add_images(&mut uploads, Some(data), &BatchOptions::new())
            .await
            .unwrap();

        assert_eq!(summaries[0].first_index, 3);
        assert_eq!(summaries[1].first_index, 1);
        assert_eq!(uploads[0].source().unwrap().imageset_id(), "isB");
        assert_eq!(mock.count(Method::PUT, "datasets/u1"), 1);
    }

    #[tokio::test]
    async fn test_rows_shared_across_tasks() {
        let mock = Arc::new(MockTransport::new());
        mock.route_bytes(
            Method::GET,
            "datasets/d1/file",
            b"Filename\na.png\nb.png\n".to_vec(),
            "text/tab-separated-values",
        );
        let collection = Arc::new(
            Collection::from_record(test_client(mock.clone()), "ws", two_source_record()).unwrap(),
        );

        let first = collection.rows().await.unwrap();
        let handles = (0..8)
            .map(|_| {
                let collection = collection.clone();
                tokio::spawn(async move { collection.rows().await.unwrap().height() })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), first.height());
        }
        assert_eq!(mock.count(Method::GET, "datasets/d1/file"), 1);
    }
}
