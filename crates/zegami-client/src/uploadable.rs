// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Local image folders staged for upload into a collection source.

use crate::{
    BatchOptions, Client, Error, Source, UploadSummary,
    transfer::{mime_for_extension, upload_images},
};
use log::{debug, warn};
use polars::prelude::*;
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
enum UploadState {
    Constructed,
    Registered { source: Source, index: usize },
    Uploaded { source: Source, summary: UploadSummary },
}

/// Image files destined for one named source of a collection.
///
/// An `UploadableSource` starts detached. It must be bound to the target
/// source with [`register`][Self::register] before [`upload`][Self::upload]
/// can run, and it uploads exactly once.
///
/// ```rust,no_run
/// # use zegami_client::{BatchOptions, Client, UploadableSource};
/// # async fn example(client: Client) -> Result<(), zegami_client::Error> {
/// let ws = client.workspace_by_name("Research").await?;
/// let collection = ws.get_collection_by_name("Dogs").await?;
///
/// let mut staged = UploadableSource::new("original", &["images/original"], "ImageName")?;
/// staged.register(collection.source("original")?, 0)?;
/// staged.upload(&client, ws.id(), &BatchOptions::new()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct UploadableSource {
    name: String,
    files: Vec<PathBuf>,
    column_filename: String,
    mime_type: Option<String>,
    state: UploadState,
}

impl UploadableSource {
    /// Collects the files under `paths`.
    ///
    /// Directories are walked recursively and contribute the files with a
    /// known image extension. Files named explicitly are kept as given. The
    /// resulting list is sorted.
    pub fn new<P: AsRef<Path>>(
        name: &str,
        paths: &[P],
        column_filename: &str,
    ) -> Result<Self, Error> {
        if name.is_empty() {
            return Err(Error::InvalidParameters(
                "uploadable source name is empty".to_string(),
            ));
        }

        let mut files = Vec::new();
        for path in paths {
            let path = path.as_ref();
            if path.is_dir() {
                for entry in WalkDir::new(path).follow_links(true) {
                    let entry = match entry {
                        Ok(entry) => entry,
                        Err(e) => {
                            warn!("Skipping unreadable entry under {:?}: {}", path, e);
                            continue;
                        }
                    };
                    if entry.file_type().is_file() && mime_for_extension(entry.path()).is_some() {
                        files.push(entry.into_path());
                    }
                }
            } else if path.is_file() {
                files.push(path.to_path_buf());
            } else {
                return Err(Error::InvalidParameters(format!(
                    "path {:?} of source '{}' does not exist",
                    path, name
                )));
            }
        }
        files.sort();
        files.dedup();

        if files.is_empty() {
            warn!("Uploadable source '{}' holds no image files", name);
        }
        debug!("Staged {} file(s) for source '{}'", files.len(), name);

        Ok(UploadableSource {
            name: name.to_string(),
            files,
            column_filename: column_filename.to_string(),
            mime_type: None,
            state: UploadState::Constructed,
        })
    }

    /// Sends every file with this MIME type instead of inferring it from the
    /// extension.
    pub fn with_mime_type(mut self, mime_type: &str) -> Self {
        self.mime_type = Some(mime_type.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Data column holding the image file names.
    pub fn column_filename(&self) -> &str {
        &self.column_filename
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    /// The bound source, once registered.
    pub fn source(&self) -> Option<&Source> {
        match &self.state {
            UploadState::Constructed => None,
            UploadState::Registered { source, .. } | UploadState::Uploaded { source, .. } => {
                Some(source)
            }
        }
    }

    /// Position of this uploadable among those added together.
    pub fn index(&self) -> Option<usize> {
        match &self.state {
            UploadState::Registered { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self.state, UploadState::Registered { .. })
    }

    /// Result of the upload, once it has run.
    pub fn summary(&self) -> Option<&UploadSummary> {
        match &self.state {
            UploadState::Uploaded { summary, .. } => Some(summary),
            _ => None,
        }
    }

    /// Binds this uploadable to `source`.
    ///
    /// The source's name must equal the uploadable's name, except for the
    /// unnamed pseudo-source of a version 1 collection.
    pub fn register(&mut self, source: Source, index: usize) -> Result<(), Error> {
        if let UploadState::Uploaded { .. } = self.state {
            return Err(Error::InvalidParameters(format!(
                "uploadable source '{}' was already uploaded",
                self.name
            )));
        }

        if !source.is_pseudo() && source.name() != Some(self.name.as_str()) {
            return Err(Error::InvalidParameters(format!(
                "uploadable source '{}' cannot be bound to source '{}'",
                self.name,
                source.name().unwrap_or_default()
            )));
        }

        debug!("Registered '{}' to {} at {}", self.name, source, index);
        self.state = UploadState::Registered { source, index };
        Ok(())
    }

    /// Checks that `data` has the file name column. Files not named in the
    /// column are reported as warnings.
    pub fn check_in_data(&self, data: &DataFrame) -> Result<(), Error> {
        let column = data.column(&self.column_filename).map_err(|_| {
            let available = data
                .get_column_names()
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>();
            Error::InvalidParameters(format!(
                "column '{}' of source '{}' not in data, available: [{}]",
                self.column_filename,
                self.name,
                available.join(", ")
            ))
        })?;

        let mut names = HashSet::with_capacity(data.height());
        for row in 0..data.height() {
            match column.get(row)? {
                AnyValue::Null => {}
                AnyValue::String(s) => {
                    names.insert(s.to_string());
                }
                AnyValue::StringOwned(s) => {
                    names.insert(s.to_string());
                }
                other => {
                    names.insert(other.to_string());
                }
            }
        }

        let missing = self
            .files
            .iter()
            .filter_map(|path| path.file_name())
            .map(|name| name.to_string_lossy())
            .filter(|name| !names.contains(&**name))
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            warn!(
                "{} file(s) of source '{}' are not listed in column '{}': {}",
                missing.len(),
                self.name,
                self.column_filename,
                missing.join(", ")
            );
        }

        Ok(())
    }

    /// Uploads the files into the bound source's imageset.
    pub async fn upload(
        &mut self,
        client: &Client,
        workspace_id: &str,
        options: &BatchOptions,
    ) -> Result<UploadSummary, Error> {
        let source = match &self.state {
            UploadState::Constructed => {
                return Err(Error::NotRegistered(format!(
                    "uploadable source '{}' must be registered before upload",
                    self.name
                )));
            }
            UploadState::Uploaded { .. } => {
                return Err(Error::InvalidParameters(format!(
                    "uploadable source '{}' was already uploaded",
                    self.name
                )));
            }
            UploadState::Registered { source, .. } => source.clone(),
        };

        let summary = upload_images(
            client,
            workspace_id,
            source.imageset_id(),
            &self.files,
            self.mime_type.as_deref(),
            options,
        )
        .await?;

        self.state = UploadState::Uploaded {
            source,
            summary: summary.clone(),
        };
        Ok(summary)
    }
}
