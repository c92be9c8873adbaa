// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Collections: tabular rows joined to one or more image sources.
//!
//! A [`Collection`] is built once from the server record. Rows, tags and the
//! per-source index lookups are fetched lazily and kept in a single cache
//! owned by the collection, which [`Collection::clear_cache`] drops in one
//! step.

use crate::{
    Annotation, BatchOptions, Client, Error, IndexLookup, RowFilter, RowSubset, Source,
    SourceRef, SourceRegistry, TagIndex, UploadSummary, Uploadable, UploadableSource,
    annotation::parse_annotations,
    client::Api,
    table::{parse_rows, write_tsv},
    transfer::{self, run_ordered},
};
use image::DynamicImage;
use log::{debug, info, warn};
use polars::prelude::DataFrame;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

/// Expiry of signed image URLs unless set in [`UrlOptions`].
pub const DEFAULT_SIGNED_EXPIRY_DAYS: u32 = 7;

/// Dataset fields the server owns and rejects on update.
const READONLY_DATASET_FIELDS: [&str; 5] = [
    "data_link",
    "id",
    "parent_versioning_values",
    "schema",
    "total_rows",
];

/// Processing state of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingState {
    Unprocessed,
    Processing,
    Completed,
    /// A label this client does not know.
    Other(String),
}

impl ProcessingState {
    /// Reads the `status` field of a collection record, either a label or
    /// an object with a `progress` percentage.
    ///
    /// Records without a status predate processing tracking and count as
    /// completed.
    pub fn from_status(status: Option<&Value>) -> Self {
        match status {
            None | Some(Value::Null) => ProcessingState::Completed,
            Some(Value::String(label)) => Self::from_label(label),
            Some(Value::Object(map)) => {
                if let Some(progress) = map.get("progress").and_then(Value::as_f64) {
                    if progress >= 100.0 {
                        ProcessingState::Completed
                    } else if progress <= 0.0 {
                        ProcessingState::Unprocessed
                    } else {
                        ProcessingState::Processing
                    }
                } else if let Some(label) = map.get("status").and_then(Value::as_str) {
                    Self::from_label(label)
                } else {
                    ProcessingState::Other(Value::Object(map.clone()).to_string())
                }
            }
            Some(other) => ProcessingState::Other(other.to_string()),
        }
    }

    fn from_label(label: &str) -> Self {
        match label.to_lowercase().as_str() {
            "unprocessed" | "pending" | "new" => ProcessingState::Unprocessed,
            "processing" | "running" | "in_progress" => ProcessingState::Processing,
            "completed" | "complete" | "processed" | "done" => ProcessingState::Completed,
            _ => ProcessingState::Other(label.to_string()),
        }
    }

    pub fn is_completed(&self) -> bool {
        *self == ProcessingState::Completed
    }
}

impl std::fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingState::Unprocessed => write!(f, "unprocessed"),
            ProcessingState::Processing => write!(f, "processing"),
            ProcessingState::Completed => write!(f, "completed"),
            ProcessingState::Other(label) => write!(f, "{}", label),
        }
    }
}

/// Rows to resolve: one index, a list of indices or a selected subset.
#[derive(Debug, Clone)]
pub enum Rows {
    Index(usize),
    Indices(Vec<usize>),
    Subset(RowSubset),
}

impl Rows {
    fn into_indices(self) -> Vec<usize> {
        match self {
            Rows::Index(i) => vec![i],
            Rows::Indices(indices) => indices,
            Rows::Subset(subset) => subset.indices().to_vec(),
        }
    }
}

impl From<usize> for Rows {
    fn from(index: usize) -> Self {
        Rows::Index(index)
    }
}

impl From<Vec<usize>> for Rows {
    fn from(indices: Vec<usize>) -> Self {
        Rows::Indices(indices)
    }
}

impl From<&[usize]> for Rows {
    fn from(indices: &[usize]) -> Self {
        Rows::Indices(indices.to_vec())
    }
}

impl From<RowSubset> for Rows {
    fn from(subset: RowSubset) -> Self {
        Rows::Subset(subset)
    }
}

impl From<&RowSubset> for Rows {
    fn from(subset: &RowSubset) -> Self {
        Rows::Subset(subset.clone())
    }
}

/// How [`Collection::get_image_urls`] builds its URLs.
#[derive(Debug, Clone, Default)]
pub struct UrlOptions {
    /// Fetch time-limited direct storage URLs instead of API URLs.
    pub signed: bool,
    /// Validity of signed URLs, [`DEFAULT_SIGNED_EXPIRY_DAYS`] when unset.
    pub expiry_days: Option<u32>,
    /// Imageset to address instead of the source's own one.
    pub override_imageset_id: Option<String>,
}

impl UrlOptions {
    pub fn signed(expiry_days: u32) -> Self {
        UrlOptions {
            signed: true,
            expiry_days: Some(expiry_days),
            override_imageset_id: None,
        }
    }

    pub fn with_override_imageset_id(mut self, imageset_id: &str) -> Self {
        self.override_imageset_id = Some(imageset_id.to_string());
        self
    }
}

/// New row data for [`Collection::replace_data`].
#[derive(Debug, Clone)]
pub enum ReplaceData {
    Frame(DataFrame),
    /// A local `.tsv`, `.csv` or `.xlsx` file.
    File(PathBuf),
}

impl From<DataFrame> for ReplaceData {
    fn from(df: DataFrame) -> Self {
        ReplaceData::Frame(df)
    }
}

impl From<PathBuf> for ReplaceData {
    fn from(path: PathBuf) -> Self {
        ReplaceData::File(path)
    }
}

impl From<&Path> for ReplaceData {
    fn from(path: &Path) -> Self {
        ReplaceData::File(path.to_path_buf())
    }
}

impl ReplaceData {
    /// File name, content type and bytes of the upload.
    async fn into_upload(self) -> Result<(String, &'static str, Vec<u8>), Error> {
        match self {
            ReplaceData::Frame(df) => Ok((
                "data.tsv".to_string(),
                "text/tab-separated-values",
                write_tsv(&df)?,
            )),
            ReplaceData::File(path) => {
                let ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_lowercase)
                    .unwrap_or_default();
                let mime = match ext.as_str() {
                    "tsv" => "text/tab-separated-values",
                    "csv" => "text/csv",
                    "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
                    _ => {
                        return Err(Error::UnsupportedFormat(format!(
                            "data file {:?} must be .tsv, .csv or .xlsx",
                            path
                        )));
                    }
                };
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| format!("data.{}", ext));
                let bytes = tokio::fs::read(&path).await?;
                Ok((name, mime, bytes))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CollectionRecord {
    id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    dataset_id: Option<String>,
    #[serde(default)]
    upload_dataset_id: Option<String>,
    #[serde(default)]
    total_data_items: Option<usize>,
    #[serde(default)]
    status: Option<Value>,
    #[serde(default)]
    userdata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone)]
enum Schema {
    V1(SourceRegistry),
    V2(SourceRegistry),
}

impl Schema {
    fn registry(&self) -> &SourceRegistry {
        match self {
            Schema::V1(registry) | Schema::V2(registry) => registry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LookupKey {
    imageset_id: String,
    join_id: String,
}

#[derive(Debug, Default)]
struct CollectionCache {
    rows: Option<DataFrame>,
    tags: Option<TagIndex>,
    lookups: HashMap<LookupKey, Arc<IndexLookup>>,
}

impl CollectionCache {
    fn invalidate(&mut self) {
        *self = CollectionCache::default();
    }
}

/// A collection of a workspace.
#[derive(Debug)]
pub struct Collection {
    client: Client,
    workspace_id: String,
    record: CollectionRecord,
    raw: Value,
    schema: Schema,
    cache: RwLock<CollectionCache>,
}

impl Collection {
    /// Validates a collection record and builds its source list.
    pub(crate) fn from_record(client: Client, workspace_id: &str, raw: Value) -> Result<Self, Error> {
        let record: CollectionRecord = serde_json::from_value(raw.clone())
            .map_err(|e| Error::MalformedRecord(format!("collection record: {}", e)))?;

        let schema = match record.version.unwrap_or(1) {
            0 | 1 => Schema::V1(SourceRegistry::from_v1(&record.id, &raw)?),
            _ => Schema::V2(SourceRegistry::from_v2(&record.id, &raw)?),
        };

        Ok(Collection {
            client,
            workspace_id: workspace_id.to_string(),
            record,
            raw,
            schema,
            cache: RwLock::new(CollectionCache::default()),
        })
    }

    fn cache(&self) -> RwLockReadGuard<'_, CollectionCache> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache_mut(&self) -> RwLockWriteGuard<'_, CollectionCache> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn description(&self) -> &str {
        self.record.description.as_deref().unwrap_or_default()
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Schema version, 1 for single source collections.
    pub fn version(&self) -> u32 {
        match self.schema {
            Schema::V1(_) => 1,
            Schema::V2(_) => self.record.version.unwrap_or(2),
        }
    }

    pub fn dataset_id(&self) -> Option<&str> {
        self.record.dataset_id.as_deref()
    }

    pub fn upload_dataset_id(&self) -> Option<&str> {
        self.record.upload_dataset_id.as_deref()
    }

    /// The collection record as served.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Web address of the collection viewer.
    pub fn web_url(&self) -> String {
        format!(
            "{}/collections/{}-{}",
            self.client.url(),
            self.workspace_id,
            self.record.id
        )
    }

    /// Number of data items, as reported by the server.
    pub fn len(&self) -> usize {
        self.record.total_data_items.unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Processing state as of the last fetch of the record.
    pub fn status(&self) -> ProcessingState {
        ProcessingState::from_status(self.record.status.as_ref())
    }

    /// Fetches the current processing state.
    pub async fn fetch_status(&self) -> Result<ProcessingState, Error> {
        let raw = self.fetch_record().await?;
        Ok(ProcessingState::from_status(raw.get("status")))
    }

    pub fn sources(&self) -> &[Source] {
        self.schema.registry().sources()
    }

    /// Resolves a source index, name or handle. Version 1 collections always
    /// return their single pseudo-source.
    pub fn source(&self, source: impl Into<SourceRef>) -> Result<Source, Error> {
        self.schema.registry().resolve(source)
    }

    fn collection_url(&self) -> String {
        self.client.project_url(
            Api::V0,
            &self.workspace_id,
            &format!("collections/{}", self.record.id),
        )
    }

    async fn fetch_record(&self) -> Result<Value, Error> {
        let mut resp: Value = self.client.get_json(&self.collection_url()).await?;
        match resp.get_mut("collection").map(Value::take) {
            Some(raw @ Value::Object(_)) => Ok(raw),
            _ => Err(Error::InvalidResponse),
        }
    }

    /// Re-fetches the collection record. Sources are rebuilt and every
    /// cached value is dropped.
    pub async fn refresh(&mut self) -> Result<(), Error> {
        let raw = self.fetch_record().await?;
        let fresh = Collection::from_record(self.client.clone(), &self.workspace_id, raw)?;
        self.record = fresh.record;
        self.raw = fresh.raw;
        self.schema = fresh.schema;
        self.clear_cache();
        Ok(())
    }

    /// Drops cached rows, tags and index lookups.
    pub fn clear_cache(&self) {
        self.cache_mut().invalidate();
    }

    /// The row data, fetched once and cached.
    pub async fn rows(&self) -> Result<DataFrame, Error> {
        let cached = self.cache().rows.clone();
        if let Some(rows) = cached {
            return Ok(rows);
        }

        let dataset_id = self.record.dataset_id.as_deref().ok_or_else(|| {
            Error::MalformedRecord(format!("collection {} has no dataset_id", self.record.id))
        })?;
        let url = self.client.project_url(
            Api::V0,
            &self.workspace_id,
            &format!("datasets/{}/file", dataset_id),
        );
        let (bytes, _) = self.client.get_bytes(&url).await?;
        let rows = parse_rows(&bytes)?;
        debug!(
            "Fetched {} row(s) of collection {}",
            rows.height(),
            self.record.id
        );

        Ok(self.cache_mut().rows.get_or_insert(rows).clone())
    }

    /// Tag index of the collection, fetched once and cached.
    pub async fn tags(&self) -> Result<TagIndex, Error> {
        let cached = self.cache().tags.clone();
        if let Some(tags) = cached {
            return Ok(tags);
        }

        let url = self.client.project_url(
            Api::V1,
            &self.workspace_id,
            &format!("collections/{}/tags", self.record.id),
        );
        let resp: Value = self.client.get_json(&url).await?;
        let records = resp
            .get("tagRecords")
            .and_then(Value::as_array)
            .ok_or(Error::InvalidResponse)?;
        let tags = TagIndex::from_records(records);

        Ok(self.cache_mut().tags.get_or_insert(tags).clone())
    }

    /// Rows where every filtered column holds one of its allowed values.
    pub async fn get_rows_by_filter(&self, filter: &RowFilter) -> Result<RowSubset, Error> {
        let rows = self.rows().await?;
        let indices = filter.matching_rows(&rows)?;
        RowSubset::select(&rows, indices)
    }

    /// Rows carrying any of `tags`, each row once.
    pub async fn get_rows_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> Result<RowSubset, Error> {
        let indices = self.tags().await?.rows_for(tags)?;
        let rows = self.rows().await?;
        RowSubset::select(&rows, indices)
    }

    /// Index lookup of `source`, fetched once per join table.
    async fn lookup(&self, source: &Source) -> Result<Arc<IndexLookup>, Error> {
        let Some(join_id) = source.join_id() else {
            return Ok(Arc::new(IndexLookup::Identity));
        };
        let key = LookupKey {
            imageset_id: source.imageset_id().to_string(),
            join_id: join_id.to_string(),
        };

        let cached = self.cache().lookups.get(&key).cloned();
        if let Some(lookup) = cached {
            return Ok(lookup);
        }

        let url = self.client.project_url(
            Api::V0,
            &self.workspace_id,
            &format!("datasets/{}", join_id),
        );
        let resp: Value = self.client.get_json(&url).await?;
        let dataset = resp.get("dataset").ok_or(Error::InvalidResponse)?;
        let lookup = Arc::new(IndexLookup::from_dataset(dataset)?);
        debug!(
            "Fetched index lookup {} for source {} ({:?} rows)",
            join_id,
            source,
            lookup.len()
        );

        Ok(self.cache_mut().lookups.entry(key).or_insert(lookup).clone())
    }

    /// Imageset index of the image at `row_index` in `source`.
    pub async fn row_index_to_imageset_index(
        &self,
        row_index: usize,
        source: impl Into<SourceRef>,
    ) -> Result<usize, Error> {
        let source = self.source(source)?;
        let lookup = self.lookup(&source).await?;
        match lookup.row_to_imageset(row_index) {
            Ok(Some(image)) => Ok(image),
            Ok(None) => Err(Error::InvalidIndex(format!(
                "row {} has no image in source {}",
                row_index, source
            ))),
            Err(e) => Err(Error::InvalidIndex(format!("{} in source {}", e, source))),
        }
    }

    /// Row holding the image at `imageset_index` of `source`.
    pub async fn imageset_index_to_row_index(
        &self,
        imageset_index: usize,
        source: impl Into<SourceRef>,
    ) -> Result<usize, Error> {
        let source = self.source(source)?;
        let lookup = self.lookup(&source).await?;
        lookup
            .imageset_to_row(imageset_index)
            .map_err(|e| Error::InvalidIndex(format!("{} in source {}", e, source)))
    }

    /// One image URL per input row, in input order.
    ///
    /// Rows without an image in `source` yield an empty string.
    pub async fn get_image_urls(
        &self,
        rows: impl Into<Rows>,
        source: impl Into<SourceRef>,
        options: &UrlOptions,
    ) -> Result<Vec<String>, Error> {
        let source = self.source(source)?;
        let lookup = self.lookup(&source).await?;
        let imageset_id = options
            .override_imageset_id
            .clone()
            .unwrap_or_else(|| source.imageset_id().to_string());

        let images = rows
            .into()
            .into_indices()
            .into_iter()
            .map(|row| lookup.row_to_imageset(row))
            .collect::<Result<Vec<_>, _>>()?;

        if !options.signed {
            return Ok(images
                .into_iter()
                .map(|image| match image {
                    Some(i) => self.client.project_url(
                        Api::V0,
                        &self.workspace_id,
                        &format!("imagesets/{}/images/{}/data", imageset_id, i),
                    ),
                    None => String::new(),
                })
                .collect());
        }

        let expiry_days = options.expiry_days.unwrap_or(DEFAULT_SIGNED_EXPIRY_DAYS);
        let items = images
            .into_iter()
            .map(|image| {
                let url = image.map(|i| {
                    self.client.project_url(
                        Api::V1,
                        &self.workspace_id,
                        &format!(
                            "imagesets/{}/images/{}/signed_route?expiry_days={}",
                            imageset_id, i, expiry_days
                        ),
                    )
                });
                let label = url.clone().unwrap_or_default();
                (label, (self.client.clone(), url))
            })
            .collect();

        #[derive(Deserialize)]
        struct SignedRoute {
            url: String,
        }

        run_ordered(
            items,
            self.client.config().max_tasks,
            &BatchOptions::default(),
            |(client, url)| async move {
                match url {
                    Some(url) => Ok(client.get_json::<SignedRoute>(&url).await?.url),
                    None => Ok(String::new()),
                }
            },
        )
        .await
    }

    pub async fn download_image(&self, url: &str) -> Result<DynamicImage, Error> {
        transfer::download_image(&self.client, url).await
    }

    /// Downloads images in the order of `urls`.
    pub async fn download_image_batch(
        &self,
        urls: &[String],
        options: &BatchOptions,
    ) -> Result<Vec<DynamicImage>, Error> {
        transfer::download_batch(&self.client, urls, options).await
    }

    /// Saves images to `directory`, named by their position in `urls`.
    pub async fn save_image_batch(
        &self,
        urls: &[String],
        directory: &Path,
        options: &BatchOptions,
    ) -> Result<Vec<PathBuf>, Error> {
        transfer::save_image_batch(&self.client, urls, directory, options).await
    }

    /// Saves the images of `rows` in `source` to `directory` as
    /// `{row}.{extension}`. Rows without an image are skipped with a warning.
    /// Returns the row and written path of every saved image, in the order
    /// of `rows`.
    pub async fn save_row_images(
        &self,
        rows: impl Into<Rows>,
        source: impl Into<SourceRef>,
        directory: &Path,
        url_options: &UrlOptions,
        options: &BatchOptions,
    ) -> Result<Vec<(usize, PathBuf)>, Error> {
        let rows = rows.into().into_indices();
        let urls = self
            .get_image_urls(rows.clone(), source, url_options)
            .await?;

        let (named, missing): (Vec<_>, Vec<_>) = rows
            .into_iter()
            .zip(urls)
            .partition(|(_, url)| !url.is_empty());
        if !missing.is_empty() {
            let missing = missing
                .iter()
                .map(|(row, _)| row.to_string())
                .collect::<Vec<_>>();
            warn!(
                "Skipping {} row(s) without an image: {}",
                missing.len(),
                missing.join(", ")
            );
        }

        let saved_rows = named.iter().map(|(row, _)| *row).collect::<Vec<_>>();
        let named = named
            .into_iter()
            .map(|(row, url)| (url, row.to_string()))
            .collect();
        let paths = transfer::save_named_batch(&self.client, named, directory, options).await?;
        Ok(saved_rows.into_iter().zip(paths).collect())
    }

    /// Free-form user data stored on the collection.
    pub fn userdata(&self) -> Map<String, Value> {
        self.record.userdata.clone().unwrap_or_default()
    }

    /// Merges `values` into the user data and saves it. A `null` value
    /// removes its key. Returns the saved user data.
    pub async fn set_userdata(
        &mut self,
        values: Map<String, Value>,
    ) -> Result<Map<String, Value>, Error> {
        let mut userdata = self.userdata();
        for (key, value) in values {
            if value.is_null() {
                userdata.remove(&key);
            } else {
                userdata.insert(key, value);
            }
        }

        let mut body = self.raw.clone();
        if let Value::Object(map) = &mut body {
            map.insert("userdata".to_string(), Value::Object(userdata.clone()));
        }

        let mut resp: Value = self.client.put_json(&self.collection_url(), body).await?;
        match resp.get_mut("collection").map(Value::take) {
            Some(raw @ Value::Object(_)) => {
                let fresh = Collection::from_record(self.client.clone(), &self.workspace_id, raw)?;
                self.record = fresh.record;
                self.raw = fresh.raw;
                self.schema = fresh.schema;
            }
            _ => {
                if let Value::Object(map) = &mut self.raw {
                    map.insert("userdata".to_string(), Value::Object(userdata.clone()));
                }
                self.record.userdata = Some(userdata);
            }
        }

        Ok(self.userdata())
    }

    /// Replaces the row data of the collection.
    ///
    /// The new data is written to the collection's upload dataset through
    /// signed blob storage and the dataset is pointed at it. Unless
    /// `fail_if_not_ready` is false, a collection still processing is
    /// refused with [`Error::NotReady`].
    pub async fn replace_data(
        &self,
        data: impl Into<ReplaceData>,
        fail_if_not_ready: bool,
    ) -> Result<(), Error> {
        let upload_dataset_id = self.record.upload_dataset_id.as_deref().ok_or_else(|| {
            Error::MalformedRecord(format!(
                "collection {} has no upload_dataset_id",
                self.record.id
            ))
        })?;

        let state = self.fetch_status().await?;
        if !state.is_completed() {
            if fail_if_not_ready {
                return Err(Error::NotReady(format!(
                    "collection {} is {}",
                    self.record.id, state
                )));
            }
            warn!(
                "Replacing data of collection {} while it is {}",
                self.record.id, state
            );
        }

        let (name, mime, bytes) = data.into().into_upload().await?;
        let blob_path = format!("datasets/{}", upload_dataset_id);
        let (urls, ids) = self
            .client
            .signed_blob_urls(&self.workspace_id, 1, Some(blob_path.as_str()))
            .await?;
        let blob_id = ids.first().ok_or(Error::InvalidResponse)?;
        let blob_url = urls.get(blob_id).ok_or(Error::InvalidResponse)?;
        self.client.upload_to_signed_url(bytes, blob_url, mime).await?;

        let url = self.client.project_url(
            Api::V0,
            &self.workspace_id,
            &format!("datasets/{}", upload_dataset_id),
        );
        let mut resp: Value = self.client.get_json(&url).await?;
        let mut dataset = match resp.get_mut("dataset").map(Value::take) {
            Some(Value::Object(map)) => map,
            _ => return Err(Error::InvalidResponse),
        };
        for field in READONLY_DATASET_FIELDS {
            dataset.remove(field);
        }

        let source = dataset
            .entry("source")
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .ok_or_else(|| {
                Error::MalformedRecord(format!("dataset {} source is not an object", upload_dataset_id))
            })?;
        source.insert("blob_id".to_string(), json!(blob_id));
        let upload = source
            .entry("upload")
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .ok_or_else(|| {
                Error::MalformedRecord(format!("dataset {} upload is not an object", upload_dataset_id))
            })?;
        upload.insert("name".to_string(), json!(name));

        let _: Value = self.client.put_json(&url, Value::Object(dataset)).await?;
        self.clear_cache();
        info!("Replaced data of collection {} with {}", self.record.id, name);
        Ok(())
    }

    /// Attaches an annotation to one image of `source`.
    ///
    /// Exactly one of `row_index` and `image_index` must be given. The author
    /// defaults to the email of the signed in user.
    pub async fn upload_annotation(
        &self,
        uploadable: &Uploadable,
        row_index: Option<usize>,
        image_index: Option<usize>,
        source: impl Into<SourceRef>,
        author: Option<&str>,
    ) -> Result<Value, Error> {
        let source = self.source(source)?;
        let image_index = match (row_index, image_index) {
            (Some(row), None) => self.row_index_to_imageset_index(row, &source).await?,
            (None, Some(image)) => image,
            _ => {
                return Err(Error::InvalidParameters(
                    "exactly one of row_index and image_index is required".to_string(),
                ));
            }
        };

        let author = match author {
            Some(author) => author.to_string(),
            None => self.client.user_info().await?.email().to_string(),
        };
        let payload = uploadable.payload(source.imageset_id(), image_index, &author)?;

        let url = self
            .client
            .project_url(Api::V1, &self.workspace_id, "annotations/");
        let resp = self.client.post_json(&url, payload).await?;
        debug!(
            "Uploaded {} annotation for image {} of {}",
            uploadable.kind(),
            image_index,
            source
        );
        Ok(resp)
    }

    /// All annotations of `source`.
    pub async fn get_annotations(
        &self,
        source: impl Into<SourceRef>,
    ) -> Result<Vec<Annotation>, Error> {
        let source = self.source(source)?;
        let resource = match (&self.schema, source.id()) {
            (Schema::V2(_), Some(source_id)) => format!(
                "annotations/collection/{}/source/{}",
                self.record.id, source_id
            ),
            _ => format!("annotations/collection/{}", self.record.id),
        };
        let url = self
            .client
            .project_url(Api::V1, &self.workspace_id, &resource);
        parse_annotations(self.client.get_json(&url).await?)
    }

    /// Annotations of the image at `row_index` in `source`.
    pub async fn get_annotations_for_image(
        &self,
        row_index: usize,
        source: impl Into<SourceRef>,
    ) -> Result<Vec<Annotation>, Error> {
        let source = self.source(source)?;
        let image_index = self.row_index_to_imageset_index(row_index, &source).await?;
        let url = self.client.project_url(
            Api::V1,
            &self.workspace_id,
            &format!(
                "annotations/imageset/{}/images/{}",
                source.imageset_id(),
                image_index
            ),
        );
        parse_annotations(self.client.get_json(&url).await?)
    }

    pub async fn delete_annotation(&self, annotation_id: &str) -> Result<(), Error> {
        if annotation_id.is_empty() {
            return Err(Error::InvalidParameters("annotation id is empty".to_string()));
        }
        let url = self.client.project_url(
            Api::V1,
            &self.workspace_id,
            &format!("annotations/{}", annotation_id),
        );
        self.client.delete(&url).await
    }

    /// Uploads staged images into the sources they are named after, then
    /// replaces the row data when `data` is given.
    ///
    /// Every uploadable is bound and checked against `data` before anything
    /// is sent.
    pub async fn add_images(
        &self,
        uploadables: &mut [UploadableSource],
        data: Option<DataFrame>,
        options: &BatchOptions,
    ) -> Result<Vec<UploadSummary>, Error> {
        for (index, uploadable) in uploadables.iter_mut().enumerate() {
            let source = match &self.schema {
                Schema::V1(registry) => registry.resolve(SourceRef::Index(0))?,
                Schema::V2(registry) => registry.resolve(uploadable.name())?,
            };
            uploadable.register(source, index)?;
        }

        if let Some(data) = &data {
            for uploadable in uploadables.iter() {
                uploadable.check_in_data(data)?;
            }
        }

        let mut summaries = Vec::with_capacity(uploadables.len());
        for uploadable in uploadables.iter_mut() {
            let summary = uploadable
                .upload(&self.client, &self.workspace_id, options)
                .await?;
            info!(
                "Uploaded {} image(s) to source '{}' of {}",
                summary.uploaded,
                uploadable.name(),
                self.record.name
            );
            summaries.push(summary);
        }

        if let Some(data) = data {
            self.replace_data(data, false).await?;
        }

        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ClientConfig, MASK_TYPE, Mask,
        test_support::{MockTransport, TEST_HOME, png_bytes, test_client, test_client_with},
        transport::Method,
    };

    const ROWS: &[u8] = b"name\tbreed\tage\nrex\tCairn\t3\nfido\tDingo\t5\nspot\tCairn\t5\n";

    fn v2_record() -> Value {
        json!({
            "id": "c1",
            "name": "Dogs",
            "version": 2,
            "dataset_id": "d1",
            "upload_dataset_id": "u1",
            "total_data_items": 3,
            "status": {"progress": 100},
            "userdata": {"keep": 1, "drop": 2},
            "image_sources": [
                {"source_id": "s1", "name": "A", "imageset_id": "is1", "imageset_dataset_join_id": "j1"},
                {"source_id": "s2", "name": "B", "imageset_id": "is2"}
            ]
        })
    }

    fn setup() -> (Arc<MockTransport>, Collection) {
        let mock = Arc::new(MockTransport::new());
        mock.route_bytes(Method::GET, "datasets/d1/file", ROWS.to_vec(), "text/tab-separated-values");
        mock.route(
            Method::GET,
            "datasets/j1",
            json!({"dataset": {"imageset_indices": [5, null, 7]}}),
        );
        mock.route(
            Method::GET,
            "collections/c1/tags",
            json!({"tagRecords": [
                {"key": 0, "tag": "good"},
                {"key": 2, "tag": "good"},
                {"key": 2, "tag": "best"}
            ]}),
        );
        let collection = Collection::from_record(test_client(mock.clone()), "ws", v2_record()).unwrap();
        (mock, collection)
    }

    #[test]
    fn test_processing_state() {
        assert_eq!(ProcessingState::from_status(None), ProcessingState::Completed);
        assert_eq!(
            ProcessingState::from_status(Some(&json!({"progress": 40}))),
            ProcessingState::Processing
        );
        assert_eq!(
            ProcessingState::from_status(Some(&json!({"progress": 0}))),
            ProcessingState::Unprocessed
        );
        assert_eq!(
            ProcessingState::from_status(Some(&json!("Completed"))),
            ProcessingState::Completed
        );
        assert_eq!(
            ProcessingState::from_status(Some(&json!("queued"))),
            ProcessingState::Other("queued".to_string())
        );
    }

    #[test]
    fn test_record_schema() {
        let (_, collection) = setup();
        assert_eq!(collection.version(), 2);
        assert_eq!(collection.sources().len(), 2);
        assert_eq!(collection.len(), 3);
        assert_eq!(collection.web_url(), format!("{}/collections/ws-c1", TEST_HOME));

        let v1 = Collection::from_record(
            test_client(Arc::new(MockTransport::new())),
            "ws",
            json!({"id": "c0", "name": "Old", "imageset_id": "is0"}),
        )
        .unwrap();
        assert_eq!(v1.version(), 1);
        assert!(v1.source("anything").unwrap().is_pseudo());

        assert!(matches!(
            Collection::from_record(
                test_client(Arc::new(MockTransport::new())),
                "ws",
                json!({"id": "c2", "name": "Broken", "version": 2})
            ),
            Err(Error::MalformedRecord(_))
        ));
    }

    #[tokio::test]
    async fn test_rows_fetched_once_until_cleared() {
        let (mock, collection) = setup();

        let first = collection.rows().await.unwrap();
        let second = collection.rows().await.unwrap();
        assert_eq!(first.height(), 3);
        assert!(first.equals(&second));
        assert_eq!(mock.count(Method::GET, "datasets/d1/file"), 1);

        collection.clear_cache();
        collection.rows().await.unwrap();
        assert_eq!(mock.count(Method::GET, "datasets/d1/file"), 2);
    }

    #[tokio::test]
    async fn test_rows_by_filter_and_tags() {
        let (_, collection) = setup();

        let filter = RowFilter::new().column("breed", ["Cairn"]).column("age", [5]);
        let subset = collection.get_rows_by_filter(&filter).await.unwrap();
        assert_eq!(subset.indices(), &[2]);

        let tagged = collection.get_rows_by_tags(&["good", "best"]).await.unwrap();
        assert_eq!(tagged.indices(), &[0, 2]);

        assert!(matches!(
            collection.get_rows_by_tags(&["nope"]).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_image_urls_keep_positions() {
        let (mock, collection) = setup();

        let urls = collection
            .get_image_urls(vec![0usize, 1, 2], "A", &UrlOptions::default())
            .await
            .unwrap();
        assert_eq!(urls.len(), 3);
        assert_eq!(
            urls[0],
            format!("{}/api/v0/project/ws/imagesets/is1/images/5/data", TEST_HOME)
        );
        assert_eq!(urls[1], "");
        assert!(urls[2].ends_with("imagesets/is1/images/7/data"));

        // Source without a join table maps rows onto images directly.
        let urls = collection
            .get_image_urls(4usize, 1usize, &UrlOptions::default())
            .await
            .unwrap();
        assert!(urls[0].ends_with("imagesets/is2/images/4/data"));

        collection
            .get_image_urls(0usize, "A", &UrlOptions::default())
            .await
            .unwrap();
        assert_eq!(mock.count(Method::GET, "datasets/j1"), 1);
    }

    #[tokio::test]
    async fn test_signed_urls() {
        let (mock, collection) = setup();
        mock.route(
            Method::GET,
            "images/5/signed_route",
            json!({"url": "https://blob.test/5?sig"}),
        );
        mock.route(
            Method::GET,
            "images/7/signed_route",
            json!({"url": "https://blob.test/7?sig"}),
        );

        let urls = collection
            .get_image_urls(vec![2usize, 1, 0], 0usize, &UrlOptions::signed(30))
            .await
            .unwrap();
        assert_eq!(urls, vec!["https://blob.test/7?sig", "", "https://blob.test/5?sig"]);
        assert_eq!(mock.count(Method::GET, "expiry_days=30"), 2);
    }

    #[tokio::test]
    async fn test_signed_urls_respect_max_tasks() {
        tokio::time::pause();
        for (max_tasks, serial) in [(1, true), (4, false)] {
            let mock = Arc::new(MockTransport::new());
            mock.route(
                Method::GET,
                "signed_route",
                json!({"url": "https://blob.test/x?sig"}),
            );
            mock.delay("signed_route", std::time::Duration::from_millis(50));
            let client = test_client_with(
                mock.clone(),
                ClientConfig {
                    max_tasks,
                    ..ClientConfig::default()
                },
            );
            let collection = Collection::from_record(client, "ws", v2_record()).unwrap();

            let urls = collection
                .get_image_urls(vec![0usize, 1, 2, 3], "B", &UrlOptions::signed(1))
                .await
                .unwrap();
            assert_eq!(urls.len(), 4);
            assert_eq!(mock.count(Method::GET, "signed_route"), 4);
            if serial {
                assert_eq!(mock.peak_in_flight(), 1);
            } else {
                assert!(mock.peak_in_flight() > 1);
            }
        }
    }

    #[tokio::test]
    async fn test_save_row_images_skips_rows_without_image() {
        let (mock, collection) = setup();
        mock.route_bytes(Method::GET, "images/5/data", png_bytes(2, 2, 0), "image/png");
        mock.route_bytes(Method::GET, "images/7/data", png_bytes(3, 3, 0), "image/png");
        let dir = tempfile::TempDir::new().unwrap();

        let saved = collection
            .save_row_images(
                vec![2usize, 1, 0],
                "A",
                dir.path(),
                &UrlOptions::default(),
                &BatchOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            saved,
            vec![(2, dir.path().join("2.png")), (0, dir.path().join("0.png"))]
        );
        assert!(!dir.path().join("1.png").exists());
        assert_eq!(mock.count(Method::GET, "/images/"), 2);
    }

    #[tokio::test]
    async fn test_index_translation_errors() {
        let (_, collection) = setup();

        assert_eq!(collection.row_index_to_imageset_index(2, "A").await.unwrap(), 7);
        assert_eq!(collection.imageset_index_to_row_index(5, "A").await.unwrap(), 0);
        assert!(matches!(
            collection.row_index_to_imageset_index(1, "A").await,
            Err(Error::InvalidIndex(_))
        ));
        assert!(matches!(
            collection.row_index_to_imageset_index(9, "A").await,
            Err(Error::InvalidIndex(_))
        ));
        assert!(matches!(
            collection.imageset_index_to_row_index(6, "A").await,
            Err(Error::InvalidIndex(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_annotation_needs_exactly_one_index() {
        let (mock, collection) = setup();
        let uploadable = Uploadable::from_mask(&Mask::new(1, 1, vec![true]).unwrap(), 0);

        for (row, image) in [(None, None), (Some(0), Some(0))] {
            let result = collection
                .upload_annotation(&uploadable, row, image, 0usize, Some("me"))
                .await;
            assert!(matches!(result, Err(Error::InvalidParameters(_))));
        }
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_upload_annotation_defaults_author() {
        let (mock, collection) = setup();
        mock.route(
            Method::GET,
            "oauth/userinfo",
            json!({"name": "Me", "email": "me@example.com", "projects": []}),
        );
        mock.route(Method::POST, "annotations/", json!({"id": "a1"}));

        let uploadable = Uploadable::from_mask(&Mask::new(1, 1, vec![true]).unwrap(), 0);
        collection
            .upload_annotation(&uploadable, Some(2), None, "A", None)
            .await
            .unwrap();

        let posted = mock
            .calls()
            .into_iter()
            .find(|call| call.method == Method::POST)
            .unwrap();
        let body = posted.json_body().unwrap();
        assert_eq!(body["author"], "me@example.com");
        assert_eq!(body["image_index"], 7);
        assert_eq!(body["imageset_id"], "is1");
        assert_eq!(body["type"], MASK_TYPE);
    }

    #[tokio::test]
    async fn test_annotation_listing_urls() {
        let (mock, collection) = setup();
        mock.route(
            Method::GET,
            "annotations/collection/c1/source/s2",
            json!([{"id": "a1", "imageset_id": "is2", "image_index": 0, "type": MASK_TYPE}]),
        );
        mock.route(
            Method::GET,
            "annotations/imageset/is1/images/7",
            json!({"annotations": []}),
        );
        mock.route(Method::DELETE, "annotations/a1", json!(null));

        let listed = collection.get_annotations("B").await.unwrap();
        assert_eq!(listed[0].id(), "a1");
        assert!(collection.get_annotations_for_image(2, 0usize).await.unwrap().is_empty());
        collection.delete_annotation("a1").await.unwrap();
        assert_eq!(mock.count(Method::DELETE, "annotations/a1"), 1);
    }

    #[tokio::test]
    async fn test_replace_data_refuses_unprocessed() {
        let (mock, collection) = setup();
        let mut record = v2_record();
        record["status"] = json!({"progress": 0});
        mock.route(Method::GET, "collections/c1", json!({"collection": record}));

        let df = collection.rows().await.unwrap();
        let result = collection.replace_data(df, true).await;
        assert!(matches!(result, Err(Error::NotReady(_))));
        assert_eq!(mock.count(Method::GET, "signed_blob_url"), 0);
    }

    #[tokio::test]
    async fn test_replace_data_updates_dataset_and_clears_rows() {
        let (mock, collection) = setup();
        mock.route(Method::GET, "collections/c1", json!({"collection": v2_record()}));
        mock.route(
            Method::GET,
            "signed_blob_url",
            json!({"ids": ["blob9"], "signed_urls": {"blob9": "https://blob.test/blob9?sig"}}),
        );
        mock.route(Method::PUT, "https://blob.test/", json!(null));
        mock.route(
            Method::GET,
            "datasets/u1",
            json!({"dataset": {
                "id": "u1", "name": "upload", "schema": {}, "total_rows": 3,
                "source": {"upload": {"name": "old.tsv"}}
            }}),
        );
        mock.route(Method::PUT, "datasets/u1", json!({}));

        let df = collection.rows().await.unwrap();
        collection.replace_data(df, true).await.unwrap();

        let calls = mock.calls();
        let blob_put = calls.iter().find(|c| c.url.starts_with("https://blob.test/")).unwrap();
        assert!(blob_put.header_value("authorization").is_none());
        assert!(calls.iter().any(|c| c.url.contains("blob_path=datasets/u1")));

        let put = calls
            .iter()
            .find(|c| c.method == Method::PUT && c.url.contains("datasets/u1"))
            .unwrap();
        let body = put.json_body().unwrap();
        assert_eq!(body["source"]["blob_id"], "blob9");
        assert_eq!(body["source"]["upload"]["name"], "data.tsv");
        assert!(body.get("id").is_none());
        assert!(body.get("schema").is_none());
        assert!(body.get("total_rows").is_none());

        collection.rows().await.unwrap();
        assert_eq!(mock.count(Method::GET, "datasets/d1/file"), 2);
    }

    #[tokio::test]
    async fn test_set_userdata_merges_and_removes() {
        let (mock, mut collection) = setup();
        mock.route(Method::PUT, "collections/c1", json!(null));

        let mut values = Map::new();
        values.insert("drop".to_string(), Value::Null);
        values.insert("new".to_string(), json!(true));
        let saved = collection.set_userdata(values).await.unwrap();

        assert_eq!(saved.get("keep"), Some(&json!(1)));
        assert_eq!(saved.get("new"), Some(&json!(true)));
        assert!(!saved.contains_key("drop"));

        let put = mock
            .calls()
            .into_iter()
            .find(|c| c.method == Method::PUT)
            .unwrap();
        let body = put.json_body().unwrap();
        assert_eq!(body["name"], "Dogs");
        assert_eq!(body["userdata"]["new"], true);
        assert_eq!(collection.userdata(), saved);
    }
}
