// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Concurrent image transfers.
//!
//! Every batch runs one tokio task per item behind a semaphore and awaits the
//! task handles in submission order, so results line up with the input no
//! matter which transfer finishes first. A failed item never aborts its
//! siblings; once every task has settled the failures are reported together
//! as [`Error::BatchFailed`].
//!
//! Retries happen per request in the [transport](crate::transport); the batch
//! layer does not retry.

use crate::{
    BatchFailure, Client, Error,
    client::Api,
};
use futures::future::join_all;
use image::DynamicImage;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::json;
use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{Semaphore, mpsc::Sender},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

/// Upper bound on concurrently processed upload chunks.
pub const UPLOAD_CONCURRENCY: usize = 16;

/// Progress information for batch operations.
///
/// ```rust
/// use zegami_client::Progress;
///
/// let progress = Progress { current: 25, total: 100 };
/// assert_eq!(progress.current * 100 / progress.total, 25);
/// ```
#[derive(Debug, Clone)]
pub struct Progress {
    /// Current number of completed items.
    pub current: usize,
    /// Total number of items to process.
    pub total: usize,
}

/// Knobs shared by every batch operation.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Concurrency limit. Downloads default to the client's `max_workers`,
    /// uploads to its `max_tasks`.
    pub max_workers: Option<usize>,
    /// Overall time budget measured from the start of the batch.
    pub deadline: Option<Duration>,
    /// External cancellation.
    pub cancel: Option<CancellationToken>,
    /// Receives a [`Progress`] update as each item completes.
    pub progress: Option<Sender<Progress>>,
}

impl BatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_progress(mut self, progress: Sender<Progress>) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Number of files uploaded and registered per chunk.
pub fn chunk_size(total: usize) -> usize {
    match total {
        0..100 => 1,
        100..=2500 => 10,
        _ => 100,
    }
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Runs `work_fn` over labelled items with at most `workers` in flight and
/// returns the results in input order.
///
/// Items still waiting for a worker when the deadline passes or the token is
/// cancelled are not run and fail with [`Error::Cancelled`].
pub(crate) async fn run_ordered<T, R, F, Fut>(
    items: Vec<(String, T)>,
    workers: usize,
    options: &BatchOptions,
    work_fn: F,
) -> Result<Vec<R>, Error>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, Error>> + Send + 'static,
{
    let total = items.len();
    let current = Arc::new(AtomicUsize::new(0));
    let sem = Arc::new(Semaphore::new(workers.max(1)));
    let work_fn = Arc::new(work_fn);
    let cancel = options.cancel.clone().unwrap_or_default();
    let deadline = options.deadline.map(|d| Instant::now() + d);

    let (labels, items): (Vec<_>, Vec<_>) = items.into_iter().unzip();

    let tasks = items
        .into_iter()
        .map(|item| {
            let sem = sem.clone();
            let current = current.clone();
            let progress = options.progress.clone();
            let work_fn = work_fn.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = deadline_reached(deadline) => return Err(Error::Cancelled),
                    permit = sem.acquire() => permit?,
                };

                let result = work_fn(item).await;

                if let Some(progress) = &progress {
                    let current = current.fetch_add(1, Ordering::SeqCst);
                    let _ = progress
                        .send(Progress {
                            current: current + 1,
                            total,
                        })
                        .await;
                }

                result
            })
        })
        .collect::<Vec<_>>();

    let mut values = Vec::with_capacity(total);
    let mut failures = Vec::new();

    for (index, (label, joined)) in labels.into_iter().zip(join_all(tasks).await).enumerate() {
        match joined {
            Ok(Ok(value)) => values.push(value),
            Ok(Err(err)) => failures.push(BatchFailure {
                index,
                item: label,
                reason: err.to_string(),
            }),
            Err(err) => failures.push(BatchFailure {
                index,
                item: label,
                reason: Error::from(err).to_string(),
            }),
        }
    }

    if failures.is_empty() {
        Ok(values)
    } else {
        warn!("{} of {} batch item(s) failed", failures.len(), total);
        Err(Error::BatchFailed(failures))
    }
}

/// MIME type for a supported image file extension.
pub fn mime_for_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    Some(match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        "tif" | "tiff" => "image/tiff",
        "webp" => "image/webp",
        "dcm" => "application/dicom",
        _ => return None,
    })
}

/// Sniffs the MIME type of a payload, `application/octet-stream` when unknown.
pub fn sniff_mime(bytes: &[u8]) -> String {
    infer::get(bytes)
        .map(|kind| kind.mime_type().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

/// Downloads and decodes images, returned in the order of `urls`.
pub async fn download_batch(
    client: &Client,
    urls: &[String],
    options: &BatchOptions,
) -> Result<Vec<DynamicImage>, Error> {
    let workers = options.max_workers.unwrap_or(client.config().max_workers);
    let items = urls
        .iter()
        .map(|url| (url.clone(), (client.clone(), url.clone())))
        .collect();

    run_ordered(items, workers, options, |(client, url)| async move {
        download_image(&client, &url).await
    })
    .await
}

/// Downloads and decodes one image.
pub async fn download_image(client: &Client, url: &str) -> Result<DynamicImage, Error> {
    if url.is_empty() {
        return Err(Error::InvalidParameters(
            "empty image URL, the row has no image".to_string(),
        ));
    }
    let (bytes, _) = client.get_bytes(url).await?;
    Ok(image::load_from_memory(&bytes)?)
}

/// Downloads images to `directory` as `{position}.{extension}`, with the
/// extension sniffed from the content. Returns the written paths in the
/// order of `urls`.
pub async fn save_image_batch(
    client: &Client,
    urls: &[String],
    directory: &Path,
    options: &BatchOptions,
) -> Result<Vec<PathBuf>, Error> {
    let named = urls
        .iter()
        .enumerate()
        .map(|(i, url)| (url.clone(), i.to_string()))
        .collect();
    save_named_batch(client, named, directory, options).await
}

/// Downloads `(url, stem)` pairs to `directory` as `{stem}.{extension}`,
/// returning the written paths in input order.
pub(crate) async fn save_named_batch(
    client: &Client,
    named: Vec<(String, String)>,
    directory: &Path,
    options: &BatchOptions,
) -> Result<Vec<PathBuf>, Error> {
    tokio::fs::create_dir_all(directory).await?;

    let workers = options.max_workers.unwrap_or(client.config().max_workers);
    let items = named
        .into_iter()
        .map(|(url, stem)| {
            (
                url.clone(),
                (client.clone(), url, directory.to_path_buf(), stem),
            )
        })
        .collect();

    run_ordered(
        items,
        workers,
        options,
        |(client, url, directory, stem)| async move {
            if url.is_empty() {
                return Err(Error::InvalidParameters(
                    "empty image URL, the row has no image".to_string(),
                ));
            }
            let (bytes, _) = client.get_bytes(&url).await?;
            let ext = infer::get(&bytes).map_or("bin", |kind| kind.extension());
            let path = directory.join(format!("{}.{}", stem, ext));
            tokio::fs::write(&path, &bytes).await?;
            debug!("Saved {} to {:?}", url, path);
            Ok(path)
        },
    )
    .await
}

#[derive(Debug, Clone)]
struct UploadFile {
    path: PathBuf,
    name: String,
    mime_type: String,
}

/// Outcome of [`upload_images`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSummary {
    /// Imageset index of the first uploaded image.
    pub first_index: usize,
    /// Number of images uploaded and registered.
    pub uploaded: usize,
    /// Files skipped for lack of a known MIME type.
    pub skipped: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct ExtendResult {
    new_size: usize,
}

/// Uploads image files into an imageset, appending after existing images.
///
/// The imageset is first extended by the number of files, then the files are
/// split into chunks (see [`chunk_size`]). Each chunk obtains signed blob
/// URLs, uploads its files and registers them with one bulk call at its own
/// fixed offset. A chunk with a failed file is not registered.
pub async fn upload_images(
    client: &Client,
    workspace_id: &str,
    imageset_id: &str,
    paths: &[PathBuf],
    mime_override: Option<&str>,
    options: &BatchOptions,
) -> Result<UploadSummary, Error> {
    let mut files = Vec::with_capacity(paths.len());
    let mut skipped = Vec::new();
    for path in paths {
        let mime_type = mime_override
            .map(str::to_string)
            .or_else(|| mime_for_extension(path).map(str::to_string));
        match mime_type {
            Some(mime_type) => files.push(UploadFile {
                path: path.clone(),
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                mime_type,
            }),
            None => {
                warn!("Skipping {:?}: unknown image type", path);
                skipped.push(path.clone());
            }
        }
    }

    if files.is_empty() {
        return Ok(UploadSummary {
            skipped,
            ..Default::default()
        });
    }

    let delta = files.len();
    let url = client.project_url(
        Api::V0,
        workspace_id,
        &format!("imagesets/{}/extend", imageset_id),
    );
    let extended: ExtendResult = client.post_json(&url, json!({ "delta": delta })).await?;
    let first_index = extended.new_size.checked_sub(delta).ok_or_else(|| {
        Error::MalformedRecord(format!(
            "imageset {} extended by {} reports size {}",
            imageset_id, delta, extended.new_size
        ))
    })?;
    debug!(
        "Extended imageset {} by {}, uploading from index {}",
        imageset_id, delta, first_index
    );

    let size = chunk_size(delta);
    let items = files
        .chunks(size)
        .enumerate()
        .map(|(i, chunk)| {
            let start = first_index + i * size;
            let label = format!("{} file(s) at {}", chunk.len(), start);
            let job = ChunkJob {
                client: client.clone(),
                workspace_id: workspace_id.to_string(),
                imageset_id: imageset_id.to_string(),
                start,
                files: chunk.to_vec(),
            };
            (label, job)
        })
        .collect::<Vec<_>>();

    let workers = options
        .max_workers
        .unwrap_or(client.config().max_tasks)
        .min(UPLOAD_CONCURRENCY);
    run_ordered(items, workers, options, upload_chunk).await?;

    Ok(UploadSummary {
        first_index,
        uploaded: delta,
        skipped,
    })
}

struct ChunkJob {
    client: Client,
    workspace_id: String,
    imageset_id: String,
    start: usize,
    files: Vec<UploadFile>,
}

async fn upload_chunk(job: ChunkJob) -> Result<(), Error> {
    let client = &job.client;
    let (urls, ids) = client
        .signed_blob_urls(&job.workspace_id, job.files.len(), None)
        .await?;

    let uploads = job.files.iter().zip(ids.iter()).map(|(file, id)| {
        let url = urls.get(id).cloned().unwrap_or_default();
        async move {
            let bytes = tokio::fs::read(&file.path).await?;
            let size = bytes.len();
            client.upload_to_signed_url(bytes, &url, &file.mime_type).await?;
            Ok::<_, Error>(json!({
                "blob_id": id,
                "name": file.name,
                "size": size,
                "mimetype": file.mime_type,
            }))
        }
    });

    let mut images = Vec::with_capacity(job.files.len());
    let mut failures = Vec::new();
    for (index, (file, result)) in job.files.iter().zip(join_all(uploads).await).enumerate() {
        match result {
            Ok(image) => images.push(image),
            Err(err) => failures.push(BatchFailure {
                index,
                item: file.path.display().to_string(),
                reason: err.to_string(),
            }),
        }
    }
    if !failures.is_empty() {
        return Err(Error::BatchFailed(failures));
    }

    let url = client.project_url(
        Api::V0,
        &job.workspace_id,
        &format!("imagesets/{}/images_bulk?start={}", job.imageset_id, job.start),
    );
    let _: serde_json::Value = client.post_json(&url, json!({ "images": images })).await?;
    debug!(
        "Registered {} image(s) in {} at {}",
        images.len(),
        job.imageset_id,
        job.start
    );
    Ok(())
}
