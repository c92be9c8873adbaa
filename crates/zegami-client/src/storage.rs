// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Token storage abstraction for the Zegami Client.
//!
//! Tokens are persisted one file per backend host so that switching between
//! `https://zegami.com` and a staging deployment never mixes credentials.
//!
//! # Storage Implementations
//!
//! - [`FileTokenStorage`]: per-host token file in the platform config directory
//! - [`MemoryTokenStorage`]: in-memory storage (no persistence)
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zegami_client::{Client, FileTokenStorage};
//!
//! # fn main() -> Result<(), zegami_client::Error> {
//! // Token file for the default host, e.g. ~/.config/zegami/zegami.token
//! let client = Client::new()?;
//!
//! // Memory-only storage
//! let client = Client::new()?.with_memory_storage();
//!
//! // Explicit token file
//! let storage = FileTokenStorage::with_path("/custom/path/zegami.token".into());
//! let client = Client::new()?.with_storage(Arc::new(storage));
//! # Ok(())
//! # }
//! ```

use directories::ProjectDirs;
use log::debug;
use std::{path::PathBuf, sync::RwLock};
use url::Url;

/// Error type for token storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// Storage is not available (e.g., cannot determine config directory).
    NotAvailable(String),
    /// Failed to read token from storage.
    ReadError(String),
    /// Failed to write token to storage.
    WriteError(String),
    /// Failed to clear token from storage.
    ClearError(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::NotAvailable(msg) => write!(f, "Token storage not available: {}", msg),
            StorageError::ReadError(msg) => write!(f, "Failed to read token: {}", msg),
            StorageError::WriteError(msg) => write!(f, "Failed to write token: {}", msg),
            StorageError::ClearError(msg) => write!(f, "Failed to clear token: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

/// Trait for persistent token storage.
///
/// Implementations must be thread-safe (`Send + Sync`) since a [`Client`]
/// and its clones share one storage backend.
///
/// [`Client`]: crate::Client
pub trait TokenStorage: Send + Sync {
    /// Store the authentication token.
    fn store(&self, token: &str) -> Result<(), StorageError>;

    /// Load the stored authentication token.
    ///
    /// Returns `Ok(None)` if no token is stored.
    fn load(&self) -> Result<Option<String>, StorageError>;

    /// Clear the stored authentication token.
    fn clear(&self) -> Result<(), StorageError>;
}

/// Returns the token file name for a server URL.
///
/// The final domain label is dropped and `.token` appended, so
/// `https://zegami.com` maps to `zegami.token` and
/// `https://staging.zegami.com` to `staging.zegami.token`. Single-label hosts
/// are kept whole and an explicit port is appended as `-{port}`.
pub fn token_file_name(home: &str) -> Result<String, StorageError> {
    let url = Url::parse(home)
        .map_err(|e| StorageError::NotAvailable(format!("Invalid server URL {}: {}", home, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| StorageError::NotAvailable(format!("Server URL {} has no host", home)))?;

    let labels: Vec<&str> = host.split('.').collect();
    let stem = if labels.len() > 1 && labels.iter().any(|l| l.parse::<u8>().is_err()) {
        labels[..labels.len() - 1].join(".")
    } else {
        host.to_string()
    };

    Ok(match url.port() {
        Some(port) => format!("{}-{}.token", stem, port),
        None => format!("{}.token", stem),
    })
}

/// File-based token storage for desktop platforms.
///
/// By default the token lives in the platform config directory
/// (`~/.config/zegami/` on Linux) under a name derived from the server host,
/// see [`token_file_name`].
#[derive(Debug, Clone)]
pub struct FileTokenStorage {
    path: PathBuf,
}

impl FileTokenStorage {
    /// Create a `FileTokenStorage` for the given server URL in the default
    /// platform config directory.
    pub fn for_host(home: &str) -> Result<Self, StorageError> {
        let path = ProjectDirs::from("com", "Zegami", "zegami")
            .ok_or_else(|| {
                StorageError::NotAvailable("Could not determine user config directory".to_string())
            })?
            .config_dir()
            .join(token_file_name(home)?);

        debug!("FileTokenStorage using default path: {:?}", path);
        Ok(Self { path })
    }

    /// Create a new `FileTokenStorage` with a custom file path.
    pub fn with_path(path: PathBuf) -> Self {
        debug!("FileTokenStorage using custom path: {:?}", path);
        Self { path }
    }

    /// Returns the path where the token is stored.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl TokenStorage for FileTokenStorage {
    fn store(&self, token: &str) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::WriteError(format!("Failed to create directory {:?}: {}", parent, e))
            })?;
        }

        std::fs::write(&self.path, token).map_err(|e| {
            StorageError::WriteError(format!("Failed to write token to {:?}: {}", self.path, e))
        })?;

        debug!("Token stored to {:?}", self.path);
        Ok(())
    }

    fn load(&self) -> Result<Option<String>, StorageError> {
        if !self.path.exists() {
            debug!("No token file found at {:?}", self.path);
            return Ok(None);
        }

        let token = std::fs::read_to_string(&self.path).map_err(|e| {
            StorageError::ReadError(format!("Failed to read token from {:?}: {}", self.path, e))
        })?;

        // Hand-edited token files often end with a newline.
        let token = token.trim();
        if token.is_empty() {
            debug!("Token file at {:?} is empty", self.path);
            return Ok(None);
        }

        debug!("Token loaded from {:?}", self.path);
        Ok(Some(token.to_string()))
    }

    fn clear(&self) -> Result<(), StorageError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).map_err(|e| {
                StorageError::ClearError(format!(
                    "Failed to remove token file {:?}: {}",
                    self.path, e
                ))
            })?;
            debug!("Token file removed from {:?}", self.path);
        }
        Ok(())
    }
}

/// In-memory token storage (no persistence).
#[derive(Debug, Default)]
pub struct MemoryTokenStorage {
    token: RwLock<Option<String>>,
}

impl MemoryTokenStorage {
    /// Create a new `MemoryTokenStorage`.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStorage for MemoryTokenStorage {
    fn store(&self, token: &str) -> Result<(), StorageError> {
        let mut guard = self.token.write().map_err(|e| {
            StorageError::WriteError(format!("Failed to acquire write lock: {}", e))
        })?;
        *guard = Some(token.to_string());
        Ok(())
    }

    fn load(&self) -> Result<Option<String>, StorageError> {
        let guard = self
            .token
            .read()
            .map_err(|e| StorageError::ReadError(format!("Failed to acquire read lock: {}", e)))?;
        Ok(guard.clone())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let mut guard = self.token.write().map_err(|e| {
            StorageError::ClearError(format!("Failed to acquire write lock: {}", e))
        })?;
        *guard = None;
        Ok(())
    }
}
