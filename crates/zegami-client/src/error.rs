// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

use crate::storage::StorageError;
use tokio::sync::AcquireError;

/// A single failed item from a batch transfer.
///
/// `index` is the item's position in the caller's input, `item` is a short
/// label (URL or file path) and `reason` the rendered error for that item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub index: usize,
    pub item: String,
    pub reason: String,
}

impl std::fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {}: {}", self.index, self.item, self.reason)
    }
}

/// Comprehensive error type for Zegami Client operations.
///
/// Usage errors (`InvalidParameters`, `OutOfRange`, `NotRegistered`) are
/// raised before any network call is made. `NotFound`, `ForeignSource` and
/// `InvalidIndex` follow a completed lookup. `HttpStatus` carries the raw
/// server response of a failed call, and `BatchFailed` enumerates every
/// failed item of a concurrent transfer.
#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred during file operations.
    IoError(std::io::Error),
    /// Configuration parsing or loading error.
    ConfigError(config::ConfigError),
    /// JSON serialization or deserialization error.
    JsonError(serde_json::Error),
    /// HTTP request error from the reqwest client.
    HttpError(reqwest::Error),
    /// The server answered with a non-success status: code, reason and body.
    HttpStatus(u16, String, String),
    /// URL parsing error.
    UrlParseError(url::ParseError),
    /// Semaphore acquisition error for concurrent operations.
    SemaphoreError(AcquireError),
    /// Async task join error.
    JoinError(tokio::task::JoinError),
    /// Token storage backend failure.
    StorageError(StorageError),
    /// Polars dataframe operation error.
    PolarsError(polars::error::PolarsError),
    /// Image decoding error.
    ImageError(image::ImageError),
    /// Spreadsheet decoding error.
    SpreadsheetError(calamine::Error),
    /// Server returned an invalid or unexpected response.
    InvalidResponse,
    /// A server record is missing required fields or is inconsistent.
    MalformedRecord(String),
    /// Unsupported file format.
    UnsupportedFormat(String),
    /// Invalid parameters provided to an operation.
    InvalidParameters(String),
    /// An index or position is outside the valid range.
    OutOfRange(String),
    /// A named workspace, collection, source or tag does not exist.
    NotFound(String),
    /// A source handle was used with a collection it does not belong to.
    ForeignSource(String),
    /// A row or image index has no counterpart in the join table.
    InvalidIndex(String),
    /// An upload staging object was used before being bound to a source.
    NotRegistered(String),
    /// The collection is not in the processing state the operation requires.
    NotReady(String),
    /// One or more items of a batch transfer failed.
    BatchFailed(Vec<BatchFailure>),
    /// The operation was cancelled or its deadline passed before it started.
    Cancelled,
    /// Authentication token is empty or not provided.
    EmptyToken,
    /// The platform rejected the token (HTTP 401).
    Unauthorized(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::ConfigError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::JsonError(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::HttpError(err)
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::UrlParseError(err)
    }
}

impl From<AcquireError> for Error {
    fn from(err: AcquireError) -> Self {
        Error::SemaphoreError(err)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::JoinError(err)
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::StorageError(err)
    }
}

impl From<polars::error::PolarsError> for Error {
    fn from(err: polars::error::PolarsError) -> Self {
        Error::PolarsError(err)
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::ImageError(err)
    }
}

impl From<calamine::Error> for Error {
    fn from(err: calamine::Error) -> Self {
        Error::SpreadsheetError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(e) => write!(f, "I/O error: {}", e),
            Error::ConfigError(e) => write!(f, "Configuration error: {}", e),
            Error::JsonError(e) => write!(f, "JSON error: {}", e),
            Error::HttpError(e) => write!(f, "HTTP error: {}", e),
            Error::HttpStatus(status, reason, body) => {
                write!(f, "Bad response ({} {}): {}", status, reason, body)
            }
            Error::UrlParseError(e) => write!(f, "URL parse error: {}", e),
            Error::SemaphoreError(e) => write!(f, "Semaphore error: {}", e),
            Error::JoinError(e) => write!(f, "Task join error: {}", e),
            Error::StorageError(e) => write!(f, "Token storage error: {}", e),
            Error::PolarsError(e) => write!(f, "Polars error: {}", e),
            Error::ImageError(e) => write!(f, "Image error: {}", e),
            Error::SpreadsheetError(e) => write!(f, "Spreadsheet error: {}", e),
            Error::InvalidResponse => write!(f, "Invalid server response"),
            Error::MalformedRecord(s) => write!(f, "Malformed record: {}", s),
            Error::UnsupportedFormat(s) => write!(f, "Unsupported format: {}", s),
            Error::InvalidParameters(s) => write!(f, "Invalid parameters: {}", s),
            Error::OutOfRange(s) => write!(f, "Out of range: {}", s),
            Error::NotFound(s) => write!(f, "Not found: {}", s),
            Error::ForeignSource(s) => write!(f, "Source does not belong here: {}", s),
            Error::InvalidIndex(s) => write!(f, "Invalid index: {}", s),
            Error::NotRegistered(s) => write!(f, "Not registered: {}", s),
            Error::NotReady(s) => write!(f, "Collection not ready: {}", s),
            Error::BatchFailed(failures) => {
                write!(f, "{} batch item(s) failed", failures.len())?;
                for failure in failures {
                    write!(f, "\n  {}", failure)?;
                }
                Ok(())
            }
            Error::Cancelled => write!(f, "Cancelled before completion"),
            Error::EmptyToken => write!(f, "Authentication token is empty"),
            Error::Unauthorized(body) => {
                write!(f, "Unauthorized, please login again: {}", body)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(e) => Some(e),
            Error::ConfigError(e) => Some(e),
            Error::JsonError(e) => Some(e),
            Error::HttpError(e) => Some(e),
            Error::UrlParseError(e) => Some(e),
            Error::JoinError(e) => Some(e),
            Error::StorageError(e) => Some(e),
            Error::PolarsError(e) => Some(e),
            Error::ImageError(e) => Some(e),
            Error::SpreadsheetError(e) => Some(e),
            _ => None,
        }
    }
}
