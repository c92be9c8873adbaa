// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Retry policies with URL-based classification for the Zegami Client.
//!
//! Requests fall into two categories:
//!
//! - **Api**: platform REST calls under `/api/` and `/oauth/`. Authentication
//!   failures (401, 403) must fail fast so users get quick feedback on bad
//!   credentials, while timeouts, rate limiting and gateway errors are retried.
//! - **BlobStorage**: signed-URL uploads and downloads against the storage
//!   account. These run with high concurrency during batch transfers and are
//!   retried on every transient status, including 409 and 423 which storage
//!   services return under contention.
//!
//! The retry count is configurable through `ZEGAMI_MAX_RETRIES` (default 3),
//! see [`ClientConfig`](crate::ClientConfig).
//!
//! ```rust
//! use zegami_client::{RetryScope, classify_url};
//!
//! assert_eq!(
//!     classify_url("https://zegami.com/api/v0/project/ws/collections/"),
//!     RetryScope::Api
//! );
//! assert_eq!(
//!     classify_url("https://acct.blob.core.windows.net/c/storage/abc?sig=x"),
//!     RetryScope::BlobStorage
//! );
//! ```

use url::Url;

/// Retry scope classification for URL-based retry policies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryScope {
    /// Platform REST API calls (`/api/...` and `/oauth/...`).
    Api,
    /// Signed blob storage transfers and any other non-API URL.
    BlobStorage,
}

/// Classifies a URL to determine which retry policy to apply.
///
/// Only `http` and `https` URLs whose path is exactly `/api`, `/oauth` or
/// lies beneath them are classified as [`RetryScope::Api`]; everything else,
/// including unparseable input, is [`RetryScope::BlobStorage`].
pub fn classify_url(url: &str) -> RetryScope {
    if let Ok(parsed) = Url::parse(url) {
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return RetryScope::BlobStorage;
        }

        let path = parsed.path();
        let is_api = ["/api", "/oauth"]
            .iter()
            .any(|prefix| path == *prefix || path.starts_with(&format!("{}/", prefix)));

        if is_api {
            return RetryScope::Api;
        }
    }

    RetryScope::BlobStorage
}

/// Creates a retry policy with URL-based classification.
///
/// | Scope | Retried | Never retried |
/// |-------|---------|---------------|
/// | Api | 408, 429, 500-599, transport errors | 401, 403 |
/// | BlobStorage | 408, 409, 423, 429, 500-599, transport errors | |
///
/// Both scopes share `max_retries`; reqwest applies one budget per request.
pub fn create_retry_policy(max_retries: u32) -> reqwest::retry::Builder {
    reqwest::retry::for_host("*")
        .max_retries_per_request(max_retries)
        .classify_fn(|req_rep| {
            let url = req_rep.uri().to_string();

            match classify_url(&url) {
                RetryScope::Api => match req_rep.status() {
                    Some(status) => match status.as_u16() {
                        401 | 403 => req_rep.success(),
                        408 | 429 | 500..=599 => req_rep.retryable(),
                        _ => req_rep.success(),
                    },
                    None if req_rep.error().is_some() => req_rep.retryable(),
                    None => req_rep.success(),
                },
                RetryScope::BlobStorage => match req_rep.status() {
                    Some(status) => match status.as_u16() {
                        408 | 409 | 423 | 429 | 500..=599 => req_rep.retryable(),
                        _ => req_rep.success(),
                    },
                    None if req_rep.error().is_some() => req_rep.retryable(),
                    None => req_rep.success(),
                },
            }
        })
}

pub fn log_retry_configuration(max_retries: u32, timeout: u64) {
    log::debug!(
        "Retry configuration - max_retries={}, timeout={}s",
        max_retries,
        timeout
    );
}
