// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! HTTP transport seam.
//!
//! Every request the client makes goes through a [`Transport`]. The default
//! [`ReqwestTransport`] owns a pooled `reqwest::Client` configured with the
//! timeouts and [retry policy](crate::retry) from [`ClientConfig`]; tests
//! substitute an in-memory implementation.

use crate::{
    ClientConfig, Error,
    retry::{create_retry_policy, log_retry_configuration},
};
use async_trait::async_trait;
use log::{Level, log_enabled, trace};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use std::time::Duration;

pub use reqwest::Method;

/// Body of an outgoing request.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

/// A single outgoing HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        HttpRequest {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    pub fn bytes(mut self, body: Vec<u8>) -> Self {
        self.body = Some(RequestBody::Bytes(body));
        self
    }

    /// Case-insensitive header lookup.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json_body(&self) -> Option<&serde_json::Value> {
        match &self.body {
            Some(RequestBody::Json(value)) => Some(value),
            _ => None,
        }
    }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Converts a non-2xx response into [`Error::HttpStatus`] carrying the
    /// status, reason and body text.
    pub fn error_for_status(self) -> Result<Self, Error> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::HttpStatus(
                self.status,
                self.reason,
                String::from_utf8_lossy(&self.body).into_owned(),
            ))
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        match serde_json::from_slice(&self.body) {
            Ok(value) => Ok(value),
            Err(err) => {
                log::error!("Invalid JSON Response: {}", String::from_utf8_lossy(&self.body));
                Err(err.into())
            }
        }
    }
}

/// Sends HTTP requests on behalf of a [`Client`](crate::Client).
///
/// Implementations return every response they receive, successful or not;
/// status handling happens in the client.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, Error>;
}

/// [`Transport`] backed by reqwest with URL-classified retries.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, Error> {
        log_retry_configuration(config.max_retries, config.timeout);

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("zegami-client/", env!("CARGO_PKG_VERSION")))
            .retry(create_retry_policy(config.max_retries))
            .build()?;

        Ok(ReqwestTransport { http })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, Error> {
        let mut builder = self.http.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match request.body {
            Some(RequestBody::Json(body)) => builder.json(&body),
            Some(RequestBody::Bytes(body)) => builder.header(CONTENT_LENGTH, body.len()).body(body),
            None => builder,
        };

        let resp = builder.send().await?;
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await?.to_vec();

        if log_enabled!(Level::Trace) {
            trace!(
                "{} {} -> {}: {}",
                request.method,
                request.url,
                status,
                String::from_utf8_lossy(&body)
            );
        }

        Ok(HttpResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            content_type,
            body,
        })
    }
}
