// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! In-memory transport for unit tests.

use crate::{
    Client, ClientConfig, Error,
    transport::{HttpRequest, HttpResponse, Method, Transport},
};
use async_trait::async_trait;
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

pub const TEST_HOME: &str = "https://zegami.test";

#[derive(Clone)]
struct Route {
    method: Method,
    pattern: String,
    status: u16,
    content_type: Option<String>,
    body: Vec<u8>,
}

/// Route table keyed on method and URL substring.
///
/// When several routes match, the longest pattern wins; among equal patterns
/// the most recently added one. Unmatched requests answer 404.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    delays: Mutex<Vec<(String, Duration)>>,
    calls: Mutex<Vec<HttpRequest>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, method: Method, pattern: &str, body: serde_json::Value) {
        self.add(Route {
            method,
            pattern: pattern.to_string(),
            status: 200,
            content_type: Some("application/json".to_string()),
            body: body.to_string().into_bytes(),
        });
    }

    pub fn route_status(&self, method: Method, pattern: &str, status: u16, body: Vec<u8>) {
        self.add(Route {
            method,
            pattern: pattern.to_string(),
            status,
            content_type: None,
            body,
        });
    }

    pub fn route_bytes(&self, method: Method, pattern: &str, body: Vec<u8>, content_type: &str) {
        self.add(Route {
            method,
            pattern: pattern.to_string(),
            status: 200,
            content_type: Some(content_type.to_string()),
            body,
        });
    }

    /// Delay every request whose URL contains `pattern`.
    pub fn delay(&self, pattern: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .push((pattern.to_string(), delay));
    }

    pub fn calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded calls with `method` whose URL contains `pattern`.
    pub fn count(&self, method: Method, pattern: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.method == method && call.url.contains(pattern))
            .count()
    }

    /// Highest number of requests that were being served at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn add(&self, route: Route) {
        self.routes.lock().unwrap().push(route);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, Error> {
        self.calls.lock().unwrap().push(request.clone());

        let delay = self
            .delays
            .lock()
            .unwrap()
            .iter()
            .filter(|(pattern, _)| request.url.contains(pattern.as_str()))
            .map(|(_, delay)| *delay)
            .max();
        if let Some(delay) = delay {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        let route = self
            .routes
            .lock()
            .unwrap()
            .iter()
            .filter(|route| route.method == request.method && request.url.contains(&route.pattern))
            .max_by_key(|route| route.pattern.len())
            .cloned();

        Ok(match route {
            Some(route) => HttpResponse {
                status: route.status,
                reason: String::new(),
                content_type: route.content_type,
                body: route.body,
            },
            None => HttpResponse {
                status: 404,
                reason: "Not Found".to_string(),
                content_type: None,
                body: format!("no route for {} {}", request.method, request.url).into_bytes(),
            },
        })
    }
}

/// An unauthenticated client on [`TEST_HOME`] backed by `mock`.
pub fn test_client(mock: Arc<MockTransport>) -> Client {
    test_client_with(mock, ClientConfig::default())
}

/// Like [`test_client`], keeping every setting of `config` but its home.
pub fn test_client_with(mock: Arc<MockTransport>, config: ClientConfig) -> Client {
    Client::from_transport(
        ClientConfig {
            home: TEST_HOME.to_string(),
            ..config
        },
        mock,
    )
}

/// A small PNG with a solid color, encoded in memory.
pub fn png_bytes(width: u32, height: u32, shade: u8) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([shade, shade, shade]));
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}
