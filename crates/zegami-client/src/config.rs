// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Layered client configuration.
//!
//! Values are resolved in order, later layers winning:
//!
//! 1. Built-in defaults
//! 2. `zegami.toml` in the platform config directory (optional)
//! 3. `ZEGAMI_*` environment variables (`ZEGAMI_HOME`, `ZEGAMI_TIMEOUT`,
//!    `ZEGAMI_MAX_RETRIES`, `ZEGAMI_MAX_TASKS`, `ZEGAMI_MAX_WORKERS`)

use crate::Error;
use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_HOME: &str = "https://zegami.com";

fn default_max_tasks() -> usize {
    // Half the CPUs, at least 2 and at most 8.
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (cpus / 2).clamp(2, 8)
}

/// Runtime settings shared by every clone of a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the Zegami deployment.
    pub home: String,
    /// Per-request timeout in seconds.
    pub timeout: u64,
    /// Retries per request applied by the transport.
    pub max_retries: u32,
    /// Default concurrency for uploads and signed URL generation.
    pub max_tasks: usize,
    /// Default concurrency for image downloads.
    pub max_workers: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            home: DEFAULT_HOME.to_string(),
            timeout: 30,
            max_retries: 3,
            max_tasks: default_max_tasks(),
            max_workers: 50,
        }
    }
}

impl ClientConfig {
    /// Load configuration from the default config file and the environment.
    pub fn load() -> Result<Self, Error> {
        let path = ProjectDirs::from("com", "Zegami", "zegami")
            .map(|dirs| dirs.config_dir().join("zegami.toml"));
        Self::load_from(path.as_deref())
    }

    /// Load configuration from an explicit (optional) file and the
    /// environment.
    pub fn load_from(path: Option<&Path>) -> Result<Self, Error> {
        let defaults = ClientConfig::default();

        let mut builder = Config::builder()
            .set_default("home", defaults.home)?
            .set_default("timeout", defaults.timeout)?
            .set_default("max_retries", defaults.max_retries as u64)?
            .set_default("max_tasks", defaults.max_tasks as u64)?
            .set_default("max_workers", defaults.max_workers as u64)?;

        if let Some(path) = path {
            log::debug!("Reading configuration from {:?}", path);
            builder = builder.add_source(File::from(PathBuf::from(path)).required(false));
        }

        let config: ClientConfig = builder
            .add_source(Environment::with_prefix("ZEGAMI").try_parsing(true))
            .build()?
            .try_deserialize()?;

        if config.max_tasks == 0 || config.max_workers == 0 {
            return Err(Error::InvalidParameters(
                "max_tasks and max_workers must be at least 1".to_string(),
            ));
        }

        Ok(ClientConfig {
            home: config.home.trim_end_matches('/').to_string(),
            ..config
        })
    }
}
