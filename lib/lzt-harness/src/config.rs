// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Harness configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. TOML file from the `LZT_CONFIG_PATH` environment variable
//! 3. Environment variables (`LZT_POOL_*`, `LZT_CHAIN_*`, `LZT_EXECUTOR_*`)

use std::time::Duration;

use figment::{
    Figment, Metadata, Profile, Provider,
    providers::{Env, Format, Serialized, Toml},
    value::{Dict, Map},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

/// ENV pointing at an optional TOML configuration file.
const CONFIG_PATH_ENV: &str = "LZT_CONFIG_PATH";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be parsed or did not match the schema.
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    /// Values parsed but fell outside their allowed ranges.
    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Top-level harness configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct HarnessConfig {
    /// Sync pool sizing.
    #[validate(nested)]
    #[serde(default)]
    pub pool: PoolConfig,

    /// Chain polling and timeouts.
    #[validate(nested)]
    #[serde(default)]
    pub chain: ChainConfig,

    /// Executor collection.
    #[validate(nested)]
    #[serde(default)]
    pub executor: ExecutorConfig,
}

/// Sync pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PoolConfig {
    /// Slots in a pool created without an explicit capacity.
    /// Default: 32
    #[serde(default = "default_pool_capacity")]
    #[validate(range(min = 1, max = 65536))]
    pub default_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_capacity: default_pool_capacity(),
        }
    }
}

fn default_pool_capacity() -> usize {
    32
}

/// Chain configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ChainConfig {
    /// How often `synchronize_all` polls executors, in microseconds.
    /// Default: 500
    #[serde(default = "default_poll_interval_us")]
    #[validate(range(min = 10, max = 1_000_000))]
    pub poll_interval_us: u64,

    /// Suggested timeout for `synchronize_all`, in milliseconds.
    /// Default: 5000
    #[serde(default = "default_sync_timeout_ms")]
    #[validate(range(min = 1))]
    pub sync_timeout_ms: u64,
}

impl ChainConfig {
    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    /// Synchronization timeout as a [`Duration`].
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            poll_interval_us: default_poll_interval_us(),
            sync_timeout_ms: default_sync_timeout_ms(),
        }
    }
}

fn default_poll_interval_us() -> u64 {
    500
}

fn default_sync_timeout_ms() -> u64 {
    5000
}

/// Executor collection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ExecutorConfig {
    /// Number of executors built by `QueueExecutor::group`.
    /// Default: 2
    #[serde(default = "default_executor_count")]
    #[validate(range(min = 1, max = 64))]
    pub count: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            count: default_executor_count(),
        }
    }
}

fn default_executor_count() -> usize {
    2
}

impl HarnessConfig {
    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(HarnessConfig::default()))
            .merge(Toml::file(&config_path))
            // LZT_POOL_DEFAULT_CAPACITY
            .merge(
                Env::prefixed("LZT_POOL_")
                    .map(|k| format!("pool.{}", k.as_str().to_lowercase()).into()),
            )
            // LZT_CHAIN_POLL_INTERVAL_US, LZT_CHAIN_SYNC_TIMEOUT_MS
            .merge(
                Env::prefixed("LZT_CHAIN_")
                    .map(|k| format!("chain.{}", k.as_str().to_lowercase()).into()),
            )
            // LZT_EXECUTOR_COUNT
            .merge(
                Env::prefixed("LZT_EXECUTOR_")
                    .map(|k| format!("executor.{}", k.as_str().to_lowercase()).into()),
            )
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from any provider.
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }
}

impl Provider for HarnessConfig {
    fn metadata(&self) -> Metadata {
        Metadata::named("HarnessConfig")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}
