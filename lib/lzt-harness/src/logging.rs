// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Harness logging.
//!
//! Logging can take two forms: `READABLE` or `JSONL`. The default is `READABLE`. `JSONL`
//! can be enabled by setting the `LZT_LOGGING_JSONL` environment variable to `1`.
//!
//! Filters follow `EnvFilter` syntax and are read from `LZT_LOG`, e.g.
//! `LZT_LOG=info,lzt_harness::chain=debug`. Defaults and per-module filters
//! can also come from a TOML file named by `LZT_LOGGING_CONFIG_PATH`:
//!
//! ```toml
//! log_level = "warn"
//!
//! [log_filters]
//! "lzt_harness::executor" = "trace"
//! ```
//!
//! Executor steps run inside a `step` span carrying `executor` and `step`
//! fields, so step transitions can be attributed without extra context.

use std::collections::HashMap;
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// ENV used to set the log level
const FILTER_ENV: &str = "LZT_LOG";

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

/// ENV used to set the path to the logging configuration file
const CONFIG_PATH_ENV: &str = "LZT_LOGGING_CONFIG_PATH";

/// ENV switching output to JSON lines
const JSONL_ENV: &str = "LZT_LOGGING_JSONL";

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::from([("tokio_util".to_string(), "error".to_string())]),
        }
    }
}

/// Initialize the logger. Safe to call more than once.
pub fn init() {
    INIT.call_once(setup_logging);
}

fn jsonl_logging_enabled() -> bool {
    std::env::var(JSONL_ENV).is_ok_and(|value| matches!(value.as_str(), "1" | "true"))
}

fn setup_logging() {
    let filter_layer = filters(load_config());
    // The generics mean we have to repeat everything. Each builder method returns a
    // specialized type.
    let installed = if jsonl_logging_enabled() {
        let l = fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry().with(l).try_init()
    } else {
        let l = fmt::layer()
            .event_format(fmt::format().compact())
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        tracing_subscriber::registry().with(l).try_init()
    };
    if let Err(e) = installed {
        eprintln!("Failed to install harness logger: {e}");
    }
}

fn filters(config: LoggingConfig) -> EnvFilter {
    let default_directive = config
        .log_level
        .parse::<Directive>()
        .unwrap_or_else(|e| {
            eprintln!(
                "Invalid log level '{}': {e}; using {DEFAULT_FILTER_LEVEL}",
                config.log_level
            );
            LevelFilter::INFO.into()
        });
    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    // apply the log_filters from the config file
    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }
    filter_layer
}

fn load_config() -> LoggingConfig {
    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();
    Figment::new()
        .merge(Serialized::defaults(LoggingConfig::default()))
        .merge(Toml::file(config_path))
        .extract()
        .unwrap_or_else(|e| {
            eprintln!("Failed to load logging config: {e}; using defaults");
            LoggingConfig::default()
        })
}
