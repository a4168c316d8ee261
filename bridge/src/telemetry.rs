// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide `tracing` subscriber setup.

use once_cell::sync::OnceCell;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Clone, Debug, Default)]
pub struct TelemetryConfig {
    // Default directive when `RUST_LOG` is not set.
    pub log_level: Option<String>,
    pub json_log_output: bool,
    pub log_target: bool,
}

impl TelemetryConfig {
    pub fn new() -> Self {
        Self {
            log_target: true,
            ..Default::default()
        }
    }

    pub fn with_log_level(mut self, log_level: &str) -> Self {
        self.log_level = Some(log_level.to_string());
        self
    }

    pub fn with_json(mut self) -> Self {
        self.json_log_output = true;
        self
    }

    // Reads `RUST_LOG_JSON` on top of what was set explicitly.
    pub fn with_env(mut self) -> Self {
        if std::env::var("RUST_LOG_JSON").is_ok() {
            self.json_log_output = true;
        }
        self
    }

    fn env_filter(&self) -> EnvFilter {
        let default = self.log_level.as_deref().unwrap_or("info");
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .try_from_env()
            .unwrap_or_else(|_| EnvFilter::new(default))
    }

    /// Installs the global subscriber. Fails if one is already installed.
    pub fn init(self) -> anyhow::Result<()> {
        let filter = self.env_filter();
        let registry = tracing_subscriber::registry().with(filter);
        if self.json_log_output {
            registry
                .with(fmt::layer().json().with_target(self.log_target))
                .try_init()?;
        } else {
            registry
                .with(fmt::layer().with_target(self.log_target))
                .try_init()?;
        }
        Ok(())
    }
}

static TEST_SUBSCRIBER: OnceCell<()> = OnceCell::new();

// Safe to call from every test.
pub fn init_for_testing() {
    TEST_SUBSCRIBER.get_or_init(|| {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}
