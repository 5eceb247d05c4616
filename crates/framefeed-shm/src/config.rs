//! Configuration for locating and opening the shared region

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::DEFAULT_PRODUCT_ID;

/// Environment variable overriding [`ShmConfig::product_id`].
pub const PRODUCT_ID_ENV: &str = "FRAMEFEED_SHM_PRODUCT_ID";

/// Environment variable overriding [`SoftwareVersion::build`].
pub const BUILD_ENV: &str = "FRAMEFEED_SHM_BUILD";

/// Build number baked in at compile time, if any.
const COMPILED_BUILD_NUMBER: Option<&str> = option_env!("FRAMEFEED_BUILD_NUMBER");

/// Version quadruplet embedded in the region name.
///
/// Feeder and consumer only meet when all four parts match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SoftwareVersion {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
    /// Patch version
    pub patch: u32,
    /// Build number
    pub build: u32,
}

impl SoftwareVersion {
    /// Create a version from its parts.
    pub const fn new(major: u32, minor: u32, patch: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            build,
        }
    }

    /// Version of this crate, with the compile-time build number if set.
    pub fn current() -> Self {
        Self {
            major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
            patch: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
            build: COMPILED_BUILD_NUMBER
                .and_then(|build| build.parse().ok())
                .unwrap_or(0),
        }
    }
}

impl Default for SoftwareVersion {
    fn default() -> Self {
        Self::current()
    }
}

impl std::fmt::Display for SoftwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.patch, self.build)
    }
}

/// Configuration for the shared region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShmConfig {
    /// Reverse-domain product identifier, the first part of the region name
    pub product_id: String,

    /// Software version, the second part of the region name
    pub version: SoftwareVersion,

    /// How long to wait for another process to finish initializing the
    /// named mutex (Linux)
    pub mutex_init_timeout: Duration,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            product_id: DEFAULT_PRODUCT_ID.to_string(),
            version: SoftwareVersion::current(),
            mutex_init_timeout: Duration::from_secs(1),
        }
    }
}

impl ShmConfig {
    /// Create a configuration for the given product identifier
    pub fn new(product_id: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            ..Default::default()
        }
    }

    /// Create a configuration from environment variables
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(product_id) = std::env::var(PRODUCT_ID_ENV)
            && !product_id.is_empty()
        {
            config.product_id = product_id;
        }
        if let Some(build) = std::env::var(BUILD_ENV)
            .ok()
            .and_then(|build| build.parse().ok())
        {
            config.version.build = build;
        }
        config
    }

    /// Set the product identifier
    #[must_use]
    pub fn with_product_id(mut self, product_id: impl Into<String>) -> Self {
        self.product_id = product_id.into();
        self
    }

    /// Set the software version
    #[must_use]
    pub const fn with_version(mut self, version: SoftwareVersion) -> Self {
        self.version = version;
        self
    }

    /// Set the build number only
    #[must_use]
    pub const fn with_build(mut self, build: u32) -> Self {
        self.version.build = build;
        self
    }

    /// Set the mutex initialization timeout
    #[must_use]
    pub const fn with_mutex_init_timeout(mut self, timeout: Duration) -> Self {
        self.mutex_init_timeout = timeout;
        self
    }
}
