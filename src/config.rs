//! Runtime configuration for the catalog client and the download pool.
//!
//! Every field has a default so a partial JSON file (or none at all) is
//! enough to get going.

use crate::types::{FinderError, FinderResult, LonLat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// USGS machine-to-machine API root
pub const DEFAULT_ENDPOINT: &str = "https://m2m.cr.usgs.gov/api/api/json/stable/";

/// Landsat 8/9 Collection 2 Level-2
pub const DEFAULT_DATASET: &str = "landsat_ot_c2_l2";

/// Upper bound accepted for either `max_retries` setting
pub const MAX_RETRIES: u32 = 10;

/// First retry waits this long; each further retry doubles it
const RETRY_BASE_MS: u64 = 500;

/// Ceiling on a single backoff pause
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Backoff before retry number `attempt` (1-based): 500ms, 1s, 2s, ... capped
/// at [`MAX_RETRY_DELAY`]
pub fn retry_delay(attempt: u32) -> Duration {
    let factor = 1u64
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    Duration::from_millis(RETRY_BASE_MS.saturating_mul(factor)).min(MAX_RETRY_DELAY)
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FinderConfig {
    pub client: ClientConfig,
    pub download: DownloadConfig,
}

/// Remote catalog defaults and transport parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base endpoint every logical endpoint name is joined onto
    pub endpoint: String,
    pub dataset: String,
    /// Cloud-cover ceiling in percent
    pub cloud_cover: f64,
    pub lonlat: LonLat,
    pub month: u32,
    pub year: i32,
    pub max_return: u32,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            dataset: DEFAULT_DATASET.to_string(),
            cloud_cover: 30.0,
            lonlat: LonLat::new(54.199, 38.499), // Turkmenistan coast
            month: 11,
            year: 2018,
            max_return: 20,
            request_timeout_secs: 60,
            max_retries: 3,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Download pool and extraction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Catalog root; assets land in `<root>/<tile>/<date>/`
    pub working_folder: PathBuf,
    pub max_concurrent: usize,
    pub task_timeout_secs: u64,
    pub max_retries: u32,
    /// Remove the archive once its bands are extracted
    pub delete_archive: bool,
    /// Honor `HTTP_PROXY`/`HTTPS_PROXY` from the environment
    pub use_env_proxy: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            working_folder: std::env::temp_dir().join("data").join("landsat"),
            max_concurrent: 4,
            task_timeout_secs: 3600,
            max_retries: 3,
            delete_archive: true,
            use_env_proxy: true,
        }
    }
}

impl DownloadConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

impl FinderConfig {
    /// Default location: `<config dir>/methane_finder/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("methane_finder").join("config.json"))
    }

    /// Read configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> FinderResult<Self> {
        let path = path.as_ref();
        log::info!("Loading configuration: {}", path.display());

        let content = std::fs::read_to_string(path)?;
        let config: FinderConfig = serde_json::from_str(&content)
            .map_err(|e| FinderError::Config(format!("{}: {}", path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, or fall back to defaults when absent
    pub fn load_or_default() -> FinderResult<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => {
                log::debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> FinderResult<()> {
        if !(1..=12).contains(&self.client.month) {
            return Err(FinderError::Config(format!(
                "month must be 1-12, got {}",
                self.client.month
            )));
        }
        for (section, retries) in [
            ("client", self.client.max_retries),
            ("download", self.download.max_retries),
        ] {
            if retries > MAX_RETRIES {
                return Err(FinderError::Config(format!(
                    "{}.max_retries must be at most {}, got {}",
                    section, MAX_RETRIES, retries
                )));
            }
        }
        if self.download.max_concurrent == 0 {
            return Err(FinderError::Config(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
