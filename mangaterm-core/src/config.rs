use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

use crate::error::{ReaderError, ReaderResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ReaderConfig {
    pub api: ApiConfig,
    pub pipeline: PipelineConfig,
    pub window: WindowConfig,
    pub scrub: ScrubConfig,
    pub library: LibraryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub uploads_url: String,
    pub user_agent: String,
    pub languages: Vec<String>,
    pub adult_content: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.mangadex.org".into(),
            uploads_url: "https://uploads.mangadex.org".into(),
            user_agent: concat!("mangaterm/", env!("CARGO_PKG_VERSION")).into(),
            languages: vec!["en".into()],
            adult_content: false,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub probe_concurrency: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "probe_timeout_ms")]
    pub probe_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            probe_concurrency: 5,
            probe_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub initial: usize,
    pub batch: usize,
    pub window: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            initial: 5,
            batch: 4,
            window: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrubConfig {
    pub lane_columns: u16,
}

impl Default for ScrubConfig {
    fn default() -> Self {
        Self { lane_columns: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LibraryConfig {
    /// Overrides the platform data directory for the library store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl ReaderConfig {
    pub fn from_toml_str(raw: &str) -> ReaderResult<Self> {
        let config: ReaderConfig =
            toml::from_str(raw).map_err(|err| ReaderError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> ReaderResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|err| {
            ReaderError::InvalidConfig(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn project_dirs() -> Option<ProjectDirs> {
        ProjectDirs::from("org", "mangaterm", "mangaterm")
    }

    pub fn default_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> ReaderResult<()> {
        if self.window.window == 0 || self.window.batch == 0 || self.window.initial == 0 {
            return Err(ReaderError::InvalidConfig(
                "window sizes must be at least one page".into(),
            ));
        }
        if self.pipeline.probe_timeout.is_zero() {
            return Err(ReaderError::InvalidConfig(
                "probe timeout must be positive".into(),
            ));
        }
        if self.api.base_url.trim().is_empty() {
            return Err(ReaderError::InvalidConfig("api base url is empty".into()));
        }
        Ok(())
    }
}
