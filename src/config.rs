use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub trash: TrashConfig,
    #[serde(default)]
    pub consume: ConsumeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Filesystem locations the task layer reads from and writes to.
#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Failed source files are moved here, named after their task.
    pub quarantine_dir: PathBuf,
    /// Stored originals, one file per document.
    pub originals_dir: PathBuf,
    /// Working copies for retries and repairs.
    pub scratch_dir: PathBuf,
    /// Serialized classifier model plus its corpus fingerprint.
    pub model_file: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrashConfig {
    #[serde(default = "default_delay_days")]
    pub delay_days: u64,
}

impl Default for TrashConfig {
    fn default() -> Self {
        Self {
            delay_days: default_delay_days(),
        }
    }
}

impl TrashConfig {
    /// The grace period. An out-of-range `delay_days` saturates, so nothing
    /// ever becomes eligible.
    pub fn delay(&self) -> Duration {
        delay_from_days(self.delay_days).unwrap_or(Duration::MAX)
    }
}

/// Convert a grace period in days, or `None` when it does not fit in
/// signed epoch seconds.
pub fn delay_from_days(days: u64) -> Option<Duration> {
    let secs = days.checked_mul(24 * 60 * 60)?;
    i64::try_from(secs).ok()?;
    Some(Duration::from_secs(secs))
}

fn default_delay_days() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConsumeConfig {
    /// Remove consume-folder sources once the document is stored.
    #[serde(default = "default_delete_consumed")]
    pub delete_consumed: bool,
}

impl Default for ConsumeConfig {
    fn default() -> Self {
        Self {
            delete_consumed: default_delete_consumed(),
        }
    }
}

fn default_delete_consumed() -> bool {
    true
}

impl Config {
    /// Build a config rooted in a single data directory.
    pub fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            db: DbConfig {
                path: data_dir.join("docket.sqlite"),
            },
            paths: PathsConfig {
                quarantine_dir: data_dir.join("failed"),
                originals_dir: data_dir.join("originals"),
                scratch_dir: data_dir.join("scratch"),
                model_file: data_dir.join("classification_model.json"),
            },
            trash: TrashConfig::default(),
            consume: ConsumeConfig::default(),
        }
    }

    /// Create every configured directory that does not exist yet.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.paths.quarantine_dir,
            &self.paths.originals_dir,
            &self.paths.scratch_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        if let Some(parent) = self.paths.model_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.trash.delay_days == 0 {
            anyhow::bail!("trash.delay_days must be >= 1");
        }
        if delay_from_days(self.trash.delay_days).is_none() {
            anyhow::bail!("trash.delay_days is out of range: {}", self.trash.delay_days);
        }

        let p = &self.paths;
        if p.quarantine_dir == p.originals_dir
            || p.quarantine_dir == p.scratch_dir
            || p.originals_dir == p.scratch_dir
        {
            anyhow::bail!(
                "paths.quarantine_dir, paths.originals_dir and paths.scratch_dir must be distinct"
            );
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
