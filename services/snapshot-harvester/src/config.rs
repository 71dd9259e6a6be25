//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys come from YOUTUBE_API_KEYS or api_keys_file and the hub token
//! from HF_TOKEN or token_file, never from the TOML directly.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use harvest::{FetchConfig, SchedulerConfig};
use hub_upload::{HubTarget, UploaderConfig};

pub const DEFAULT_CONFIG_FILE: &str = "snapshot-harvester.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub harvest: HarvestConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

/// Metadata API settings
#[derive(Debug, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_url")]
    pub base_url: String,
    #[serde(default = "default_source_timeout")]
    pub timeout_secs: u64,
    /// File with one or more API keys (alternative to YOUTUBE_API_KEYS)
    #[serde(default)]
    pub api_keys_file: Option<PathBuf>,
    #[serde(skip)]
    pub api_keys: Vec<Secret<String>>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_source_url(),
            timeout_secs: default_source_timeout(),
            api_keys_file: None,
            api_keys: Vec::new(),
        }
    }
}

/// Harvest run settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub work_list: PathBuf,
    pub results_dir: PathBuf,
    pub legacy_results_dir: Option<PathBuf>,
    pub run_index_name: String,
    pub batch_size: usize,
    pub concurrency: usize,
    pub stall_threshold: u32,
    pub transient_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub fetch_channel: bool,
    pub fetch_comments: bool,
    pub max_comments: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        let fetch = FetchConfig::default();
        Self {
            work_list: PathBuf::from("urls.json"),
            results_dir: scheduler.results_dir,
            legacy_results_dir: scheduler.legacy_results_dir,
            run_index_name: scheduler.run_index_name,
            batch_size: scheduler.batch_size,
            concurrency: scheduler.concurrency,
            stall_threshold: scheduler.stall_threshold,
            transient_retries: fetch.transient_retries,
            initial_backoff_ms: fetch.initial_backoff.as_millis() as u64,
            max_backoff_ms: fetch.max_backoff.as_millis() as u64,
            fetch_channel: fetch.fetch_channel,
            fetch_comments: fetch.fetch_comments,
            max_comments: fetch.max_comments,
        }
    }
}

impl HarvestConfig {
    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            transient_retries: self.transient_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            fetch_channel: self.fetch_channel,
            fetch_comments: self.fetch_comments,
            max_comments: self.max_comments,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            stall_threshold: self.stall_threshold,
            results_dir: self.results_dir.clone(),
            legacy_results_dir: self.legacy_results_dir.clone(),
            run_index_name: self.run_index_name.clone(),
        }
    }
}

/// Hub upload settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub endpoint: String,
    pub repo_id: Option<String>,
    pub repo_type: String,
    pub revision: String,
    /// Path to a file containing the hub token (alternative to HF_TOKEN)
    pub token_file: Option<PathBuf>,
    #[serde(skip)]
    pub token: Option<Secret<String>>,
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub detection_threshold: usize,
    pub min_batches_per_commit: usize,
    pub max_wait_secs: u64,
    pub max_commits_per_hour: usize,
    pub max_batches_per_commit: usize,
    pub max_files_per_commit: usize,
    pub split_floor: usize,
    pub single_delay_ms: u64,
    pub rate_limit_cooldown_secs: u64,
    pub snapshot_label: String,
    pub results_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub cat2ids_path: Option<PathBuf>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        let uploader = UploaderConfig::default();
        Self {
            endpoint: hub_upload::hub::DEFAULT_ENDPOINT.to_string(),
            repo_id: None,
            repo_type: "dataset".to_string(),
            revision: "main".to_string(),
            token_file: None,
            token: None,
            timeout_secs: 120,
            poll_interval_secs: uploader.poll_interval.as_secs(),
            detection_threshold: uploader.detection_threshold,
            min_batches_per_commit: uploader.min_batches_per_commit,
            max_wait_secs: uploader.max_wait.as_secs(),
            max_commits_per_hour: uploader.max_commits_per_hour,
            max_batches_per_commit: uploader.max_batches_per_commit,
            max_files_per_commit: uploader.max_files_per_commit,
            split_floor: uploader.split_floor,
            single_delay_ms: uploader.single_delay.as_millis() as u64,
            rate_limit_cooldown_secs: uploader.rate_limit_cooldown.as_secs(),
            snapshot_label: uploader.snapshot_label,
            results_dir: uploader.results_dir,
            cache_dir: uploader.cache_dir,
            cat2ids_path: uploader.cat2ids_path,
        }
    }
}

impl UploadConfig {
    /// `None` when no `repo_id` is configured.
    pub fn target(&self) -> Option<HubTarget> {
        self.repo_id.as_ref().map(|repo_id| HubTarget {
            endpoint: self.endpoint.clone(),
            repo_id: repo_id.clone(),
            repo_type: self.repo_type.clone(),
            revision: self.revision.clone(),
        })
    }

    pub fn uploader_config(&self) -> UploaderConfig {
        UploaderConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            detection_threshold: self.detection_threshold,
            min_batches_per_commit: self.min_batches_per_commit,
            max_wait: Duration::from_secs(self.max_wait_secs),
            max_commits_per_hour: self.max_commits_per_hour,
            max_batches_per_commit: self.max_batches_per_commit,
            max_files_per_commit: self.max_files_per_commit,
            split_floor: self.split_floor,
            single_delay: Duration::from_millis(self.single_delay_ms),
            rate_limit_cooldown: Duration::from_secs(self.rate_limit_cooldown_secs),
            snapshot_label: self.snapshot_label.clone(),
            results_dir: self.results_dir.clone(),
            cache_dir: self.cache_dir.clone(),
            cat2ids_path: self.cat2ids_path.clone(),
        }
    }
}

/// Status endpoint settings. No listener when `listen_addr` is unset.
#[derive(Debug, Default, Deserialize)]
pub struct StatusConfig {
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
}

fn default_source_url() -> String {
    metadata_source::youtube::DEFAULT_BASE_URL.to_string()
}

fn default_source_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Secret resolution order:
    /// 1. YOUTUBE_API_KEYS / HF_TOKEN env var
    /// 2. api_keys_file / token_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(raw) = std::env::var("YOUTUBE_API_KEYS") {
            config.source.api_keys = parse_keys(&raw);
        } else if let Some(ref keys_file) = config.source.api_keys_file {
            let raw = read_secret_file(keys_file, "api_keys_file")?;
            config.source.api_keys = parse_keys(&raw);
        }

        if let Ok(token) = std::env::var("HF_TOKEN") {
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.upload.token = Some(Secret::new(token));
            }
        } else if let Some(ref token_file) = config.upload.token_file {
            let token = read_secret_file(token_file, "token_file")?;
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.upload.token = Some(Secret::new(token));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        require_http("source.base_url", &self.source.base_url)?;
        require_http("upload.endpoint", &self.upload.endpoint)?;

        let nonzero = [
            ("source.timeout_secs", self.source.timeout_secs as usize),
            ("harvest.batch_size", self.harvest.batch_size),
            ("harvest.concurrency", self.harvest.concurrency),
            ("harvest.stall_threshold", self.harvest.stall_threshold as usize),
            ("upload.timeout_secs", self.upload.timeout_secs as usize),
            ("upload.poll_interval_secs", self.upload.poll_interval_secs as usize),
            ("upload.detection_threshold", self.upload.detection_threshold),
            ("upload.max_commits_per_hour", self.upload.max_commits_per_hour),
            ("upload.max_batches_per_commit", self.upload.max_batches_per_commit),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.upload.max_batches_per_commit >= self.upload.max_files_per_commit {
            return Err(common::Error::Config(format!(
                "upload.max_batches_per_commit ({}) must be below upload.max_files_per_commit ({})",
                self.upload.max_batches_per_commit, self.upload.max_files_per_commit
            )));
        }

        if let Some(repo_id) = &self.upload.repo_id {
            if repo_id.split('/').filter(|s| !s.is_empty()).count() != 2 {
                return Err(common::Error::Config(format!(
                    "upload.repo_id must look like owner/name, got: {repo_id}"
                )));
            }
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }
}

fn require_http(name: &str, url: &str) -> common::Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::Config(format!(
            "{name} must start with http:// or https://, got: {url}"
        )))
    }
}

fn read_secret_file(path: &Path, field: &str) -> common::Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        common::Error::Config(format!("failed to read {field} {}: {e}", path.display()))
    })
}

/// Split a key list on commas and whitespace, dropping empty entries.
pub fn parse_keys(raw: &str) -> Vec<Secret<String>> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|k| !k.is_empty())
        .map(|k| Secret::new(k.to_owned()))
        .collect()
}
