//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.fedstat.toml` files: collector and query tuning plus the federations
//! the engine knows about.

use crate::collector::CollectorSettings;
use crate::lifecycle::LifecycleSettings;
use crate::resolver::{FederationMember, FederationSnapshot, VariableSpec};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = ".fedstat.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Site fetch settings.
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Query lifecycle settings.
    #[serde(default)]
    pub queries: QueriesConfig,

    /// Known federations.
    #[serde(default)]
    pub federations: Vec<FederationConfig>,
}

/// General application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// JSON file that keeps query history between runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_file: Option<PathBuf>,
}

/// Aggregate collector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Site fetches in flight across all queries.
    #[serde(default = "default_concurrency")]
    pub max_concurrent_fetches: usize,

    /// Deadline for a single site answer, in seconds.
    #[serde(default = "default_site_timeout")]
    pub site_timeout_seconds: u64,

    /// A collection fails once this share of sites is excluded.
    #[serde(default = "default_max_excluded_fraction")]
    pub max_excluded_fraction: f64,

    /// Pause before retrying a transient failure, in milliseconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: default_concurrency(),
            site_timeout_seconds: default_site_timeout(),
            max_excluded_fraction: default_max_excluded_fraction(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

fn default_concurrency() -> usize {
    8
}

fn default_site_timeout() -> u64 {
    30
}

fn default_max_excluded_fraction() -> f64 {
    0.5
}

fn default_retry_delay() -> u64 {
    200
}

/// Query lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueriesConfig {
    /// Overall deadline of one query, in seconds.
    #[serde(default = "default_query_timeout")]
    pub timeout_seconds: u64,

    /// History page size when none is requested.
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,

    /// Largest history page served.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

impl Default for QueriesConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_query_timeout(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

fn default_query_timeout() -> u64 {
    300
}

fn default_page_size() -> usize {
    50
}

fn default_max_page_size() -> usize {
    200
}

/// One federation: its members and variable schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    pub id: String,

    #[serde(default)]
    pub variables: BTreeMap<String, VariableSpec>,

    #[serde(default)]
    pub members: Vec<FederationMember>,
}

impl From<&FederationConfig> for FederationSnapshot {
    fn from(config: &FederationConfig) -> Self {
        FederationSnapshot {
            id: config.id.clone(),
            members: config.members.clone(),
            variables: config.variables.clone(),
        }
    }
}

impl From<&CollectorConfig> for CollectorSettings {
    fn from(config: &CollectorConfig) -> Self {
        CollectorSettings {
            max_concurrent_fetches: config.max_concurrent_fetches,
            site_timeout: Duration::from_secs(config.site_timeout_seconds),
            max_excluded_fraction: config.max_excluded_fraction,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

impl From<&QueriesConfig> for LifecycleSettings {
    fn from(config: &QueriesConfig) -> Self {
        LifecycleSettings {
            query_timeout: Duration::from_secs(config.timeout_seconds),
            default_page_size: config.default_page_size,
            max_page_size: config.max_page_size,
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    /// This method only overrides config when CLI provides explicit values.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(timeout) = args.timeout {
            self.queries.timeout_seconds = timeout;
        }
        if let Some(site_timeout) = args.site_timeout {
            self.collector.site_timeout_seconds = site_timeout;
        }
        if let Some(concurrency) = args.concurrency {
            self.collector.max_concurrent_fetches = concurrency;
        }
        if let Some(ref history) = args.history {
            self.general.history_file = Some(history.clone());
        }

        // Flags always override
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Check settings that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.collector.max_concurrent_fetches == 0 {
            bail!("collector.max_concurrent_fetches must be at least 1");
        }
        let fraction = self.collector.max_excluded_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            bail!("collector.max_excluded_fraction must be in (0, 1], got {}", fraction);
        }
        if self.queries.max_page_size == 0 || self.queries.default_page_size == 0 {
            bail!("queries page sizes must be at least 1");
        }

        let mut federation_ids = HashSet::new();
        for federation in &self.federations {
            if !federation_ids.insert(federation.id.as_str()) {
                bail!("Federation '{}' is defined more than once", federation.id);
            }
            let mut member_ids = HashSet::new();
            for member in &federation.members {
                if !member_ids.insert(member.id.as_str()) {
                    bail!(
                        "Member '{}' appears twice in federation '{}'",
                        member.id,
                        federation.id
                    );
                }
                if !member.endpoint.starts_with("http://") && !member.endpoint.starts_with("https://")
                {
                    bail!(
                        "Endpoint of member '{}' must start with 'http://' or 'https://'",
                        member.id
                    );
                }
            }
        }
        Ok(())
    }

    /// Snapshots of every configured federation.
    pub fn snapshots(&self) -> Vec<FederationSnapshot> {
        self.federations.iter().map(FederationSnapshot::from).collect()
    }

    /// Generate a default configuration file content, with one example
    /// federation to edit.
    pub fn default_toml() -> String {
        let mut config = Config::default();
        let mut variables = BTreeMap::new();
        variables.insert("age".to_string(), VariableSpec::Numeric);
        variables.insert(
            "smoker".to_string(),
            VariableSpec::Categorical {
                categories: vec!["yes".to_string(), "no".to_string()],
            },
        );
        config.federations.push(FederationConfig {
            id: "example".to_string(),
            variables,
            members: vec![
                FederationMember {
                    id: "site-a".to_string(),
                    endpoint: "http://localhost:9001".to_string(),
                    device_groups: vec!["ios".to_string()],
                },
                FederationMember {
                    id: "site-b".to_string(),
                    endpoint: "http://localhost:9002".to_string(),
                    device_groups: vec!["android".to_string()],
                },
            ],
        });
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
