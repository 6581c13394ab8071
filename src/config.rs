//! Node Configuration
//!
//! The ordered disk selector list and engine tunables, loaded from YAML and
//! hot-reloaded by [`ConfigWatcher`]. Every reconciliation pass reads the
//! latest value from the watch channel.

use crate::domain::types::{DiskSelectorPolicy, ManagementPolicy};
use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

/// Lower bound for the disk scan interval
pub const MIN_SCAN_INTERVAL_SECS: u64 = 60;

const DEFAULT_SCAN_INTERVAL_SECS: u64 = 300;
const DEFAULT_EVENT_TIMEOUT_SECS: u64 = 5;

// =============================================================================
// Node Configuration
// =============================================================================

/// Configuration for one storage node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Node identity
    #[serde(default)]
    pub node_name: String,

    /// Ordered disk selector policies; first match wins
    #[serde(default)]
    pub disk_selectors: Vec<DiskSelectorPolicy>,

    /// Reconciliation interval in seconds
    #[serde(default = "default_scan_interval")]
    pub disk_scan_interval_secs: u64,

    /// Thin pool size = volume size x ratio
    #[serde(default = "default_over_provision_ratio")]
    pub over_provision_ratio: f64,

    /// How long a producer waits for capacity republish
    #[serde(default = "default_event_timeout")]
    pub event_timeout_secs: u64,

    /// Kernel-name substrings that are never selected
    #[serde(default = "default_reserved_markers")]
    pub reserved_name_markers: Vec<String>,
}

fn default_scan_interval() -> u64 {
    DEFAULT_SCAN_INTERVAL_SECS
}

fn default_over_provision_ratio() -> f64 {
    1.0
}

fn default_event_timeout() -> u64 {
    DEFAULT_EVENT_TIMEOUT_SECS
}

fn default_reserved_markers() -> Vec<String> {
    vec!["bcache".to_string()]
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            disk_selectors: Vec::new(),
            disk_scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            over_provision_ratio: 1.0,
            event_timeout_secs: DEFAULT_EVENT_TIMEOUT_SECS,
            reserved_name_markers: default_reserved_markers(),
        }
    }
}

impl NodeConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: NodeConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }

    /// Check regexes, group-name uniqueness and numeric bounds
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for selector in &self.disk_selectors {
            if selector.name.is_empty() {
                return Err(Error::Configuration("disk selector with empty name".into()));
            }
            if !names.insert(selector.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate disk selector name: {}",
                    selector.name
                )));
            }
            for pattern in &selector.re {
                Regex::new(pattern)?;
            }
        }

        if !self.over_provision_ratio.is_finite() || self.over_provision_ratio < 1.0 {
            return Err(Error::Configuration(format!(
                "overProvisionRatio must be >= 1.0, got {}",
                self.over_provision_ratio
            )));
        }

        Ok(())
    }

    /// Scan interval with the lower bound applied
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.disk_scan_interval_secs.max(MIN_SCAN_INTERVAL_SECS))
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_secs(self.event_timeout_secs)
    }

    /// Selector for a group name
    pub fn selector(&self, name: &str) -> Option<&DiskSelectorPolicy> {
        self.disk_selectors.iter().find(|s| s.name == name)
    }

    /// Names of all LVM-managed groups
    pub fn lvm_groups(&self) -> Vec<&str> {
        self.disk_selectors
            .iter()
            .filter(|s| s.policy == ManagementPolicy::Lvm)
            .map(|s| s.name.as_str())
            .collect()
    }
}

// =============================================================================
// Config Watcher
// =============================================================================

/// Polls a config file and publishes validated changes
pub struct ConfigWatcher {
    path: PathBuf,
    poll_interval: Duration,
    tx: watch::Sender<NodeConfig>,
}

impl ConfigWatcher {
    /// Load the initial config and create the watch channel
    pub fn new(
        path: impl Into<PathBuf>,
        poll_interval: Duration,
        overrides: impl Fn(&mut NodeConfig) + Send + Sync + 'static,
    ) -> Result<(Self, watch::Receiver<NodeConfig>)> {
        let path = path.into();
        let mut initial = NodeConfig::load(&path)?;
        overrides(&mut initial);
        let (tx, rx) = watch::channel(initial);
        Ok((
            Self {
                path,
                poll_interval,
                tx,
            },
            rx,
        ))
    }

    /// Re-read the file once; returns true if a new config was published
    pub fn reload(&self) -> bool {
        let mut next = match NodeConfig::load(&self.path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring invalid config at {}: {}", self.path.display(), e);
                return false;
            }
        };

        // Node identity comes from the process, not the file
        next.node_name = self.tx.borrow().node_name.clone();

        self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                info!(
                    selectors = next.disk_selectors.len(),
                    interval_secs = next.disk_scan_interval_secs,
                    "Disk selector config changed"
                );
                *current = next;
                true
            }
        })
    }

    /// Poll until cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Config watcher stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.reload();
                }
            }
        }
    }
}
