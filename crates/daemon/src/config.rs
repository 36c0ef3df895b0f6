//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Reconciliation loop configuration
    pub reconcile: ReconcileConfig,

    /// Node agent client configuration
    pub agent: AgentConfig,

    /// Network and port allocation
    pub allocation: AllocationConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: divisora_common::default_store_path(),
            reconcile: ReconcileConfig::default(),
            agent: AgentConfig::default(),
            allocation: AllocationConfig::default(),
        }
    }
}

/// What to do with cubicles a node runs but the store does not want
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Log a warning and list them in the tick report
    Report,
    /// Leave them out of logs and reports
    Ignore,
}

impl Default for OrphanPolicy {
    fn default() -> Self {
        Self::Report
    }
}

/// Reconciliation loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Seconds between ticks
    pub interval_secs: u64,

    /// Nodes reconciled in parallel within one tick
    pub node_concurrency: usize,

    pub orphan_policy: OrphanPolicy,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            node_concurrency: 4,
            orphan_policy: OrphanPolicy::Report,
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Node agent client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Liveness probe timeout
    pub probe_timeout_secs: u64,

    /// Timeout for listing cubicles and networks
    pub read_timeout_secs: u64,

    /// Timeout for network creation
    pub network_timeout_secs: u64,

    /// Timeout for cubicle creation; containers start slower than metadata reads
    pub write_timeout_secs: u64,

    /// Domain appended to cubicle names to form their hostname
    pub hostname_domain: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: 2,
            read_timeout_secs: 2,
            network_timeout_secs: 2,
            write_timeout_secs: 10,
            hostname_domain: "domain.internal".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// Network and noVNC port allocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// Prefix length of per-user subnets carved out of a node range
    pub subnet_prefix: u8,

    /// First noVNC port handed out on a node
    pub novnc_port_min: u16,

    /// Upper bound (exclusive) of noVNC ports
    pub novnc_port_max: u16,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            subnet_prefix: 26,
            novnc_port_min: 30000,
            novnc_port_max: 40000,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the reconciler cannot work with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.reconcile.node_concurrency == 0 {
            anyhow::bail!("reconcile.node_concurrency must be at least 1");
        }
        // IPv4 ranges are additionally held to /31 when a node is created
        if self.allocation.subnet_prefix > 127 {
            anyhow::bail!(
                "allocation.subnet_prefix ({}) leaves no room for a gateway",
                self.allocation.subnet_prefix
            );
        }
        for (key, secs) in [
            ("agent.probe_timeout_secs", self.agent.probe_timeout_secs),
            ("agent.read_timeout_secs", self.agent.read_timeout_secs),
            ("agent.network_timeout_secs", self.agent.network_timeout_secs),
            ("agent.write_timeout_secs", self.agent.write_timeout_secs),
        ] {
            if secs == 0 {
                anyhow::bail!("{} must be at least 1", key);
            }
        }
        if self.allocation.novnc_port_min >= self.allocation.novnc_port_max {
            anyhow::bail!(
                "allocation.novnc_port_min ({}) must be below novnc_port_max ({})",
                self.allocation.novnc_port_min,
                self.allocation.novnc_port_max
            );
        }
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }
}
