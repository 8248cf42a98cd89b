//! Registry configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Owner applied to stable-storage records after they are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOwner {
    /// Numeric user id
    pub uid: u32,
    /// Numeric group id
    pub gid: u32,
}

/// Cluster identity of this server node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Cluster node id (8 bits). `None` when the server is not clustered.
    pub cluster_node_id: Option<u8>,
    /// Metacluster node id (4 bits).
    pub metacluster_id: Option<u8>,
}

/// Reaper interval per table, in lease-time units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTimes {
    /// Client table
    pub client: u64,
    /// Open-owner table
    pub open_owner: u64,
    /// Open-state tables
    pub open_state: u64,
    /// Lock-state tables
    pub lock_state: u64,
    /// Lock-owner table
    pub lock_owner: u64,
    /// File tables
    pub file: u64,
    /// Delegation tables
    pub delegation: u64,
}

impl Default for CacheTimes {
    fn default() -> Self {
        Self {
            client: 10,
            open_owner: 5,
            open_state: 1,
            lock_state: 1,
            lock_owner: 3,
            file: 40,
            delegation: 1,
        }
    }
}

/// Configuration for the NFSv4 state registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Lease duration in seconds
    pub lease_secs: u64,
    /// Grace window length as a multiple of the lease
    pub grace_multiplier: u64,
    /// Stable-storage path that is always read and written
    pub dss_default_path: PathBuf,
    /// Additional replicated stable-storage paths
    pub dss_paths: Vec<PathBuf>,
    /// Cluster identity
    pub node: NodeConfig,
    /// Ownership applied to written records
    pub record_owner: Option<RecordOwner>,
    /// Reaper intervals
    pub cache_times: CacheTimes,
    /// Whether the binary spawns background reapers
    pub reaper_enabled: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            lease_secs: 90,
            grace_multiplier: 1,
            dss_default_path: PathBuf::from("/var/nfs"),
            dss_paths: Vec::new(),
            node: NodeConfig::default(),
            record_owner: None,
            cache_times: CacheTimes::default(),
            reaper_enabled: true,
        }
    }
}

impl StateConfig {
    /// Loads a configuration file; the format is chosen by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: StateConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the registry cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lease_secs == 0 {
            anyhow::bail!("lease_secs must be non-zero");
        }
        if self.grace_multiplier == 0 {
            anyhow::bail!("grace_multiplier must be non-zero");
        }
        if let Some(mc) = self.node.metacluster_id {
            if mc > 0x0f {
                anyhow::bail!("metacluster_id {} does not fit in 4 bits", mc);
            }
        }
        Ok(())
    }

    /// Grace window length in seconds.
    pub fn grace_period_secs(&self) -> u64 {
        self.lease_secs.saturating_mul(self.grace_multiplier)
    }

    /// Every stable-storage path, default first.
    pub fn all_dss_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.dss_default_path.clone()];
        for p in &self.dss_paths {
            if !paths.contains(p) {
                paths.push(p.clone());
            }
        }
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = StateConfig::default();
        assert_eq!(config.lease_secs, 90);
        assert_eq!(config.grace_multiplier, 1);
        assert_eq!(config.dss_default_path, PathBuf::from("/var/nfs"));
        assert!(config.dss_paths.is_empty());
        assert!(config.node.cluster_node_id.is_none());
        assert_eq!(config.cache_times.client, 10);
        assert_eq!(config.cache_times.file, 40);
        assert!(config.reaper_enabled);
    }

    #[test]
    fn test_grace_period_secs() {
        let config = StateConfig {
            lease_secs: 30,
            grace_multiplier: 3,
            ..StateConfig::default()
        };
        assert_eq!(config.grace_period_secs(), 90);
    }

    #[test]
    fn test_all_dss_paths_dedups_default() {
        let config = StateConfig {
            dss_default_path: PathBuf::from("/a"),
            dss_paths: vec![PathBuf::from("/a"), PathBuf::from("/b")],
            ..StateConfig::default()
        };
        assert_eq!(
            config.all_dss_paths(),
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
    }

    #[test]
    fn test_validate_rejects_zero_lease() {
        let config = StateConfig {
            lease_secs: 0,
            ..StateConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_wide_metacluster_id() {
        let config = StateConfig {
            node: NodeConfig {
                cluster_node_id: Some(1),
                metacluster_id: Some(16),
            },
            ..StateConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
lease_secs = 45
dss_default_path = "/srv/nfs"
dss_paths = ["/mnt/dss1"]

[node]
cluster_node_id = 3
metacluster_id = 1

[cache_times]
client = 4
            "#
        )
        .unwrap();

        let config = StateConfig::from_file(file.path()).unwrap();
        assert_eq!(config.lease_secs, 45);
        assert_eq!(config.grace_multiplier, 1);
        assert_eq!(config.dss_default_path, PathBuf::from("/srv/nfs"));
        assert_eq!(config.dss_paths, vec![PathBuf::from("/mnt/dss1")]);
        assert_eq!(config.node.cluster_node_id, Some(3));
        assert_eq!(config.cache_times.client, 4);
        assert_eq!(config.cache_times.open_owner, 5);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{ "lease_secs": 60, "record_owner": {{ "uid": 1, "gid": 12 }} }}"#
        )
        .unwrap();

        let config = StateConfig::from_file(file.path()).unwrap();
        assert_eq!(config.lease_secs, 60);
        assert_eq!(config.record_owner, Some(RecordOwner { uid: 1, gid: 12 }));
    }

    #[test]
    fn test_from_file_unknown_extension() {
        let file = NamedTempFile::with_suffix(".ini").unwrap();
        assert!(StateConfig::from_file(file.path()).is_err());
    }
}
