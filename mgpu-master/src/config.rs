//! Master configuration.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What to do with running jobs an agent reports that the master does
/// not know about (they survive a master restart on the agent side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OrphanPolicy {
    /// Leave them running; they are invisible to the queue.
    #[default]
    Adopt,
    /// Ask the agent to kill them.
    Kill,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MasterConfig {
    /// Address the client listener binds.
    pub client_listen: String,
    /// Address the agent listener binds.
    pub agent_listen: String,
    /// Expected agent heartbeat cadence.
    pub heartbeat_interval_secs: u64,
    /// Silence longer than this marks a node degraded.
    pub heartbeat_timeout_secs: u64,
    /// Further silence beyond the heartbeat timeout marks a node offline.
    pub offline_timeout_secs: u64,
    /// How long a cancelled job may take to report its exit before the
    /// master force-retires it.
    pub cancel_grace_secs: u64,
    /// Per-job output history kept for late attaches.
    pub ring_capacity_bytes: usize,
    /// Placement attempts before a job is failed.
    pub start_retry_budget: u32,
    /// Terminal jobs older than this are dropped from the table.
    pub retired_retention_secs: u64,
    pub orphan_policy: OrphanPolicy,
    /// Rendezvous port injected as MASTER_PORT for torch-distributed jobs.
    pub torch_master_port: u16,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            client_listen: "0.0.0.0:7700".to_string(),
            agent_listen: "0.0.0.0:7701".to_string(),
            heartbeat_interval_secs: 10,
            heartbeat_timeout_secs: 30,
            offline_timeout_secs: 60,
            cancel_grace_secs: 10,
            ring_capacity_bytes: 1024 * 1024,
            start_retry_budget: 5,
            retired_retention_secs: 3600,
            orphan_policy: OrphanPolicy::Adopt,
            torch_master_port: 29500,
        }
    }
}

impl MasterConfig {
    /// Load from a YAML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            None => Ok(Self::default()),
            Some(p) => {
                let text = std::fs::read_to_string(p)?;
                serde_yaml::from_str(&text)
                    .map_err(|e| Error::Config(format!("{}: {e}", p.display())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn defaults_match_protocol_windows() {
        let cfg = MasterConfig::default();
        assert_eq!(cfg.heartbeat_interval_secs, 10);
        assert_eq!(cfg.heartbeat_timeout_secs, 30);
        assert_eq!(cfg.offline_timeout_secs, 60);
        assert_eq!(cfg.cancel_grace_secs, 10);
        assert_eq!(cfg.orphan_policy, OrphanPolicy::Adopt);
    }

    #[test]
    fn partial_yaml_overrides_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "offline_timeout_secs: 120\norphan_policy: kill").unwrap();
        let cfg = MasterConfig::load(Some(f.path())).unwrap();
        assert_eq!(cfg.offline_timeout_secs, 120);
        assert_eq!(cfg.orphan_policy, OrphanPolicy::Kill);
        assert_eq!(cfg.heartbeat_timeout_secs, 30);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "hartbeat_interval_secs: 5").unwrap();
        assert!(MasterConfig::load(Some(f.path())).is_err());
    }
}
