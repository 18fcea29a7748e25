//! Agent configuration.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Operator-chosen node id; defaults to the hostname.
    pub node_id: String,
    /// Master's agent endpoint.
    pub master_addr: String,
    /// Address the command listener binds.
    pub listen: String,
    /// `host:port` advertised to the master for dial-back commands.
    /// Empty means: first non-loopback IP plus the listen port.
    pub advertise_addr: String,
    pub heartbeat_interval_secs: u64,
    /// SIGTERM-to-SIGKILL escalation window on cancel.
    pub kill_grace_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let node_id = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            node_id,
            master_addr: "127.0.0.1:7701".to_string(),
            listen: "0.0.0.0:7800".to_string(),
            advertise_addr: String::new(),
            heartbeat_interval_secs: 10,
            kill_grace_secs: 10,
        }
    }
}

impl AgentConfig {
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

    /// The dial-back address handed to the master at registration.
    pub fn advertised(&self) -> String {
        if !self.advertise_addr.is_empty() {
            return self.advertise_addr.clone();
        }
        let port = self.listen.rsplit_once(':').map(|(_, p)| p).unwrap_or("7800");
        format!("{}:{port}", local_ip())
    }
}

/// First non-loopback address; reported to the master and printed in
/// the job banner.
pub fn local_ip() -> String {
    if let Ok(ifas) = local_ip_address::list_afinet_netifas() {
        for (_, ip) in ifas {
            if !ip.is_loopback() {
                return ip.to_string();
            }
        }
    }
    "127.0.0.1".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn node_id_defaults_to_hostname() {
        let cfg = AgentConfig::default();
        assert!(!cfg.node_id.is_empty());
        assert_eq!(cfg.heartbeat_interval_secs, 10);
        assert_eq!(cfg.kill_grace_secs, 10);
    }

    #[test]
    fn advertised_uses_listen_port() {
        let cfg = AgentConfig { listen: "0.0.0.0:9123".into(), ..Default::default() };
        assert!(cfg.advertised().ends_with(":9123"));

        let pinned = AgentConfig {
            advertise_addr: "gpu-host-3:7800".into(),
            ..Default::default()
        };
        assert_eq!(pinned.advertised(), "gpu-host-3:7800");
    }

    #[test]
    fn yaml_overrides_apply() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "node_id: n7\nmaster_addr: 10.0.0.1:7701").unwrap();
        let cfg = AgentConfig::load(Some(f.path())).unwrap();
        assert_eq!(cfg.node_id, "n7");
        assert_eq!(cfg.master_addr, "10.0.0.1:7701");
        assert_eq!(cfg.listen, "0.0.0.0:7800");
    }
}
