//! Reload coordinator: rebuilds the config from disk, swaps group
//! definitions under dispatchers without closing listening sockets, and
//! opens/closes listeners for ports added/removed since the last load.

use crate::config::Config;
use crate::dispatcher::tcp::TcpDispatcher;
use crate::dispatcher::udp::UdpDispatcher;
use crate::Result;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{error, info};

struct PortDispatchers {
    tcp: TcpDispatcher,
    udp: UdpDispatcher,
}

/// Owns every live listener, keyed by port, and the path reload re-reads.
pub struct Core {
    config_path: PathBuf,
    dispatchers: Mutex<HashMap<u16, PortDispatchers>>,
}

impl Core {
    /// Loads `config_path`, spawns one TCP and one UDP dispatcher per
    /// group, and returns the running core.
    pub async fn start(config_path: PathBuf) -> Result<Self> {
        let config = Config::load(&config_path)?;
        let built = config.build()?;

        let mut dispatchers = HashMap::new();
        for group in built.groups {
            let port = group.port;
            let tcp = TcpDispatcher::spawn(group.clone()).await?;
            let udp = UdpDispatcher::spawn(group).await?;
            dispatchers.insert(port, PortDispatchers { tcp, udp });
        }

        info!(config_path = %config_path.display(), groups = dispatchers.len(), "core started");

        Ok(Core {
            config_path,
            dispatchers: Mutex::new(dispatchers),
        })
    }

    /// Re-reads the config file and reconciles the live listener set
    /// against it. A reload-time I/O or validation error is non-fatal: it
    /// is logged and the entire previous configuration is preserved. A
    /// narrower failure — one group's `upstreams` manifest failing to pull
    /// while the rest of the config rebuilds fine — is salvaged per group:
    /// servers tagged with the failed upstream are carried over from the
    /// previous generation (spec §4.7 step 3) instead of disappearing.
    pub async fn reload(&self) -> Result<()> {
        let mut dispatchers = self.dispatchers.lock().await;

        let config = match Config::load(&self.config_path) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "reload: failed to read config, keeping previous configuration");
                return Ok(());
            }
        };
        let built = match config.build() {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "reload: failed to build config, keeping previous configuration");
                return Ok(());
            }
        };

        let new_ports: HashSet<u16> = built.groups.iter().map(|g| g.port).collect();

        for mut group in built.groups {
            let port = group.port;

            // Salvage: for every upstream tag that failed to refresh in this
            // group, carry over the matching servers from the previous
            // generation's group on the same port (spec §4.7 step 3).
            if let Some(failed_tags) = built.failed_upstreams.get(&port) {
                if let Some(pd) = dispatchers.get(&port) {
                    let salvaged = pd.tcp.current_group().salvage_servers(failed_tags);
                    if !salvaged.is_empty() {
                        info!(
                            port,
                            tags = ?failed_tags,
                            count = salvaged.len(),
                            "reload: salvaged servers from previous generation after upstream pull failure"
                        );
                    }
                    group.servers.extend(salvaged);
                }
            }

            match dispatchers.get(&port) {
                Some(pd) => {
                    pd.tcp.update_group(group.clone());
                    pd.udp.update_group(group);
                    info!(port, "reload: updated group in place");
                }
                None => match TcpDispatcher::spawn(group.clone()).await {
                    Ok(tcp) => match UdpDispatcher::spawn(group).await {
                        Ok(udp) => {
                            dispatchers.insert(port, PortDispatchers { tcp, udp });
                            info!(port, "reload: opened new listener");
                        }
                        Err(e) => {
                            tcp.close();
                            error!(error = %e, port, "reload: failed to open udp listener for new group");
                        }
                    },
                    Err(e) => {
                        error!(error = %e, port, "reload: failed to open tcp listener for new group");
                    }
                },
            }
        }

        let stale_ports: Vec<u16> = dispatchers
            .keys()
            .copied()
            .filter(|p| !new_ports.contains(p))
            .collect();
        for port in stale_ports {
            if let Some(pd) = dispatchers.remove(&port) {
                pd.tcp.close();
                pd.udp.close();
                info!(port, "reload: closed listener for removed group");
            }
        }

        Ok(())
    }

    /// Ports currently listening on, for diagnostics and tests.
    pub async fn active_ports(&self) -> Vec<u16> {
        self.dispatchers.lock().await.keys().copied().collect()
    }
}
