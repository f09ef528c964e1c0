//! Static YAML configuration: groups, servers, validation.
//!
//! Servers can also be pulled from an `upstream` reference: a named external
//! manifest (here, a second local YAML file — a stand-in for the HTTP/SSH
//! manifest fetchers that are out of scope for this crate) that yields more
//! servers for the group. A manifest that fails to load does not fail the
//! whole reload; its tag is reported back so the reload coordinator can
//! salvage the previous refresh's servers for that tag (spec §4.7 step 3).

use crate::cipher::CipherSpec;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Top-level configuration: a set of groups, each fronting one port.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub groups: Vec<GroupConfig>,
}

/// One (port, server-set) tuple, as read from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub port: u16,

    #[serde(default, rename = "auth-timeout-sec")]
    pub auth_timeout_sec: u32,

    #[serde(default, rename = "drain-on-auth-fail")]
    pub drain_on_auth_fail: bool,

    #[serde(default, rename = "listener-tcp-fast-open")]
    pub listener_tcp_fast_open: bool,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// References to external server manifests, tagged by name. See
    /// [`UpstreamRef`]; a failed pull is recorded, not fatal.
    #[serde(default)]
    pub upstreams: Vec<UpstreamRef>,
}

/// A named external manifest of servers to merge into a group.
///
/// `path` stands in for the out-of-scope HTTP/SSH access-key manifest
/// fetchers the full system uses; the core only needs the *result* of a
/// pull (a server list, or an error) to implement reload salvage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamRef {
    pub tag: String,
    pub path: PathBuf,
}

/// One candidate upstream within a group, as read from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub target: String,

    #[serde(default, rename = "tcp-fast-open")]
    pub tcp_fast_open: bool,

    pub method: String,

    pub password: String,

    #[serde(default, rename = "upstream-tag")]
    pub upstream_tag: Option<String>,
}

/// A built server: target address plus its derived cipher material. Cheap
/// to clone (one `Vec<u8>` master key); reload builds a fresh set and the
/// old set is dropped once every dispatcher has swapped its group pointer.
#[derive(Clone)]
pub struct Server {
    pub target: String,
    pub tcp_fast_open: bool,
    pub cipher: CipherSpec,
    pub upstream_tag: Option<String>,
}

/// A built group: validated, ready to hand to a TCP/UDP dispatcher.
#[derive(Clone)]
pub struct Group {
    pub port: u16,
    pub auth_timeout_sec: u32,
    pub drain_on_auth_fail: bool,
    pub listener_tcp_fast_open: bool,
    pub servers: Vec<Server>,
}

impl Group {
    /// Servers in this (previous-generation) group whose `upstream_tag`
    /// matches one of `failed_tags`, cloned for splicing into the next
    /// generation's group (spec §4.7 step 3).
    pub fn salvage_servers(&self, failed_tags: &[String]) -> Vec<Server> {
        self.servers
            .iter()
            .filter(|s| {
                s.upstream_tag
                    .as_ref()
                    .is_some_and(|tag| failed_tags.iter().any(|f| f == tag))
            })
            .cloned()
            .collect()
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_yaml(&content)
    }

    pub fn parse_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Unique ports across groups; within each group, unique (method,
    /// password) pairs; every method resolves to a registered cipher.
    pub fn validate(&self) -> Result<()> {
        let mut ports = HashSet::new();
        for group in &self.groups {
            if !ports.insert(group.port) {
                return Err(Error::config(format!("duplicate port {}", group.port)));
            }
            let mut pairs = HashSet::new();
            for server in &group.servers {
                crate::cipher::CipherKind::try_from(server.method.as_str())?;
                let key = (server.method.clone(), server.password.clone());
                if !pairs.insert(key) {
                    return Err(Error::config(format!(
                        "duplicate (method, password) pair in group on port {}: method={}",
                        group.port, server.method
                    )));
                }
            }
        }
        Ok(())
    }

    /// Build the runtime `Group` list: derives every server's master key and
    /// pulls every `upstreams` manifest. A manifest pull failure does not
    /// fail the whole build; its tag is returned in `failed_upstreams` so
    /// the reload coordinator can salvage the previous generation's servers
    /// for that tag (spec §4.7 step 3).
    pub fn build(&self) -> Result<BuiltConfig> {
        self.validate()?;
        let mut groups = Vec::with_capacity(self.groups.len());
        let mut failed_upstreams = HashMap::new();
        for cfg in &self.groups {
            let (group, failed) = Group::build(cfg)?;
            if !failed.is_empty() {
                failed_upstreams.insert(cfg.port, failed);
            }
            groups.push(group);
        }
        Ok(BuiltConfig {
            groups,
            failed_upstreams,
        })
    }
}

/// Result of [`Config::build`]: the runtime groups plus, per port, the tags
/// of any `upstreams` manifest that failed to pull this generation.
pub struct BuiltConfig {
    pub groups: Vec<Group>,
    pub failed_upstreams: HashMap<u16, Vec<String>>,
}

impl Group {
    /// Returns the built group plus the tags of any upstream manifest that
    /// failed to pull (and so contributed no servers this generation).
    fn build(cfg: &GroupConfig) -> Result<(Self, Vec<String>)> {
        let mut servers = cfg
            .servers
            .iter()
            .map(Server::build)
            .collect::<Result<Vec<_>>>()?;

        let mut failed = Vec::new();
        for upstream in &cfg.upstreams {
            match pull_upstream(upstream) {
                Ok(mut pulled) => servers.append(&mut pulled),
                Err(e) => {
                    tracing::warn!(tag = %upstream.tag, error = %e, "upstream manifest pull failed, servers from this tag not refreshed");
                    failed.push(upstream.tag.clone());
                }
            }
        }

        Ok((
            Group {
                port: cfg.port,
                auth_timeout_sec: cfg.auth_timeout_sec,
                drain_on_auth_fail: cfg.drain_on_auth_fail,
                listener_tcp_fast_open: cfg.listener_tcp_fast_open,
                servers,
            },
            failed,
        ))
    }
}

/// Pulls one upstream manifest: a YAML file containing a `servers:` list in
/// the same shape as an inline group's servers, tagged with its source.
fn pull_upstream(upstream: &UpstreamRef) -> Result<Vec<Server>> {
    #[derive(Deserialize)]
    struct Manifest {
        servers: Vec<ServerConfig>,
    }

    let content = std::fs::read_to_string(&upstream.path)?;
    let manifest: Manifest = serde_yaml::from_str(&content)?;
    manifest
        .servers
        .iter()
        .map(|cfg| {
            let mut server = Server::build(cfg)?;
            server.upstream_tag = Some(upstream.tag.clone());
            Ok(server)
        })
        .collect()
}

impl Server {
    fn build(cfg: &ServerConfig) -> Result<Self> {
        let cipher = CipherSpec::new(&cfg.method, &cfg.password)?;
        Ok(Server {
            target: cfg.target.clone(),
            tcp_fast_open: cfg.tcp_fast_open,
            cipher,
            upstream_tag: cfg.upstream_tag.clone(),
        })
    }
}
