//! GSFS Configuration
//!
//! Configuration structures for a gsfs node. Every section has defaults so a
//! node can run from command-line flags alone.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::registry::{Host, HostId};

/// Main gsfs configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Where the master lives
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Exported directory and its staging area
    #[serde(default)]
    pub export: ExportConfig,

    /// Local mount point
    #[serde(default)]
    pub mount: MountConfig,

    /// Remote read broker
    #[serde(default)]
    pub broker: BrokerConfig,
}

/// Role of this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Slave,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Master or slave
    #[serde(default)]
    pub role: Option<Role>,

    /// IP address to listen on (master) and to advertise by default
    #[serde(default)]
    pub address: Option<String>,

    /// Address other hosts use to reach this one, if different
    #[serde(default)]
    pub advertise: Option<String>,

    /// Replication protocol port
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// Remote-shell port peers use to read from this host
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// IP address of the master (slaves only)
    #[serde(default)]
    pub master: Option<String>,

    /// Replication port of the master (defaults to `node.tcp_port`)
    #[serde(default)]
    pub master_port: Option<u16>,

    /// Timeout for reaching the master, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Export configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Local directory to export
    #[serde(default)]
    pub dir: PathBuf,

    /// Working directory holding hard-linked copies of the export
    #[serde(default)]
    pub staging_dir: PathBuf,
}

/// Mount configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountConfig {
    /// Mount point
    #[serde(default)]
    pub path: PathBuf,

    /// Let other users access the mount
    #[serde(default)]
    pub allow_other: bool,
}

/// Remote read broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Remote-shell client binary
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,

    /// Remote login name (defaults to the local user)
    #[serde(default)]
    pub user: Option<String>,

    /// Directory for persistent control sockets
    #[serde(default = "default_control_dir")]
    pub control_dir: PathBuf,

    /// Remote-shell connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

// Default value functions
fn default_tcp_port() -> u16 {
    7700
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_ssh_program() -> String {
    "ssh".to_string()
}

fn default_control_dir() -> PathBuf {
    std::env::temp_dir()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: None,
            address: None,
            advertise: None,
            tcp_port: default_tcp_port(),
            ssh_port: default_ssh_port(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            master: None,
            master_port: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ssh_program: default_ssh_program(),
            user: None,
            control_dir: default_control_dir(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> crate::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No configuration file at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(crate::Error::Config(format!("reading {}: {}", path.display(), e))),
        }
    }

    /// Parse configuration from a TOML string (not validated)
    pub fn from_str(content: &str) -> crate::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        let role = self
            .node
            .role
            .ok_or_else(|| crate::Error::Config("node.role must be set (--listen or --connect)".into()))?;

        if let Some(address) = &self.node.address {
            parse_ip("node.address", address)?;
        }

        match role {
            Role::Master => {
                if self.node.address.is_none() {
                    return Err(crate::Error::Config("a master needs node.address to listen on".into()));
                }
            }
            Role::Slave => match &self.cluster.master {
                Some(master) => {
                    parse_ip("cluster.master", master)?;
                }
                None => {
                    return Err(crate::Error::Config("a slave needs cluster.master".into()));
                }
            },
        }

        if self.node.tcp_port == 0 || self.cluster.master_port == Some(0) {
            return Err(crate::Error::Config("TCP port cannot be 0".into()));
        }

        if self.export.dir.as_os_str().is_empty() {
            return Err(crate::Error::Config("export.dir cannot be empty".into()));
        }

        if self.export.staging_dir.as_os_str().is_empty() {
            return Err(crate::Error::Config("export.staging_dir cannot be empty".into()));
        }

        if self.mount.path.as_os_str().is_empty() {
            return Err(crate::Error::Config("mount.path cannot be empty".into()));
        }

        Ok(())
    }

    /// Role of this node (call after `validate`)
    pub fn role(&self) -> Role {
        self.node.role.unwrap_or(Role::Slave)
    }

    /// Address the master listens on
    pub fn listen_address(&self) -> String {
        let ip = self.node.address.as_deref().unwrap_or("0.0.0.0");
        socket_address(ip, self.node.tcp_port)
    }

    /// Address a slave dials
    pub fn master_address(&self) -> Option<String> {
        let port = self.cluster.master_port.unwrap_or(self.node.tcp_port);
        self.cluster.master.as_deref().map(|ip| socket_address(ip, port))
    }

    /// Address other hosts use to reach this one
    pub fn advertise_address(&self) -> String {
        if let Some(advertise) = self.node.advertise.as_deref().or(self.node.address.as_deref()) {
            return advertise.to_string();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Timeout for reaching the master
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster.connect_timeout_secs)
    }

    /// Host record describing this node, carrying `id`.
    ///
    /// Both paths should be the canonical ones found by the export scan.
    pub fn local_host(&self, id: HostId, export_dir: &Path, staging_dir: &Path) -> Host {
        Host {
            id,
            address: self.advertise_address(),
            tcp_port: self.node.tcp_port,
            ssh_port: self.node.ssh_port,
            mount_path: export_dir.to_path_buf(),
            staging_path: staging_dir.to_path_buf(),
        }
    }
}

fn parse_ip(field: &str, value: &str) -> crate::Result<IpAddr> {
    value
        .parse()
        .map_err(|_| crate::Error::Config(format!("{} is not an IP address: {}", field, value)))
}

fn socket_address(ip: &str, port: u16) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{}]:{}", ip, port),
        _ => format!("{}:{}", ip, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
role = "slave"
address = "10.0.0.5"
ssh_port = 2222

[cluster]
master = "10.0.0.1"

[export]
dir = "/srv/share"
staging_dir = "/var/tmp/gsfs"

[mount]
path = "/mnt/gsfs"

[broker]
user = "gsfs"
"#;

        let config = Config::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.role(), Role::Slave);
        assert_eq!(config.node.tcp_port, 7700);
        assert_eq!(config.master_address().as_deref(), Some("10.0.0.1:7700"));
        assert_eq!(config.broker.ssh_program, "ssh");
        assert_eq!(config.broker.user.as_deref(), Some("gsfs"));

        let host = config.local_host(0, Path::new("/srv/share"), Path::new("/var/tmp/gsfs"));
        assert_eq!(host.address, "10.0.0.5");
        assert_eq!(host.ssh_port, 2222);
        assert_eq!(host.staged_root(), PathBuf::from("/var/tmp/gsfs/share"));
    }

    #[test]
    fn test_validation_failures() {
        let base = r#"
[export]
dir = "/srv/share"
staging_dir = "/var/tmp/gsfs"

[mount]
path = "/mnt/gsfs"
"#;
        // no role
        let config = Config::from_str(base).unwrap();
        assert!(config.validate().is_err());

        // slave without a master
        let mut config = Config::from_str(base).unwrap();
        config.node.role = Some(Role::Slave);
        assert!(config.validate().is_err());

        // unparsable master address
        config.cluster.master = Some("not-an-ip".into());
        assert!(config.validate().is_err());
        config.cluster.master = Some("10.0.0.1".into());
        config.validate().unwrap();

        // zero port
        config.node.tcp_port = 0;
        assert!(config.validate().is_err());
        config.node.tcp_port = 7700;

        // master needs an address
        config.node.role = Some(Role::Master);
        assert!(config.validate().is_err());
        config.node.address = Some("::1".into());
        config.validate().unwrap();
        assert_eq!(config.listen_address(), "[::1]:7700");

        config.export.staging_dir = PathBuf::new();
        let err = config.validate().unwrap_err();
        assert!(err.is_fatal_at_startup());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert!(config.node.role.is_none());
        assert_eq!(config.node.ssh_port, 22);
    }
}
