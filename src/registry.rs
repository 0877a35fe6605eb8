//! Host Registry
//!
//! Maps host ids to the network location that can serve a host's files.
//! The registry is keyed by host id alone; there is no positional indexing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Host identifier
pub type HostId = u64;

/// Id of a host that has not been admitted by the master yet
pub const UNASSIGNED_HOST: HostId = 0;

/// Id reserved for the master
pub const MASTER_HOST: HostId = 1;

/// First id handed out to a joining slave
pub const FIRST_SLAVE_HOST: HostId = 2;

/// One participating host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Host id (see `UNASSIGNED_HOST`, `MASTER_HOST`)
    pub id: HostId,
    /// Address other hosts use to reach this one
    pub address: String,
    /// Replication protocol port
    pub tcp_port: u16,
    /// Remote-shell port used by the read broker
    pub ssh_port: u16,
    /// Directory this host exports
    pub mount_path: PathBuf,
    /// Working directory holding the staged copy of the export
    pub staging_path: PathBuf,
}

impl Host {
    /// Directory under which this host's exported files are staged
    pub fn staged_root(&self) -> PathBuf {
        staged_root_for(&self.staging_path, &self.mount_path)
    }

    /// Serialize a single host record
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize a single host record
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Location of the staged copy of `export_dir` inside `staging_dir`
pub fn staged_root_for(staging_dir: &Path, export_dir: &Path) -> PathBuf {
    match export_dir.file_name() {
        Some(name) => staging_dir.join(name),
        None => staging_dir.join("export"),
    }
}

/// Registry of all hosts known to this node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRegistry {
    hosts: BTreeMap<HostId, Host>,
}

impl HostRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host record, keyed by its id. Returns the id.
    ///
    /// A record already stored under the same id is replaced.
    pub fn append(&mut self, host: Host) -> HostId {
        let id = host.id;
        if self.hosts.insert(id, host).is_some() {
            tracing::debug!("Replaced registry entry for host {}", id);
        }
        id
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Get a host by id
    pub fn get(&self, id: HostId) -> Option<&Host> {
        self.hosts.get(&id)
    }

    /// Get a mutable host by id
    pub fn get_mut(&mut self, id: HostId) -> Option<&mut Host> {
        self.hosts.get_mut(&id)
    }

    /// Iterate over hosts in id order
    pub fn iter(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    /// Serialize the whole registry
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize a whole registry
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let registry: HostRegistry = bincode::deserialize(bytes)?;
        if let Some((key, host)) = registry.hosts.iter().find(|(key, host)| **key != host.id) {
            return Err(crate::Error::Protocol(format!(
                "registry entry {} carries host id {}",
                key, host.id
            )));
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(id: HostId, address: &str) -> Host {
        Host {
            id,
            address: address.to_string(),
            tcp_port: 7700,
            ssh_port: 22,
            mount_path: PathBuf::from("/srv/share"),
            staging_path: PathBuf::from("/var/tmp/gsfs"),
        }
    }

    #[test]
    fn test_append_and_lookup() {
        let mut registry = HostRegistry::new();
        assert_eq!(registry.append(host(MASTER_HOST, "10.0.0.1")), MASTER_HOST);
        assert_eq!(registry.append(host(2, "10.0.0.2")), 2);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(2).unwrap().address, "10.0.0.2");
        assert!(registry.get(3).is_none());

        registry.get_mut(2).unwrap().ssh_port = 2222;
        assert_eq!(registry.get(2).unwrap().ssh_port, 2222);
    }

    #[test]
    fn test_staged_root() {
        let h = host(2, "10.0.0.2");
        assert_eq!(h.staged_root(), PathBuf::from("/var/tmp/gsfs/share"));
    }

    #[test]
    fn test_registry_serialization() {
        let mut registry = HostRegistry::new();
        registry.append(host(MASTER_HOST, "10.0.0.1"));
        registry.append(host(4, "10.0.0.4"));

        let bytes = registry.serialize().unwrap();
        let restored = HostRegistry::deserialize(&bytes).unwrap();
        assert_eq!(restored, registry);

        let single = host(4, "10.0.0.4");
        assert_eq!(Host::deserialize(&single.serialize().unwrap()).unwrap(), single);
    }

    #[test]
    fn test_malformed_registry_rejected() {
        assert!(HostRegistry::deserialize(&[0xff, 0x01]).is_err());
    }
}
