//! INI-style configuration loading (spec.md §6).
//!
//! Cyclone itself only consumes the `storage`, `quorum`, `active`, and
//! `dispatch` sections; `network` (peer socket addresses) belongs to the
//! transport, an external collaborator — we parse `network.me` because the
//! dispatcher and bootstrap need to know this replica's own id, but we do
//! not parse peer addresses.

use std::path::PathBuf;

use ini::Ini;

use crate::error::ConfigError;
use crate::NodeId;

#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Prefix for the per-node pmem log file; the actual path is
    /// `{raftpath}{node_id}`.
    pub raftpath: String,
    pub logsize: usize,
}

#[derive(Clone, Debug)]
pub struct QuorumConfig {
    pub baseport: u16,
}

#[derive(Clone, Debug)]
pub struct ActiveConfig {
    /// The active-replica list: a node not in this set late-joins via
    /// image-build (spec.md §4.6).
    pub replicas: Vec<NodeId>,
}

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub filepath: String,
    pub clients: u32,
    pub server_baseport: u16,
    pub client_baseport: u16,
}

#[derive(Clone, Debug)]
pub struct CycloneConfig {
    pub me: NodeId,
    pub storage: StorageConfig,
    pub quorum: QuorumConfig,
    pub active: ActiveConfig,
    pub dispatch: DispatchConfig,
}

impl CycloneConfig {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|e| match e {
            ini::Error::Io(io) => ConfigError::Io {
                path: path.display().to_string(),
                source: io,
            },
            ini::Error::Parse(p) => ConfigError::Parse(p.msg.to_string()),
        })?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let me = get_u32(ini, "network", "me")?;

        let raftpath = get_str(ini, "storage", "raftpath")?;
        let logsize = get_usize(ini, "storage", "logsize")?;

        let baseport = get_u16(ini, "quorum", "baseport")?;

        let n_replicas = get_usize(ini, "active", "replicas")?;
        let mut replicas = Vec::with_capacity(n_replicas);
        for i in 0..n_replicas {
            replicas.push(get_u32(ini, "active", &format!("entry{}", i))?);
        }

        let filepath = get_str(ini, "dispatch", "filepath")?;
        let clients = get_u32(ini, "dispatch", "clients")?;
        let server_baseport = get_u16(ini, "dispatch", "server_baseport")?;
        let client_baseport = get_u16(ini, "dispatch", "client_baseport")?;

        Ok(CycloneConfig {
            me,
            storage: StorageConfig { raftpath, logsize },
            quorum: QuorumConfig { baseport },
            active: ActiveConfig { replicas },
            dispatch: DispatchConfig {
                filepath,
                clients,
                server_baseport,
                client_baseport,
            },
        })
    }

    /// The path to this node's own pmem log file.
    pub fn raft_log_path(&self) -> PathBuf {
        PathBuf::from(format!("{}{}", self.storage.raftpath, self.me))
    }

    pub fn is_active(&self) -> bool {
        self.active.replicas.contains(&self.me)
    }
}

fn get_str(ini: &Ini, section: &'static str, key: &str) -> Result<String, ConfigError> {
    ini.section(Some(section))
        .and_then(|s| s.get(key))
        .map(str::to_owned)
        .ok_or_else(|| ConfigError::MissingKey {
            section,
            key: key.to_owned(),
        })
}

fn get_u32(ini: &Ini, section: &'static str, key: &str) -> Result<u32, ConfigError> {
    let raw = get_str(ini, section, key)?;
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        section,
        key: key.to_owned(),
        value: raw,
    })
}

fn get_u16(ini: &Ini, section: &'static str, key: &str) -> Result<u16, ConfigError> {
    let raw = get_str(ini, section, key)?;
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        section,
        key: key.to_owned(),
        value: raw,
    })
}

fn get_usize(ini: &Ini, section: &'static str, key: &str) -> Result<usize, ConfigError> {
    let raw = get_str(ini, section, key)?;
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        section,
        key: key.to_owned(),
        value: raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_config() -> &'static str {
        "[network]\nme=0\n\n[storage]\nraftpath=/tmp/cyclone.raft.\nlogsize=1048576\n\n\
         [quorum]\nbaseport=9000\n\n[active]\nreplicas=3\nentry0=0\nentry1=1\nentry2=2\n\n\
         [dispatch]\nfilepath=/tmp/cyclone.disp\nclients=4\nserver_baseport=9100\nclient_baseport=9200\n"
    }

    #[test]
    fn parses_a_well_formed_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cyclone.ini");
        std::fs::File::create(&path).unwrap().write_all(sample_config().as_bytes()).unwrap();
        let cfg = CycloneConfig::load(&path).unwrap();
        assert_eq!(cfg.me, 0);
        assert_eq!(cfg.active.replicas, vec![0, 1, 2]);
        assert!(cfg.is_active());
        assert_eq!(cfg.raft_log_path(), PathBuf::from("/tmp/cyclone.raft.0"));
    }

    #[test]
    fn missing_key_is_a_structured_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cyclone.ini");
        std::fs::File::create(&path).unwrap().write_all(b"[network]\nme=0\n").unwrap();
        let err = CycloneConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { section: "storage", .. }));
    }
}
