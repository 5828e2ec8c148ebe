//! Configuration for one sshfs-backed mount

use crate::id_map::IdMappings;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Mount configuration
///
/// One value of this type describes one exported directory: where it lives
/// on the host, where sshfs mounts it inside the instance, and how
/// ownership translates between the two id namespaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Absolute host directory exposed to the instance
    pub source: String,

    /// Mount point inside the instance; only used to (re)launch sshfs
    pub target: String,

    /// Ordered `(host, instance)` uid pairs
    #[serde(default)]
    pub uid_mappings: IdMappings,

    /// Ordered `(host, instance)` gid pairs
    #[serde(default)]
    pub gid_mappings: IdMappings,

    /// uid advertised when the host owner has no usable mapping
    #[serde(default = "default_instance_id")]
    pub default_uid: i64,

    /// gid advertised when the host group has no usable mapping
    #[serde(default = "default_instance_id")]
    pub default_gid: i64,

    /// Command started inside the instance to run the mount; the server
    /// wraps it as `sudo <line> :"<source>" "<target>"`
    #[serde(default = "default_sshfs_exec_line")]
    pub sshfs_exec_line: String,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            source: String::new(),
            target: String::new(),
            uid_mappings: Vec::new(),
            gid_mappings: Vec::new(),
            default_uid: default_instance_id(),
            default_gid: default_instance_id(),
            sshfs_exec_line: default_sshfs_exec_line(),
        }
    }
}

impl MountConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.source.is_empty() {
            return Err(crate::Error::Config("source must not be empty".to_string()));
        }

        let source = Path::new(&self.source);
        if !source.is_absolute() {
            return Err(crate::Error::Config(format!(
                "source must be an absolute path: {:?}",
                self.source
            )));
        }

        if !source.is_dir() {
            return Err(crate::Error::Config(format!(
                "source is not a directory: {:?}",
                self.source
            )));
        }

        if self.target.is_empty() {
            return Err(crate::Error::Config("target must not be empty".to_string()));
        }

        Ok(())
    }
}

fn default_instance_id() -> i64 {
    1000 // first regular user in stock cloud images
}

fn default_sshfs_exec_line() -> String {
    "sshfs -o slave -o nonempty".to_string()
}
