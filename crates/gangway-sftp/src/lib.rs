//! # Gangway SFTP
//!
//! SFTP server backing sshfs mounts of host directories into guest
//! instances.
//!
//! The server speaks the OpenSSH-compatible subset of SFTP version 3
//! (draft-ietf-secsh-filexfer-02) to an sshfs process it launches inside
//! the instance over an already-established SSH connection. Every request
//! is confined to a single exported source directory, and ownership
//! metadata is translated between the host and instance id namespaces in
//! both directions.
//!
//! ## Features
//!
//! - Full SFTP v3 handler set (files, directories, attributes, symlinks,
//!   the `hardlink@openssh.com` and `posix-rename@openssh.com` extensions)
//! - uid/gid mapping with configurable defaults
//! - Automatic recovery when sshfs dies inside the instance
//! - Async/await with Tokio

pub mod config;
pub mod error;
pub mod id_map;
pub mod platform;
pub mod protocol;
pub mod server;
pub mod session;
pub mod ssh;

pub use config::MountConfig;
pub use error::{Error, Result};
pub use id_map::{IdMapper, IdMappings, DEFAULT_ID, NO_ID_INFO};
pub use platform::{Platform, UnixPlatform};
pub use server::{SftpServer, StopHandle};
pub use ssh::{CommandSsh, SshChannel, SshConnection, SshProcess};
