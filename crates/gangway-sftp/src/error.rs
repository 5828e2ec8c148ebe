//! Error types for the mount server.
//!
//! Only session-fatal conditions surface as [`Error`]: construction,
//! handshake and transport failures. Per-operation failures never leave the
//! server as Rust errors; they are mapped to SFTP status codes and replied
//! to the client.

use thiserror::Error;

/// Result type alias for mount-server operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// I/O error on the SSH channel or while probing the helper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure executing a command over the SSH connection
    #[error("SSH error: {0}")]
    Ssh(String),

    /// SFTP protocol violation, including a failed version handshake
    #[error("SFTP protocol error: {0}")]
    Protocol(String),

    /// sshfs could not be started (or restarted) inside the instance
    #[error("sshfs failed in the instance: {0}")]
    Sshfs(String),

    /// Invalid or missing mount configuration
    #[error("Configuration error: {0}")]
    Config(String),
}
