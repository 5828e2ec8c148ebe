//! SSH connection seam and sshfs process management.
//!
//! The SFTP server never owns the SSH transport; it talks to the instance
//! through the [`SshConnection`] trait, which can be backed by the system
//! `ssh` client ([`CommandSsh`]) or by an in-memory double in tests. The
//! channel attached to the sshfs process carries the SFTP wire traffic.

use crate::{Error, Result};
use async_trait::async_trait;
use std::io;
use std::io::IoSlice;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::debug;

/// Bounded wait used when probing a remote process for its exit status,
/// both at launch and when the message stream runs dry.
pub(crate) const HELPER_PROBE_WAIT: Duration = Duration::from_millis(250);

/// Byte stream attached to a remote process.
pub trait SshChannel: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> SshChannel for T {}

/// An established SSH connection able to run commands in the instance.
#[async_trait]
pub trait SshConnection: Send + Sync {
    /// Execute `command` in the instance.
    async fn exec(&self, command: &str) -> Result<Box<dyn SshProcess>>;

    /// Tear the transport down so any blocked channel read unblocks.
    fn force_shutdown(&self);
}

/// A process started over the SSH connection.
#[async_trait]
pub trait SshProcess: Send + Sync {
    /// Wait up to `wait` for the process to exit. `Ok(Some(code))` means it
    /// exited, `Ok(None)` means it is still running after the bounded wait,
    /// `Err` means its status could not be determined at all.
    async fn exit_status(&mut self, wait: Duration) -> io::Result<Option<i32>>;

    /// Drain the process's standard output.
    async fn read_stdout(&mut self) -> io::Result<String>;

    /// Drain the process's standard error.
    async fn read_stderr(&mut self) -> io::Result<String>;

    /// Detach the byte channel attached to the process's stdio. Yields
    /// `None` once taken.
    fn take_channel(&mut self) -> Option<Box<dyn SshChannel>>;
}

/// Start sshfs inside the instance and probe it for immediate failure.
///
/// The exec line is wrapped as `sudo <line> :"<source>" "<target>"`, with
/// embedded double quotes in source and target escaped. A non-zero exit
/// within the probe window is a launch failure carrying the process's
/// stderr; a process still running after the window is taken as healthy.
pub async fn launch_sshfs(
    ssh: &dyn SshConnection,
    sshfs_exec_line: &str,
    source: &str,
    target: &str,
) -> Result<Box<dyn SshProcess>> {
    let command = format!(
        "sudo {} :\"{}\" \"{}\"",
        sshfs_exec_line,
        escape_char(source, '"'),
        escape_char(target, '"')
    );
    debug!(%command, "launching sshfs in the instance");

    let mut process = ssh.exec(&command).await?;
    match process.exit_status(HELPER_PROBE_WAIT).await {
        Ok(Some(code)) if code != 0 => {
            let stderr = process.read_stderr().await.unwrap_or_default();
            if stderr.is_empty() {
                Err(Error::Sshfs(format!("exited with status {}", code)))
            } else {
                Err(Error::Sshfs(stderr))
            }
        }
        Ok(_) => Ok(process),
        Err(e) => Err(Error::Sshfs(format!(
            "could not determine sshfs status: {}",
            e
        ))),
    }
}

/// Backslash-escape every occurrence of `needle` in `value`.
pub(crate) fn escape_char(value: &str, needle: char) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == needle {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// [`SshConnection`] backed by the system `ssh` client.
///
/// Every `exec` spawns `<ssh-command> -x -p <port> -- <user>@<host>
/// <command>` with piped stdio; the child's stdin/stdout become the channel.
pub struct CommandSsh {
    ssh_command: String,
    user: String,
    host: String,
    port: u16,
    spawned: Mutex<Vec<u32>>,
}

impl CommandSsh {
    pub fn new(ssh_command: &str, user: &str, host: &str, port: u16) -> Self {
        Self {
            ssh_command: ssh_command.to_string(),
            user: user.to_string(),
            host: host.to_string(),
            port,
            spawned: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SshConnection for CommandSsh {
    async fn exec(&self, command: &str) -> Result<Box<dyn SshProcess>> {
        let mut words = shell_words::split(&self.ssh_command)
            .map_err(|e| Error::Ssh(format!("invalid ssh command: {}", e)))?;
        if words.is_empty() {
            return Err(Error::Ssh("empty ssh command".to_string()));
        }

        let program = words.remove(0);
        let mut cmd = Command::new(program);
        cmd.args(&words)
            .arg("-x")
            .arg("-p")
            .arg(self.port.to_string())
            .arg("--")
            .arg(format!("{}@{}", self.user, self.host))
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(command, "spawning ssh");
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Ssh(format!("failed to spawn ssh: {}", e)))?;

        if let Some(pid) = child.id() {
            self.spawned.lock().unwrap().push(pid);
        }

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        Ok(Box::new(CommandSshProcess {
            child,
            stdin,
            stdout,
            stderr,
        }))
    }

    #[cfg(unix)]
    fn force_shutdown(&self) {
        for pid in self.spawned.lock().unwrap().drain(..) {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    fn force_shutdown(&self) {
        // kill_on_drop covers teardown where signals are unavailable
    }
}

/// A remote process reached through the system `ssh` client.
struct CommandSshProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

#[async_trait]
impl SshProcess for CommandSshProcess {
    async fn exit_status(&mut self, wait: Duration) -> io::Result<Option<i32>> {
        match tokio::time::timeout(wait, self.child.wait()).await {
            Ok(Ok(status)) => Ok(Some(status.code().unwrap_or(1))),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    async fn read_stdout(&mut self) -> io::Result<String> {
        let mut out = String::new();
        if let Some(mut stdout) = self.stdout.take() {
            stdout.read_to_string(&mut out).await?;
        }
        Ok(out)
    }

    async fn read_stderr(&mut self) -> io::Result<String> {
        let mut out = String::new();
        if let Some(mut stderr) = self.stderr.take() {
            stderr.read_to_string(&mut out).await?;
        }
        Ok(out)
    }

    fn take_channel(&mut self) -> Option<Box<dyn SshChannel>> {
        let stdin = self.stdin.take()?;
        let stdout = self.stdout.take()?;
        Some(Box::new(StdioStream {
            reader: stdout,
            writer: stdin,
        }))
    }
}

/// Child stdin/stdout glued into one duplex byte stream.
struct StdioStream {
    reader: ChildStdout,
    writer: ChildStdin,
}

impl AsyncRead for StdioStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for StdioStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write_vectored(cx, bufs)
    }
}
