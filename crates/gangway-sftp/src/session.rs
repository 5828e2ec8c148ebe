//! Framed SFTP session over an SSH channel.
//!
//! Requests and replies are length-prefixed packets; the session owns the
//! channel and performs the server side of the version handshake before any
//! request is read.

use crate::protocol::{ClientMessage, MessageType, Reply, SFTP_VERSION};
use crate::ssh::SshChannel;
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Largest request frame accepted from the client. sshfs writes at most
/// 64 KiB of payload per request, so anything bigger is a framing error.
const MAX_PACKET: u32 = 256 * 1024;

/// One SFTP session bound to one sshfs process.
pub struct SftpSession {
    channel: Box<dyn SshChannel>,
}

impl SftpSession {
    /// Perform the server side of the SFTP handshake: read `SSH_FXP_INIT`,
    /// answer `SSH_FXP_VERSION`. A failed handshake is fatal to the mount.
    pub async fn initialize(mut channel: Box<dyn SshChannel>) -> Result<Self> {
        let len = channel
            .read_u32()
            .await
            .map_err(|e| Error::Protocol(format!("server init failed: {}", e)))?;
        if !(5..=MAX_PACKET).contains(&len) {
            return Err(Error::Protocol(format!(
                "server init failed: bad packet length {}",
                len
            )));
        }

        let mut packet = vec![0u8; len as usize];
        channel
            .read_exact(&mut packet)
            .await
            .map_err(|e| Error::Protocol(format!("server init failed: {}", e)))?;

        if packet[0] != MessageType::Init as u8 {
            return Err(Error::Protocol(format!(
                "server init failed: expected SSH_FXP_INIT, got {}",
                packet[0]
            )));
        }
        let version = u32::from_be_bytes([packet[1], packet[2], packet[3], packet[4]]);
        debug!(version, "sftp client init");

        let mut reply = BytesMut::with_capacity(9);
        reply.put_u32(5);
        reply.put_u8(MessageType::Version as u8);
        reply.put_u32(SFTP_VERSION);
        channel.write_all(&reply).await?;
        channel.flush().await?;

        Ok(Self { channel })
    }

    /// Read the next client request. `None` when the channel closed or
    /// produced an unreadable frame; the caller decides between shutdown
    /// and recovery.
    pub async fn read_message(&mut self) -> Option<ClientMessage> {
        let len = self.channel.read_u32().await.ok()?;
        if len == 0 || len > MAX_PACKET {
            warn!(len, "dropping session: bad sftp frame length");
            return None;
        }

        let mut packet = vec![0u8; len as usize];
        self.channel.read_exact(&mut packet).await.ok()?;

        match ClientMessage::decode(&packet) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!(error = %e, "dropping session: undecodable sftp message");
                None
            }
        }
    }

    /// Send one reply frame.
    pub async fn send_reply(&mut self, request_id: u32, reply: &Reply) -> Result<()> {
        let payload = reply.encode(request_id);
        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.extend_from_slice(&payload);
        self.channel.write_all(&frame).await?;
        self.channel.flush().await?;
        Ok(())
    }
}
