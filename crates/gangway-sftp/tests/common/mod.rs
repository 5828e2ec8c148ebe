//! Shared fixtures for the integration tests: an in-memory SSH connection
//! whose "sshfs" is the test itself, a scripted process double for exit
//! status probes, a recording platform, and a minimal SFTP client speaking
//! the wire format.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use gangway_sftp::platform::Platform;
use gangway_sftp::protocol::{codec, FileAttrs, MessageType, StatusCode};
use gangway_sftp::ssh::{SshChannel, SshConnection, SshProcess};
use gangway_sftp::{MountConfig, SftpServer, StopHandle, UnixPlatform};
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Scripted outcome of one `exit_status` probe.
#[derive(Debug, Clone, Copy)]
pub enum Probe {
    Running,
    Exited(i32),
    Failed,
}

/// `SshConnection` double. Commands are recorded; every sshfs launch hands
/// the test the client half of an in-memory channel.
pub struct StubSsh {
    channels: mpsc::UnboundedSender<DuplexStream>,
    pub commands: Mutex<Vec<String>>,
    scripts: Mutex<VecDeque<Vec<Probe>>>,
    findmnt_output: Mutex<String>,
    pub shutdowns: AtomicUsize,
}

impl StubSsh {
    pub fn new(
        channels: mpsc::UnboundedSender<DuplexStream>,
        scripts: Vec<Vec<Probe>>,
        findmnt_output: String,
    ) -> Self {
        Self {
            channels,
            commands: Mutex::new(Vec::new()),
            scripts: Mutex::new(scripts.into_iter().collect()),
            findmnt_output: Mutex::new(findmnt_output),
            shutdowns: AtomicUsize::new(0),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl SshConnection for StubSsh {
    async fn exec(&self, command: &str) -> gangway_sftp::Result<Box<dyn SshProcess>> {
        self.commands.lock().unwrap().push(command.to_string());

        if command.starts_with("findmnt") {
            return Ok(Box::new(StubProcess {
                probes: VecDeque::new(),
                stdout: self.findmnt_output.lock().unwrap().clone(),
                stderr: String::new(),
                channel: None,
            }));
        }

        if command.starts_with("sudo umount") {
            return Ok(Box::new(StubProcess {
                probes: VecDeque::new(),
                stdout: String::new(),
                stderr: String::new(),
                channel: None,
            }));
        }

        // sshfs launch: the stub client opens the conversation with
        // SSH_FXP_INIT the way the real sshfs does.
        let (mut client, server) = duplex(1 << 20);
        let mut init = BytesMut::with_capacity(9);
        init.put_u32(5);
        init.put_u8(MessageType::Init as u8);
        init.put_u32(3);
        client.write_all(&init).await.unwrap();

        self.channels.send(client).unwrap();

        let probes = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        Ok(Box::new(StubProcess {
            probes: probes.into_iter().collect(),
            stdout: String::new(),
            stderr: String::new(),
            channel: Some(Box::new(server)),
        }))
    }

    fn force_shutdown(&self) {
        self.shutdowns
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

struct StubProcess {
    probes: VecDeque<Probe>,
    stdout: String,
    stderr: String,
    channel: Option<Box<dyn SshChannel>>,
}

#[async_trait]
impl SshProcess for StubProcess {
    async fn exit_status(&mut self, _wait: Duration) -> io::Result<Option<i32>> {
        match self.probes.pop_front().unwrap_or(Probe::Running) {
            Probe::Running => Ok(None),
            Probe::Exited(code) => Ok(Some(code)),
            Probe::Failed => Err(io::Error::new(io::ErrorKind::Other, "status probe failed")),
        }
    }

    async fn read_stdout(&mut self) -> io::Result<String> {
        Ok(std::mem::take(&mut self.stdout))
    }

    async fn read_stderr(&mut self) -> io::Result<String> {
        Ok(std::mem::take(&mut self.stderr))
    }

    fn take_channel(&mut self) -> Option<Box<dyn SshChannel>> {
        self.channel.take()
    }
}

/// `Platform` double: chown is recorded instead of applied (the tests run
/// unprivileged), everything else delegates to the real platform.
pub struct RecordingPlatform {
    real: UnixPlatform,
    pub chowns: Mutex<Vec<(PathBuf, i64, i64)>>,
    pub utimes: Mutex<Vec<(PathBuf, i64, i64)>>,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self {
            real: UnixPlatform,
            chowns: Mutex::new(Vec::new()),
            utimes: Mutex::new(Vec::new()),
        }
    }

    pub fn chown_calls(&self) -> Vec<(PathBuf, i64, i64)> {
        self.chowns.lock().unwrap().clone()
    }

    pub fn utime_calls(&self) -> Vec<(PathBuf, i64, i64)> {
        self.utimes.lock().unwrap().clone()
    }
}

impl Platform for RecordingPlatform {
    fn chown(&self, path: &Path, uid: i64, gid: i64) -> io::Result<()> {
        self.chowns
            .lock()
            .unwrap()
            .push((path.to_path_buf(), uid, gid));
        Ok(())
    }

    fn symlink(&self, target: &Path, link: &Path, target_is_dir: bool) -> io::Result<()> {
        self.real.symlink(target, link, target_is_dir)
    }

    fn link(&self, original: &Path, link: &Path) -> io::Result<()> {
        self.real.link(original, link)
    }

    fn utime(&self, path: &Path, atime: i64, mtime: i64) -> io::Result<()> {
        self.utimes
            .lock()
            .unwrap()
            .push((path.to_path_buf(), atime, mtime));
        self.real.utime(path, atime, mtime)
    }

    fn symlink_attr(&self, path: &Path) -> io::Result<FileAttrs> {
        self.real.symlink_attr(path)
    }
}

/// Decoded reply as the test client sees it.
#[derive(Debug)]
pub enum ClientReply {
    Status { code: u32, message: String },
    Handle(Vec<u8>),
    Data(Vec<u8>),
    Attrs(FileAttrs),
    Name(Vec<(String, String, FileAttrs)>),
}

/// Minimal SFTP client driving the server over the in-memory channel.
pub struct TestClient {
    stream: DuplexStream,
    next_id: u32,
}

impl TestClient {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            next_id: 100,
        }
    }

    pub async fn read_version(&mut self) {
        let len = self.stream.read_u32().await.expect("version frame");
        let mut packet = vec![0u8; len as usize];
        self.stream.read_exact(&mut packet).await.unwrap();
        assert_eq!(packet[0], MessageType::Version as u8);
        let version = u32::from_be_bytes([packet[1], packet[2], packet[3], packet[4]]);
        assert_eq!(version, 3);
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    async fn request(&mut self, body: BytesMut) -> ClientReply {
        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.put_u32(body.len() as u32);
        frame.extend_from_slice(&body);
        self.stream.write_all(&frame).await.unwrap();
        self.read_reply().await
    }

    pub async fn read_reply(&mut self) -> ClientReply {
        let len = self.stream.read_u32().await.expect("reply frame");
        let mut packet = vec![0u8; len as usize];
        self.stream.read_exact(&mut packet).await.unwrap();

        let kind = packet[0];
        let mut buf = &packet[1..];
        let _id = codec::get_u32(&mut buf).unwrap();

        match MessageType::try_from(kind).unwrap() {
            MessageType::Status => {
                let code = codec::get_u32(&mut buf).unwrap();
                let message = codec::get_string(&mut buf).unwrap();
                ClientReply::Status { code, message }
            }
            MessageType::Handle => ClientReply::Handle(codec::get_bytes(&mut buf).unwrap()),
            MessageType::Data => ClientReply::Data(codec::get_bytes(&mut buf).unwrap()),
            MessageType::Attrs => ClientReply::Attrs(FileAttrs::decode(&mut buf).unwrap()),
            MessageType::Name => {
                let count = codec::get_u32(&mut buf).unwrap();
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let filename = codec::get_string(&mut buf).unwrap();
                    let longname = codec::get_string(&mut buf).unwrap();
                    let attrs = FileAttrs::decode(&mut buf).unwrap();
                    entries.push((filename, longname, attrs));
                }
                ClientReply::Name(entries)
            }
            other => panic!("unexpected reply type {:?}", other),
        }
    }

    fn path_body(&mut self, kind: MessageType, path: &str) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_u8(kind as u8);
        body.put_u32(self.next_id());
        codec::put_string(&mut body, path);
        body
    }

    fn handle_body(&mut self, kind: MessageType, handle: &[u8]) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_u8(kind as u8);
        body.put_u32(self.next_id());
        codec::put_bytes(&mut body, handle);
        body
    }

    pub async fn open(&mut self, path: &str, flags: u32, attrs: &FileAttrs) -> ClientReply {
        let mut body = self.path_body(MessageType::Open, path);
        body.put_u32(flags);
        body.put(attrs.encode());
        self.request(body).await
    }

    pub async fn close(&mut self, handle: &[u8]) -> ClientReply {
        let body = self.handle_body(MessageType::Close, handle);
        self.request(body).await
    }

    pub async fn read(&mut self, handle: &[u8], offset: u64, len: u32) -> ClientReply {
        let mut body = self.handle_body(MessageType::Read, handle);
        body.put_u64(offset);
        body.put_u32(len);
        self.request(body).await
    }

    pub async fn write(&mut self, handle: &[u8], offset: u64, data: &[u8]) -> ClientReply {
        let mut body = self.handle_body(MessageType::Write, handle);
        body.put_u64(offset);
        codec::put_bytes(&mut body, data);
        self.request(body).await
    }

    pub async fn stat(&mut self, path: &str) -> ClientReply {
        let body = self.path_body(MessageType::Stat, path);
        self.request(body).await
    }

    pub async fn lstat(&mut self, path: &str) -> ClientReply {
        let body = self.path_body(MessageType::Lstat, path);
        self.request(body).await
    }

    pub async fn fstat(&mut self, handle: &[u8]) -> ClientReply {
        let body = self.handle_body(MessageType::Fstat, handle);
        self.request(body).await
    }

    pub async fn setstat(&mut self, path: &str, attrs: &FileAttrs) -> ClientReply {
        let mut body = self.path_body(MessageType::Setstat, path);
        body.put(attrs.encode());
        self.request(body).await
    }

    pub async fn fsetstat(&mut self, handle: &[u8], attrs: &FileAttrs) -> ClientReply {
        let mut body = self.handle_body(MessageType::Fsetstat, handle);
        body.put(attrs.encode());
        self.request(body).await
    }

    pub async fn opendir(&mut self, path: &str) -> ClientReply {
        let body = self.path_body(MessageType::Opendir, path);
        self.request(body).await
    }

    pub async fn readdir(&mut self, handle: &[u8]) -> ClientReply {
        let body = self.handle_body(MessageType::Readdir, handle);
        self.request(body).await
    }

    pub async fn mkdir(&mut self, path: &str, attrs: &FileAttrs) -> ClientReply {
        let mut body = self.path_body(MessageType::Mkdir, path);
        body.put(attrs.encode());
        self.request(body).await
    }

    pub async fn rmdir(&mut self, path: &str) -> ClientReply {
        let body = self.path_body(MessageType::Rmdir, path);
        self.request(body).await
    }

    pub async fn remove(&mut self, path: &str) -> ClientReply {
        let body = self.path_body(MessageType::Remove, path);
        self.request(body).await
    }

    pub async fn realpath(&mut self, path: &str) -> ClientReply {
        let body = self.path_body(MessageType::Realpath, path);
        self.request(body).await
    }

    pub async fn readlink(&mut self, path: &str) -> ClientReply {
        let body = self.path_body(MessageType::Readlink, path);
        self.request(body).await
    }

    pub async fn rename(&mut self, source: &str, target: &str) -> ClientReply {
        let mut body = self.path_body(MessageType::Rename, source);
        codec::put_string(&mut body, target);
        self.request(body).await
    }

    /// `old_name` is the link text, `new_name` the link's location.
    pub async fn symlink(&mut self, old_name: &str, new_name: &str) -> ClientReply {
        let mut body = self.path_body(MessageType::Symlink, old_name);
        codec::put_string(&mut body, new_name);
        self.request(body).await
    }

    pub async fn extended(&mut self, submessage: &str, filename: &str, data: &str) -> ClientReply {
        let mut body = BytesMut::new();
        body.put_u8(MessageType::Extended as u8);
        body.put_u32(self.next_id());
        codec::put_string(&mut body, submessage);
        codec::put_string(&mut body, filename);
        codec::put_string(&mut body, data);
        self.request(body).await
    }
}

/// One running server with its client side and observation points.
pub struct Harness {
    pub ssh: Arc<StubSsh>,
    pub platform: Arc<RecordingPlatform>,
    pub client: TestClient,
    pub task: JoinHandle<gangway_sftp::Result<()>>,
    pub stop: StopHandle,
    pub dir: TempDir,
    channels: mpsc::UnboundedReceiver<DuplexStream>,
}

impl Harness {
    pub async fn start() -> Self {
        Self::builder().spawn().await
    }

    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// Absolute path of `rel` inside the exported source directory.
    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn path_str(&self, rel: &str) -> String {
        self.path(rel).to_string_lossy().into_owned()
    }

    pub fn source(&self) -> String {
        self.dir.path().to_string_lossy().into_owned()
    }

    /// Sever the current client channel, as if sshfs went away.
    pub fn drop_client(&mut self) {
        let (replacement, _closed) = duplex(8);
        drop(std::mem::replace(
            &mut self.client,
            TestClient::new(replacement),
        ));
    }

    /// Client for the channel created by the most recent sshfs launch
    /// (used after a recovery rebuilt the session).
    pub async fn next_client(&mut self) -> TestClient {
        let stream = self.channels.recv().await.expect("relaunched channel");
        let mut client = TestClient::new(stream);
        client.read_version().await;
        client
    }
}

pub struct HarnessBuilder {
    uid_mappings: Vec<(i64, i64)>,
    gid_mappings: Vec<(i64, i64)>,
    default_uid: i64,
    default_gid: i64,
    scripts: Vec<Vec<Probe>>,
    findmnt_output: String,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            uid_mappings: Vec::new(),
            gid_mappings: Vec::new(),
            default_uid: 1000,
            default_gid: 1000,
            scripts: Vec::new(),
            findmnt_output: String::new(),
        }
    }
}

impl HarnessBuilder {
    pub fn uid_map(mut self, host: i64, instance: i64) -> Self {
        self.uid_mappings.push((host, instance));
        self
    }

    pub fn gid_map(mut self, host: i64, instance: i64) -> Self {
        self.gid_mappings.push((host, instance));
        self
    }

    pub fn default_uid(mut self, uid: i64) -> Self {
        self.default_uid = uid;
        self
    }

    pub fn default_gid(mut self, gid: i64) -> Self {
        self.default_gid = gid;
        self
    }

    /// Exit-status script for the next launched sshfs process.
    pub fn probe_script(mut self, script: Vec<Probe>) -> Self {
        self.scripts.push(script);
        self
    }

    pub fn findmnt_output(mut self, output: &str) -> Self {
        self.findmnt_output = output.to_string();
        self
    }

    pub async fn spawn(self) -> Harness {
        let dir = TempDir::new().unwrap();
        let config = MountConfig {
            source: dir.path().to_string_lossy().into_owned(),
            target: "/mnt/share".to_string(),
            uid_mappings: self.uid_mappings,
            gid_mappings: self.gid_mappings,
            default_uid: self.default_uid,
            default_gid: self.default_gid,
            ..MountConfig::default()
        };

        let (tx, mut channels) = mpsc::unbounded_channel();
        let ssh = Arc::new(StubSsh::new(tx, self.scripts, self.findmnt_output));
        let platform = Arc::new(RecordingPlatform::new());

        let mut server = SftpServer::new(ssh.clone(), platform.clone(), config)
            .await
            .expect("server construction");
        let stop = server.stop_handle();
        let task = tokio::spawn(async move { server.run().await });

        let stream = channels.recv().await.expect("sshfs channel");
        let mut client = TestClient::new(stream);
        client.read_version().await;

        Harness {
            ssh,
            platform,
            client,
            task,
            stop,
            dir,
            channels,
        }
    }
}

pub fn expect_status(reply: ClientReply, code: StatusCode) -> String {
    match reply {
        ClientReply::Status { code: got, message } => {
            assert_eq!(got, code as u32, "unexpected status (message: {})", message);
            message
        }
        other => panic!("expected status reply, got {:?}", other),
    }
}

pub fn expect_ok(reply: ClientReply) {
    expect_status(reply, StatusCode::Ok);
}

pub fn expect_handle(reply: ClientReply) -> Vec<u8> {
    match reply {
        ClientReply::Handle(handle) => handle,
        other => panic!("expected handle reply, got {:?}", other),
    }
}

pub fn expect_data(reply: ClientReply) -> Vec<u8> {
    match reply {
        ClientReply::Data(data) => data,
        other => panic!("expected data reply, got {:?}", other),
    }
}

pub fn expect_attrs(reply: ClientReply) -> FileAttrs {
    match reply {
        ClientReply::Attrs(attrs) => attrs,
        other => panic!("expected attrs reply, got {:?}", other),
    }
}

pub fn expect_name(reply: ClientReply) -> Vec<(String, String, FileAttrs)> {
    match reply {
        ClientReply::Name(entries) => entries,
        other => panic!("expected name reply, got {:?}", other),
    }
}
