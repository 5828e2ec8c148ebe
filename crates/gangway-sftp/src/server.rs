//! SFTP server backing one sshfs mount inside an instance.
//!
//! The server launches sshfs in the instance over an established SSH
//! connection, then answers the SFTP requests sshfs sends back against the
//! host filesystem. Requests are handled strictly one at a time; every
//! request gets exactly one reply, and all open-handle state lives in this
//! one task. Ownership metadata crosses the wire through the mount's
//! identity mappings: outward attributes are forward-mapped, inbound
//! attribute changes are reverse-mapped before reaching the host.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{error, info, trace, warn};

use crate::config::MountConfig;
use crate::id_map::{IdMapper, NO_ID_INFO};
use crate::platform::Platform;
use crate::protocol::{
    ClientMessage, FileAttrs, MessageType, NameEntry, OpenFlags, Reply, StatusCode, S_IFDIR,
    S_IFLNK, S_IFREG,
};
use crate::session::SftpSession;
use crate::ssh::{launch_sshfs, SshConnection, SshProcess, HELPER_PROBE_WAIT};
use crate::{Error, Result};

/// Upper bound on bytes returned by a single `READ`
const MAX_READ_LEN: u32 = 65536;

/// Upper bound on entries returned by a single `READDIR`
const MAX_ENTRIES_PER_PACKET: usize = 50;

/// An open file together with the path it was opened under, kept for
/// `FSETSTAT` and diagnostics.
struct OpenFile {
    file: fs::File,
    path: PathBuf,
}

/// One directory entry captured at `OPENDIR` time.
///
/// The listing is a snapshot: entries created after the open are never
/// reported, entries deleted after the open still are.
struct DirEntrySnapshot {
    name: String,
    path: PathBuf,
    meta: std::fs::Metadata,
}

/// Requests loop termination from outside the serving task.
///
/// Stopping both sets the flag and tears the transport down, so a read
/// blocked on the channel unblocks and the loop observes the flag.
#[derive(Clone)]
pub struct StopHandle {
    stop_requested: Arc<AtomicBool>,
    ssh: Arc<dyn SshConnection>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.ssh.force_shutdown();
    }
}

/// SFTP server for one mount.
pub struct SftpServer {
    ssh: Arc<dyn SshConnection>,
    platform: Arc<dyn Platform>,
    config: MountConfig,
    ids: IdMapper,
    sshfs: Box<dyn SshProcess>,
    session: SftpSession,
    open_files: HashMap<u32, OpenFile>,
    open_dirs: HashMap<u32, Vec<DirEntrySnapshot>>,
    next_handle: u32,
    stop_requested: Arc<AtomicBool>,
}

impl SftpServer {
    /// Launch sshfs in the instance and bring up the SFTP session over its
    /// channel. Fails if the configuration is invalid, sshfs exits during
    /// the launch probe, or the version handshake cannot be completed.
    pub async fn new(
        ssh: Arc<dyn SshConnection>,
        platform: Arc<dyn Platform>,
        config: MountConfig,
    ) -> Result<Self> {
        config.validate()?;

        warn!(
            source = %config.source,
            "path confinement is a raw prefix check; `..` components are not canonicalised away"
        );

        let mut sshfs = launch_sshfs(
            ssh.as_ref(),
            &config.sshfs_exec_line,
            &config.source,
            &config.target,
        )
        .await?;
        let channel = sshfs
            .take_channel()
            .ok_or_else(|| Error::Ssh("sshfs process has no channel".to_string()))?;
        let session = SftpSession::initialize(channel).await?;

        let ids = IdMapper::new(
            config.uid_mappings.clone(),
            config.gid_mappings.clone(),
            config.default_uid,
            config.default_gid,
        );

        Ok(Self {
            ssh,
            platform,
            config,
            ids,
            sshfs,
            session,
            open_files: HashMap::new(),
            open_dirs: HashMap::new(),
            next_handle: 0,
            stop_requested: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Handle for stopping the server from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop_requested: self.stop_requested.clone(),
            ssh: self.ssh.clone(),
        }
    }

    /// Serve requests until the session ends.
    ///
    /// When the stream runs dry without a stop request, the sshfs process
    /// is probed: a clean exit (or a process still running) ends the loop,
    /// anything else triggers one recovery attempt before resuming.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            let Some(msg) = self.session.read_message().await else {
                if self.stop_requested.load(Ordering::SeqCst) {
                    break;
                }

                match self.sshfs.exit_status(HELPER_PROBE_WAIT).await {
                    Ok(Some(0)) | Ok(None) => break,
                    Ok(Some(code)) => {
                        error!(
                            code,
                            "sshfs in the instance appears to have exited unexpectedly, trying to recover"
                        );
                        self.recover().await?;
                    }
                    Err(e) => {
                        error!(error = %e, "could not determine sshfs status, trying to recover");
                        self.recover().await?;
                    }
                }
                continue;
            };

            self.process_message(msg).await;
        }

        Ok(())
    }

    /// Unmount whatever sshfs left behind, relaunch it and rebuild the
    /// session over the fresh channel.
    async fn recover(&mut self) -> Result<()> {
        let mut findmnt = self
            .ssh
            .exec(&format!(
                "findmnt --source :{} -o TARGET -n",
                self.config.source
            ))
            .await?;
        let mount_path = findmnt.read_stdout().await.unwrap_or_default();
        let mount_path = mount_path.trim();
        if !mount_path.is_empty() {
            self.ssh.exec(&format!("sudo umount {}", mount_path)).await?;
        }

        self.sshfs = launch_sshfs(
            self.ssh.as_ref(),
            &self.config.sshfs_exec_line,
            &self.config.source,
            &self.config.target,
        )
        .await?;
        let channel = self
            .sshfs
            .take_channel()
            .ok_or_else(|| Error::Ssh("sshfs process has no channel".to_string()))?;
        self.session = SftpSession::initialize(channel).await?;

        Ok(())
    }

    async fn process_message(&mut self, msg: ClientMessage) {
        let reply = self.dispatch(&msg).await;
        if let Err(e) = self.session.send_reply(msg.request_id, &reply).await {
            error!(error = %e, "error occurred when replying to client");
        }
    }

    async fn dispatch(&mut self, msg: &ClientMessage) -> Reply {
        match MessageType::try_from(msg.kind) {
            Ok(MessageType::Realpath) => self.handle_realpath(msg),
            Ok(MessageType::Opendir) => self.handle_opendir(msg).await,
            Ok(MessageType::Mkdir) => self.handle_mkdir(msg).await,
            Ok(MessageType::Rmdir) => self.handle_rmdir(msg).await,
            Ok(MessageType::Lstat) => self.handle_stat(msg, false).await,
            Ok(MessageType::Stat) => self.handle_stat(msg, true).await,
            Ok(MessageType::Fstat) => self.handle_fstat(msg).await,
            Ok(MessageType::Readdir) => self.handle_readdir(msg),
            Ok(MessageType::Close) => self.handle_close(msg),
            Ok(MessageType::Open) => self.handle_open(msg).await,
            Ok(MessageType::Read) => self.handle_read(msg).await,
            Ok(MessageType::Write) => self.handle_write(msg).await,
            Ok(MessageType::Rename) => self.handle_rename(msg).await,
            Ok(MessageType::Remove) => self.handle_remove(msg).await,
            Ok(MessageType::Setstat) | Ok(MessageType::Fsetstat) => {
                self.handle_setstat(msg).await
            }
            Ok(MessageType::Readlink) => self.handle_readlink(msg).await,
            Ok(MessageType::Symlink) => self.handle_symlink(msg).await,
            Ok(MessageType::Extended) => self.handle_extended(msg).await,
            Ok(other) => {
                trace!(r#type = ?other, "unsupported message");
                reply_unsupported()
            }
            Err(_) => {
                trace!(r#type = msg.kind, "unknown message");
                reply_unsupported()
            }
        }
    }

    /// Raw byte-prefix check of `path` against the exported source.
    fn validate_path(&self, op: &str, path: &str) -> bool {
        let source = &self.config.source;
        let ok = !source.is_empty() && path.as_bytes().starts_with(source.as_bytes());
        if !ok {
            trace!(
                "{}: cannot validate path '{}' against source '{}'",
                op,
                path,
                source
            );
        }
        ok
    }

    fn next_handle_id(&mut self) -> u32 {
        let id = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        id
    }

    /// Wire attributes for one host object, with forward-mapped ownership.
    fn attr_from(&self, meta: &std::fs::Metadata) -> FileAttrs {
        let mut permissions = permission_bits(meta);
        if meta.file_type().is_symlink() {
            permissions |= S_IFLNK | 0o777;
        } else if meta.is_dir() {
            permissions |= S_IFDIR;
        } else if meta.is_file() {
            permissions |= S_IFREG;
        }

        FileAttrs {
            size: Some(meta.len()),
            uid: Some(self.ids.mapped_uid_for(host_uid(meta)) as u32),
            gid: Some(self.ids.mapped_gid_for(host_gid(meta)) as u32),
            permissions: Some(permissions),
            atime: Some(epoch_secs(meta.accessed())),
            mtime: Some(epoch_secs(meta.modified())),
        }
    }

    /// Forward-map the ownership of attributes produced by the platform's
    /// symlink introspection.
    fn map_symlink_attr(&self, mut attrs: FileAttrs) -> FileAttrs {
        attrs.uid = attrs
            .uid
            .map(|uid| self.ids.mapped_uid_for(uid as i64) as u32);
        attrs.gid = attrs
            .gid
            .map(|gid| self.ids.mapped_gid_for(gid as i64) as u32);
        attrs
    }

    /// Apply the ownership an `OPEN`-created file or fresh directory should
    /// carry: reverse-mapped request ids, with the parent directory's
    /// owner/group as the fallback for unmapped ids.
    async fn chown_new_entry(&self, op: &str, path: &Path, attrs: &FileAttrs) -> bool {
        let parent = path.parent().unwrap_or_else(|| Path::new("/"));
        let (parent_uid, parent_gid) = match fs::metadata(parent).await {
            Ok(meta) => (host_uid(&meta), host_gid(&meta)),
            Err(_) => (NO_ID_INFO, NO_ID_INFO),
        };

        let uid = self
            .ids
            .reverse_uid_for(attrs.uid.map(i64::from).unwrap_or(0), parent_uid);
        let gid = self
            .ids
            .reverse_gid_for(attrs.gid.map(i64::from).unwrap_or(0), parent_gid);

        if let Err(e) = self.platform.chown(path, uid, gid) {
            trace!(
                "{}: failed to chown '{}' to owner:{} and group:{}: {}",
                op,
                path.display(),
                uid,
                gid,
                e
            );
            return false;
        }
        true
    }

    fn handle_realpath(&self, msg: &ClientMessage) -> Reply {
        let filename = &msg.filename;
        if !self.validate_path("realpath", filename) {
            return reply_perm_denied();
        }

        let realpath = lexically_absolute(filename);
        Reply::Name(vec![NameEntry {
            filename: realpath.clone(),
            longname: realpath,
            attrs: FileAttrs::default(),
        }])
    }

    async fn handle_opendir(&mut self, msg: &ClientMessage) -> Reply {
        let filename = &msg.filename;
        if !self.validate_path("opendir", filename) {
            return reply_perm_denied();
        }

        let dir = Path::new(filename);
        match fs::metadata(dir).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                trace!("cannot open directory '{}': no such directory", filename);
                return reply_status(StatusCode::NoSuchFile, "no such directory");
            }
        }

        let mut read_dir = match fs::read_dir(dir).await {
            Ok(read_dir) => read_dir,
            Err(e) => {
                trace!("cannot read directory '{}': {}", filename, e);
                return reply_perm_denied();
            }
        };

        // Full snapshot, dot entries included; later mutations of the
        // directory are invisible to this handle.
        let mut entries = Vec::new();
        for name in [".", ".."] {
            let path = dir.join(name);
            if let Ok(meta) = fs::symlink_metadata(&path).await {
                entries.push(DirEntrySnapshot {
                    name: name.to_string(),
                    path,
                    meta,
                });
            }
        }
        loop {
            match read_dir.next_entry().await {
                Ok(Some(entry)) => match entry.metadata().await {
                    Ok(meta) => entries.push(DirEntrySnapshot {
                        name: entry.file_name().to_string_lossy().into_owned(),
                        path: entry.path(),
                        meta,
                    }),
                    Err(e) => {
                        trace!(
                            "skipping unreadable entry '{}': {}",
                            entry.path().display(),
                            e
                        );
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    trace!("error listing '{}': {}", filename, e);
                    return reply_failure();
                }
            }
        }

        let handle = self.next_handle_id();
        self.open_dirs.insert(handle, entries);
        Reply::Handle(handle)
    }

    fn handle_readdir(&mut self, msg: &ClientMessage) -> Reply {
        let snapshot = match msg.handle {
            Some(handle) => self.open_dirs.get_mut(&handle),
            None => None,
        };
        let Some(snapshot) = snapshot else {
            trace!("readdir: bad handle requested");
            return reply_bad_handle("readdir");
        };

        if snapshot.is_empty() {
            return reply_status(StatusCode::Eof, "");
        }

        let count = snapshot.len().min(MAX_ENTRIES_PER_PACKET);
        let batch: Vec<DirEntrySnapshot> = snapshot.drain(..count).collect();

        let mut names = Vec::with_capacity(batch.len());
        for entry in &batch {
            let attrs = if entry.meta.file_type().is_symlink() {
                match self.platform.symlink_attr(&entry.path) {
                    Ok(attrs) => self.map_symlink_attr(attrs),
                    Err(_) => self.attr_from(&entry.meta),
                }
            } else {
                self.attr_from(&entry.meta)
            };

            names.push(NameEntry {
                filename: entry.name.clone(),
                longname: longname_from(&entry.meta, &entry.name),
                attrs,
            });
        }

        Reply::Name(names)
    }

    fn handle_close(&mut self, msg: &ClientMessage) -> Reply {
        let removed = match msg.handle {
            Some(handle) => {
                self.open_files.remove(&handle).is_some()
                    || self.open_dirs.remove(&handle).is_some()
            }
            None => false,
        };

        if !removed {
            trace!("close: bad handle requested");
            return reply_bad_handle("close");
        }
        reply_ok()
    }

    async fn handle_open(&mut self, msg: &ClientMessage) -> Reply {
        let filename = &msg.filename;
        if !self.validate_path("open", filename) {
            return reply_perm_denied();
        }

        let flags = OpenFlags(msg.flags);
        let mut options = fs::OpenOptions::new();
        if flags.has_read() {
            options.read(true);
        }
        if flags.has_write() {
            options.write(true).create(true);

            // sshfs before 3.2 does not pass O_APPEND through; a plain
            // write-only open has to append to keep those clients correct.
            if msg.flags == OpenFlags::WRITE {
                options.append(true);
                info!("adding sshfs O_APPEND workaround");
            }
        }
        if flags.has_append() {
            options.append(true).create(true);
        }
        if flags.has_trunc() {
            options.truncate(true);
        }

        let existed = fs::symlink_metadata(filename).await.is_ok();

        let file = match options.open(filename).await {
            Ok(file) => file,
            Err(e) => {
                trace!("Cannot open '{}': {}", filename, e);
                return reply_failure();
            }
        };

        if !existed {
            // a request without the PERMISSIONS flag carries mode 0, and
            // mode 0 is what gets applied
            let permissions = msg.attrs.permissions.unwrap_or(0);
            if let Err(e) = apply_permissions(Path::new(filename), permissions).await {
                trace!("Cannot set permissions for '{}': {}", filename, e);
                return reply_failure();
            }

            if !self
                .chown_new_entry("open", Path::new(filename), &msg.attrs)
                .await
            {
                return reply_failure();
            }
        }

        let handle = self.next_handle_id();
        self.open_files.insert(
            handle,
            OpenFile {
                file,
                path: PathBuf::from(filename),
            },
        );
        Reply::Handle(handle)
    }

    async fn handle_read(&mut self, msg: &ClientMessage) -> Reply {
        let open = match msg.handle {
            Some(handle) => self.open_files.get_mut(&handle),
            None => None,
        };
        let Some(open) = open else {
            trace!("read: bad handle requested");
            return reply_bad_handle("read");
        };

        if let Err(e) = open.file.seek(SeekFrom::Start(msg.offset)).await {
            trace!(
                "read: cannot seek to position {} in '{}': {}",
                msg.offset,
                open.path.display(),
                e
            );
            return reply_failure();
        }

        let len = msg.len.min(MAX_READ_LEN) as usize;
        let mut data = vec![0u8; len];
        match open.file.read(&mut data).await {
            Ok(0) => reply_status(StatusCode::Eof, "End of file"),
            Ok(n) => {
                data.truncate(n);
                Reply::Data(data)
            }
            Err(e) => {
                trace!("read: read failed for '{}': {}", open.path.display(), e);
                Reply::Status {
                    code: StatusCode::Failure,
                    message: e.to_string(),
                }
            }
        }
    }

    async fn handle_write(&mut self, msg: &ClientMessage) -> Reply {
        let open = match msg.handle {
            Some(handle) => self.open_files.get_mut(&handle),
            None => None,
        };
        let Some(open) = open else {
            trace!("write: bad handle requested");
            return reply_bad_handle("write");
        };

        if let Err(e) = open.file.seek(SeekFrom::Start(msg.offset)).await {
            trace!(
                "write: cannot seek to position {} in '{}': {}",
                msg.offset,
                open.path.display(),
                e
            );
            return reply_failure();
        }

        let mut remaining = &msg.payload[..];
        while !remaining.is_empty() {
            let written = match open.file.write(remaining).await {
                Ok(0) => {
                    trace!(
                        "write: write failed for '{}': wrote no bytes",
                        open.path.display()
                    );
                    return reply_failure();
                }
                Ok(n) => n,
                Err(e) => {
                    trace!("write: write failed for '{}': {}", open.path.display(), e);
                    return reply_failure();
                }
            };

            if let Err(e) = open.file.flush().await {
                trace!("write: flush failed for '{}': {}", open.path.display(), e);
                return reply_failure();
            }

            remaining = &remaining[written..];
        }

        reply_ok()
    }

    async fn handle_stat(&mut self, msg: &ClientMessage, follow: bool) -> Reply {
        let op = if follow { "stat" } else { "lstat" };
        let filename = &msg.filename;
        if !self.validate_path(op, filename) {
            return reply_perm_denied();
        }

        let Ok(sym_meta) = fs::symlink_metadata(filename).await else {
            trace!("{}: cannot stat '{}': no such file", op, filename);
            return reply_status(StatusCode::NoSuchFile, "no such file");
        };

        if !follow && sym_meta.file_type().is_symlink() {
            return match self.platform.symlink_attr(Path::new(filename)) {
                Ok(attrs) => Reply::Attrs(self.map_symlink_attr(attrs)),
                Err(e) => {
                    trace!("lstat: cannot read link attributes of '{}': {}", filename, e);
                    reply_failure()
                }
            };
        }

        let meta = if sym_meta.file_type().is_symlink() {
            match fs::metadata(filename).await {
                Ok(meta) => meta,
                Err(_) => {
                    trace!("{}: cannot stat '{}': no such file", op, filename);
                    return reply_status(StatusCode::NoSuchFile, "no such file");
                }
            }
        } else {
            sym_meta
        };

        Reply::Attrs(self.attr_from(&meta))
    }

    async fn handle_fstat(&mut self, msg: &ClientMessage) -> Reply {
        let open = match msg.handle {
            Some(handle) => self.open_files.get(&handle),
            None => None,
        };
        let Some(open) = open else {
            trace!("fstat: bad handle requested");
            return reply_bad_handle("fstat");
        };

        let meta = match open.file.metadata().await {
            Ok(meta) => meta,
            Err(e) => {
                trace!("fstat: cannot stat '{}': {}", open.path.display(), e);
                return reply_failure();
            }
        };

        Reply::Attrs(self.attr_from(&meta))
    }

    async fn handle_mkdir(&mut self, msg: &ClientMessage) -> Reply {
        let filename = &msg.filename;
        if !self.validate_path("mkdir", filename) {
            return reply_perm_denied();
        }

        if let Err(e) = fs::create_dir(filename).await {
            trace!("mkdir: mkdir failed for '{}': {}", filename, e);
            return reply_failure();
        }

        let permissions = msg.attrs.permissions.unwrap_or(0);
        if let Err(e) = apply_permissions(Path::new(filename), permissions).await {
            trace!("mkdir: set permissions failed for '{}': {}", filename, e);
            return reply_failure();
        }

        if !self
            .chown_new_entry("mkdir", Path::new(filename), &msg.attrs)
            .await
        {
            return reply_failure();
        }

        reply_ok()
    }

    async fn handle_rmdir(&mut self, msg: &ClientMessage) -> Reply {
        let filename = &msg.filename;
        if !self.validate_path("rmdir", filename) {
            return reply_perm_denied();
        }

        if let Err(e) = fs::remove_dir(filename).await {
            trace!("rmdir: rmdir failed for '{}': {}", filename, e);
            return reply_failure();
        }

        reply_ok()
    }

    async fn handle_remove(&mut self, msg: &ClientMessage) -> Reply {
        let filename = &msg.filename;
        if !self.validate_path("remove", filename) {
            return reply_perm_denied();
        }

        if let Err(e) = fs::remove_file(filename).await {
            trace!("remove: cannot remove '{}': {}", filename, e);
            return reply_failure();
        }

        reply_ok()
    }

    async fn handle_rename(&mut self, msg: &ClientMessage) -> Reply {
        let source = &msg.filename;
        if !self.validate_path("rename", source) {
            return reply_perm_denied();
        }

        if fs::symlink_metadata(source).await.is_err() {
            trace!("rename: cannot rename '{}': no such file", source);
            return reply_status(StatusCode::NoSuchFile, "no such file");
        }

        let target = &msg.data;
        if !self.validate_path("rename", target) {
            return reply_perm_denied();
        }

        // Destructive overwrite: an existing target is removed first.
        if fs::metadata(target).await.is_ok() {
            if let Err(e) = fs::remove_file(target).await {
                trace!("rename: cannot remove '{}' for renaming: {}", target, e);
                return reply_failure();
            }
        }

        if let Err(e) = fs::rename(source, target).await {
            trace!("rename: failed renaming '{}' to '{}': {}", source, target, e);
            return reply_failure();
        }

        reply_ok()
    }

    async fn handle_setstat(&mut self, msg: &ClientMessage) -> Reply {
        let filename: PathBuf;

        if msg.kind == MessageType::Fsetstat as u8 {
            let open = match msg.handle {
                Some(handle) => self.open_files.get(&handle),
                None => None,
            };
            let Some(open) = open else {
                trace!("setstat: bad handle requested");
                return reply_bad_handle("setstat");
            };
            filename = open.path.clone();
        } else {
            if !self.validate_path("setstat", &msg.filename) {
                return reply_perm_denied();
            }
            if fs::symlink_metadata(&msg.filename).await.is_err() {
                trace!("setstat: cannot setstat '{}': no such file", msg.filename);
                return reply_status(StatusCode::NoSuchFile, "no such file");
            }
            filename = PathBuf::from(&msg.filename);
        }

        // Order matters: the resize must land before permission and
        // ownership changes can make the file unwritable.
        if let Some(size) = msg.attrs.size {
            if let Err(e) = resize_file(&filename, size).await {
                trace!("setstat: cannot resize '{}': {}", filename.display(), e);
                return reply_failure();
            }
        }

        if let Some(permissions) = msg.attrs.permissions {
            if let Err(e) = apply_permissions(&filename, permissions).await {
                trace!(
                    "setstat: set permissions failed for '{}': {}",
                    filename.display(),
                    e
                );
                return reply_failure();
            }
        }

        if let (Some(atime), Some(mtime)) = (msg.attrs.atime, msg.attrs.mtime) {
            if let Err(e) = self
                .platform
                .utime(&filename, i64::from(atime), i64::from(mtime))
            {
                trace!(
                    "setstat: cannot set modification date for '{}': {}",
                    filename.display(),
                    e
                );
                return reply_failure();
            }
        }

        if let (Some(uid), Some(gid)) = (msg.attrs.uid, msg.attrs.gid) {
            // Unlike creation, the fallback here is the requested id itself.
            let rev_uid = self.ids.reverse_uid_for(i64::from(uid), i64::from(uid));
            let rev_gid = self.ids.reverse_gid_for(i64::from(gid), i64::from(gid));
            if let Err(e) = self.platform.chown(&filename, rev_uid, rev_gid) {
                trace!(
                    "setstat: cannot set ownership for '{}': {}",
                    filename.display(),
                    e
                );
                return reply_failure();
            }
        }

        reply_ok()
    }

    async fn handle_readlink(&mut self, msg: &ClientMessage) -> Reply {
        let filename = &msg.filename;
        if !self.validate_path("readlink", filename) {
            return reply_perm_denied();
        }

        let link = match fs::read_link(filename).await {
            Ok(link) if !link.as_os_str().is_empty() => link,
            _ => {
                trace!("readlink: invalid link for '{}'", filename);
                return reply_status(StatusCode::NoSuchFile, "invalid link");
            }
        };

        let link = link.to_string_lossy().into_owned();
        Reply::Name(vec![NameEntry {
            filename: link.clone(),
            longname: link,
            attrs: FileAttrs::default(),
        }])
    }

    async fn handle_symlink(&mut self, msg: &ClientMessage) -> Reply {
        // The link text may name anything, only the link's own location is
        // confined to the source.
        let old_name = &msg.filename;
        let new_name = &msg.data;
        if !self.validate_path("symlink", new_name) {
            return reply_perm_denied();
        }

        let target_is_dir = fs::metadata(old_name)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);

        if let Err(e) = self
            .platform
            .symlink(Path::new(old_name), Path::new(new_name), target_is_dir)
        {
            trace!(
                "symlink: failure creating symlink from '{}' to '{}': {}",
                old_name,
                new_name,
                e
            );
            return reply_failure();
        }

        reply_ok()
    }

    async fn handle_extended(&mut self, msg: &ClientMessage) -> Reply {
        let Some(submessage) = msg.submessage.as_deref() else {
            trace!("extended: invalid submessage requested");
            return reply_failure();
        };

        match submessage {
            "hardlink@openssh.com" => {
                let old_name = &msg.filename;
                let new_name = &msg.data;
                if !self.validate_path("hardlink", new_name) {
                    return reply_perm_denied();
                }

                if let Err(e) = self
                    .platform
                    .link(Path::new(old_name), Path::new(new_name))
                {
                    trace!(
                        "hardlink: failed creating link from '{}' to '{}': {}",
                        old_name,
                        new_name,
                        e
                    );
                    return reply_failure();
                }

                reply_ok()
            }
            "posix-rename@openssh.com" => self.handle_rename(msg).await,
            other => {
                trace!("Unhandled extended method requested: {}", other);
                reply_unsupported()
            }
        }
    }
}

fn reply_ok() -> Reply {
    reply_status(StatusCode::Ok, "")
}

fn reply_failure() -> Reply {
    reply_status(StatusCode::Failure, "")
}

fn reply_perm_denied() -> Reply {
    reply_status(StatusCode::PermissionDenied, "permission denied")
}

fn reply_bad_handle(op: &str) -> Reply {
    reply_status(StatusCode::BadMessage, &format!("{}: invalid handle", op))
}

fn reply_unsupported() -> Reply {
    reply_status(StatusCode::OpUnsupported, "Unsupported message")
}

fn reply_status(code: StatusCode, message: &str) -> Reply {
    Reply::Status {
        code,
        message: message.to_string(),
    }
}

/// Lexical absolutisation: strips `.` and resolves `..` without touching
/// the filesystem or following symlinks.
fn lexically_absolute(path: &str) -> String {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::RootDir | Component::Prefix(_) => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out.to_string_lossy().into_owned()
}

/// Classic `ls -l` line for one directory entry. Owner and group are the
/// raw host ids; the link count is a fixed `1`.
fn longname_from(meta: &std::fs::Metadata, filename: &str) -> String {
    let mut out = String::with_capacity(64 + filename.len());

    out.push(if meta.file_type().is_symlink() {
        'l'
    } else if meta.is_dir() {
        'd'
    } else {
        '-'
    });

    let mode = permission_bits(meta);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }

    let mtime: DateTime<Local> = meta
        .modified()
        .map(DateTime::from)
        .unwrap_or_else(|_| Local::now());
    let timestamp = mtime.format("%b %-d %H:%M:%S %Y");

    out.push_str(&format!(
        " 1 {} {} {} {} {}",
        host_uid(meta),
        host_gid(meta),
        meta.len(),
        timestamp,
        filename
    ));

    out
}

#[cfg(unix)]
fn host_uid(meta: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    i64::from(meta.uid())
}

#[cfg(not(unix))]
fn host_uid(_meta: &std::fs::Metadata) -> i64 {
    NO_ID_INFO
}

#[cfg(unix)]
fn host_gid(meta: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    i64::from(meta.gid())
}

#[cfg(not(unix))]
fn host_gid(_meta: &std::fs::Metadata) -> i64 {
    NO_ID_INFO
}

#[cfg(unix)]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode() & 0o777
}

#[cfg(not(unix))]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o555
    } else {
        0o755
    }
}

fn epoch_secs(time: std::io::Result<SystemTime>) -> u32 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(unix)]
async fn apply_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o777)).await
}

#[cfg(not(unix))]
async fn apply_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    let mut permissions = fs::metadata(path).await?.permissions();
    permissions.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, permissions).await
}

async fn resize_file(path: &Path, size: u64) -> std::io::Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path).await?;
    file.set_len(size).await
}
