//! Host platform operations behind a trait seam.
//!
//! Ownership changes, link creation and timestamp updates differ by
//! platform and need to be observable in tests, so the handlers reach them
//! through a [`Platform`] value injected at construction instead of calling
//! the OS directly.

use crate::protocol::FileAttrs;
use std::io;
use std::path::Path;

/// Platform calls the SFTP handlers delegate.
pub trait Platform: Send + Sync {
    /// Change ownership of `path`. Ids are passed through to the platform
    /// untranslated; values outside the `u32` range wrap the way the C
    /// interface does.
    fn chown(&self, path: &Path, uid: i64, gid: i64) -> io::Result<()>;

    /// Create a symlink at `link` pointing at `target`. `target_is_dir`
    /// carries the directory-vs-file distinction platforms like Windows
    /// need; POSIX ignores it.
    fn symlink(&self, target: &Path, link: &Path, target_is_dir: bool) -> io::Result<()>;

    /// Create a hard link at `link` pointing at `original`.
    fn link(&self, original: &Path, link: &Path) -> io::Result<()>;

    /// Set access and modification times, in seconds since the epoch.
    fn utime(&self, path: &Path, atime: i64, mtime: i64) -> io::Result<()>;

    /// Attributes of the symlink itself, never its target, with the raw
    /// host uid/gid.
    fn symlink_attr(&self, path: &Path) -> io::Result<FileAttrs>;
}

/// [`Platform`] implementation for Unix hosts.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixPlatform;

#[cfg(unix)]
impl Platform for UnixPlatform {
    fn chown(&self, path: &Path, uid: i64, gid: i64) -> io::Result<()> {
        use std::os::unix::ffi::OsStrExt;

        let path_c = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains null byte"))?;

        let ret = unsafe { libc::chown(path_c.as_ptr(), uid as libc::uid_t, gid as libc::gid_t) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn symlink(&self, target: &Path, link: &Path, _target_is_dir: bool) -> io::Result<()> {
        std::os::unix::fs::symlink(target, link)
    }

    fn link(&self, original: &Path, link: &Path) -> io::Result<()> {
        std::fs::hard_link(original, link)
    }

    fn utime(&self, path: &Path, atime: i64, mtime: i64) -> io::Result<()> {
        use std::os::unix::ffi::OsStrExt;

        let path_c = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains null byte"))?;

        let times = libc::utimbuf {
            actime: atime as libc::time_t,
            modtime: mtime as libc::time_t,
        };

        let ret = unsafe { libc::utime(path_c.as_ptr(), &times) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn symlink_attr(&self, path: &Path) -> io::Result<FileAttrs> {
        use std::os::unix::fs::MetadataExt;

        let meta = std::fs::symlink_metadata(path)?;
        Ok(FileAttrs {
            size: Some(meta.len()),
            uid: Some(meta.uid()),
            gid: Some(meta.gid()),
            // lstat mode already carries S_IFLNK in the high bits
            permissions: Some(meta.mode()),
            atime: Some(meta.atime() as u32),
            mtime: Some(meta.mtime() as u32),
        })
    }
}

#[cfg(not(unix))]
impl Platform for UnixPlatform {
    fn chown(&self, _path: &Path, _uid: i64, _gid: i64) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "chown not supported on this platform",
        ))
    }

    fn symlink(&self, target: &Path, link: &Path, target_is_dir: bool) -> io::Result<()> {
        #[cfg(windows)]
        {
            if target_is_dir {
                return std::os::windows::fs::symlink_dir(target, link);
            }
            return std::os::windows::fs::symlink_file(target, link);
        }
        #[cfg(not(windows))]
        {
            let _ = (target, link, target_is_dir);
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "symlink not supported on this platform",
            ))
        }
    }

    fn link(&self, original: &Path, link: &Path) -> io::Result<()> {
        std::fs::hard_link(original, link)
    }

    fn utime(&self, _path: &Path, _atime: i64, _mtime: i64) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "utime not supported on this platform",
        ))
    }

    fn symlink_attr(&self, path: &Path) -> io::Result<FileAttrs> {
        let meta = std::fs::symlink_metadata(path)?;
        Ok(FileAttrs {
            size: Some(meta.len()),
            uid: None,
            gid: None,
            permissions: Some(crate::protocol::S_IFLNK | 0o777),
            atime: None,
            mtime: None,
        })
    }
}
