//! Shared SQLite and secure-filesystem helpers.
//!
//! Every store in this crate opens `annotator.db` through [`open_secure_db`]:
//! - Creates the parent directory if it doesn't exist
//! - Tightens directory permissions (Unix: 0o700, owner-only)
//! - Creates the DB file with secure permissions (Unix: 0o600)
//! - Opens the SQLite connection

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{DbContext, StorageError};

fn io_err(op: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> StorageError {
    let path = path.display().to_string();
    move |source| StorageError::Io { op, path, source }
}

pub(crate) fn open_secure_db(path: &Path) -> Result<Connection, StorageError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        ensure_secure_dir(parent)?;
    }
    ensure_secure_db_files(path)?;

    Connection::open(path).db("open database")
}

/// Creates the directory (and parents) if missing, then on Unix tightens
/// permissions to 0o700 if the directory is owned by the current user.
pub(crate) fn ensure_secure_dir(path: &Path) -> Result<(), StorageError> {
    std::fs::create_dir_all(path).map_err(io_err("create directory", path))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};
        let metadata = std::fs::metadata(path).map_err(io_err("read metadata of", path))?;

        let our_uid = unsafe { libc::getuid() };
        if metadata.uid() != our_uid {
            return Ok(());
        }

        let current_mode = metadata.permissions().mode() & 0o777;
        if current_mode & 0o077 != 0 {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
                .map_err(io_err("set permissions on", path))?;
        }
    }
    Ok(())
}

/// If the file doesn't exist, it is created with 0o600 on Unix.
/// Pre-existing files and WAL/SHM sidecars are permission-tightened.
pub(crate) fn ensure_secure_db_files(path: &Path) -> Result<(), StorageError> {
    if !path.exists() {
        let mut options = OpenOptions::new();
        options.create(true).truncate(false).read(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options
            .open(path)
            .map_err(io_err("create database file", path))?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(io_err("set permissions on", path))?;
        for suffix in ["-wal", "-shm"] {
            let sidecar = sqlite_sidecar_path(path, suffix);
            if sidecar.exists() {
                let _ = std::fs::set_permissions(&sidecar, std::fs::Permissions::from_mode(0o600));
            }
        }
    }
    Ok(())
}

fn sqlite_sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let file_name = path.file_name().map(|name| name.to_string_lossy());
    match file_name {
        Some(name) => path.with_file_name(format!("{name}{suffix}")),
        None => PathBuf::from(format!("{}{suffix}", path.display())),
    }
}

/// Current UTC time as RFC 3339 with second precision, e.g. `2025-01-02T03:04:05Z`.
pub(crate) fn utc_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
