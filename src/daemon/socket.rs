//! Listening socket setup.
//!
//! The daemon binds the primary path and falls back to the secondary one if
//! that fails. A leftover socket file from a previous run is removed first,
//! unless a live daemon still answers on it. After bind the file mode is set
//! and the file is handed to the access group so only group members can
//! connect at the filesystem level. The file is removed again on drop.

use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::unistd::{chown, Group};
use tokio::net::UnixListener;

use super::DaemonError;
use crate::config::SocketConfig;

pub struct BoundSocket {
    listener: UnixListener,
    path: PathBuf,
}

impl BoundSocket {
    /// Binds `config.primary_path`, else `config.fallback_path`. Must be
    /// called from within a tokio runtime.
    pub fn bind(config: &SocketConfig, group: &str) -> Result<Self, DaemonError> {
        match bind_at(&config.primary_path, config.mode, group) {
            Ok(listener) => Ok(Self {
                listener,
                path: config.primary_path.clone(),
            }),
            Err(primary_err) => {
                log::warn!(
                    "socket: cannot bind {}: {primary_err}; trying {}",
                    config.primary_path.display(),
                    config.fallback_path.display()
                );
                let listener = bind_at(&config.fallback_path, config.mode, group).map_err(
                    |source| DaemonError::Bind {
                        path: config.fallback_path.clone(),
                        source,
                    },
                )?;
                Ok(Self {
                    listener,
                    path: config.fallback_path.clone(),
                })
            }
        }
    }

    pub fn listener(&self) -> &UnixListener {
        &self.listener
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BoundSocket {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => log::debug!("socket: removed {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("socket: failed to remove {}: {e}", self.path.display()),
        }
    }
}

fn bind_at(path: &Path, mode: u32, group: &str) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_stale(path)?;

    let listener = UnixListener::bind(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    assign_group(path, group);
    log::info!(
        "socket: listening on {} (mode {mode:o}, group {group})",
        path.display()
    );
    Ok(listener)
}

/// Removes a socket file nobody is listening on. A non-socket file or a live
/// listener is left alone and reported as an error.
fn remove_stale(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !meta.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        ));
    }
    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("another daemon is listening on {}", path.display()),
        ));
    }
    log::info!("socket: removing stale socket {}", path.display());
    fs::remove_file(path)
}

/// Best-effort chgrp to the access group.
fn assign_group(path: &Path, group: &str) {
    match Group::from_name(group) {
        Ok(Some(g)) => {
            if let Err(e) = chown(path, None, Some(g.gid)) {
                log::warn!("socket: chgrp {} to {group} failed: {e}", path.display());
            }
        }
        Ok(None) => log::warn!("socket: group {group:?} not found, socket group unchanged"),
        Err(e) => log::warn!("socket: group lookup for {group:?} failed: {e}"),
    }
}
