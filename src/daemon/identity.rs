//! Peer identity lookups.
//!
//! `SystemIdentityProvider` reads `SO_PEERCRED` from the accepted socket,
//! resolves `/proc/<pid>/exe` for audit context and checks group membership
//! through the system group database (primary group plus supplementary
//! groups).

use std::ffi::CString;
use std::io;
use std::path::PathBuf;

use nix::unistd::{getgrouplist, Group, Uid, User};
use tokio::net::UnixStream;

/// Credentials of the process on the other end of a Unix socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: Option<i32>,
}

pub trait IdentityProvider: Send + Sync {
    fn credentials(&self, stream: &UnixStream) -> io::Result<PeerCredentials>;

    fn process_executable(&self, pid: i32) -> io::Result<PathBuf>;

    fn is_user_in_group(&self, uid: u32, group: &str) -> io::Result<bool>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemIdentityProvider;

impl IdentityProvider for SystemIdentityProvider {
    fn credentials(&self, stream: &UnixStream) -> io::Result<PeerCredentials> {
        let cred = stream.peer_cred()?;
        Ok(PeerCredentials {
            uid: cred.uid(),
            gid: cred.gid(),
            pid: cred.pid(),
        })
    }

    fn process_executable(&self, pid: i32) -> io::Result<PathBuf> {
        std::fs::read_link(format!("/proc/{pid}/exe"))
    }

    fn is_user_in_group(&self, uid: u32, group: &str) -> io::Result<bool> {
        let Some(group) = Group::from_name(group)? else {
            log::warn!("identity: access group {group:?} does not exist");
            return Ok(false);
        };
        let Some(user) = User::from_uid(Uid::from_raw(uid))? else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("uid {uid} has no passwd entry"),
            ));
        };
        if user.gid == group.gid {
            return Ok(true);
        }
        let name = CString::new(user.name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let groups = getgrouplist(&name, user.gid)?;
        Ok(groups.contains(&group.gid))
    }
}
