//! System policy service client.
//!
//! `PkcheckPolicyClient` asks polkit whether a process may perform the
//! configured action by running `pkcheck`. The daemon never lets the policy
//! service prompt: a decision that would need user interaction counts as a
//! denial.
//!
//! The subject is passed as `pid,start-time,uid` so a pid recycled between
//! the credential check and the policy query is not mistaken for the peer.

use std::ffi::OsString;
use std::io;

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("could not run policy check: {0}")]
    Io(#[from] io::Error),

    #[error("policy service error: {0}")]
    Service(String),
}

/// Authorizes a `(uid, pid)` pair for the daemon's privileged action.
pub trait PolicyClient: Send + Sync {
    /// `Ok(false)` is an explicit denial; `Err` means no decision was made.
    fn is_authorized(&self, uid: u32, pid: i32) -> BoxFuture<'_, Result<bool, PolicyError>>;
}

/// polkit client backed by the `pkcheck` binary.
#[derive(Debug, Clone)]
pub struct PkcheckPolicyClient {
    program: OsString,
    action_id: String,
}

impl PkcheckPolicyClient {
    pub fn new(action_id: impl Into<String>) -> Self {
        Self {
            program: "pkcheck".into(),
            action_id: action_id.into(),
        }
    }

    /// Overrides the binary that is executed.
    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }
}

impl PolicyClient for PkcheckPolicyClient {
    fn is_authorized(&self, uid: u32, pid: i32) -> BoxFuture<'_, Result<bool, PolicyError>> {
        async move {
            let subject = process_subject(pid, uid)?;
            let output = Command::new(&self.program)
                .arg("--action-id")
                .arg(&self.action_id)
                .arg("--process")
                .arg(&subject)
                .kill_on_drop(true)
                .output()
                .await?;

            let decision = interpret_exit(output.status.code());
            match &decision {
                Ok(granted) => log::debug!(
                    "policy: {} uid={uid} pid={pid} -> {}",
                    self.action_id,
                    if *granted { "authorized" } else { "denied" }
                ),
                Err(_) => log::warn!(
                    "policy: pkcheck failed for uid={uid} pid={pid}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }
            decision
        }
        .boxed()
    }
}

/// Builds the `pid,start-time,uid` subject from `/proc/<pid>/stat`.
fn process_subject(pid: i32, uid: u32) -> io::Result<String> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat"))?;
    let start_time = parse_start_time(&stat).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed /proc/{pid}/stat"),
        )
    })?;
    Ok(format!("{pid},{start_time},{uid}"))
}

/// Field 22 (`starttime`) of a `/proc/<pid>/stat` line. The command name in
/// field 2 may contain spaces and parentheses, so counting starts after the
/// last `)`.
fn parse_start_time(stat: &str) -> Option<u64> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(19)?.parse().ok()
}

/// pkcheck exits 0 when authorized, 1 when not, 2 when authentication would
/// be required and 3 when the dialog was dismissed. Anything else is an error.
fn interpret_exit(code: Option<i32>) -> Result<bool, PolicyError> {
    match code {
        Some(0) => Ok(true),
        Some(1..=3) => Ok(false),
        Some(other) => Err(PolicyError::Service(format!("pkcheck exited with {other}"))),
        None => Err(PolicyError::Service("pkcheck terminated by signal".into())),
    }
}
