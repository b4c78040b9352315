//! Security audit trail.
//!
//! Admission decisions and session lifecycle events are reported through the
//! `AuditSink` trait. The production sink writes one `key=value` record per
//! event to the `audit` log target, so audit lines can be routed separately
//! with `RUST_LOG=audit=info`.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use super::ConnectionIdentity;

/// Why a connection was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    PeerCredFailed,
    RootRejected,
    RateLimited,
    NotInGroup,
    PolkitDenied,
    PolkitError,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerCredFailed => "PEER_CRED_FAILED",
            Self::RootRejected => "ROOT_REJECTED",
            Self::RateLimited => "RATE_LIMITED",
            Self::NotInGroup => "NOT_IN_GROUP",
            Self::PolkitDenied => "POLKIT_DENIED",
            Self::PolkitError => "POLKIT_ERROR",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives structured audit events. Implementations must not block.
pub trait AuditSink: Send + Sync {
    /// A connection passed every admission check.
    fn log_connection_attempt(&self, uid: u32, pid: i32, executable: Option<&Path>);

    /// A connection was refused by an identity or policy check. `uid`/`pid`
    /// are absent when the peer could not be identified.
    fn log_security_violation(
        &self,
        uid: Option<u32>,
        pid: Option<i32>,
        reason: RejectReason,
        detail: &str,
    );

    fn log_rate_limited(&self, uid: u32, pid: i32);

    fn log_disconnect(&self, identity: &ConnectionIdentity, duration: Duration);

    fn log_capture_start(&self, identity: &ConnectionIdentity, mouse: bool, keyboard: bool);

    fn log_capture_stop(&self, identity: &ConnectionIdentity);
}

/// Writes audit records through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

const TARGET: &str = "audit";

impl AuditSink for LogAuditSink {
    fn log_connection_attempt(&self, uid: u32, pid: i32, executable: Option<&Path>) {
        let exe = executable.map_or_else(|| "unknown".into(), |p| p.display().to_string());
        log::info!(target: TARGET, "event=connect result=ok uid={uid} pid={pid} exe={exe:?}");
    }

    fn log_security_violation(
        &self,
        uid: Option<u32>,
        pid: Option<i32>,
        reason: RejectReason,
        detail: &str,
    ) {
        log::warn!(
            target: TARGET,
            "event=connect result=rejected reason={reason} uid={} pid={} detail={detail:?}",
            opt(uid),
            opt(pid)
        );
    }

    fn log_rate_limited(&self, uid: u32, pid: i32) {
        log::warn!(
            target: TARGET,
            "event=connect result=rejected reason={} uid={uid} pid={pid}",
            RejectReason::RateLimited
        );
    }

    fn log_disconnect(&self, identity: &ConnectionIdentity, duration: Duration) {
        log::info!(
            target: TARGET,
            "event=disconnect uid={} pid={} duration_ms={}",
            identity.uid,
            identity.pid,
            duration.as_millis()
        );
    }

    fn log_capture_start(&self, identity: &ConnectionIdentity, mouse: bool, keyboard: bool) {
        log::info!(
            target: TARGET,
            "event=capture_start uid={} pid={} mouse={mouse} keyboard={keyboard}",
            identity.uid,
            identity.pid
        );
    }

    fn log_capture_stop(&self, identity: &ConnectionIdentity) {
        log::info!(
            target: TARGET,
            "event=capture_stop uid={} pid={}",
            identity.uid,
            identity.pid
        );
    }
}

fn opt<T: fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".into(), |v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_tags_are_distinct() {
        let all = [
            RejectReason::PeerCredFailed,
            RejectReason::RootRejected,
            RejectReason::RateLimited,
            RejectReason::NotInGroup,
            RejectReason::PolkitDenied,
            RejectReason::PolkitError,
        ];
        let tags: std::collections::HashSet<_> = all.iter().map(|r| r.as_str()).collect();
        assert_eq!(tags.len(), all.len());
        assert_eq!(RejectReason::RootRejected.to_string(), "ROOT_REJECTED");
    }

    #[test]
    fn missing_ids_render_as_dash() {
        assert_eq!(opt::<u32>(None), "-");
        assert_eq!(opt(Some(1000u32)), "1000");
    }
}
