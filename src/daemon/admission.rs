//! Connection admission.
//!
//! Every accepted socket passes through `AdmissionPipeline::admit` before a
//! session handler reads a single byte from it. Checks run in a fixed order
//! and the first failure decides:
//!
//! 1. peer credentials unavailable      -> `PEER_CRED_FAILED`
//! 2. peer is root                      -> `ROOT_REJECTED`, socket force-closed
//! 3. uid over its connection budget    -> rate limited
//! 4. uid not in the access group       -> `NOT_IN_GROUP`
//! 5. policy service (cached per uid)   -> `POLKIT_DENIED`, or `POLKIT_ERROR`
//!    with the socket force-closed when no decision could be obtained
//!
//! Any failure inside a check is a rejection. This is the only place where a
//! `ConnectionIdentity` is created.

use std::os::fd::AsRawFd;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use nix::sys::socket::{shutdown, Shutdown};
use tokio::net::UnixStream;

use super::audit::{AuditSink, RejectReason};
use super::auth_cache::AuthorizationCache;
use super::identity::IdentityProvider;
use super::policy::PolicyClient;
use super::rate_limit::RateLimiter;
use super::ConnectionIdentity;

pub struct AdmissionPipeline {
    identity: Arc<dyn IdentityProvider>,
    policy: Arc<dyn PolicyClient>,
    rate_limiter: Arc<RateLimiter>,
    auth_cache: Arc<AuthorizationCache>,
    audit: Arc<dyn AuditSink>,
    group: String,
    policy_timeout: Duration,
}

impl AdmissionPipeline {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        policy: Arc<dyn PolicyClient>,
        rate_limiter: Arc<RateLimiter>,
        auth_cache: Arc<AuthorizationCache>,
        audit: Arc<dyn AuditSink>,
        group: impl Into<String>,
        policy_timeout: Duration,
    ) -> Self {
        Self {
            identity,
            policy,
            rate_limiter,
            auth_cache,
            audit,
            group: group.into(),
            policy_timeout,
        }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Decides whether `stream` may talk to the daemon.
    pub async fn admit(&self, stream: &UnixStream) -> Result<ConnectionIdentity, RejectReason> {
        // 1. Peer identity.
        let creds = match self.identity.credentials(stream) {
            Ok(c) => c,
            Err(e) => {
                return Err(self.violation(None, None, RejectReason::PeerCredFailed, &e.to_string()));
            }
        };
        let uid = creds.uid;
        let Some(pid) = creds.pid.filter(|p| *p > 0) else {
            return Err(self.violation(
                Some(uid),
                None,
                RejectReason::PeerCredFailed,
                "peer pid unavailable",
            ));
        };

        // 2. Never serve root, whatever the other checks would say.
        if uid == 0 {
            let reason = self.violation(Some(uid), Some(pid), RejectReason::RootRejected, "root peer");
            force_close(stream);
            return Err(reason);
        }

        // 3. Rate limit.
        if self.rate_limiter.is_rate_limited(uid) {
            self.audit.log_rate_limited(uid, pid);
            return Err(RejectReason::RateLimited);
        }

        // 4. Group gate. NSS lookups may block, so they run off the runtime.
        match self.group_membership(uid).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(self.violation(
                    Some(uid),
                    Some(pid),
                    RejectReason::NotInGroup,
                    &format!("not a member of {}", self.group),
                ));
            }
            Err(e) => {
                return Err(self.violation(
                    Some(uid),
                    Some(pid),
                    RejectReason::NotInGroup,
                    &format!("group lookup failed: {e}"),
                ));
            }
        }

        // 5. Policy service.
        match self.authorize(uid, pid).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(self.violation(
                    Some(uid),
                    Some(pid),
                    RejectReason::PolkitDenied,
                    "policy denied",
                ));
            }
            Err(detail) => {
                let reason = self.violation(Some(uid), Some(pid), RejectReason::PolkitError, &detail);
                force_close(stream);
                return Err(reason);
            }
        }

        // 6. Admitted.
        self.rate_limiter.record_success(uid);
        let executable = match self.identity.process_executable(pid) {
            Ok(path) => Some(path),
            Err(e) => {
                log::debug!("admission: could not resolve executable of pid {pid}: {e}");
                None
            }
        };
        self.audit
            .log_connection_attempt(uid, pid, executable.as_deref());
        Ok(ConnectionIdentity { uid, pid })
    }

    async fn group_membership(&self, uid: u32) -> Result<bool, String> {
        let identity = Arc::clone(&self.identity);
        let group = self.group.clone();
        match tokio::task::spawn_blocking(move || identity.is_user_in_group(uid, &group)).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(e) => Err(format!("lookup task failed: {e}")),
        }
    }

    /// Cached policy decision, or a fresh one bounded by `policy_timeout`.
    /// Any failure of the policy call (error, panic, timeout) is `Err`.
    async fn authorize(&self, uid: u32, pid: i32) -> Result<bool, String> {
        if let Some(cached) = self.auth_cache.get(uid) {
            log::debug!("admission: cached policy decision for uid {uid}: {cached}");
            return Ok(cached);
        }

        let call = AssertUnwindSafe(self.policy.is_authorized(uid, pid)).catch_unwind();
        let decision = match tokio::time::timeout(self.policy_timeout, call).await {
            Ok(Ok(Ok(granted))) => granted,
            Ok(Ok(Err(e))) => return Err(e.to_string()),
            Ok(Err(_panic)) => return Err("policy client panicked".into()),
            Err(_elapsed) => {
                return Err(format!("policy check timed out after {:?}", self.policy_timeout))
            }
        };
        self.auth_cache.insert(uid, decision);
        Ok(decision)
    }

    fn violation(
        &self,
        uid: Option<u32>,
        pid: Option<i32>,
        reason: RejectReason,
        detail: &str,
    ) -> RejectReason {
        self.audit.log_security_violation(uid, pid, reason, detail);
        reason
    }
}

/// Shuts the socket down in both directions immediately.
fn force_close(stream: &UnixStream) {
    if let Err(e) = shutdown(stream.as_raw_fd(), Shutdown::Both) {
        log::warn!("admission: failed to force-close socket: {e}");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
