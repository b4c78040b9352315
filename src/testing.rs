//! Fake collaborators shared by the daemon unit tests.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::net::UnixStream;

use crate::daemon::audit::{AuditSink, RejectReason};
use crate::daemon::identity::{IdentityProvider, PeerCredentials};
use crate::daemon::policy::{PolicyClient, PolicyError};
use crate::daemon::ConnectionIdentity;
use crate::platform::{
    CaptureFactory, CaptureFilter, CaptureSource, DeviceSink, EventCallback, PlatformError,
    RawInputEvent,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    ConnectionAttempt {
        uid: u32,
        pid: i32,
        executable: Option<PathBuf>,
    },
    Violation {
        uid: Option<u32>,
        pid: Option<i32>,
        reason: RejectReason,
    },
    RateLimited {
        uid: u32,
        pid: i32,
    },
    Disconnect {
        uid: u32,
        pid: i32,
    },
    CaptureStart {
        uid: u32,
        pid: i32,
        mouse: bool,
        keyboard: bool,
    },
    CaptureStop {
        uid: u32,
        pid: i32,
    },
}

#[derive(Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        lock(&self.events).clone()
    }

    pub fn has_violation(&self, reason: RejectReason) -> bool {
        lock(&self.events)
            .iter()
            .any(|e| matches!(e, AuditEvent::Violation { reason: r, .. } if *r == reason))
    }

    pub fn count(&self, pred: impl Fn(&AuditEvent) -> bool) -> usize {
        lock(&self.events).iter().filter(|e| pred(e)).count()
    }

    fn push(&self, event: AuditEvent) {
        lock(&self.events).push(event);
    }
}

impl AuditSink for RecordingAuditSink {
    fn log_connection_attempt(&self, uid: u32, pid: i32, executable: Option<&Path>) {
        self.push(AuditEvent::ConnectionAttempt {
            uid,
            pid,
            executable: executable.map(Path::to_path_buf),
        });
    }

    fn log_security_violation(
        &self,
        uid: Option<u32>,
        pid: Option<i32>,
        reason: RejectReason,
        _detail: &str,
    ) {
        self.push(AuditEvent::Violation { uid, pid, reason });
    }

    fn log_rate_limited(&self, uid: u32, pid: i32) {
        self.push(AuditEvent::RateLimited { uid, pid });
    }

    fn log_disconnect(&self, identity: &ConnectionIdentity, _duration: Duration) {
        self.push(AuditEvent::Disconnect {
            uid: identity.uid,
            pid: identity.pid,
        });
    }

    fn log_capture_start(&self, identity: &ConnectionIdentity, mouse: bool, keyboard: bool) {
        self.push(AuditEvent::CaptureStart {
            uid: identity.uid,
            pid: identity.pid,
            mouse,
            keyboard,
        });
    }

    fn log_capture_stop(&self, identity: &ConnectionIdentity) {
        self.push(AuditEvent::CaptureStop {
            uid: identity.uid,
            pid: identity.pid,
        });
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Answers every lookup from fixed fields, ignoring the socket.
pub struct StaticIdentity {
    pub creds: Option<PeerCredentials>,
    pub executable: Option<PathBuf>,
    pub in_group: Result<bool, String>,
}

impl StaticIdentity {
    pub fn user(uid: u32, pid: i32) -> Self {
        Self {
            creds: Some(PeerCredentials {
                uid,
                gid: uid,
                pid: Some(pid),
            }),
            executable: Some(PathBuf::from("/usr/bin/inputbridge-ui")),
            in_group: Ok(true),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            creds: None,
            ..Self::user(1000, 1)
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn credentials(&self, _stream: &UnixStream) -> io::Result<PeerCredentials> {
        self.creds
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no peer credentials"))
    }

    fn process_executable(&self, _pid: i32) -> io::Result<PathBuf> {
        self.executable
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "process gone"))
    }

    fn is_user_in_group(&self, _uid: u32, _group: &str) -> io::Result<bool> {
        self.in_group.clone().map_err(io::Error::other)
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub enum PolicyBehavior {
    Allow,
    Deny,
    Fail,
    Panic,
    Hang,
}

pub struct ScriptedPolicy {
    behavior: PolicyBehavior,
    calls: AtomicUsize,
}

impl ScriptedPolicy {
    pub fn new(behavior: PolicyBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PolicyClient for ScriptedPolicy {
    fn is_authorized(&self, _uid: u32, _pid: i32) -> BoxFuture<'_, Result<bool, PolicyError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior;
        async move {
            match behavior {
                PolicyBehavior::Allow => Ok(true),
                PolicyBehavior::Deny => Ok(false),
                PolicyBehavior::Fail => Err(PolicyError::Service("bus unavailable".into())),
                PolicyBehavior::Panic => panic!("policy client exploded"),
                PolicyBehavior::Hang => futures::future::pending().await,
            }
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCall {
    Configure(i32, i32),
    Send(u16, u16, i32),
    Reset,
}

#[derive(Default)]
pub struct RecordingDevice {
    calls: Mutex<Vec<DeviceCall>>,
}

impl RecordingDevice {
    pub fn calls(&self) -> Vec<DeviceCall> {
        lock(&self.calls).clone()
    }
}

impl DeviceSink for RecordingDevice {
    fn configure(&self, width: i32, height: i32) -> Result<(), PlatformError> {
        lock(&self.calls).push(DeviceCall::Configure(width, height));
        Ok(())
    }

    fn send_event(&self, event_type: u16, code: u16, value: i32) -> Result<(), PlatformError> {
        lock(&self.calls).push(DeviceCall::Send(event_type, code, value));
        Ok(())
    }

    fn reset(&self) -> Result<(), PlatformError> {
        lock(&self.calls).push(DeviceCall::Reset);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

#[derive(Default)]
struct HubState {
    callback: Option<EventCallback>,
    filter: Option<CaptureFilter>,
    starts: usize,
}

/// Shared state behind every `FakeCapture` a hub's factory creates. Tests
/// push events through `emit` as if a kernel device produced them.
#[derive(Default)]
pub struct CaptureHub {
    state: Mutex<HubState>,
}

impl CaptureHub {
    pub fn factory(self: &Arc<Self>) -> Arc<dyn CaptureFactory> {
        let hub = Arc::clone(self);
        Arc::new(move || -> Result<Box<dyn CaptureSource>, PlatformError> {
            Ok(Box::new(FakeCapture {
                hub: Arc::clone(&hub),
                running: false,
            }))
        })
    }

    /// Delivers `event` to the running capture; false when none is running.
    pub fn emit(&self, event: RawInputEvent) -> bool {
        match &lock(&self.state).callback {
            Some(cb) => {
                cb(event);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).callback.is_some()
    }

    pub fn starts(&self) -> usize {
        lock(&self.state).starts
    }

    pub fn last_filter(&self) -> Option<CaptureFilter> {
        lock(&self.state).filter
    }
}

struct FakeCapture {
    hub: Arc<CaptureHub>,
    running: bool,
}

impl CaptureSource for FakeCapture {
    fn start(&mut self, filter: CaptureFilter, callback: EventCallback) -> Result<(), PlatformError> {
        let mut state = lock(&self.hub.state);
        state.callback = Some(callback);
        state.filter = Some(filter);
        state.starts += 1;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PlatformError> {
        if self.running {
            lock(&self.hub.state).callback = None;
            self.running = false;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

/// Polls `cond` until it holds or one second passes.
pub async fn wait_until(cond: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
