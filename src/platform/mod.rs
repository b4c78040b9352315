//! Platform abstraction layer.
//!
//! Defines the `DeviceSink` (synthetic input injection) and `CaptureSource`
//! (kernel event capture) traits consumed by the daemon session handler.
//! The Linux implementations live in child modules.

#[cfg(target_os = "linux")]
pub mod linux;

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A kernel input event as read from a capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawInputEvent {
    pub event_type: u16,
    pub code: u16,
    pub value: i32,
    pub timestamp: SystemTime,
}

impl RawInputEvent {
    /// Milliseconds since the Unix epoch; pre-epoch timestamps clamp to 0.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

/// Which device classes a capture should read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureFilter {
    pub mouse: bool,
    pub keyboard: bool,
}

impl CaptureFilter {
    pub fn is_empty(&self) -> bool {
        !self.mouse && !self.keyboard
    }
}

/// Receives every captured event on the capture thread.
pub type EventCallback = Box<dyn Fn(RawInputEvent) + Send>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PlatformError {
    /// A required device or OS facility is missing.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Virtual input device used to inject synthetic events.
///
/// One instance is owned for the daemon's lifetime and shared by every
/// session. `configure` and `reset` are its only lifecycle transitions.
pub trait DeviceSink: Send + Sync {
    /// (Re)creates the device with an absolute pointer range of
    /// `width` x `height`.
    fn configure(&self, width: i32, height: i32) -> Result<(), PlatformError>;

    /// Emits one raw event verbatim.
    fn send_event(&self, event_type: u16, code: u16, value: i32) -> Result<(), PlatformError>;

    /// Releases the device; safe to call when never configured.
    fn reset(&self) -> Result<(), PlatformError>;
}

/// Reads kernel input events on a background thread.
pub trait CaptureSource: Send {
    /// Begins delivering events matching `filter` to `callback`.
    fn start(&mut self, filter: CaptureFilter, callback: EventCallback) -> Result<(), PlatformError>;

    /// Stops delivery and joins the reader. A no-op when not started.
    fn stop(&mut self) -> Result<(), PlatformError>;

    fn is_running(&self) -> bool;
}

/// Creates one `CaptureSource` per capturing session.
pub trait CaptureFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn CaptureSource>, PlatformError>;
}

impl<F> CaptureFactory for F
where
    F: Fn() -> Result<Box<dyn CaptureSource>, PlatformError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn CaptureSource>, PlatformError> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn timestamp_is_millis_since_epoch() {
        let ev = RawInputEvent {
            event_type: 1,
            code: 30,
            value: 1,
            timestamp: UNIX_EPOCH + Duration::from_millis(1_234_567),
        };
        assert_eq!(ev.timestamp_ms(), 1_234_567);
    }

    #[test]
    fn pre_epoch_timestamp_clamps_to_zero() {
        let ev = RawInputEvent {
            event_type: 1,
            code: 30,
            value: 1,
            timestamp: UNIX_EPOCH - Duration::from_secs(1),
        };
        assert_eq!(ev.timestamp_ms(), 0);
    }

    #[test]
    fn empty_filter() {
        assert!(CaptureFilter::default().is_empty());
        assert!(!CaptureFilter { mouse: true, keyboard: false }.is_empty());
    }
}
