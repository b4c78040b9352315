//! Linux platform backend.
//!
//! Capture: direct evdev (/dev/input/event*) via `EvdevCapture`.
//! Injection: a uinput virtual device via `UinputDevice`.
//!
//! Both need root (or equivalent device ACLs); the daemon is the only
//! process that constructs them.

mod evdev;
mod uinput;

pub use self::evdev::EvdevCapture;
pub use self::uinput::UinputDevice;

use std::sync::Arc;

use crate::platform::{CaptureFactory, CaptureSource, DeviceSink, PlatformError};

/// Name of the uinput device; capture skips devices with this name.
pub const VIRTUAL_DEVICE_NAME: &str = "inputbridge virtual input";

// ---------------------------------------------------------------------------
// Factory: device sink
// ---------------------------------------------------------------------------

/// Returns the process-wide injection device.
pub fn create_device_sink(default_width: i32, default_height: i32) -> Arc<dyn DeviceSink> {
    Arc::new(UinputDevice::new(default_width, default_height))
}

// ---------------------------------------------------------------------------
// Factory: input capture
// ---------------------------------------------------------------------------

/// Returns a factory producing one evdev capture per session.
pub fn create_capture_factory() -> Arc<dyn CaptureFactory> {
    Arc::new(|| -> Result<Box<dyn CaptureSource>, PlatformError> {
        Ok(Box::new(EvdevCapture::new()))
    })
}
