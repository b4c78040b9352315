//! evdev capture backend.

mod capture;

pub use capture::EvdevCapture;
