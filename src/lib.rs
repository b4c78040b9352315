//! inputbridge -- privileged input capture and injection over a Unix socket.
//!
//! The unprivileged side uses [`client::InputClient`]; the privileged side
//! is [`daemon::Daemon`], run by the `inputbridged` binary. Both speak the
//! binary protocol in [`protocol`].

#[cfg(unix)]
pub mod client;
pub mod clock;
pub mod config;
#[cfg(target_os = "linux")]
pub mod daemon;
pub mod platform;
pub mod protocol;

#[cfg(all(test, target_os = "linux"))]
mod testing;
