//! Wire protocol shared by the client transport and the daemon.
//!
//! Every frame starts with a one-byte opcode followed by a fixed-layout
//! payload. There is no outer length prefix; the only variable-length field
//! is the `Error` message string. Readers must decode the opcode before they
//! can know how many payload bytes follow.
//!
//! | opcode | message               | payload                                   |
//! |--------|-----------------------|-------------------------------------------|
//! | `0x01` | `Handshake`           | i32 version                               |
//! | `0x02` | `StartCapture`        | bool mouse, bool keyboard                 |
//! | `0x03` | `StopCapture`         | (none)                                    |
//! | `0x04` | `ConfigureResolution` | i32 width, i32 height                     |
//! | `0x05` | `SimulateEvent`       | u16 type, u16 code, i32 value             |
//! | `0x06` | `InputEvent`          | u8 type, i32 code, i32 value, i64 time_ms |
//! | `0x07` | `Error`               | 7-bit length prefix + UTF-8 bytes         |
//!
//! Integers are little-endian.

mod codec;

pub use codec::{FrameBuffer, InputEvent, Message, Opcode};

use thiserror::Error;

/// Protocol version exchanged in the handshake. Compared exactly.
pub const PROTOCOL_VERSION: i32 = 1;

/// Upper bound on the encoded byte length of an `Error` message.
pub const MAX_STRING_LEN: usize = 4096;

/// Errors raised while decoding frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("string length {0} exceeds limit of {MAX_STRING_LEN} bytes")]
    StringTooLong(usize),

    #[error("malformed string length prefix")]
    BadLengthPrefix,

    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,
}
