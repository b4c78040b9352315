//! Frame encoding and incremental decoding.
//!
//! Encoding always produces one complete frame per call. Decoding is
//! push-based: bytes read from the socket are appended to a `FrameBuffer`,
//! which yields complete messages and keeps any trailing partial frame for
//! the next read. This lets the blocking client and the async daemon share
//! one codec.

use super::{ProtocolError, MAX_STRING_LEN};

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

/// One-byte frame tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Handshake = 0x01,
    StartCapture = 0x02,
    StopCapture = 0x03,
    ConfigureResolution = 0x04,
    SimulateEvent = 0x05,
    InputEvent = 0x06,
    Error = 0x07,
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x01 => Ok(Self::Handshake),
            0x02 => Ok(Self::StartCapture),
            0x03 => Ok(Self::StopCapture),
            0x04 => Ok(Self::ConfigureResolution),
            0x05 => Ok(Self::SimulateEvent),
            0x06 => Ok(Self::InputEvent),
            0x07 => Ok(Self::Error),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A captured kernel input event as forwarded to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    /// Linux event type (`EV_KEY`, `EV_REL`, ...).
    pub event_type: u8,
    pub code: i32,
    pub value: i32,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

/// Every frame that can appear on the wire, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake { version: i32 },
    StartCapture { mouse: bool, keyboard: bool },
    StopCapture,
    ConfigureResolution { width: i32, height: i32 },
    SimulateEvent { event_type: u16, code: u16, value: i32 },
    InputEvent(InputEvent),
    Error { message: String },
}

impl Message {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Handshake { .. } => Opcode::Handshake,
            Self::StartCapture { .. } => Opcode::StartCapture,
            Self::StopCapture => Opcode::StopCapture,
            Self::ConfigureResolution { .. } => Opcode::ConfigureResolution,
            Self::SimulateEvent { .. } => Opcode::SimulateEvent,
            Self::InputEvent(_) => Opcode::InputEvent,
            Self::Error { .. } => Opcode::Error,
        }
    }

    /// Builds an `Error` frame.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Appends the encoded frame to `out`.
    ///
    /// `Error` messages longer than `MAX_STRING_LEN` bytes are truncated at a
    /// character boundary so the peer never rejects them.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.opcode() as u8);
        match self {
            Self::Handshake { version } => out.extend_from_slice(&version.to_le_bytes()),
            Self::StartCapture { mouse, keyboard } => {
                out.push(u8::from(*mouse));
                out.push(u8::from(*keyboard));
            }
            Self::StopCapture => {}
            Self::ConfigureResolution { width, height } => {
                out.extend_from_slice(&width.to_le_bytes());
                out.extend_from_slice(&height.to_le_bytes());
            }
            Self::SimulateEvent {
                event_type,
                code,
                value,
            } => {
                out.extend_from_slice(&event_type.to_le_bytes());
                out.extend_from_slice(&code.to_le_bytes());
                out.extend_from_slice(&value.to_le_bytes());
            }
            Self::InputEvent(ev) => {
                out.push(ev.event_type);
                out.extend_from_slice(&ev.code.to_le_bytes());
                out.extend_from_slice(&ev.value.to_le_bytes());
                out.extend_from_slice(&ev.timestamp_ms.to_le_bytes());
            }
            Self::Error { message } => {
                let bytes = truncate_utf8(message, MAX_STRING_LEN).as_bytes();
                write_length_prefix(out, bytes.len());
                out.extend_from_slice(bytes);
            }
        }
    }

    /// Encodes the message as one standalone frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        self.encode_into(&mut out);
        out
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` holds only part of a frame, otherwise the
    /// message and the number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>, ProtocolError> {
        let mut r = Reader { buf, pos: 0 };
        let Some(tag) = r.u8() else {
            return Ok(None);
        };
        let opcode = Opcode::try_from(tag)?;

        let message = match opcode {
            Opcode::Handshake => r.i32().map(|version| Message::Handshake { version }),
            Opcode::StartCapture => match (r.u8(), r.u8()) {
                (Some(m), Some(k)) => Some(Message::StartCapture {
                    mouse: m != 0,
                    keyboard: k != 0,
                }),
                _ => None,
            },
            Opcode::StopCapture => Some(Message::StopCapture),
            Opcode::ConfigureResolution => match (r.i32(), r.i32()) {
                (Some(width), Some(height)) => {
                    Some(Message::ConfigureResolution { width, height })
                }
                _ => None,
            },
            Opcode::SimulateEvent => match (r.u16(), r.u16(), r.i32()) {
                (Some(event_type), Some(code), Some(value)) => Some(Message::SimulateEvent {
                    event_type,
                    code,
                    value,
                }),
                _ => None,
            },
            Opcode::InputEvent => match (r.u8(), r.i32(), r.i32(), r.i64()) {
                (Some(event_type), Some(code), Some(value), Some(timestamp_ms)) => {
                    Some(Message::InputEvent(InputEvent {
                        event_type,
                        code,
                        value,
                        timestamp_ms,
                    }))
                }
                _ => None,
            },
            Opcode::Error => r.string()?.map(|message| Message::Error { message }),
        };

        Ok(message.map(|m| (m, r.pos)))
    }
}

// ---------------------------------------------------------------------------
// Incremental decoder
// ---------------------------------------------------------------------------

/// Accumulates raw socket bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pops the next complete message, if one is buffered.
    ///
    /// A decode error leaves the buffer untouched; the stream is unusable
    /// after that because there is no delimiter to resynchronise on.
    pub fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        match Message::decode(&self.buf)? {
            Some((message, used)) => {
                self.buf.drain(..used);
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// Number of buffered bytes not yet consumed by a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

// ---------------------------------------------------------------------------
// Primitive helpers
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N).and_then(|s| s.try_into().ok())
    }

    fn u8(&mut self) -> Option<u8> {
        self.array::<1>().map(|[b]| b)
    }

    fn u16(&mut self) -> Option<u16> {
        self.array().map(u16::from_le_bytes)
    }

    fn i32(&mut self) -> Option<i32> {
        self.array().map(i32::from_le_bytes)
    }

    fn i64(&mut self) -> Option<i64> {
        self.array().map(i64::from_le_bytes)
    }

    /// 7-bit encoded length followed by UTF-8 bytes.
    fn string(&mut self) -> Result<Option<String>, ProtocolError> {
        let mut len: usize = 0;
        let mut shift = 0;
        loop {
            let Some(byte) = self.u8() else {
                return Ok(None);
            };
            if shift >= 35 {
                return Err(ProtocolError::BadLengthPrefix);
            }
            len |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }

        if len > MAX_STRING_LEN {
            return Err(ProtocolError::StringTooLong(len));
        }
        let Some(bytes) = self.take(len) else {
            return Ok(None);
        };
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }
}

fn write_length_prefix(out: &mut Vec<u8>, mut len: usize) {
    while len >= 0x80 {
        out.push((len as u8 & 0x7f) | 0x80);
        len >>= 7;
    }
    out.push(len as u8);
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_layout_is_opcode_then_le_version() {
        let bytes = Message::Handshake { version: 1 }.to_bytes();
        assert_eq!(bytes, vec![0x01, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn simulate_event_layout() {
        let bytes = Message::SimulateEvent {
            event_type: 1,
            code: 30,
            value: -1,
        }
        .to_bytes();
        assert_eq!(
            bytes,
            vec![0x05, 0x01, 0x00, 0x1e, 0x00, 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn input_event_is_22_bytes() {
        let bytes = Message::InputEvent(InputEvent {
            event_type: 2,
            code: 0,
            value: 5,
            timestamp_ms: 1_700_000_000_000,
        })
        .to_bytes();
        assert_eq!(bytes.len(), 1 + 1 + 4 + 4 + 8);
        assert_eq!(bytes[0], Opcode::InputEvent as u8);
    }

    #[test]
    fn stop_capture_has_no_payload() {
        assert_eq!(Message::StopCapture.to_bytes(), vec![0x03]);
        assert_eq!(
            Message::decode(&[0x03]).unwrap(),
            Some((Message::StopCapture, 1))
        );
    }

    #[test]
    fn error_uses_seven_bit_length_prefix() {
        let long = "x".repeat(200);
        let bytes = Message::error(long.clone()).to_bytes();
        // 200 = 0b1_1001000 -> [0xc8, 0x01]
        assert_eq!(&bytes[..3], &[0x07, 0xc8, 0x01]);
        assert_eq!(bytes.len(), 3 + 200);

        let (decoded, used) = Message::decode(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, Message::Error { message: long });
    }

    #[test]
    fn oversized_error_is_truncated_on_encode() {
        let bytes = Message::error("é".repeat(MAX_STRING_LEN)).to_bytes();
        let (decoded, _) = Message::decode(&bytes).unwrap().unwrap();
        let Message::Error { message } = decoded else {
            panic!("expected error frame");
        };
        assert!(message.len() <= MAX_STRING_LEN);
        assert!(message.chars().all(|c| c == 'é'));
    }

    #[test]
    fn partial_frame_needs_more_bytes() {
        let bytes = Message::ConfigureResolution {
            width: 1920,
            height: 1080,
        }
        .to_bytes();
        for cut in 0..bytes.len() {
            assert_eq!(Message::decode(&bytes[..cut]).unwrap(), None, "cut={cut}");
        }
    }

    #[test]
    fn partial_error_string_needs_more_bytes() {
        let bytes = Message::error("denied").to_bytes();
        assert_eq!(Message::decode(&bytes[..4]).unwrap(), None);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert_eq!(
            Message::decode(&[0x42, 0, 0]),
            Err(ProtocolError::UnknownOpcode(0x42))
        );
    }

    #[test]
    fn nonzero_bool_decodes_true() {
        let (msg, _) = Message::decode(&[0x02, 0x07, 0x00]).unwrap().unwrap();
        assert_eq!(
            msg,
            Message::StartCapture {
                mouse: true,
                keyboard: false
            }
        );
    }

    #[test]
    fn string_length_over_limit_is_rejected() {
        // 5000 = [0x88, 0x27]
        let err = Message::decode(&[0x07, 0x88, 0x27]).unwrap_err();
        assert_eq!(err, ProtocolError::StringTooLong(5000));
    }

    #[test]
    fn runaway_length_prefix_is_rejected() {
        let err = Message::decode(&[0x07, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01]).unwrap_err();
        assert_eq!(err, ProtocolError::BadLengthPrefix);
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let err = Message::decode(&[0x07, 0x02, 0xc3, 0x28]).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidUtf8);
    }

    #[test]
    fn frame_buffer_splits_coalesced_frames() {
        let mut wire = Message::Handshake { version: 1 }.to_bytes();
        Message::StartCapture {
            mouse: true,
            keyboard: true,
        }
        .encode_into(&mut wire);
        Message::StopCapture.encode_into(&mut wire);

        let mut fb = FrameBuffer::new();
        // Feed in two uneven chunks.
        fb.extend(&wire[..3]);
        assert_eq!(fb.next_message().unwrap(), None);
        fb.extend(&wire[3..]);

        assert_eq!(
            fb.next_message().unwrap(),
            Some(Message::Handshake { version: 1 })
        );
        assert_eq!(
            fb.next_message().unwrap(),
            Some(Message::StartCapture {
                mouse: true,
                keyboard: true
            })
        );
        assert_eq!(fb.next_message().unwrap(), Some(Message::StopCapture));
        assert_eq!(fb.next_message().unwrap(), None);
        assert_eq!(fb.pending(), 0);
    }
}
