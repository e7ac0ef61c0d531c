//! Binary codec for encoding and decoding tunnel frames.
//!
//! Wire format:
//! ```text
//! [command:2][length:2][payload:N]
//! ```
//! Header size: 4 bytes. `length` counts the **whole** frame (header included),
//! so an empty frame carries `length = 4`. All multi-byte integers are
//! big-endian.
//!
//! One USB bulk transfer carries exactly one frame; the codec never has to
//! search for frame boundaries inside a byte stream.
//!
//! # Borrowed payloads
//!
//! [`Message::Data`] borrows its bytes from the transfer buffer instead of
//! copying them.  DATA frames are the hot path (every byte a forwarded TCP
//! connection sends goes through one), so decoding them is a slice operation.

use thiserror::Error;

use crate::protocol::command::Command;

/// Identifier chosen by the device for one forwarded TCP connection.
pub type SessionId = u16;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 4;

/// Header plus the 2-byte session id that prefixes every DATA payload.
pub const DATA_PREFIX_SIZE: usize = HEADER_SIZE + 2;

/// Largest frame the 16-bit length field can describe.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Errors that can occur during frame encoding or decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Fewer bytes than a frame header (or a fixed payload field) needs.
    #[error("frame too short: need at least {needed} bytes, got {available}")]
    TooShort { needed: usize, available: usize },

    /// The header's length field disagrees with the bytes actually delivered.
    #[error("length mismatch: header declares {declared} bytes, transfer has {available}")]
    LengthMismatch { declared: usize, available: usize },

    /// The command tag is not one this codec knows.
    #[error("unknown command tag: {:02X} {:02X}", .0[0], .0[1])]
    UnknownCommand([u8; 2]),

    /// The payload could not be parsed for its command.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The frame would not fit in the 16-bit length field.
    #[error("frame of {size} bytes exceeds the {max}-byte limit", max = MAX_FRAME_SIZE)]
    FrameTooLarge { size: usize },
}

// ── Frame header ──────────────────────────────────────────────────────────────

/// The decoded 4-byte frame header.
///
/// The tag is kept raw so that a header with an unknown command still decodes;
/// resolving it to a [`Command`] is a separate step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub tag: [u8; 2],
    pub length: u16,
}

impl FrameHeader {
    /// Resolves the raw tag to a [`Command`].
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownCommand`] for unrecognised tags.
    pub fn command(&self) -> Result<Command, ProtocolError> {
        Command::from_tag(self.tag).ok_or(ProtocolError::UnknownCommand(self.tag))
    }

    /// Whether the declared total length equals `actual`.
    pub fn matches_len(&self, actual: usize) -> bool {
        self.length as usize == actual
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// A frame payload interpreted according to its command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message<'a> {
    ConnectSocket { session_id: SessionId },
    ConnectionResponse { session_id: SessionId, success: bool },
    DisconnectSocket { session_id: SessionId },
    Data { session_id: SessionId, payload: &'a [u8] },
    /// The device app is running; `port` is its default forwarding port.
    AccessoryConnected { port: u16 },
    CloseAccessory,
}

impl Message<'_> {
    /// Returns the command this message is carried under.
    pub fn command(&self) -> Command {
        match self {
            Message::ConnectSocket { .. } => Command::ConnectSocket,
            Message::ConnectionResponse { .. } => Command::ConnectionResponse,
            Message::DisconnectSocket { .. } => Command::DisconnectSocket,
            Message::Data { .. } => Command::DataPacket,
            Message::AccessoryConnected { .. } => Command::AccessoryConnected,
            Message::CloseAccessory => Command::CloseAccessory,
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Builds a frame from a command and an opaque payload.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if `4 + payload.len()` exceeds
/// 65535.
///
/// # Examples
///
/// ```rust
/// use aoa_core::{encode, Command};
///
/// let frame = encode(Command::CloseAccessory, &[]).unwrap();
/// assert_eq!(frame, vec![0x05, 0x0F, 0x00, 0x04]);
/// ```
pub fn encode(command: Command, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let total = HEADER_SIZE + payload.len();
    let length = frame_length(total)?;

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&command.tag());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Builds a frame whose payload is a single big-endian `u16`.
///
/// # Errors
///
/// Never fails in practice; the signature matches [`encode`].
pub fn encode_u16(command: Command, value: u16) -> Result<Vec<u8>, ProtocolError> {
    encode(command, &value.to_be_bytes())
}

/// Encodes a typed [`Message`] into a complete frame.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if a DATA payload is too big.
pub fn encode_message(msg: &Message<'_>) -> Result<Vec<u8>, ProtocolError> {
    match *msg {
        Message::ConnectSocket { session_id } | Message::DisconnectSocket { session_id } => {
            encode_u16(msg.command(), session_id)
        }
        Message::ConnectionResponse { session_id, success } => {
            let mut payload = [0u8; 4];
            payload[..2].copy_from_slice(&session_id.to_be_bytes());
            payload[2..].copy_from_slice(&u16::from(success).to_be_bytes());
            encode(Command::ConnectionResponse, &payload)
        }
        Message::Data { session_id, payload } => {
            let total = DATA_PREFIX_SIZE + payload.len();
            let mut buf = vec![0u8; total];
            write_data_header(&mut buf, session_id, payload.len())?;
            buf[DATA_PREFIX_SIZE..].copy_from_slice(payload);
            Ok(buf)
        }
        Message::AccessoryConnected { port } => {
            encode(Command::AccessoryConnected, &u32::from(port).to_be_bytes())
        }
        Message::CloseAccessory => encode(Command::CloseAccessory, &[]),
    }
}

/// Writes a DATA frame header and session id into the first
/// [`DATA_PREFIX_SIZE`] bytes of `buf`, returning the total frame length.
///
/// Used by the outbound forwarder, which reads socket bytes directly into
/// `buf[DATA_PREFIX_SIZE..]` so the frame is assembled without a copy.
///
/// # Errors
///
/// Returns [`ProtocolError::TooShort`] if `buf` cannot hold the prefix and
/// [`ProtocolError::FrameTooLarge`] if the frame would overflow the length field.
pub fn write_data_header(
    buf: &mut [u8],
    session_id: SessionId,
    payload_len: usize,
) -> Result<usize, ProtocolError> {
    if buf.len() < DATA_PREFIX_SIZE {
        return Err(ProtocolError::TooShort {
            needed: DATA_PREFIX_SIZE,
            available: buf.len(),
        });
    }
    let total = DATA_PREFIX_SIZE + payload_len;
    let length = frame_length(total)?;

    buf[0..2].copy_from_slice(&Command::DataPacket.tag());
    buf[2..4].copy_from_slice(&length.to_be_bytes());
    buf[4..6].copy_from_slice(&session_id.to_be_bytes());
    Ok(total)
}

/// Decodes the 4-byte header at the start of `bytes`.
///
/// Unknown command tags are **not** an error here; see [`FrameHeader::command`].
///
/// # Errors
///
/// Returns [`ProtocolError::TooShort`] if fewer than 4 bytes are available.
pub fn decode_header(bytes: &[u8]) -> Result<FrameHeader, ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::TooShort {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }
    Ok(FrameHeader {
        tag: [bytes[0], bytes[1]],
        length: u16::from_be_bytes([bytes[2], bytes[3]]),
    })
}

/// Splits one transfer into its header and payload.
///
/// When the declared length lies between the header size and the transfer
/// size, the payload ends where the header says; otherwise the payload is
/// everything after the header.  Callers that care about a mismatch compare
/// [`FrameHeader::matches_len`] against the transfer size themselves.
///
/// # Errors
///
/// Returns [`ProtocolError::TooShort`] if fewer than 4 bytes are available.
pub fn split_frame(bytes: &[u8]) -> Result<(FrameHeader, &[u8]), ProtocolError> {
    let header = decode_header(bytes)?;
    let declared = header.length as usize;
    let end = if (HEADER_SIZE..=bytes.len()).contains(&declared) {
        declared
    } else {
        bytes.len()
    };
    Ok((header, &bytes[HEADER_SIZE..end]))
}

/// Interprets `payload` according to `command`.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] when a fixed field is missing or
/// out of range.
pub fn decode_payload(command: Command, payload: &[u8]) -> Result<Message<'_>, ProtocolError> {
    match command {
        Command::ConnectSocket => Ok(Message::ConnectSocket {
            session_id: read_session_id(payload, "CONNECT_SOCKET")?,
        }),
        Command::ConnectionResponse => {
            require_len(payload, 4, "CONNECTION_RESP")?;
            Ok(Message::ConnectionResponse {
                session_id: u16::from_be_bytes([payload[0], payload[1]]),
                success: u16::from_be_bytes([payload[2], payload[3]]) != 0,
            })
        }
        Command::DisconnectSocket => Ok(Message::DisconnectSocket {
            session_id: read_session_id(payload, "DISCONNECT_SOCKET")?,
        }),
        Command::DataPacket => Ok(Message::Data {
            session_id: read_session_id(payload, "DATA_PACKET")?,
            payload: &payload[2..],
        }),
        Command::AccessoryConnected => {
            require_len(payload, 4, "ACCESSORY_CONNECTED")?;
            let raw = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            let port = u16::try_from(raw).map_err(|_| {
                ProtocolError::MalformedPayload(format!("ACCESSORY_CONNECTED: port {raw} out of range"))
            })?;
            Ok(Message::AccessoryConnected { port })
        }
        Command::CloseAccessory => Ok(Message::CloseAccessory),
    }
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn frame_length(total: usize) -> Result<u16, ProtocolError> {
    u16::try_from(total).map_err(|_| ProtocolError::FrameTooLarge { size: total })
}

fn require_len(buf: &[u8], needed: usize, context: &str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        Err(ProtocolError::MalformedPayload(format!(
            "{context}: need {needed} bytes, got {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

fn read_session_id(buf: &[u8], context: &str) -> Result<SessionId, ProtocolError> {
    require_len(buf, 2, context)?;
    Ok(u16::from_be_bytes([buf[0], buf[1]]))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
