//! Wire codec for the server's remote-console protocol.
//!
//! Frame layout, all integers little-endian:
//!
//! ```text
//! <u32 len> <i32 request id> <i32 packet type> <payload> 0x00 0x00
//! ```
//!
//! `len` covers everything after the length field itself. The payload
//! is followed by a mandatory two-byte NUL terminator sequence. The
//! protocol is stream-oriented: one TCP read is not guaranteed to
//! return one frame, so decoding always reads exactly `len` bytes.

use hearth_process::RconError;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

pub const TYPE_RESPONSE: i32 = 0;
pub const TYPE_COMMAND: i32 = 2;
pub const TYPE_AUTH: i32 = 3;
/// Echoed in the auth response when the password was rejected.
pub const AUTH_FAILED_ID: i32 = -1;

/// id (4) + type (4) + two NUL terminators.
const BODY_OVERHEAD: usize = 10;
/// Well-formed servers never come close to this; anything larger means
/// the stream is desynchronized.
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub request_id: i32,
    pub packet_type: i32,
    pub payload: String,
}

impl Frame {
    pub fn auth(request_id: i32, password: &str) -> Self {
        Self {
            request_id,
            packet_type: TYPE_AUTH,
            payload: password.to_string(),
        }
    }

    pub fn command(request_id: i32, command: &str) -> Self {
        Self {
            request_id,
            packet_type: TYPE_COMMAND,
            payload: command.to_string(),
        }
    }

    pub fn response(request_id: i32, payload: &str) -> Self {
        Self {
            request_id,
            packet_type: TYPE_RESPONSE,
            payload: payload.to_string(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = self.payload.as_bytes();
        let len = BODY_OVERHEAD + body.len();

        let mut out = Vec::with_capacity(4 + len);
        out.extend_from_slice(&(len as u32).to_le_bytes());
        out.extend_from_slice(&self.request_id.to_le_bytes());
        out.extend_from_slice(&self.packet_type.to_le_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(&[0, 0]);
        out
    }

    /// Decodes a frame body, i.e. everything after the length prefix.
    pub fn decode_body(body: &[u8]) -> Result<Self, RconError> {
        if body.len() < BODY_OVERHEAD {
            return Err(RconError::Protocol(format!(
                "frame too short: {} bytes",
                body.len()
            )));
        }

        let request_id = i32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        let packet_type = i32::from_le_bytes([body[4], body[5], body[6], body[7]]);
        // Strip the two-byte terminator; payload is whatever remains.
        let payload = String::from_utf8_lossy(&body[8..body.len() - 2]).into_owned();

        Ok(Self {
            request_id,
            packet_type,
            payload,
        })
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), RconError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads exactly one frame, retrying partial reads until the declared
/// length has arrived.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, RconError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;

    if !(BODY_OVERHEAD..=MAX_BODY_BYTES).contains(&len) {
        return Err(RconError::Protocol(format!("invalid frame length: {len}")));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Frame::decode_body(&body)
}
