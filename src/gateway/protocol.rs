//! Presence DLP - Gateway Wire Protocol
//!
//! Every message is a 4-byte big-endian length followed by UTF-8 JSON.
//! Requests are `{"token", "cmd", "data"}`; responses are JSON objects
//! framed the same way.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DlpError, DlpResult};

/// Length prefix size
pub const LEN_PREFIX: usize = 4;

/// Request as sent on the wire.
///
/// `token` and `cmd` accept any JSON value so a request with a token of the
/// wrong type is rejected as unauthorized rather than malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub token: Value,
    #[serde(default)]
    pub cmd: Value,
    #[serde(default)]
    pub data: Option<Value>,
}

/// The commands the gateway understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Viewer is alive; `file_id` names the open document
    Heartbeat { file_id: Option<i64> },
    ReloadConfig,
    GetStatus,
}

impl Command {
    pub const HEARTBEAT: &'static str = "HEARTBEAT";
    pub const RELOAD_CONFIG: &'static str = "RELOAD_CONFIG";
    pub const GET_STATUS: &'static str = "GET_STATUS";

    pub fn name(&self) -> &'static str {
        match self {
            Command::Heartbeat { .. } => Self::HEARTBEAT,
            Command::ReloadConfig => Self::RELOAD_CONFIG,
            Command::GetStatus => Self::GET_STATUS,
        }
    }

    /// `None` for an unknown command name
    pub fn parse(cmd: &str, data: Option<&Value>) -> Option<Self> {
        match cmd {
            "HEARTBEAT" => Some(Command::Heartbeat {
                file_id: data.and_then(|d| d.get("file_id")).and_then(Value::as_i64),
            }),
            "RELOAD_CONFIG" => Some(Command::ReloadConfig),
            "GET_STATUS" => Some(Command::GetStatus),
            _ => None,
        }
    }

    pub fn into_request(self, token: &str) -> Request {
        let data = match self {
            Command::Heartbeat { file_id } => Some(json!({ "file_id": file_id })),
            _ => None,
        };
        Request {
            token: Value::from(token),
            cmd: Value::from(self.name()),
            data,
        }
    }
}

/// Response bodies
pub mod response {
    use serde_json::{json, Value};

    pub fn heartbeat(authorized: bool) -> Value {
        json!({ "action": if authorized { "continue" } else { "close" } })
    }

    pub fn status(authorized: bool) -> Value {
        json!({ "status": "ok", "authorized": authorized })
    }

    pub fn ok() -> Value {
        json!({ "status": "ok" })
    }

    pub fn error(message: &str) -> Value {
        json!({ "status": "error", "message": message })
    }

    pub fn unauthorized() -> Value {
        error("Unauthorized")
    }

    pub fn unknown_command() -> Value {
        json!({ "status": "unknown_command" })
    }

    pub fn is_error(value: &Value) -> bool {
        value.get("status").and_then(Value::as_str) == Some("error")
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// FRAMING
// ═══════════════════════════════════════════════════════════════════════════

fn check_len(len: usize, max: usize) -> DlpResult<()> {
    if len > max || len > u32::MAX as usize {
        return Err(DlpError::FrameTooLarge { size: len, max });
    }
    Ok(())
}

/// Write one length-prefixed frame
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> DlpResult<()> {
    check_len(payload.len(), u32::MAX as usize)?;
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed frame of at most `max` bytes
pub fn read_frame<R: Read>(reader: &mut R, max: usize) -> DlpResult<Vec<u8>> {
    let mut prefix = [0u8; LEN_PREFIX];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix) as usize;
    check_len(len, max)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

pub async fn write_frame_async<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> DlpResult<()> {
    check_len(payload.len(), u32::MAX as usize)?;
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame_async<R: AsyncRead + Unpin>(reader: &mut R, max: usize) -> DlpResult<Vec<u8>> {
    let len = reader.read_u32().await? as usize;
    check_len(len, max)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Serialize a JSON value into a frame payload
pub fn encode(value: &impl Serialize) -> DlpResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode_request(payload: &[u8]) -> DlpResult<Request> {
    serde_json::from_slice(payload).map_err(|e| DlpError::Protocol(format!("malformed request: {}", e)))
}

pub fn decode_response(payload: &[u8]) -> DlpResult<Value> {
    serde_json::from_slice(payload).map_err(|e| DlpError::Protocol(format!("malformed response: {}", e)))
}
