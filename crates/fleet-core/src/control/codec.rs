//! Control-plane message codec.
//!
//! Messages are JSON objects, one per line:
//!
//! ```text
//! {"cmd":"handshake","app":"greeter","pid":4242}\n
//! {"cmd":"reply","msgId":"5f0c...","result":"reloaded"}\n
//! ```
//!
//! Decoding works on raw bytes so a multi-byte character split across two
//! reads survives. A line that fails to parse is dropped without disturbing
//! the lines around it.

use crate::config::ControlConfig;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Control-plane command carried in the `cmd` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Handshake,
    Goodbye,
    Reload,
    Stop,
    List,
    Stat,
    Reply,
}

/// One control-plane message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    pub cmd: Command,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Marks the sender's final message on this connection.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fin: bool,
}

impl ControlMessage {
    pub fn new(cmd: Command) -> Self {
        Self {
            cmd,
            app: None,
            msg_id: None,
            pid: None,
            result: None,
            error: None,
            fin: false,
        }
    }

    pub fn handshake(app: Option<String>, pid: u32) -> Self {
        Self {
            app,
            pid: Some(pid),
            ..Self::new(Command::Handshake)
        }
    }

    pub fn goodbye(reason: &str) -> Self {
        Self {
            result: Some(Value::String(reason.to_string())),
            ..Self::new(Command::Goodbye)
        }
    }

    /// A correlated reply carrying either a result or an error string.
    pub fn reply(msg_id: Option<String>, outcome: std::result::Result<Value, String>) -> Self {
        let mut msg = Self::new(Command::Reply);
        msg.msg_id = msg_id;
        match outcome {
            Ok(result) => msg.result = Some(result),
            Err(error) => msg.error = Some(error),
        }
        msg
    }

    pub fn with_app(mut self, app: impl Into<String>) -> Self {
        self.app = Some(app.into());
        self
    }

    pub fn with_msg_id(mut self, msg_id: impl Into<String>) -> Self {
        self.msg_id = Some(msg_id.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn finished(mut self) -> Self {
        self.fin = true;
        self
    }

    /// Split a reply into the outcome it carries.
    pub fn into_outcome(self) -> std::result::Result<Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Serialize one message followed by exactly one `\n`.
pub fn encode(msg: &ControlMessage) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(msg)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode every complete line in `partial + bytes`.
///
/// Returns the decoded messages and the unterminated remainder, which the
/// caller passes back as `partial` on the next call. With `eof` set the
/// remainder is decoded as a final message and an empty buffer is returned.
pub fn decode(mut partial: Vec<u8>, bytes: &[u8], eof: bool) -> (Vec<ControlMessage>, Vec<u8>) {
    partial.extend_from_slice(bytes);

    let mut messages = Vec::new();
    let mut start = 0;
    while let Some(offset) = partial[start..].iter().position(|b| *b == b'\n') {
        let end = start + offset;
        decode_line(&partial[start..end], &mut messages);
        start = end + 1;
    }

    let mut rest = partial.split_off(start);
    if eof {
        decode_line(&rest, &mut messages);
        rest.clear();
    } else if rest.len() > ControlConfig::MAX_LINE_BYTES {
        warn!(
            "Discarding {} buffered control bytes without a line break",
            rest.len()
        );
        rest.clear();
    }
    (messages, rest)
}

fn decode_line(line: &[u8], out: &mut Vec<ControlMessage>) {
    let line = line.trim_ascii();
    if line.is_empty() {
        return;
    }
    match serde_json::from_slice::<ControlMessage>(line) {
        Ok(msg) => out.push(msg),
        Err(e) => warn!("Dropping malformed control message: {}", e),
    }
}

/// Stateful decoder for one connection.
#[derive(Debug, Default)]
pub struct ControlDecoder {
    partial: Vec<u8>,
}

impl ControlDecoder {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ControlMessage> {
        let (messages, rest) = decode(std::mem::take(&mut self.partial), bytes, false);
        self.partial = rest;
        messages
    }

    /// Flush the carried partial at end of stream.
    pub fn finish(&mut self) -> Vec<ControlMessage> {
        decode(std::mem::take(&mut self.partial), &[], true).0
    }
}
