//! Data-plane wire format of the default transport.
//!
//! A frame is a 4-byte big-endian length followed by that many bytes of
//! UTF-8 JSON. Calls and replies are JSON-RPC 2.0 objects; the method names
//! a service and one of its methods as `<service>/<method>`, e.g.
//! `helloworld.Greeter/sayHello`.

use crate::config::RpcConfig;
use crate::{FleetError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const JSONRPC_VERSION: &str = "2.0";

/// One call on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcCall {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    #[serde(default)]
    pub id: Option<Value>,
}

impl RpcCall {
    pub fn new(service: &str, method: &str, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: format!("{}/{}", service, method),
            params,
            id: Some(id.into()),
        }
    }

    /// Service and method, split at the last slash so service names may
    /// contain slashes themselves.
    pub fn target(&self) -> Option<(&str, &str)> {
        self.method
            .rsplit_once('/')
            .filter(|(service, method)| !service.is_empty() && !method.is_empty())
    }

    /// Params handed to the service; an absent value becomes `{}`.
    pub fn payload(&self) -> Value {
        match &self.params {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        }
    }
}

/// Error member of a failed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&FleetError> for RpcError {
    fn from(e: &FleetError) -> Self {
        Self {
            code: e.to_rpc_error_code(),
            message: e.to_string(),
            data: None,
        }
    }
}

/// Reply to one call: exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    #[serde(default)]
    pub id: Option<Value>,
}

impl RpcReply {
    pub fn from_outcome(id: Option<Value>, outcome: Result<Value>) -> Self {
        match outcome {
            Ok(value) => Self::build(id, Some(value), None),
            Err(e) => Self::build(id, None, Some(RpcError::from(&e))),
        }
    }

    /// Failure raised before any service saw the call.
    pub fn rejected(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        let error = RpcError {
            code,
            message: message.into(),
            data: None,
        };
        Self::build(id, None, Some(error))
    }

    fn build(id: Option<Value>, result: Option<Value>, error: Option<RpcError>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result,
            error,
            id,
        }
    }

    /// The caller's view: a remote error keeps its code.
    pub fn into_result(self) -> Result<Value> {
        match (self.error, self.result) {
            (Some(err), _) => Err(FleetError::Remote {
                code: err.code,
                message: err.message,
            }),
            (None, Some(value)) => Ok(value),
            (None, None) => Err(FleetError::Protocol {
                message: "RPC reply carries neither result nor error".to_string(),
            }),
        }
    }
}

/// Read one frame. `None` when the peer closed between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > RpcConfig::MAX_MESSAGE_SIZE {
        return Err(FleetError::Protocol {
            message: format!(
                "Incoming RPC frame of {} bytes exceeds the {} byte limit",
                len,
                RpcConfig::MAX_MESSAGE_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Serialize `message` into one frame and flush it.
pub async fn write_json<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    write_frame(writer, &payload).await
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len as usize <= RpcConfig::MAX_MESSAGE_SIZE)
        .ok_or_else(|| FleetError::Protocol {
            message: format!("RPC payload of {} bytes is too large", payload.len()),
        })?;
    writer.write_u32(len).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call_with_method(method: &str) -> RpcCall {
        serde_json::from_value(json!({"jsonrpc": "2.0", "method": method, "id": 1})).unwrap()
    }

    #[test]
    fn test_call_target_split() {
        let call = RpcCall::new("helloworld.Greeter", "sayHello", json!({}), 1);
        assert_eq!(call.method, "helloworld.Greeter/sayHello");
        assert_eq!(call.target(), Some(("helloworld.Greeter", "sayHello")));

        let nested = RpcCall::new("pkg/v1.Svc", "Call", json!({}), 2);
        assert_eq!(nested.target(), Some(("pkg/v1.Svc", "Call")));

        assert_eq!(call_with_method("bare").target(), None);
        assert_eq!(call_with_method("svc/").target(), None);
    }

    #[test]
    fn test_missing_params_become_empty_object() {
        let call = call_with_method("svc/m");
        assert_eq!(call.payload(), json!({}));
        assert!(!serde_json::to_string(&call).unwrap().contains("params"));
    }

    #[test]
    fn test_reply_maps_errors() {
        let err = FleetError::ServiceNotRegistered {
            service: "svc".to_string(),
        };
        let reply = RpcReply::from_outcome(Some(json!(1)), Err(err));
        let text = serde_json::to_string(&reply).unwrap();
        assert!(!text.contains("\"result\""));

        match reply.into_result() {
            Err(FleetError::Remote { code, .. }) => assert_eq!(code, -32010),
            other => panic!("Expected Remote error, got: {:?}", other),
        }

        let empty: RpcReply = serde_json::from_value(json!({"jsonrpc": "2.0", "id": 1})).unwrap();
        assert!(matches!(empty.into_result(), Err(FleetError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_frames_on_a_stream() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"{\"a\":1}").await.unwrap();
        write_json(&mut buf, &json!([1, 2])).await.unwrap();
        assert_eq!(&buf[..4], &7u32.to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).await.unwrap(), Some(b"{\"a\":1}".to_vec()));
        assert_eq!(read_frame(&mut cursor).await.unwrap(), Some(b"[1,2]".to_vec()));
        assert_eq!(read_frame(&mut cursor).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let huge = (RpcConfig::MAX_MESSAGE_SIZE + 1) as u32;
        let mut buf = huge.to_be_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(FleetError::Protocol { .. })
        ));
    }
}
