//! Client channel of the default transport.
//!
//! Connects lazily on the first call and reconnects on the next call after
//! a broken connection.
//!
//! # Thread Safety
//!
//! A tokio `Mutex` serializes access to the TCP stream, so one request is
//! in flight per channel at a time.

use super::protocol::{read_frame, write_json, RpcCall, RpcReply};
use super::transport::{ChannelState, RpcChannel};
use crate::{FleetError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

impl ChannelState {
    fn to_u8(self) -> u8 {
        match self {
            ChannelState::Idle => 0,
            ChannelState::Connecting => 1,
            ChannelState::Ready => 2,
            ChannelState::TransientFailure => 3,
            ChannelState::Shutdown => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Idle,
            1 => ChannelState::Connecting,
            2 => ChannelState::Ready,
            3 => ChannelState::TransientFailure,
            _ => ChannelState::Shutdown,
        }
    }
}

/// JSON-RPC channel to one `host:port`.
#[derive(Debug)]
pub struct JsonRpcChannel {
    target: String,
    connect_timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
    state: AtomicU8,
    next_id: AtomicU64,
}

impl JsonRpcChannel {
    pub fn new(target: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            target: target.into(),
            connect_timeout,
            stream: Mutex::new(None),
            state: AtomicU8::new(ChannelState::Idle.to_u8()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Shutdown is terminal.
    fn set_state(&self, state: ChannelState) {
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != ChannelState::Shutdown.to_u8()).then_some(state.to_u8())
            });
    }

    fn shut_down_error(&self) -> FleetError {
        FleetError::Network {
            message: format!("Channel to {} is shut down", self.target),
            source: None,
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        self.set_state(ChannelState::Connecting);
        let result = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.target))
            .await
            .map_err(|_| FleetError::Timeout(self.connect_timeout))
            .and_then(|r| {
                r.map_err(|e| FleetError::network(format!("Failed to connect to {}", self.target), e))
            });

        match result {
            Ok(stream) => {
                debug!("RPC channel connected to {}", self.target);
                self.set_state(ChannelState::Ready);
                Ok(stream)
            }
            Err(e) => {
                self.set_state(ChannelState::TransientFailure);
                Err(e)
            }
        }
    }

    async fn exchange(&self, stream: &mut TcpStream, call: &RpcCall) -> Result<Vec<u8>> {
        let (mut reader, mut writer) = stream.split();
        write_json(&mut writer, call).await?;
        read_frame(&mut reader)
            .await?
            .ok_or_else(|| FleetError::Network {
                message: format!("Connection to {} closed mid-call", self.target),
                source: None,
            })
    }

    /// Call `method` of `service` and return its result.
    pub async fn call(&self, service: &str, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let call = RpcCall::new(service, method, params, id);

        let mut guard = self.stream.lock().await;
        // close() may have run while we waited for the lock.
        if self.state() == ChannelState::Shutdown {
            *guard = None;
            return Err(self.shut_down_error());
        }
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(self.shut_down_error());
        };

        let response_bytes = match self.exchange(stream, &call).await {
            Ok(bytes) => bytes,
            Err(e) => {
                *guard = None;
                self.set_state(ChannelState::TransientFailure);
                return Err(e);
            }
        };
        if self.state() == ChannelState::Shutdown {
            *guard = None;
        }
        drop(guard);

        let reply: RpcReply =
            serde_json::from_slice(&response_bytes).map_err(|e| FleetError::Json {
                message: format!("Failed to parse RPC reply from {}: {}", self.target, e),
                source: Some(e),
            })?;
        reply.into_result()
    }
}

#[async_trait]
impl RpcChannel for JsonRpcChannel {
    fn target(&self) -> &str {
        &self.target
    }

    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    async fn invoke(&self, service: &str, method: &str, payload: Value) -> Result<Value> {
        self.call(service, method, payload).await
    }

    fn close(&self) {
        self.set_state(ChannelState::Shutdown);
        // A call in flight drops the stream itself once it sees Shutdown.
        if let Ok(mut guard) = self.stream.try_lock() {
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::server::RpcServer;
    use crate::rpc::transport::{RpcListener, ServiceMap};
    use crate::service::Service;
    use std::sync::Arc;

    struct Adder;

    #[async_trait]
    impl Service for Adder {
        async fn invoke(&self, method: &str, payload: Value) -> Result<Value> {
            match method {
                "add" => {
                    let a = payload["a"].as_i64().unwrap_or(0);
                    let b = payload["b"].as_i64().unwrap_or(0);
                    Ok(serde_json::json!(a + b))
                }
                _ => Err(FleetError::MethodNotFound {
                    service: "math.Adder".to_string(),
                    method: method.to_string(),
                }),
            }
        }
    }

    async fn start_adder() -> crate::rpc::server::RpcServerHandle {
        let handle = RpcServer::start("127.0.0.1:0").await.unwrap();
        let mut services = ServiceMap::new();
        services.insert("math.Adder".to_string(), Arc::new(Adder) as Arc<dyn Service>);
        handle.set_services(services);
        handle
    }

    #[tokio::test]
    async fn test_lazy_connect_and_call() {
        let handle = start_adder().await;
        let channel = JsonRpcChannel::new(handle.local_addr(), Duration::from_secs(1));
        assert_eq!(channel.state(), ChannelState::Idle);

        let result = channel
            .invoke("math.Adder", "add", serde_json::json!({"a": 3, "b": 4}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!(7));
        assert_eq!(channel.state(), ChannelState::Ready);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_error_carries_code() {
        let handle = start_adder().await;
        let channel = JsonRpcChannel::new(handle.local_addr(), Duration::from_secs(1));

        match channel.invoke("math.Adder", "sub", serde_json::json!({})).await {
            Err(FleetError::Remote { code, .. }) => assert_eq!(code, -32601),
            other => panic!("Expected Remote error, got: {:?}", other),
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_to_dead_endpoint_fails() {
        let channel = JsonRpcChannel::new("127.0.0.1:1", Duration::from_secs(1));
        let result = channel.call("math.Adder", "add", serde_json::json!({})).await;

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(channel.state(), ChannelState::TransientFailure);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let handle = start_adder().await;
        let channel = JsonRpcChannel::new(handle.local_addr(), Duration::from_secs(1));
        channel.close();

        assert_eq!(channel.state(), ChannelState::Shutdown);
        assert!(channel.call("math.Adder", "add", serde_json::json!({})).await.is_err());
        assert_eq!(channel.state(), ChannelState::Shutdown);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_during_call_releases_stream() {
        let handle = start_adder().await;
        let channel = JsonRpcChannel::new(handle.local_addr(), Duration::from_secs(1));
        assert!(channel.call("math.Adder", "add", serde_json::json!({})).await.is_ok());

        // Hold the stream lock the way an in-flight call does.
        let guard = channel.stream.lock().await;
        channel.close();
        assert!(guard.is_some());
        drop(guard);

        assert!(channel.call("math.Adder", "add", serde_json::json!({})).await.is_err());
        assert!(channel.stream.lock().await.is_none());
        assert_eq!(channel.state(), ChannelState::Shutdown);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_detects_listener_shutdown() {
        let handle = start_adder().await;
        let channel = JsonRpcChannel::new(handle.local_addr(), Duration::from_secs(1));
        assert!(channel.call("math.Adder", "add", serde_json::json!({})).await.is_ok());

        handle.shutdown().await;

        let mut detected = false;
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if channel.call("math.Adder", "add", serde_json::json!({})).await.is_err() {
                detected = true;
                break;
            }
        }
        assert!(detected, "Channel should detect listener shutdown");
    }
}
