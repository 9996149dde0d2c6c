//! Transport traits the lifecycle binds listeners and opens channels through,
//! plus the default JSON-RPC implementation.

use super::client::JsonRpcChannel;
use super::server::RpcServer;
use crate::manifest::{AppConfig, FleetConfig, Scheme, TlsMaterial};
use crate::service::Service;
use crate::{FleetError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Service implementations a listener dispatches to, keyed by service name.
pub type ServiceMap = HashMap<String, Arc<dyn Service>>;

/// Connectivity of a client channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    /// Closed for good; route resolution skips it.
    Shutdown,
}

/// What a serving app binds. Two specs that compare equal can share a
/// listener.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSpec {
    pub app: String,
    pub scheme: Scheme,
    pub address: String,
    pub tls: TlsMaterial,
    pub options: Map<String, Value>,
}

impl ServerSpec {
    /// Bind settings for `app`, reading its TLS material.
    pub async fn for_app(config: &FleetConfig, app: &AppConfig) -> Result<Self> {
        Ok(Self {
            app: app.name.clone(),
            scheme: app.scheme()?,
            address: app.address()?,
            tls: TlsMaterial::load(config, app).await?,
            options: app.options.clone(),
        })
    }

    /// Whether moving from `self` to `next` needs a fresh listener: the bind
    /// target, the TLS material or the server options changed.
    pub fn requires_rebind(&self, next: &ServerSpec) -> bool {
        self.scheme != next.scheme
            || self.address != next.address
            || self.tls != next.tls
            || self.options != next.options
    }
}

/// RPC transport: binds listeners and opens client channels.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn bind(&self, spec: &ServerSpec) -> Result<Box<dyn RpcListener>>;

    /// Create a channel to `app`. Connecting is lazy.
    fn channel(&self, app: &AppConfig, tls: &TlsMaterial) -> Result<Arc<dyn RpcChannel>>;
}

/// A bound listener.
#[async_trait]
pub trait RpcListener: Send + Sync {
    fn local_addr(&self) -> String;

    /// Replace the implementations requests are dispatched to.
    fn set_services(&self, services: ServiceMap);

    async fn shutdown(&self);
}

/// Client side of one app endpoint.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    fn target(&self) -> &str;

    fn state(&self) -> ChannelState;

    async fn invoke(&self, service: &str, method: &str, payload: Value) -> Result<Value>;

    fn close(&self);
}

/// Length-prefixed JSON-RPC 2.0 over plain TCP.
///
/// Has no TLS and no xds resolver; apps using those schemes need another
/// transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRpcTransport;

impl JsonRpcTransport {
    fn check_scheme(app: &str, scheme: Scheme) -> Result<()> {
        if scheme.is_secure() || scheme == Scheme::Xds {
            return Err(FleetError::Network {
                message: format!(
                    "App '{}' uses {}, which the JSON-RPC transport does not support",
                    app, scheme
                ),
                source: None,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RpcTransport for JsonRpcTransport {
    async fn bind(&self, spec: &ServerSpec) -> Result<Box<dyn RpcListener>> {
        Self::check_scheme(&spec.app, spec.scheme)?;
        if !spec.tls.is_empty() {
            warn!(
                "App '{}' declares TLS files; the JSON-RPC transport serves plaintext",
                spec.app
            );
        }
        let server = RpcServer::start(&spec.address).await?;
        Ok(Box::new(server))
    }

    fn channel(&self, app: &AppConfig, _tls: &TlsMaterial) -> Result<Arc<dyn RpcChannel>> {
        Self::check_scheme(&app.name, app.scheme()?)?;
        Ok(Arc::new(JsonRpcChannel::new(
            app.address()?,
            app.connect_timeout(),
        )))
    }
}
