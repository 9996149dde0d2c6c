//! Live route table and the per-service client handed to callers.

use super::registry::{RouteTable, ServiceEndpoint};
use crate::Result;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Holds the current [`RouteTable`]. Replacement is a single pointer swap,
/// so a resolve sees either the old table or the new one.
#[derive(Default)]
pub struct ClientRegistry {
    table: RwLock<Arc<RouteTable>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Arc<RouteTable> {
        self.table.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Install `table` and return the one it replaced.
    pub fn replace(&self, table: RouteTable) -> Arc<RouteTable> {
        let mut guard = self.table.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(table))
    }

    pub fn resolve(&self, service: &str, hint: Option<&str>) -> Result<ServiceEndpoint> {
        self.current().resolve(service, hint)
    }

    pub fn close_all(&self) {
        self.current().close_all();
    }
}

/// Calls into one service through whatever table is current at call time.
#[derive(Clone)]
pub struct ServiceClient {
    service: String,
    registry: Arc<ClientRegistry>,
}

impl ServiceClient {
    pub fn new(service: impl Into<String>, registry: Arc<ClientRegistry>) -> Self {
        Self {
            service: service.into(),
            registry,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Invoke `method` on the next endpoint in round robin.
    pub async fn call(&self, method: &str, payload: Value) -> Result<Value> {
        self.call_routed(method, payload, None).await
    }

    /// Invoke `method`, routed by `hint` when given (app name, uri, or any
    /// sharding key).
    pub async fn call_routed(
        &self,
        method: &str,
        payload: Value,
        hint: Option<&str>,
    ) -> Result<Value> {
        let endpoint = self.registry.resolve(&self.service, hint)?;
        debug!(
            "Calling {}/{} on app '{}' ({})",
            self.service, method, endpoint.app, endpoint.address
        );
        let result = endpoint.channel.invoke(&self.service, method, payload).await;
        if let Err(e) = &result {
            if e.is_retryable() {
                warn!(
                    "App '{}' unreachable for {}/{}: {}",
                    endpoint.app, self.service, method, e
                );
            }
        }
        result
    }
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("service", &self.service)
            .finish()
    }
}
