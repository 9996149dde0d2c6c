//! Service implementations and the catalog they are constructed from.
//!
//! A serving app looks up each declared service name in the
//! [`ServiceCatalog`] and installs what the factory returns on its listener.
//! Registering a new factory under an existing name and reloading swaps the
//! implementation without restarting the process.

use crate::routing::{ClientRegistry, ServiceClient};
use crate::{FleetError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// A service implementation.
///
/// `init` runs after the listener and client registry are in place, so it
/// may call other services. `destroy` runs before a reload or stop.
#[async_trait]
pub trait Service: Send + Sync {
    async fn init(&self, _ctx: &ServiceContext) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        Ok(())
    }

    /// Handle `method` with a JSON payload.
    async fn invoke(&self, method: &str, payload: Value) -> Result<Value>;
}

/// Constructor of a service instance.
pub type ServiceFactory = Arc<dyn Fn() -> Arc<dyn Service> + Send + Sync>;

/// Factories keyed by service name. Clones share the same table.
#[derive(Clone, Default)]
pub struct ServiceCatalog {
    factories: Arc<RwLock<HashMap<String, ServiceFactory>>>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`, replacing any previous one.
    /// Returns `true` if a factory was replaced.
    pub fn register<F>(&self, name: impl Into<String>, factory: F) -> bool
    where
        F: Fn() -> Arc<dyn Service> + Send + Sync + 'static,
    {
        let name = name.into();
        let replaced = self
            .factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.clone(), Arc::new(factory))
            .is_some();
        debug!(
            "{} service factory '{}'",
            if replaced { "Replaced" } else { "Registered" },
            name
        );
        replaced
    }

    /// Construct a fresh instance of `name`.
    pub fn create(&self, name: &str) -> Result<Arc<dyn Service>> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| FleetError::Lifecycle {
                service: name.to_string(),
                message: "no implementation registered in the service catalog".to_string(),
            })?;
        Ok(factory())
    }
}

impl std::fmt::Debug for ServiceCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<&String> = factories.keys().collect();
        names.sort();
        f.debug_struct("ServiceCatalog")
            .field("services", &names)
            .finish()
    }
}

/// What an `init` hook sees of the running app.
#[derive(Clone)]
pub struct ServiceContext {
    app: Option<String>,
    clients: Arc<ClientRegistry>,
}

impl ServiceContext {
    pub fn new(app: Option<String>, clients: Arc<ClientRegistry>) -> Self {
        Self { app, clients }
    }

    /// Name of the app this process runs, if any.
    pub fn app(&self) -> Option<&str> {
        self.app.as_deref()
    }

    pub fn client(&self, service: &str) -> ServiceClient {
        ServiceClient::new(service, self.clients.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl Service for Fixed {
        async fn invoke(&self, _method: &str, _payload: Value) -> Result<Value> {
            Ok(Value::from(self.0))
        }
    }

    #[tokio::test]
    async fn test_register_replaces_factory() {
        let catalog = ServiceCatalog::new();
        assert!(!catalog.register("svc", || Arc::new(Fixed("one")) as Arc<dyn Service>));
        let first = catalog.create("svc").unwrap();

        let shared = catalog.clone();
        assert!(shared.register("svc", || Arc::new(Fixed("two")) as Arc<dyn Service>));
        let second = catalog.create("svc").unwrap();

        assert_eq!(first.invoke("x", Value::Null).await.unwrap(), "one");
        assert_eq!(second.invoke("x", Value::Null).await.unwrap(), "two");
    }

    #[test]
    fn test_create_unknown_is_lifecycle_error() {
        let catalog = ServiceCatalog::new();
        assert!(matches!(
            catalog.create("ghost"),
            Err(FleetError::Lifecycle { .. })
        ));
    }
}
