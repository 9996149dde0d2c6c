//! Builder for configuring FleetApp boot.

use super::app::FleetApp;
use crate::config::ControlConfig;
use crate::process::{CommandSpawner, ProcessSpawner};
use crate::rpc::{JsonRpcTransport, RpcTransport};
use crate::service::ServiceCatalog;
use crate::{FleetError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Options for [`FleetApp::boot`].
///
/// # Example
///
/// ```rust,ignore
/// use fleet_core::{FleetOptions, ServiceCatalog};
///
/// let catalog = ServiceCatalog::new();
/// catalog.register("helloworld.Greeter", || Arc::new(Greeter) as Arc<dyn Service>);
///
/// let fleet = FleetOptions::new("./fleet.json")
///     .app("greeter")
///     .catalog(catalog)
///     .boot()
///     .await?;
/// fleet.wait_stopped().await;
/// ```
pub struct FleetOptions {
    pub(crate) config_path: PathBuf,
    pub(crate) app: Option<String>,
    pub(crate) catalog: ServiceCatalog,
    pub(crate) transport: Arc<dyn RpcTransport>,
    pub(crate) spawner: Arc<dyn ProcessSpawner>,
    pub(crate) reconnect_interval: Duration,
}

impl FleetOptions {
    /// Options for the fleet described by `config_path`, running no app.
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            app: None,
            catalog: ServiceCatalog::new(),
            transport: Arc::new(JsonRpcTransport),
            spawner: Arc::new(CommandSpawner),
            reconnect_interval: ControlConfig::RECONNECT_INTERVAL,
        }
    }

    /// Options for a process started by the fleet: config path and app name
    /// come from `FLEET_CONFIG` and `FLEET_APP`.
    pub fn from_env() -> Result<Self> {
        let config_path =
            std::env::var_os(ControlConfig::CONFIG_ENV_VAR).ok_or_else(|| FleetError::Config {
                message: format!("{} is not set", ControlConfig::CONFIG_ENV_VAR),
            })?;
        let options = Self::new(config_path);
        Ok(match std::env::var(ControlConfig::APP_ENV_VAR) {
            Ok(app) if !app.is_empty() => options.app(app),
            _ => options,
        })
    }

    /// Run as `app`. The app may serve, and competes for hostship.
    pub fn app(mut self, app: impl Into<String>) -> Self {
        self.app = Some(app.into());
        self
    }

    /// Where service implementations come from.
    ///
    /// Default: an empty catalog
    pub fn catalog(mut self, catalog: ServiceCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Default: [`JsonRpcTransport`]
    pub fn transport(mut self, transport: Arc<dyn RpcTransport>) -> Self {
        self.transport = transport;
        self
    }

    /// Used when this process, as host, restarts a crashed app.
    ///
    /// Default: [`CommandSpawner`]
    pub fn spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Delay between attempts to reach a host.
    ///
    /// Default: one second
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Shorthand for [`FleetApp::boot`].
    pub async fn boot(self) -> Result<Arc<FleetApp>> {
        FleetApp::boot(self).await
    }
}

impl std::fmt::Debug for FleetOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetOptions")
            .field("config_path", &self.config_path)
            .field("app", &self.app)
            .field("catalog", &self.catalog)
            .field("reconnect_interval", &self.reconnect_interval)
            .finish()
    }
}
