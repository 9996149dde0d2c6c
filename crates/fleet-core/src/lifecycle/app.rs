//! FleetApp: one process's life in the fleet.

use super::clients;
use super::options::FleetOptions;
use super::server::ServingState;
use crate::control::{
    Command, ControlAddress, GuestConnector, GuestOptions, HostCandidate, HostElection, HostSlot,
    InboundCommand,
};
use crate::manifest::{AppConfig, ConfigCell, FleetConfig};
use crate::routing::{ClientRegistry, ServiceClient};
use crate::rpc::{RpcTransport, ServerSpec};
use crate::service::{ServiceCatalog, ServiceContext};
use crate::{FleetError, Result};
use serde_json::json;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A booted fleet member.
///
/// Owns the listener (when its app serves), the client registry and the
/// control-plane guest, and hosts the control plane when it wins the
/// election.
pub struct FleetApp {
    app: Option<String>,
    config: ConfigCell,
    catalog: ServiceCatalog,
    transport: Arc<dyn RpcTransport>,
    clients: Arc<ClientRegistry>,
    serving: tokio::sync::Mutex<ServingState>,
    guest: GuestConnector,
    host: HostSlot,
    stopped_tx: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// The app config of `app` when it runs a listener.
fn serving_app<'a>(config: &'a FleetConfig, app: Option<&str>) -> Option<&'a AppConfig> {
    app.and_then(|name| config.app(name))
        .filter(|app| app.is_server())
}

impl FleetApp {
    /// Boot a fleet member.
    ///
    /// Binds the listener if the app serves, builds the client registry,
    /// runs service init hooks, then tries for hostship and joins the
    /// control plane as a guest.
    pub async fn boot(options: FleetOptions) -> Result<Arc<Self>> {
        let FleetOptions {
            config_path,
            app,
            catalog,
            transport,
            spawner,
            reconnect_interval,
        } = options;

        let config = FleetConfig::load(&config_path)?;
        if let Some(name) = &app {
            if config.app(name).is_none() {
                return Err(FleetError::UnknownApp { app: name.clone() });
            }
        }
        let address = ControlAddress::for_config(&config.path)?;
        let cell = ConfigCell::new(config);
        let config = cell.current();

        let mut serving = ServingState::default();
        if let Some(app_config) = serving_app(&config, app.as_deref()) {
            let instances = ServingState::construct(&catalog, &app_config.services)?;
            let spec = ServerSpec::for_app(&config, app_config).await?;
            serving.apply(transport.as_ref(), Some(spec)).await?;
            serving.install(instances);
        }

        let registry = Arc::new(ClientRegistry::new());
        let materials = clients::preload(&config).await?;
        clients::rebuild(&registry, transport.as_ref(), &config, materials);

        let ctx = ServiceContext::new(app.clone(), registry.clone());
        if let Err(e) = serving.init_all(&ctx).await {
            serving.shutdown().await;
            registry.close_all();
            return Err(e);
        }

        let host: HostSlot = Arc::new(Mutex::new(None));
        let election = app.as_ref().map(|_| {
            Arc::new(HostCandidate::new(
                address.clone(),
                app.clone(),
                cell.clone(),
                spawner.clone(),
                host.clone(),
            )) as Arc<dyn HostElection>
        });
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let guest = GuestConnector::new(
            address,
            GuestOptions {
                app: app.clone(),
                reconnect_interval,
                election: election.clone(),
                commands: Some(commands_tx),
            },
        );

        let (stopped_tx, _) = watch::channel(false);
        let fleet = Arc::new(FleetApp {
            app,
            config: cell,
            catalog,
            transport,
            clients: registry,
            serving: tokio::sync::Mutex::new(serving),
            guest,
            host,
            stopped_tx,
            driver: Mutex::new(None),
        });
        let driver = tokio::spawn(drive_commands(Arc::downgrade(&fleet), commands_rx));
        *fleet.driver.lock().unwrap_or_else(|e| e.into_inner()) = Some(driver);

        let joined = match &election {
            Some(election) => match election.try_become_host().await {
                Ok(_) => fleet.guest.join().await,
                Err(e) => Err(e),
            },
            None => fleet.guest.join().await,
        };
        if let Err(e) = joined {
            error!(
                "App '{}' failed to join the fleet: {}",
                fleet.app.as_deref().unwrap_or("-"),
                e
            );
            fleet.teardown().await;
            return Err(e);
        }

        info!(
            "App '{}' booted (host: {})",
            fleet.app.as_deref().unwrap_or("-"),
            fleet.is_host()
        );
        Ok(fleet)
    }

    /// Re-read the config file and bring this process in line with it.
    ///
    /// The listener survives unless its bind target, TLS material or
    /// options changed. Service instances are always rebuilt from the
    /// catalog, and the client registry is rebuilt from scratch.
    ///
    /// The new config, TLS files and service instances are all prepared
    /// before the running instances are destroyed; a failure there leaves
    /// the app as it was.
    pub async fn reload(&self) -> Result<()> {
        let mut serving = self.serving.lock().await;
        if serving.stopped {
            return Err(FleetError::Other("Fleet app is stopped".to_string()));
        }

        let old = self.config.current();
        let next = FleetConfig::load(&old.path)?;
        let next_app = serving_app(&next, self.app.as_deref());
        let next_spec = match next_app {
            Some(app) => Some(ServerSpec::for_app(&next, app).await?),
            None => None,
        };
        let materials = clients::preload(&next).await?;
        let instances = match next_app {
            Some(app) => ServingState::construct(&self.catalog, &app.services)?,
            None => Vec::new(),
        };
        info!(
            "Reloading app '{}' from {}",
            self.app.as_deref().unwrap_or("-"),
            next.path.display()
        );

        serving.destroy_all().await;
        serving.apply(self.transport.as_ref(), next_spec).await?;
        serving.install(instances);

        clients::rebuild(&self.clients, self.transport.as_ref(), &next, materials);
        self.config.replace(next);

        let ctx = ServiceContext::new(self.app.clone(), self.clients.clone());
        serving.init_all(&ctx).await?;
        info!("App '{}' reloaded", self.app.as_deref().unwrap_or("-"));
        Ok(())
    }

    /// Stop this process's part in the fleet.
    ///
    /// Destroys service instances, closes the listener and client channels,
    /// says goodbye to the host (answering `reply_id` if the stop came from
    /// a command) and stops hosting. Stopping twice is a no-op.
    pub async fn stop(&self, reply_id: Option<String>) -> Result<()> {
        let mut serving = self.serving.lock().await;
        if serving.stopped {
            return Ok(());
        }
        serving.stopped = true;
        info!("Stopping app '{}'", self.app.as_deref().unwrap_or("-"));

        serving.destroy_all().await;
        serving.shutdown().await;
        self.clients.close_all();

        self.guest.leave("stopping", reply_id).await;
        let host = self.host.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(host) = host {
            host.stop().await;
        }

        self.stopped_tx.send_replace(true);
        info!("App '{}' stopped", self.app.as_deref().unwrap_or("-"));
        Ok(())
    }

    /// Resolves once [`FleetApp::stop`] has completed.
    pub async fn wait_stopped(&self) {
        let mut rx = self.stopped_tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Client for `service`, routed through the current registry.
    pub fn client(&self, service: &str) -> ServiceClient {
        ServiceClient::new(service, self.clients.clone())
    }

    pub fn app(&self) -> Option<&str> {
        self.app.as_deref()
    }

    pub fn config(&self) -> Arc<FleetConfig> {
        self.config.current()
    }

    pub fn guest(&self) -> &GuestConnector {
        &self.guest
    }

    pub fn is_host(&self) -> bool {
        self.host
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped_tx.borrow()
    }

    /// Address the listener is bound to, if this app serves.
    pub async fn local_addr(&self) -> Option<String> {
        self.serving.lock().await.local_addr()
    }

    /// Counts listener binds; unchanged across a reload that kept the
    /// listener. `None` while not serving.
    pub async fn listener_generation(&self) -> Option<u64> {
        self.serving.lock().await.generation()
    }

    /// Undo a partial boot.
    async fn teardown(&self) {
        let mut serving = self.serving.lock().await;
        serving.stopped = true;
        serving.destroy_all().await;
        serving.shutdown().await;
        self.clients.close_all();
        self.guest.leave("boot failed", None).await;
        let host = self.host.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(host) = host {
            host.stop().await;
        }
        self.stopped_tx.send_replace(true);
    }
}

impl Drop for FleetApp {
    fn drop(&mut self) {
        if let Some(driver) = self
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            driver.abort();
        }
    }
}

/// Carry out `stop` and `reload` commands the host sent.
async fn drive_commands(fleet: Weak<FleetApp>, mut commands: mpsc::UnboundedReceiver<InboundCommand>) {
    while let Some(command) = commands.recv().await {
        let Some(fleet) = fleet.upgrade() else {
            break;
        };
        match command.cmd {
            Command::Reload => {
                let outcome = match fleet.reload().await {
                    Ok(()) => Ok(json!("reloaded")),
                    Err(e) => {
                        error!("Reload failed: {}", e);
                        Err(e.to_string())
                    }
                };
                fleet.guest.reply(command.msg_id, outcome);
            }
            Command::Stop => {
                if let Err(e) = fleet.stop(command.msg_id).await {
                    error!("Stop failed: {}", e);
                }
                break;
            }
            other => warn!("Ignoring control command {:?}", other),
        }
    }
}
