//! The serving side of an app: its listener and the service instances
//! installed on it.

use crate::rpc::{RpcListener, RpcTransport, ServerSpec, ServiceMap};
use crate::service::{Service, ServiceCatalog, ServiceContext};
use crate::{FleetError, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) type Instances = Vec<(String, Arc<dyn Service>)>;

struct ActiveListener {
    spec: ServerSpec,
    listener: Box<dyn RpcListener>,
    generation: u64,
}

/// Listener and instances of this process. Guarded by the app's lifecycle
/// lock; never touched concurrently.
#[derive(Default)]
pub(crate) struct ServingState {
    listener: Option<ActiveListener>,
    instances: Instances,
    generations: u64,
    pub(crate) stopped: bool,
}

impl ServingState {
    /// Bumped every time a listener is bound.
    pub(crate) fn generation(&self) -> Option<u64> {
        self.listener.as_ref().map(|a| a.generation)
    }

    pub(crate) fn local_addr(&self) -> Option<String> {
        self.listener.as_ref().map(|a| a.listener.local_addr())
    }

    /// Bring the listener in line with `next`: reuse it when nothing that
    /// affects the bind changed, otherwise close it and bind afresh.
    pub(crate) async fn apply(
        &mut self,
        transport: &dyn RpcTransport,
        next: Option<ServerSpec>,
    ) -> Result<()> {
        match (self.listener.take(), next) {
            (Some(mut active), Some(spec)) if !active.spec.requires_rebind(&spec) => {
                debug!(
                    "Reusing listener {} (generation {})",
                    active.listener.local_addr(),
                    active.generation
                );
                active.spec = spec;
                self.listener = Some(active);
            }
            (current, next) => {
                if let Some(active) = current {
                    info!(
                        "Closing listener {} of app '{}'",
                        active.listener.local_addr(),
                        active.spec.app
                    );
                    active.listener.shutdown().await;
                }
                if let Some(spec) = next {
                    let listener = transport.bind(&spec).await?;
                    self.generations += 1;
                    info!(
                        "App '{}' serving on {} (generation {})",
                        spec.app,
                        listener.local_addr(),
                        self.generations
                    );
                    self.listener = Some(ActiveListener {
                        spec,
                        listener,
                        generation: self.generations,
                    });
                }
            }
        }
        Ok(())
    }

    /// Construct every service in `services`. Fails on the first name the
    /// catalog has no factory for, before anything running is touched.
    pub(crate) fn construct(catalog: &ServiceCatalog, services: &[String]) -> Result<Instances> {
        services
            .iter()
            .map(|name| Ok((name.clone(), catalog.create(name)?)))
            .collect()
    }

    /// Put `instances` on the listener. Without a listener they are dropped.
    pub(crate) fn install(&mut self, instances: Instances) {
        let Some(active) = &self.listener else {
            self.instances.clear();
            return;
        };
        let map: ServiceMap = instances
            .iter()
            .map(|(name, service)| (name.clone(), service.clone()))
            .collect();
        active.listener.set_services(map);
        self.instances = instances;
    }

    pub(crate) async fn init_all(&self, ctx: &ServiceContext) -> Result<()> {
        for (name, service) in &self.instances {
            service
                .init(ctx)
                .await
                .map_err(|e| FleetError::Lifecycle {
                    service: name.clone(),
                    message: format!("init failed: {}", e),
                })?;
            debug!("Service '{}' initialised", name);
        }
        Ok(())
    }

    /// Run every destroy hook. Failures are logged; the instances are gone
    /// either way.
    pub(crate) async fn destroy_all(&mut self) {
        for (name, service) in self.instances.drain(..) {
            if let Err(e) = service.destroy().await {
                warn!("Destroy hook of service '{}' failed: {}", name, e);
            }
        }
    }

    pub(crate) async fn shutdown(&mut self) {
        if let Some(active) = self.listener.take() {
            active.listener.shutdown().await;
        }
    }
}
