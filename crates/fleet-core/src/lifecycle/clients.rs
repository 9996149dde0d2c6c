//! Rebuilding the client side of the route registry.

use crate::manifest::{FleetConfig, TlsMaterial};
use crate::routing::{ClientRegistry, RouteTable};
use crate::rpc::{RpcChannel, RpcTransport};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Client TLS material of every app that declares services.
pub(crate) async fn preload(config: &FleetConfig) -> Result<Vec<(String, TlsMaterial)>> {
    let mut materials = Vec::new();
    for app in config.apps.iter().filter(|a| !a.services.is_empty()) {
        materials.push((app.name.clone(), TlsMaterial::load(config, app).await?));
    }
    Ok(materials)
}

/// Build channels and a fresh table, swap it in, then close the old
/// channels. Does not suspend, so no call ever sees a half-built table.
///
/// An app the transport cannot reach is left out of the table.
pub(crate) fn rebuild(
    registry: &ClientRegistry,
    transport: &dyn RpcTransport,
    config: &FleetConfig,
    materials: Vec<(String, TlsMaterial)>,
) {
    let mut channels: HashMap<String, Arc<dyn RpcChannel>> = HashMap::new();
    for (name, tls) in materials {
        let Some(app) = config.app(&name) else {
            continue;
        };
        match transport.channel(app, &tls) {
            Ok(channel) => {
                channels.insert(name, channel);
            }
            Err(e) => warn!("No client channel for app '{}': {}", name, e),
        }
    }

    let old = registry.replace(RouteTable::build(config, &channels));
    old.close_all();
    debug!("Client registry rebuilt with {} channels", channels.len());
}
