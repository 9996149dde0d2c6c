//! Route table: service name to the app endpoints that declare it.

use crate::manifest::FleetConfig;
use crate::rpc::{ChannelState, RpcChannel};
use crate::{FleetError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// One app that serves a service.
#[derive(Clone)]
pub struct ServiceEndpoint {
    pub service: String,
    pub app: String,
    pub uri: String,
    /// `host:port`, or the uri for xds apps.
    pub address: String,
    pub channel: Arc<dyn RpcChannel>,
}

impl ServiceEndpoint {
    fn is_live(&self) -> bool {
        self.channel.state() != ChannelState::Shutdown
    }
}

impl std::fmt::Debug for ServiceEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEndpoint")
            .field("service", &self.service)
            .field("app", &self.app)
            .field("uri", &self.uri)
            .field("address", &self.address)
            .field("state", &self.channel.state())
            .finish()
    }
}

/// Endpoints of one service plus its round-robin cursor.
#[derive(Default)]
pub struct RouteEntry {
    instances: Vec<ServiceEndpoint>,
    counter: AtomicUsize,
}

impl RouteEntry {
    pub fn instances(&self) -> &[ServiceEndpoint] {
        &self.instances
    }

    fn pick(&self, service: &str, hint: Option<&str>) -> Result<ServiceEndpoint> {
        let live: Vec<&ServiceEndpoint> = self.instances.iter().filter(|e| e.is_live()).collect();
        if live.is_empty() {
            return Err(FleetError::ServiceUnavailable {
                service: service.to_string(),
            });
        }

        let index = match hint {
            None => self.counter.fetch_add(1, Ordering::Relaxed) % live.len(),
            Some(hint) => live
                .iter()
                .position(|e| e.app == hint || e.uri == hint)
                .unwrap_or_else(|| hint_slot(hint, live.len())),
        };
        Ok(live[index].clone())
    }
}

/// Stable shard for a hint that names no endpoint.
fn hint_slot(hint: &str, len: usize) -> usize {
    let digest = blake3::hash(hint.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    (u64::from_le_bytes(prefix) % len as u64) as usize
}

/// Immutable routing snapshot. Rebuilt wholesale, never patched.
#[derive(Default)]
pub struct RouteTable {
    routes: HashMap<String, RouteEntry>,
    channels: Vec<Arc<dyn RpcChannel>>,
}

impl RouteTable {
    /// Group the config's apps by declared service. `channels` holds one
    /// channel per app; apps without one are left out.
    pub fn build(config: &FleetConfig, channels: &HashMap<String, Arc<dyn RpcChannel>>) -> Self {
        let mut routes: HashMap<String, RouteEntry> = HashMap::new();
        let mut used = Vec::new();

        for app in &config.apps {
            let Some(channel) = channels.get(&app.name) else {
                continue;
            };
            if app.services.is_empty() {
                continue;
            }
            used.push(channel.clone());
            let address = app.address().unwrap_or_else(|_| app.uri.clone());
            for service in &app.services {
                routes
                    .entry(service.clone())
                    .or_default()
                    .instances
                    .push(ServiceEndpoint {
                        service: service.clone(),
                        app: app.name.clone(),
                        uri: app.uri.clone(),
                        address: address.clone(),
                        channel: channel.clone(),
                    });
            }
        }

        debug!(
            "Built route table: {} services over {} channels",
            routes.len(),
            used.len()
        );
        Self {
            routes,
            channels: used,
        }
    }

    /// Pick an endpoint for `service`.
    ///
    /// Without a hint, live endpoints are taken round robin. A hint equal to
    /// an endpoint's app name or uri pins to it; any other hint maps to a
    /// stable endpoint by hash. Closed endpoints are never returned.
    pub fn resolve(&self, service: &str, hint: Option<&str>) -> Result<ServiceEndpoint> {
        self.routes
            .get(service)
            .ok_or_else(|| FleetError::ServiceNotRegistered {
                service: service.to_string(),
            })?
            .pick(service, hint)
    }

    pub fn entry(&self, service: &str) -> Option<&RouteEntry> {
        self.routes.get(service)
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn close_all(&self) {
        for channel in &self.channels {
            channel.close();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::AtomicBool;

    /// In-memory channel answering with the app it belongs to.
    pub(crate) struct FakeChannel {
        app: String,
        closed: AtomicBool,
    }

    impl FakeChannel {
        pub(crate) fn new(app: &str) -> Arc<Self> {
            Arc::new(Self {
                app: app.to_string(),
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl RpcChannel for FakeChannel {
        fn target(&self) -> &str {
            &self.app
        }

        fn state(&self) -> ChannelState {
            if self.closed.load(Ordering::SeqCst) {
                ChannelState::Shutdown
            } else {
                ChannelState::Idle
            }
        }

        async fn invoke(&self, service: &str, method: &str, _payload: Value) -> Result<Value> {
            Ok(serde_json::json!({"app": self.app, "service": service, "method": method}))
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn two_app_table() -> (RouteTable, Arc<FakeChannel>, Arc<FakeChannel>) {
        let config = FleetConfig::parse(
            &serde_json::json!({
                "apps": [
                    {"name": "a", "uri": "grpc://127.0.0.1:7001", "services": ["svc.Echo"]},
                    {"name": "b", "uri": "grpc://127.0.0.1:7002", "services": ["svc.Echo", "svc.Only"]},
                    {"name": "c", "uri": "grpc://127.0.0.1:7003"}
                ]
            })
            .to_string(),
            "/tmp/fleet.json",
        )
        .unwrap();
        let a = FakeChannel::new("a");
        let b = FakeChannel::new("b");
        let mut channels: HashMap<String, Arc<dyn RpcChannel>> = HashMap::new();
        channels.insert("a".to_string(), a.clone());
        channels.insert("b".to_string(), b.clone());
        (RouteTable::build(&config, &channels), a, b)
    }

    #[test]
    fn test_unknown_service_not_registered() {
        let (table, _, _) = two_app_table();
        assert!(matches!(
            table.resolve("svc.Missing", None),
            Err(FleetError::ServiceNotRegistered { .. })
        ));
    }

    #[test]
    fn test_all_closed_is_unavailable() {
        let (table, _, b) = two_app_table();
        b.close();
        assert!(matches!(
            table.resolve("svc.Only", None),
            Err(FleetError::ServiceUnavailable { .. })
        ));
    }

    #[test]
    fn test_round_robin_starts_at_first() {
        let (table, _, _) = two_app_table();
        let picks: Vec<String> = (0..4)
            .map(|_| table.resolve("svc.Echo", None).unwrap().app)
            .collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_round_robin_skips_closed() {
        let (table, a, _) = two_app_table();
        a.close();
        for _ in 0..3 {
            assert_eq!(table.resolve("svc.Echo", None).unwrap().app, "b");
        }
    }

    #[test]
    fn test_hint_pins_by_name_or_uri() {
        let (table, _, _) = two_app_table();
        for _ in 0..3 {
            assert_eq!(table.resolve("svc.Echo", Some("b")).unwrap().app, "b");
            assert_eq!(
                table
                    .resolve("svc.Echo", Some("grpc://127.0.0.1:7001"))
                    .unwrap()
                    .app,
                "a"
            );
        }
    }

    #[test]
    fn test_unmatched_hint_is_stable() {
        let (table, _, _) = two_app_table();
        let first = table.resolve("svc.Echo", Some("user-42")).unwrap().app;
        for _ in 0..5 {
            assert_eq!(table.resolve("svc.Echo", Some("user-42")).unwrap().app, first);
        }
        assert_eq!(hint_slot("user-42", 2), if first == "a" { 0 } else { 1 });
    }

    #[test]
    fn test_apps_without_channels_or_services_are_skipped() {
        let (table, _, _) = two_app_table();
        let mut services: Vec<&str> = table.services().collect();
        services.sort();
        assert_eq!(services, vec!["svc.Echo", "svc.Only"]);
        assert_eq!(table.entry("svc.Echo").unwrap().instances().len(), 2);
    }

    #[test]
    fn test_close_all_shuts_every_channel() {
        let (table, a, b) = two_app_table();
        table.close_all();
        assert_eq!(a.state(), ChannelState::Shutdown);
        assert_eq!(b.state(), ChannelState::Shutdown);
    }
}
