//! Boot, reload and stop of a serving app over the default transport.

#![cfg(unix)]

use async_trait::async_trait;
use fleet_core::{
    Command, FleetApp, FleetError, FleetOptions, GuestConnector, GuestOptions, ProcessSpawner,
    Result, Service, ServiceCatalog, ServiceContext, SpawnRequest,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const GREETER: &str = "helloworld.Greeter";

struct Greeter {
    greeting: &'static str,
}

#[async_trait]
impl Service for Greeter {
    async fn invoke(&self, method: &str, payload: Value) -> Result<Value> {
        match method {
            "sayHello" => {
                let name = payload["name"].as_str().unwrap_or("stranger");
                Ok(json!({"message": format!("{}, {}", self.greeting, name)}))
            }
            _ => Err(FleetError::MethodNotFound {
                service: GREETER.to_string(),
                method: method.to_string(),
            }),
        }
    }
}

/// Counts hook calls across instances.
#[derive(Default)]
struct Hooks {
    inits: AtomicUsize,
    destroys: AtomicUsize,
}

struct Hooked {
    hooks: Arc<Hooks>,
}

#[async_trait]
impl Service for Hooked {
    async fn init(&self, ctx: &ServiceContext) -> Result<()> {
        assert_eq!(ctx.app(), Some("greeter"));
        // Other services are reachable from init.
        let reply = ctx
            .client(GREETER)
            .call("sayHello", json!({"name": "init"}))
            .await?;
        assert!(reply["message"].as_str().unwrap().ends_with("init"));
        self.hooks.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.hooks.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn invoke(&self, _method: &str, _payload: Value) -> Result<Value> {
        Ok(Value::Null)
    }
}

struct NoSpawn;

impl ProcessSpawner for NoSpawn {
    fn spawn(&self, request: &SpawnRequest) -> Result<u32> {
        Err(FleetError::Other(format!("unexpected spawn of {}", request.app)))
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn write_config(path: &Path, greeter: Value) {
    let config = json!({
        "entry": "bin/app",
        "apps": [greeter]
    });
    std::fs::write(path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
}

fn greeter_app(port: u16, services: &[&str]) -> Value {
    json!({
        "name": "greeter",
        "uri": format!("grpc://127.0.0.1:{}", port),
        "serve": true,
        "services": services
    })
}

fn greeter_catalog(greeting: &'static str) -> ServiceCatalog {
    let catalog = ServiceCatalog::new();
    catalog.register(GREETER, move || Arc::new(Greeter { greeting }) as Arc<dyn Service>);
    catalog
}

async fn boot(path: &Path, catalog: ServiceCatalog) -> Arc<FleetApp> {
    FleetOptions::new(path)
        .app("greeter")
        .catalog(catalog)
        .spawner(Arc::new(NoSpawn))
        .reconnect_interval(Duration::from_millis(50))
        .boot()
        .await
        .unwrap()
}

fn setup() -> (TempDir, PathBuf, u16) {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("fleet.json");
    let port = free_port();
    write_config(&path, greeter_app(port, &[GREETER]));
    (temp, path, port)
}

async fn say_hello(fleet: &FleetApp) -> Result<String> {
    let reply = fleet
        .client(GREETER)
        .call("sayHello", json!({"name": "World"}))
        .await?;
    Ok(reply["message"].as_str().unwrap_or_default().to_string())
}

#[tokio::test]
async fn test_reload_picks_up_replaced_implementation() {
    let (_temp, path, _port) = setup();
    let catalog = greeter_catalog("Hello");
    let fleet = boot(&path, catalog.clone()).await;

    assert!(fleet.is_host());
    assert_eq!(say_hello(&fleet).await.unwrap(), "Hello, World");

    catalog.register(GREETER, || {
        Arc::new(Greeter { greeting: "Howdy" }) as Arc<dyn Service>
    });
    fleet.reload().await.unwrap();
    assert_eq!(say_hello(&fleet).await.unwrap(), "Howdy, World");

    fleet.stop(None).await.unwrap();
    fleet.wait_stopped().await;
    assert!(fleet.is_stopped());
}

#[tokio::test]
async fn test_listener_kept_when_bind_unchanged() {
    let (_temp, path, port) = setup();
    let fleet = boot(&path, greeter_catalog("Hello")).await;

    assert_eq!(fleet.listener_generation().await, Some(1));
    assert_eq!(
        fleet.local_addr().await,
        Some(format!("127.0.0.1:{}", port))
    );

    fleet.reload().await.unwrap();
    assert_eq!(fleet.listener_generation().await, Some(1));
    assert_eq!(say_hello(&fleet).await.unwrap(), "Hello, World");

    fleet.stop(None).await.unwrap();
}

#[tokio::test]
async fn test_listener_rebound_on_port_change() {
    let (_temp, path, _port) = setup();
    let fleet = boot(&path, greeter_catalog("Hello")).await;

    let new_port = free_port();
    write_config(&path, greeter_app(new_port, &[GREETER]));
    fleet.reload().await.unwrap();

    assert_eq!(fleet.listener_generation().await, Some(2));
    assert_eq!(
        fleet.local_addr().await,
        Some(format!("127.0.0.1:{}", new_port))
    );
    assert_eq!(say_hello(&fleet).await.unwrap(), "Hello, World");

    fleet.stop(None).await.unwrap();
}

#[tokio::test]
async fn test_listener_torn_down_when_app_stops_serving() {
    let (_temp, path, port) = setup();
    let fleet = boot(&path, greeter_catalog("Hello")).await;

    let mut not_serving = greeter_app(port, &[GREETER]);
    not_serving["serve"] = json!(false);
    write_config(&path, not_serving);
    fleet.reload().await.unwrap();

    assert_eq!(fleet.listener_generation().await, None);
    assert_eq!(fleet.local_addr().await, None);
    assert!(say_hello(&fleet).await.is_err());

    fleet.stop(None).await.unwrap();
}

#[tokio::test]
async fn test_listener_torn_down_for_xds() {
    let (_temp, path, _port) = setup();
    let fleet = boot(&path, greeter_catalog("Hello")).await;

    let mut xds = greeter_app(0, &[GREETER]);
    xds["uri"] = json!("xds:///greeter");
    write_config(&path, xds);
    fleet.reload().await.unwrap();

    assert_eq!(fleet.listener_generation().await, None);
    // The default transport cannot reach xds apps, so no route remains.
    assert!(matches!(
        fleet.client(GREETER).call("sayHello", json!({})).await,
        Err(FleetError::ServiceNotRegistered { .. })
    ));

    fleet.stop(None).await.unwrap();
}

#[tokio::test]
async fn test_unknown_service_is_not_registered() {
    let (_temp, path, _port) = setup();
    let fleet = boot(&path, greeter_catalog("Hello")).await;

    assert!(matches!(
        fleet.client("nope.Missing").call("anything", json!({})).await,
        Err(FleetError::ServiceNotRegistered { .. })
    ));
    match fleet.client(GREETER).call("sayGoodbye", json!({})).await {
        Err(FleetError::Remote { code, .. }) => assert_eq!(code, -32601),
        other => panic!("Expected MethodNotFound, got: {:?}", other),
    }

    fleet.stop(None).await.unwrap();
}

#[tokio::test]
async fn test_boot_fails_for_undeclared_app() {
    let (_temp, path, _port) = setup();
    let result = FleetOptions::new(&path).app("ghost").boot().await;
    assert!(matches!(result, Err(FleetError::UnknownApp { .. })));
}

#[tokio::test]
async fn test_boot_fails_for_missing_implementation() {
    let (_temp, path, _port) = setup();
    let result = FleetOptions::new(&path)
        .app("greeter")
        .catalog(ServiceCatalog::new())
        .boot()
        .await;
    assert!(matches!(result, Err(FleetError::Lifecycle { .. })));
}

#[tokio::test]
async fn test_failed_reload_keeps_running_instances() {
    let (_temp, path, port) = setup();
    let hooks = Arc::new(Hooks::default());
    let catalog = greeter_catalog("Hello");
    let shared = hooks.clone();
    catalog.register("test.Hooked", move || {
        Arc::new(Hooked {
            hooks: shared.clone(),
        }) as Arc<dyn Service>
    });
    write_config(&path, greeter_app(port, &[GREETER, "test.Hooked"]));
    let fleet = boot(&path, catalog).await;

    write_config(
        &path,
        greeter_app(port, &[GREETER, "test.Hooked", "ghost.Missing"]),
    );
    assert!(matches!(
        fleet.reload().await,
        Err(FleetError::Lifecycle { ref service, .. }) if service == "ghost.Missing"
    ));

    assert_eq!(hooks.destroys.load(Ordering::SeqCst), 0);
    assert_eq!(hooks.inits.load(Ordering::SeqCst), 1);
    assert_eq!(say_hello(&fleet).await.unwrap(), "Hello, World");
    assert_eq!(fleet.listener_generation().await, Some(1));
    assert_eq!(
        fleet.config().app("greeter").unwrap().services,
        vec![GREETER.to_string(), "test.Hooked".to_string()]
    );

    fleet.stop(None).await.unwrap();
    assert_eq!(hooks.destroys.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_hooks_run_on_boot_reload_and_stop() {
    let (_temp, path, port) = setup();
    write_config(&path, greeter_app(port, &[GREETER, "test.Hooked"]));

    let hooks = Arc::new(Hooks::default());
    let catalog = greeter_catalog("Hello");
    let shared = hooks.clone();
    catalog.register("test.Hooked", move || {
        Arc::new(Hooked {
            hooks: shared.clone(),
        }) as Arc<dyn Service>
    });

    let fleet = boot(&path, catalog).await;
    assert_eq!(hooks.inits.load(Ordering::SeqCst), 1);

    fleet.reload().await.unwrap();
    assert_eq!(hooks.destroys.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.inits.load(Ordering::SeqCst), 2);

    fleet.stop(None).await.unwrap();
    assert_eq!(hooks.destroys.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_operator_commands_reach_the_app() {
    let (_temp, path, _port) = setup();
    let catalog = greeter_catalog("Hello");
    let fleet = boot(&path, catalog.clone()).await;

    let operator = GuestConnector::new(
        fleet.guest().address().clone(),
        GuestOptions::default(),
    );
    operator.connect().await.unwrap();

    catalog.register(GREETER, || {
        Arc::new(Greeter { greeting: "Hi" }) as Arc<dyn Service>
    });
    let reloaded = operator
        .request(Command::Reload, Some("greeter"))
        .await
        .unwrap();
    assert_eq!(reloaded, json!("reloaded"));
    assert_eq!(say_hello(&fleet).await.unwrap(), "Hi, World");

    let stopped = operator
        .request(Command::Stop, Some("greeter"))
        .await
        .unwrap();
    assert_eq!(stopped, json!("stopped"));

    tokio::time::timeout(Duration::from_secs(5), fleet.wait_stopped())
        .await
        .unwrap();
    assert!(!fleet.is_host());
    assert!(!fleet.guest().address().exists());
}
