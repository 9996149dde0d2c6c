//! Fleet Core - runtime coordination for a fleet of cooperating RPC processes.
//!
//! Every process in a fleet reads the same JSON config. The first app to
//! bind the control socket next to that config becomes the host; the others
//! join it as guests. Through the host, an operator can reload, stop or list
//! apps across the fleet. Each app serves its declared services on its own
//! listener and reaches other apps' services through a route registry.
//!
//! # Example
//!
//! ```rust,ignore
//! use fleet_core::{FleetOptions, Service, ServiceCatalog};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> fleet_core::Result<()> {
//!     let catalog = ServiceCatalog::new();
//!     catalog.register("helloworld.Greeter", || Arc::new(Greeter) as Arc<dyn Service>);
//!
//!     let fleet = FleetOptions::from_env()?.catalog(catalog).boot().await?;
//!
//!     // Call a service wherever in the fleet it is served
//!     let reply = fleet
//!         .client("helloworld.Greeter")
//!         .call("sayHello", serde_json::json!({"name": "World"}))
//!         .await?;
//!     println!("{}", reply["message"]);
//!
//!     fleet.wait_stopped().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod control;
pub mod error;
pub mod manifest;
pub mod process;
pub mod routing;
pub mod rpc;
pub mod service;

mod lifecycle;

// Re-export commonly used types
pub use control::{Command, ControlAddress, ControlMessage, GuestConnector, GuestOptions, GuestState};
pub use error::{FleetError, Result};
pub use lifecycle::{FleetApp, FleetOptions};
pub use manifest::{AppConfig, FleetConfig, Scheme};
pub use process::{AppStat, CommandSpawner, ProcessSpawner, SpawnRequest};
pub use routing::{ClientRegistry, ServiceClient};
pub use rpc::{ChannelState, JsonRpcTransport, RpcChannel, RpcListener, RpcTransport, ServerSpec};
pub use service::{Service, ServiceCatalog, ServiceContext};
