//! TCP listener of the default transport.
//!
//! Accepts connections and dispatches framed JSON-RPC requests to the
//! service implementations currently installed on the listener.
//!
//! # Thread Safety
//!
//! Each connection is handled in its own spawned task. The service map sits
//! behind a `RwLock` so a reload can swap implementations while the listener
//! keeps accepting.

use super::protocol::{read_frame, write_json, RpcCall, RpcReply, JSONRPC_VERSION};
use super::transport::{RpcListener, ServiceMap};
use crate::config::RpcConfig;
use crate::{FleetError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type SharedServices = Arc<RwLock<ServiceMap>>;

/// Handle to a running listener. Dropping stops it.
pub struct RpcServerHandle {
    addr: SocketAddr,
    services: SharedServices,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RpcServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn signal_shutdown(&self) -> Option<JoinHandle<()>> {
        let tx = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
        self.task_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.signal_shutdown() {
            handle.abort();
        }
    }
}

#[async_trait]
impl RpcListener for RpcServerHandle {
    fn local_addr(&self) -> String {
        self.addr.to_string()
    }

    fn set_services(&self, services: ServiceMap) {
        let names: Vec<&String> = services.keys().collect();
        debug!("Listener {} now serving {:?}", self.addr, names);
        *self.services.write().unwrap_or_else(|e| e.into_inner()) = services;
    }

    async fn shutdown(&self) {
        if let Some(handle) = self.signal_shutdown() {
            let _ = handle.await;
        }
        info!("Listener {} closed", self.addr);
    }
}

/// JSON-RPC listener.
pub struct RpcServer;

impl RpcServer {
    /// Bind `address` and start accepting in a background task.
    pub async fn start(address: &str) -> Result<RpcServerHandle> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| FleetError::network(format!("Failed to bind {}", address), e))?;
        let addr = listener.local_addr()?;

        info!("RPC listener bound on {}", addr);

        let services: SharedServices = Arc::new(RwLock::new(ServiceMap::new()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            services.clone(),
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(RpcServerHandle {
            addr,
            services,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            conn_shutdown_tx,
            task_handle: Mutex::new(Some(task_handle)),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        services: SharedServices,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!("RPC accept loop stopping");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= RpcConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting RPC connection from {}: at max capacity ({})",
                                    peer_addr,
                                    RpcConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let services = services.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("RPC connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, &services, &mut conn_shutdown).await {
                                    debug!("RPC connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("RPC accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        services: &RwLock<ServiceMap>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.split();

        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result? {
                        Some(f) => f,
                        None => return Ok(()),
                    }
                }
                _ = shutdown_rx.changed() => {
                    return Ok(());
                }
            };

            let reply = Self::process_request(&frame, services).await;
            write_json(&mut writer, &reply).await?;
        }
    }

    async fn process_request(frame: &[u8], services: &RwLock<ServiceMap>) -> RpcReply {
        let call: RpcCall = match serde_json::from_slice(frame) {
            Ok(call) => call,
            Err(e) => return RpcReply::rejected(None, -32700, format!("Parse error: {}", e)),
        };
        if call.jsonrpc != JSONRPC_VERSION {
            return RpcReply::rejected(call.id, -32600, "Invalid Request: expected jsonrpc 2.0");
        }

        let outcome = Self::dispatch(&call, services).await;
        RpcReply::from_outcome(call.id, outcome)
    }

    async fn dispatch(call: &RpcCall, services: &RwLock<ServiceMap>) -> Result<Value> {
        let (service_name, method) = call.target().ok_or_else(|| FleetError::InvalidParams {
            message: format!(
                "Method '{}' is not of the form <service>/<method>",
                call.method
            ),
        })?;

        let service = services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(service_name)
            .cloned()
            .ok_or_else(|| FleetError::ServiceNotRegistered {
                service: service_name.to_string(),
            })?;

        service.invoke(method, call.payload()).await
    }
}
