//! Guest connector: one process's membership in the control plane.
//!
//! A guest handshakes with the host, answers `stat` itself and hands `stop`
//! and `reload` to its owner over a channel. When the host goes away the
//! guest reconnects, first trying to become host itself when it is allowed
//! to.

use super::address::ControlAddress;
use super::codec::{Command, ControlMessage};
use super::election::{self, HostElection};
use super::socket::{self, run_connection, ConnectionEnd, ControlStream, Outbound};
use crate::config::ControlConfig;
use crate::process::ProcessMetrics;
use crate::{FleetError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestState {
    Disconnected,
    Connected,
    /// Terminal; reached through [`GuestConnector::leave`].
    Closed,
}

/// A `stop` or `reload` delivered by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCommand {
    pub cmd: Command,
    /// Correlation id the eventual reply must carry.
    pub msg_id: Option<String>,
}

pub struct GuestOptions {
    /// App this process runs, announced in the handshake.
    pub app: Option<String>,
    pub reconnect_interval: Duration,
    /// Present when this process may take over as host.
    pub election: Option<Arc<dyn HostElection>>,
    /// Receives `stop`/`reload`; without it those commands are refused.
    pub commands: Option<mpsc::UnboundedSender<InboundCommand>>,
}

impl Default for GuestOptions {
    fn default() -> Self {
        Self {
            app: None,
            reconnect_interval: ControlConfig::RECONNECT_INTERVAL,
            election: None,
            commands: None,
        }
    }
}

/// Host that went away while we were connected to it.
struct LostHost {
    app: Option<String>,
    graceful: bool,
}

struct Shared {
    state: GuestState,
    outbox: Option<mpsc::UnboundedSender<Outbound>>,
    pending: HashMap<String, oneshot::Sender<ControlMessage>>,
    host_app: Option<String>,
    retry: Option<JoinHandle<()>>,
    generation: u64,
}

struct Inner {
    address: ControlAddress,
    app: Option<String>,
    reconnect_interval: Duration,
    election: Option<Arc<dyn HostElection>>,
    commands: Option<mpsc::UnboundedSender<InboundCommand>>,
    metrics: Mutex<ProcessMetrics>,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<GuestState>,
    connect_lock: tokio::sync::Mutex<()>,
}

/// Control-plane client of one process.
#[derive(Clone)]
pub struct GuestConnector {
    inner: Arc<Inner>,
}

impl GuestConnector {
    pub fn new(address: ControlAddress, options: GuestOptions) -> Self {
        let (state_tx, _) = watch::channel(GuestState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                address,
                app: options.app,
                reconnect_interval: options.reconnect_interval,
                election: options.election,
                commands: options.commands,
                metrics: Mutex::new(ProcessMetrics::current()),
                shared: Mutex::new(Shared {
                    state: GuestState::Disconnected,
                    outbox: None,
                    pending: HashMap::new(),
                    host_app: None,
                    retry: None,
                    generation: 0,
                }),
                state_tx,
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> GuestState {
        self.inner.lock().state
    }

    /// App name the current host announced in its handshake.
    pub fn host_app(&self) -> Option<String> {
        self.inner.lock().host_app.clone()
    }

    pub fn address(&self) -> &ControlAddress {
        &self.inner.address
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<GuestState> {
        self.inner.state_tx.subscribe()
    }

    /// Connect, or keep retrying in the background if no host answers.
    ///
    /// Only an explicit rejection by the host is returned as an error.
    pub async fn join(&self) -> Result<()> {
        match self.inner.connect().await {
            Ok(()) => Ok(()),
            Err(e @ FleetError::Rejected { .. }) => Err(e),
            Err(e) => {
                debug!(
                    "Joining {} failed ({}); retrying every {:?}",
                    self.inner.address, e, self.inner.reconnect_interval
                );
                let mut shared = self.inner.lock();
                self.inner.spawn_retry(&mut shared, None);
                Ok(())
            }
        }
    }

    /// Connect once and wait for the host's handshake.
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    /// Send a command to the host and wait for its reply.
    pub async fn request(&self, cmd: Command, app: Option<&str>) -> Result<Value> {
        let msg_id = Uuid::new_v4().to_string();
        let mut msg = ControlMessage::new(cmd).with_msg_id(msg_id.clone());
        msg.app = app.map(str::to_string);

        let (tx, rx) = oneshot::channel();
        {
            let mut shared = self.inner.lock();
            let outbox = shared.outbox.clone().ok_or_else(|| FleetError::Network {
                message: format!("Not connected to {}", self.inner.address),
                source: None,
            })?;
            shared.pending.insert(msg_id, tx);
            outbox
                .send(Outbound::Message(msg))
                .map_err(|_| FleetError::Network {
                    message: "Control connection closed".to_string(),
                    source: None,
                })?;
        }

        let reply = rx.await.map_err(|_| FleetError::Network {
            message: "Control connection closed before the reply arrived".to_string(),
            source: None,
        })?;
        reply.into_outcome().map_err(|message| FleetError::Remote {
            code: -32603,
            message,
        })
    }

    /// Answer a command the host sent us. Returns false when not connected.
    pub fn reply(&self, msg_id: Option<String>, outcome: std::result::Result<Value, String>) -> bool {
        self.inner.send(ControlMessage::reply(msg_id, outcome))
    }

    /// Leave the control plane for good.
    ///
    /// Sends `goodbye` (and a reply for `reply_id`, if any) and waits until
    /// both are flushed. Returns whether a connection was open.
    pub async fn leave(&self, reason: &str, reply_id: Option<String>) -> bool {
        let (outbox, retry) = {
            let mut shared = self.inner.lock();
            let was_connected = shared.state == GuestState::Connected;
            shared.state = GuestState::Closed;
            shared.pending.clear();
            let outbox = shared.outbox.take().filter(|_| was_connected);
            (outbox, shared.retry.take())
        };
        self.inner.state_tx.send_replace(GuestState::Closed);
        if let Some(retry) = retry {
            retry.abort();
        }
        let Some(outbox) = outbox else {
            return false;
        };

        let _ = outbox.send(Outbound::Message(ControlMessage::goodbye(reason)));
        if let Some(id) = reply_id {
            let _ = outbox.send(Outbound::Message(ControlMessage::reply(
                Some(id),
                Ok(Value::String("stopped".to_string())),
            )));
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if outbox.send(Outbound::Close(Some(ack_tx))).is_ok() {
            let _ = ack_rx.await;
        }
        info!("Left control plane at {} ({})", self.inner.address, reason);
        true
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, shared: &mut Shared, state: GuestState) {
        shared.state = state;
        self.state_tx.send_replace(state);
    }

    fn send(&self, msg: ControlMessage) -> bool {
        let shared = self.lock();
        match &shared.outbox {
            Some(outbox) if shared.state == GuestState::Connected => {
                outbox.send(Outbound::Message(msg)).is_ok()
            }
            _ => false,
        }
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        let _serial = self.connect_lock.lock().await;
        match self.lock().state {
            GuestState::Connected => return Ok(()),
            GuestState::Closed => {
                return Err(FleetError::Protocol {
                    message: "Guest connector is closed".to_string(),
                })
            }
            GuestState::Disconnected => {}
        }
        if !self.address.exists() {
            return Err(FleetError::Network {
                message: format!("No fleet host at {}", self.address),
                source: None,
            });
        }

        let stream = match tokio::time::timeout(
            ControlConfig::CONNECT_TIMEOUT,
            socket::connect(&self.address),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.remove_stale().await;
                return Err(FleetError::network(
                    format!("Failed to connect to {}", self.address),
                    e,
                ));
            }
            Err(_) => {
                self.remove_stale().await;
                return Err(FleetError::Timeout(ControlConfig::CONNECT_TIMEOUT));
            }
        };

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (handshake_tx, handshake_rx) = oneshot::channel();
        let generation = {
            let mut shared = self.lock();
            shared.generation += 1;
            shared.generation
        };
        let _ = outbox_tx.send(Outbound::Message(ControlMessage::handshake(
            self.app.clone(),
            std::process::id(),
        )));
        let task = tokio::spawn(self.clone().run(
            stream,
            outbox_rx,
            outbox_tx.clone(),
            handshake_tx,
            generation,
        ));

        let reply = match tokio::time::timeout(ControlConfig::HANDSHAKE_TIMEOUT, handshake_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                self.remove_stale().await;
                return Err(FleetError::Network {
                    message: format!("{} closed before the handshake completed", self.address),
                    source: None,
                });
            }
            Err(_) => {
                task.abort();
                self.remove_stale().await;
                return Err(FleetError::Timeout(ControlConfig::HANDSHAKE_TIMEOUT));
            }
        };
        if let Some(reason) = reply.error {
            warn!("Host at {} rejected this guest: {}", self.address, reason);
            return Err(FleetError::Rejected { reason });
        }

        let mut shared = self.lock();
        if shared.state == GuestState::Closed || shared.generation != generation {
            task.abort();
            return Err(FleetError::Protocol {
                message: "Guest connector closed while connecting".to_string(),
            });
        }
        shared.outbox = Some(outbox_tx);
        shared.host_app = reply.app;
        self.set_state(&mut shared, GuestState::Connected);
        info!(
            "Joined fleet host at {} (host app: {})",
            self.address,
            shared.host_app.as_deref().unwrap_or("-")
        );
        Ok(())
    }

    async fn remove_stale(&self) {
        if let Err(e) = election::remove_stale(&self.address).await {
            debug!("Stale address cleanup for {} failed: {}", self.address, e);
        }
    }

    async fn run(
        self: Arc<Self>,
        stream: ControlStream,
        outbox_rx: mpsc::UnboundedReceiver<Outbound>,
        outbox_tx: mpsc::UnboundedSender<Outbound>,
        handshake_tx: oneshot::Sender<ControlMessage>,
        generation: u64,
    ) {
        let mut handshake_tx = Some(handshake_tx);
        let mut graceful = false;
        let end = run_connection(stream, outbox_rx, |msg| {
            let fin = msg.fin;
            if msg.cmd == Command::Handshake {
                match handshake_tx.take() {
                    Some(tx) => {
                        let _ = tx.send(msg);
                    }
                    None => warn!("Ignoring repeated handshake from host"),
                }
            } else if msg.cmd == Command::Goodbye {
                graceful = true;
                return false;
            } else {
                self.handle(msg, &outbox_tx);
            }
            if fin {
                graceful = true;
            }
            !fin
        })
        .await;
        self.on_disconnect(generation, graceful || end == ConnectionEnd::Local);
    }

    fn handle(&self, msg: ControlMessage, outbox: &mpsc::UnboundedSender<Outbound>) {
        match msg.cmd {
            Command::Reload | Command::Stop => {
                let command = InboundCommand {
                    cmd: msg.cmd,
                    msg_id: msg.msg_id.clone(),
                };
                let delivered = self
                    .commands
                    .as_ref()
                    .is_some_and(|tx| tx.send(command).is_ok());
                if !delivered {
                    let reply = ControlMessage::reply(
                        msg.msg_id,
                        Err("This process does not accept commands".to_string()),
                    );
                    let _ = outbox.send(Outbound::Message(reply));
                }
            }
            Command::Stat => {
                let sample = self
                    .metrics
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .sample();
                let outcome = serde_json::to_value(sample).map_err(|e| e.to_string());
                let _ = outbox.send(Outbound::Message(ControlMessage::reply(msg.msg_id, outcome)));
            }
            Command::Reply => {
                let Some(msg_id) = msg.msg_id.clone() else {
                    warn!("Ignoring reply without msgId");
                    return;
                };
                let waiter = self.lock().pending.remove(&msg_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(msg);
                    }
                    None => debug!("Ignoring reply {} with nothing pending", msg_id),
                }
            }
            other => warn!("Ignoring unexpected {:?} from host", other),
        }
    }

    fn on_disconnect(self: &Arc<Self>, generation: u64, graceful: bool) {
        let mut shared = self.lock();
        if shared.generation != generation {
            return;
        }
        let was_connected = shared.state == GuestState::Connected;
        shared.outbox = None;
        shared.pending.clear();
        if shared.state == GuestState::Closed || !was_connected {
            return;
        }
        self.set_state(&mut shared, GuestState::Disconnected);
        let lost = LostHost {
            app: shared.host_app.take(),
            graceful,
        };
        if graceful {
            info!("Fleet host at {} said goodbye; reconnecting", self.address);
        } else {
            warn!("Lost fleet host at {}; reconnecting", self.address);
        }
        self.spawn_retry(&mut shared, Some(lost));
    }

    fn spawn_retry(self: &Arc<Self>, shared: &mut Shared, lost: Option<LostHost>) {
        if shared.state == GuestState::Closed {
            return;
        }
        let handle = tokio::spawn(self.clone().retry_loop(lost));
        if let Some(previous) = shared.retry.replace(handle) {
            previous.abort();
        }
    }

    /// `lost` is handed to the first election this guest wins, however many
    /// attempts lose before it.
    async fn retry_loop(self: Arc<Self>, mut lost: Option<LostHost>) {
        loop {
            if let Some(election) = &self.election {
                match election.try_become_host().await {
                    Ok(true) => {
                        if let Some(host) = lost.take() {
                            self.respawn_lost_host(election.as_ref(), host);
                        }
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Host election at {} failed: {}", self.address, e),
                }
            }

            match self.connect().await {
                Ok(()) => return,
                Err(FleetError::Rejected { reason }) => {
                    error!("Giving up on {}: {}", self.address, reason);
                    return;
                }
                Err(e) => debug!("Reconnect to {} failed: {}", self.address, e),
            }
            if self.lock().state == GuestState::Closed {
                return;
            }
            tokio::time::sleep(self.reconnect_interval).await;
        }
    }

    fn respawn_lost_host(&self, election: &dyn HostElection, host: LostHost) {
        if host.graceful {
            return;
        }
        match host.app {
            Some(app) if Some(&app) != self.app.as_ref() => {
                info!("Took over as host; restarting former host app '{}'", app);
                election.respawn(&app);
            }
            _ => {}
        }
    }
}
