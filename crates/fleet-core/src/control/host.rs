//! Host coordinator.
//!
//! The host owns the control address. One event-loop task holds every guest
//! record and pending command; connection tasks only forward what they read
//! into it, so all membership and correlation state changes in one place and
//! in arrival order.
//!
//! # Commands
//!
//! - `reload`/`stop` naming an app are forwarded to that app's guest under a
//!   fresh correlation id; the guest's reply is relayed to the issuer.
//! - Without an app they are broadcast to every app-bearing guest and the
//!   issuer gets one reply once all of them answered.
//! - `list` broadcasts `stat` and merges the samples with the config.
//!
//! A guest that disconnects without saying goodbye is treated as crashed and
//! its app is spawned again.

use super::address::ControlAddress;
use super::codec::{Command, ControlMessage};
use super::election;
use super::socket::{run_connection, ControlListener, ControlStream, Outbound};
use crate::manifest::{ConfigCell, FleetConfig};
use crate::process::{AppStat, ProcessSample, ProcessSpawner, SpawnRequest};
use crate::{FleetError, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where a process keeps the host it is running, if any.
pub type HostSlot = Arc<Mutex<Option<HostHandle>>>;

type ConnId = u64;
type Outcome = std::result::Result<Value, String>;

enum HostEvent {
    Accepted {
        conn: ConnId,
        outbox: mpsc::UnboundedSender<Outbound>,
    },
    Message {
        conn: ConnId,
        msg: ControlMessage,
    },
    Closed {
        conn: ConnId,
    },
    /// Stop taking commands and report once in-flight ones completed.
    Drain {
        done: oneshot::Sender<()>,
    },
    /// Say goodbye to every guest and end the loop.
    Shutdown,
}

/// Handle to a running host. Dropping it aborts the host without cleanup.
pub struct HostHandle {
    address: ControlAddress,
    events: mpsc::UnboundedSender<HostEvent>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
    loop_task: Option<JoinHandle<()>>,
}

impl HostHandle {
    pub fn address(&self) -> &ControlAddress {
        &self.address
    }

    /// Stop hosting.
    ///
    /// In-flight commands drain first. The listener then closes and the
    /// socket file is removed before guests receive their final goodbye, so
    /// a guest reacting to it finds the address free.
    pub async fn stop(mut self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.events.send(HostEvent::Drain { done: done_tx }).is_ok() {
            let _ = done_rx.await;
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        #[cfg(unix)]
        if let Err(e) = tokio::fs::remove_file(self.address.path()).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove control socket {}: {}", self.address, e);
            }
        }

        let _ = self.events.send(HostEvent::Shutdown);
        if let Some(task) = self.loop_task.take() {
            let _ = task.await;
        }
        info!("Fleet host at {} stopped", self.address);
    }

    /// Tear the host down the way a crash would: no goodbye, and the socket
    /// file stays behind.
    #[doc(hidden)]
    pub async fn terminate(mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(task) = self.loop_task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for HostHandle {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if let Some(task) = self.loop_task.take() {
            task.abort();
        }
    }
}

struct GuestRecord {
    app: Option<String>,
    pid: Option<u32>,
    stopped: bool,
}

struct Connection {
    outbox: mpsc::UnboundedSender<Outbound>,
    guest: Option<GuestRecord>,
    /// The host closed this connection itself.
    closing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    Single,
    Broadcast,
    List,
}

/// A command issued by one connection, waiting on one or more guests.
struct PendingCommand {
    issuer: ConnId,
    reply_id: Option<String>,
    kind: CommandKind,
    outstanding: usize,
    outcomes: HashMap<String, Outcome>,
}

/// A correlation id the host is waiting on.
struct PendingReply {
    command: u64,
    conn: ConnId,
    app: String,
}

/// State owned by the host event loop.
pub struct HostCoordinator {
    app: Option<String>,
    config: ConfigCell,
    spawner: Arc<dyn ProcessSpawner>,
    connections: HashMap<ConnId, Connection>,
    commands: HashMap<u64, PendingCommand>,
    pending: HashMap<String, PendingReply>,
    next_command: u64,
    stopping: bool,
    drain_waiter: Option<oneshot::Sender<()>>,
}

impl HostCoordinator {
    /// Try to become host at `address`.
    ///
    /// Returns `Ok(None)` when another live process already is.
    pub async fn start(
        address: ControlAddress,
        app: Option<String>,
        config: ConfigCell,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Result<Option<HostHandle>> {
        let Some(listener) = election::claim(&address).await? else {
            debug!("Control address {} is held by another host", address);
            return Ok(None);
        };
        info!(
            "Hosting fleet control plane at {} (app: {})",
            address,
            app.as_deref().unwrap_or("-")
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let coordinator = HostCoordinator {
            app,
            config,
            spawner,
            connections: HashMap::new(),
            commands: HashMap::new(),
            pending: HashMap::new(),
            next_command: 0,
            stopping: false,
            drain_waiter: None,
        };
        let loop_task = tokio::spawn(coordinator.run(events_rx));
        let accept_task = tokio::spawn(accept_loop(listener, events_tx.clone(), shutdown_rx));

        Ok(Some(HostHandle {
            address,
            events: events_tx,
            shutdown_tx: Some(shutdown_tx),
            accept_task: Some(accept_task),
            loop_task: Some(loop_task),
        }))
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<HostEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                HostEvent::Accepted { conn, outbox } => {
                    self.connections.insert(
                        conn,
                        Connection {
                            outbox,
                            guest: None,
                            closing: false,
                        },
                    );
                }
                HostEvent::Message { conn, msg } => self.on_message(conn, msg),
                HostEvent::Closed { conn } => self.on_closed(conn),
                HostEvent::Drain { done } => {
                    self.stopping = true;
                    self.drain_waiter = Some(done);
                    self.check_drained();
                }
                HostEvent::Shutdown => {
                    self.farewell();
                    break;
                }
            }
        }
    }

    fn on_message(&mut self, conn: ConnId, msg: ControlMessage) {
        if !self.connections.contains_key(&conn) {
            return;
        }
        match msg.cmd {
            Command::Handshake => self.on_handshake(conn, msg),
            Command::Goodbye => {
                if let Some(guest) = self
                    .connections
                    .get_mut(&conn)
                    .and_then(|c| c.guest.as_mut())
                {
                    debug!(
                        "Guest '{}' said goodbye",
                        guest.app.as_deref().unwrap_or("-")
                    );
                    guest.stopped = true;
                }
            }
            Command::Reload | Command::Stop => self.on_command(conn, msg),
            Command::List => self.on_list(conn, msg),
            Command::Reply => self.on_reply(msg),
            Command::Stat => warn!("Ignoring unexpected stat from connection {}", conn),
        }
    }

    fn on_handshake(&mut self, conn: ConnId, msg: ControlMessage) {
        if self
            .connections
            .get(&conn)
            .is_some_and(|c| c.guest.is_some())
        {
            warn!("Ignoring repeated handshake on connection {}", conn);
            return;
        }
        if self.stopping {
            self.reject(conn, "Fleet host is stopping".to_string());
            return;
        }
        if let Some(app) = &msg.app {
            if self.config.current().app(app).is_none() {
                self.reject(conn, FleetError::UnknownApp { app: app.clone() }.to_string());
                return;
            }
            if self.live_guest(app).is_some() {
                self.reject(conn, format!("App '{}' is already registered", app));
                return;
            }
        }

        info!(
            "Guest joined: app {} (pid {})",
            msg.app.as_deref().unwrap_or("-"),
            msg.pid.map_or_else(|| "?".to_string(), |p| p.to_string())
        );
        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.guest = Some(GuestRecord {
                app: msg.app,
                pid: msg.pid,
                stopped: false,
            });
        }
        self.send(
            conn,
            ControlMessage::handshake(self.app.clone(), std::process::id()),
        );
    }

    fn reject(&mut self, conn: ConnId, reason: String) {
        warn!("Rejecting control connection {}: {}", conn, reason);
        let reply = ControlMessage::handshake(self.app.clone(), std::process::id())
            .with_error(reason)
            .finished();
        self.send(conn, reply);
        self.close(conn);
    }

    fn on_command(&mut self, conn: ConnId, msg: ControlMessage) {
        let reply_id = msg.msg_id.clone();
        if self.stopping {
            self.send(
                conn,
                ControlMessage::reply(reply_id, Err("Fleet host is stopping".to_string())),
            );
            return;
        }
        let config = self.config.current();

        let Some(app) = msg.app else {
            let id = self.open_command(conn, reply_id, CommandKind::Broadcast);
            for (target, app, stopped) in self.app_guests(&config) {
                if stopped {
                    self.note_outcome(id, app, Ok(json!("stopped")));
                } else {
                    self.dispatch(id, target, &app, msg.cmd);
                }
            }
            self.settle(id);
            return;
        };

        if config.app(&app).is_none() {
            let error = FleetError::UnknownApp { app }.to_string();
            warn!("Closing connection {} after command for undeclared app: {}", conn, error);
            self.send(conn, ControlMessage::reply(reply_id, Err(error)).finished());
            self.close(conn);
            return;
        }
        match self.live_guest(&app) {
            Some(target) => {
                let id = self.open_command(conn, reply_id, CommandKind::Single);
                self.dispatch(id, target, &app, msg.cmd);
            }
            None => {
                let error = FleetError::NotRunning { app }.to_string();
                self.send(conn, ControlMessage::reply(reply_id, Err(error)));
            }
        }
    }

    fn on_list(&mut self, conn: ConnId, msg: ControlMessage) {
        if self.stopping {
            self.send(
                conn,
                ControlMessage::reply(msg.msg_id, Err("Fleet host is stopping".to_string())),
            );
            return;
        }
        let config = self.config.current();
        let id = self.open_command(conn, msg.msg_id, CommandKind::List);
        for (target, app, stopped) in self.app_guests(&config) {
            if !stopped {
                self.dispatch(id, target, &app, Command::Stat);
            }
        }
        self.settle(id);
    }

    fn on_reply(&mut self, msg: ControlMessage) {
        let Some(msg_id) = msg.msg_id.as_deref() else {
            warn!("Ignoring reply without msgId");
            return;
        };
        let Some(pending) = self.pending.remove(msg_id) else {
            debug!("Ignoring reply {} with nothing pending", msg_id);
            return;
        };
        self.resolve(pending, msg.into_outcome());
    }

    fn on_closed(&mut self, conn: ConnId) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };
        let graceful = self.stopping
            || connection.closing
            || connection.guest.as_ref().map_or(true, |g| g.stopped);

        let owed: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.conn == conn)
            .map(|(id, _)| id.clone())
            .collect();
        for id in owed {
            if let Some(pending) = self.pending.remove(&id) {
                let outcome = if graceful {
                    Ok(json!("stopped"))
                } else {
                    Err(format!("App '{}' disconnected", pending.app))
                };
                self.resolve(pending, outcome);
            }
        }

        let Some(GuestRecord {
            app: Some(app),
            pid,
            ..
        }) = connection.guest
        else {
            return;
        };
        if graceful {
            debug!("Guest '{}' left", app);
            return;
        }
        warn!(
            "App '{}' (pid {}) disconnected without goodbye; respawning",
            app,
            pid.map_or_else(|| "?".to_string(), |p| p.to_string())
        );
        self.respawn(&app);
    }

    fn respawn(&self, app: &str) {
        let config = self.config.current();
        let spawned = SpawnRequest::for_app(&config, app).and_then(|req| self.spawner.spawn(&req));
        match spawned {
            Ok(pid) => info!("Respawned app '{}' (pid {})", app, pid),
            Err(e) => error!("Failed to respawn app '{}': {}", app, e),
        }
    }

    fn open_command(&mut self, issuer: ConnId, reply_id: Option<String>, kind: CommandKind) -> u64 {
        self.next_command += 1;
        let id = self.next_command;
        self.commands.insert(
            id,
            PendingCommand {
                issuer,
                reply_id,
                kind,
                outstanding: 0,
                outcomes: HashMap::new(),
            },
        );
        id
    }

    fn dispatch(&mut self, command: u64, target: ConnId, app: &str, cmd: Command) {
        let msg_id = Uuid::new_v4().to_string();
        self.pending.insert(
            msg_id.clone(),
            PendingReply {
                command,
                conn: target,
                app: app.to_string(),
            },
        );
        if let Some(pending) = self.commands.get_mut(&command) {
            pending.outstanding += 1;
        }
        self.send(target, ControlMessage::new(cmd).with_app(app).with_msg_id(msg_id));
    }

    fn note_outcome(&mut self, command: u64, app: String, outcome: Outcome) {
        if let Some(pending) = self.commands.get_mut(&command) {
            pending.outcomes.insert(app, outcome);
        }
    }

    /// Record the answer to one dispatched correlation id.
    fn resolve(&mut self, pending: PendingReply, outcome: Outcome) {
        if let Some(command) = self.commands.get_mut(&pending.command) {
            command.outstanding = command.outstanding.saturating_sub(1);
        }
        self.note_outcome(pending.command, pending.app, outcome);
        self.settle(pending.command);
    }

    /// Complete `command` if nothing is outstanding.
    fn settle(&mut self, command: u64) {
        let done = self
            .commands
            .get(&command)
            .is_some_and(|c| c.outstanding == 0);
        if !done {
            return;
        }
        if let Some(pending) = self.commands.remove(&command) {
            self.complete(pending);
        }
        self.check_drained();
    }

    fn complete(&mut self, pending: PendingCommand) {
        let config = self.config.current();
        let outcome = match pending.kind {
            CommandKind::Single => pending
                .outcomes
                .into_values()
                .next()
                .unwrap_or(Ok(Value::Null)),
            CommandKind::Broadcast => Ok(Value::Array(
                ordered(&config, pending.outcomes)
                    .into_iter()
                    .map(|(app, outcome)| match outcome {
                        Ok(result) => json!({"app": app, "result": result}),
                        Err(error) => json!({"app": app, "error": error}),
                    })
                    .collect(),
            )),
            CommandKind::List => list_rows(&config, &pending.outcomes),
        };
        self.send(pending.issuer, ControlMessage::reply(pending.reply_id, outcome));
    }

    fn check_drained(&mut self) {
        if self.stopping && self.commands.is_empty() {
            if let Some(waiter) = self.drain_waiter.take() {
                let _ = waiter.send(());
            }
        }
    }

    fn farewell(&mut self) {
        for (_, connection) in self.connections.drain() {
            let _ = connection.outbox.send(Outbound::Message(
                ControlMessage::goodbye("host stopping").finished(),
            ));
            let _ = connection.outbox.send(Outbound::Close(None));
        }
    }

    /// The connection of the running (not stopped) guest for `app`.
    fn live_guest(&self, app: &str) -> Option<ConnId> {
        self.connections.iter().find_map(|(conn, c)| match &c.guest {
            Some(g) if !g.stopped && g.app.as_deref() == Some(app) => Some(*conn),
            _ => None,
        })
    }

    /// Every app-bearing guest, in config order.
    fn app_guests(&self, config: &FleetConfig) -> Vec<(ConnId, String, bool)> {
        let mut guests: Vec<(usize, ConnId, String, bool)> = self
            .connections
            .iter()
            .filter_map(|(conn, c)| {
                let guest = c.guest.as_ref()?;
                let app = guest.app.clone()?;
                let rank = config
                    .apps
                    .iter()
                    .position(|a| a.name == app)
                    .unwrap_or(usize::MAX);
                Some((rank, *conn, app, guest.stopped))
            })
            .collect();
        // Stopped records first so a live guest of the same app reports last.
        guests.sort_by_key(|(rank, conn, _, stopped)| (*rank, !*stopped, *conn));
        guests
            .into_iter()
            .map(|(_, conn, app, stopped)| (conn, app, stopped))
            .collect()
    }

    fn send(&self, conn: ConnId, msg: ControlMessage) {
        if let Some(connection) = self.connections.get(&conn) {
            let _ = connection.outbox.send(Outbound::Message(msg));
        }
    }

    fn close(&mut self, conn: ConnId) {
        if let Some(connection) = self.connections.get_mut(&conn) {
            connection.closing = true;
            let _ = connection.outbox.send(Outbound::Close(None));
        }
    }
}

/// Outcomes ordered by the config's app order; unknown apps go last by name.
fn ordered(config: &FleetConfig, mut outcomes: HashMap<String, Outcome>) -> Vec<(String, Outcome)> {
    let mut rows = Vec::with_capacity(outcomes.len());
    for app in &config.apps {
        if let Some(outcome) = outcomes.remove(&app.name) {
            rows.push((app.name.clone(), outcome));
        }
    }
    let mut rest: Vec<_> = outcomes.into_iter().collect();
    rest.sort_by(|a, b| a.0.cmp(&b.0));
    rows.extend(rest);
    rows
}

fn list_rows(config: &FleetConfig, outcomes: &HashMap<String, Outcome>) -> Outcome {
    let rows: Vec<AppStat> = config
        .apps
        .iter()
        .map(|app| {
            let sample = outcomes
                .get(&app.name)
                .and_then(|outcome| outcome.as_ref().ok())
                .and_then(|value| serde_json::from_value::<ProcessSample>(value.clone()).ok());
            AppStat::new(app, sample)
        })
        .collect();
    serde_json::to_value(rows).map_err(|e| e.to_string())
}

async fn accept_loop(
    mut listener: ControlListener,
    events: mpsc::UnboundedSender<HostEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut next_conn: ConnId = 0;
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("Control listener shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    next_conn += 1;
                    tokio::spawn(serve_connection(next_conn, stream, events.clone()));
                }
                Err(e) => error!("Control accept error: {}", e),
            }
        }
    }
}

async fn serve_connection(
    conn: ConnId,
    stream: ControlStream,
    events: mpsc::UnboundedSender<HostEvent>,
) {
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    if events
        .send(HostEvent::Accepted {
            conn,
            outbox: outbox_tx,
        })
        .is_err()
    {
        return;
    }
    run_connection(stream, outbox_rx, |msg| {
        events.send(HostEvent::Message { conn, msg }).is_ok()
    })
    .await;
    let _ = events.send(HostEvent::Closed { conn });
}
