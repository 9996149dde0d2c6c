//! Host election.
//!
//! Whoever binds the control address is host. Binding alone cannot tell a
//! live host from a socket file left by a crashed one, so stale-file removal
//! and the bind that follows run under an advisory file lock. Guests racing
//! for hostship after a crash therefore take turns: the first reclaims the
//! address, the rest find a live host behind it.

use super::address::ControlAddress;
use super::host::{HostCoordinator, HostSlot};
use super::socket::{self, ControlListener};
use crate::config::ControlConfig;
use crate::manifest::ConfigCell;
use crate::process::{ProcessSpawner, SpawnRequest};
use crate::{FleetError, Result};
use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Exclusive advisory lock on an address's lock file. Released on drop.
#[derive(Debug)]
pub struct ElectionLock {
    file: File,
}

impl ElectionLock {
    pub async fn acquire(addr: &ControlAddress) -> Result<Self> {
        let path = addr.lock_path();
        let lock_path = path.clone();
        let file = tokio::task::spawn_blocking(move || -> io::Result<File> {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|e| FleetError::Other(format!("Election lock task failed: {}", e)))?
        .map_err(|e| FleetError::io_with_path(e, path))?;
        Ok(Self { file })
    }
}

impl Drop for ElectionLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Bind the control address, reclaiming it from a dead host if needed.
///
/// `Ok(None)` means a live host already holds the address.
pub async fn claim(addr: &ControlAddress) -> Result<Option<ControlListener>> {
    let _lock = ElectionLock::acquire(addr).await?;
    match ControlListener::bind(addr) {
        Ok(listener) => Ok(Some(listener)),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            if reclaim_if_stale(addr).await? {
                ControlListener::bind(addr)
                    .map(Some)
                    .map_err(|e| FleetError::network(format!("Failed to bind {}", addr), e))
            } else {
                Ok(None)
            }
        }
        Err(e) => Err(FleetError::network(format!("Failed to bind {}", addr), e)),
    }
}

/// Remove the address artifact if nothing answers behind it.
///
/// Returns whether a stale artifact was removed.
pub async fn remove_stale(addr: &ControlAddress) -> Result<bool> {
    let _lock = ElectionLock::acquire(addr).await?;
    reclaim_if_stale(addr).await
}

async fn reclaim_if_stale(addr: &ControlAddress) -> Result<bool> {
    if cfg!(windows) || !addr.exists() {
        return Ok(false);
    }
    let probe = tokio::time::timeout(ControlConfig::CONNECT_TIMEOUT, socket::connect(addr)).await;
    match probe {
        Ok(Ok(_stream)) => Ok(false),
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            match tokio::fs::remove_file(addr.path()).await {
                Ok(()) => {
                    info!("Removed stale control socket {}", addr);
                    Ok(true)
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(FleetError::io_with_path(e, addr.path())),
            }
        }
        Ok(Err(e)) => {
            debug!("Probe of {} failed: {}", addr, e);
            Ok(false)
        }
        Err(_) => {
            warn!("Probe of {} timed out; leaving it in place", addr);
            Ok(false)
        }
    }
}

/// A process's right to seek hostship.
#[async_trait]
pub trait HostElection: Send + Sync {
    /// Try to become host. `Ok(false)` when another live process holds it.
    async fn try_become_host(&self) -> Result<bool>;

    /// Start `app` again after its host process vanished without a goodbye.
    fn respawn(&self, app: &str);
}

/// Election backed by a real [`HostCoordinator`].
pub struct HostCandidate {
    address: ControlAddress,
    app: Option<String>,
    config: ConfigCell,
    spawner: Arc<dyn ProcessSpawner>,
    slot: HostSlot,
}

impl HostCandidate {
    pub fn new(
        address: ControlAddress,
        app: Option<String>,
        config: ConfigCell,
        spawner: Arc<dyn ProcessSpawner>,
        slot: HostSlot,
    ) -> Self {
        Self {
            address,
            app,
            config,
            spawner,
            slot,
        }
    }

    pub fn is_host(&self) -> bool {
        self.slot
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }
}

#[async_trait]
impl HostElection for HostCandidate {
    async fn try_become_host(&self) -> Result<bool> {
        if self.is_host() {
            return Ok(false);
        }
        let started = HostCoordinator::start(
            self.address.clone(),
            self.app.clone(),
            self.config.clone(),
            self.spawner.clone(),
        )
        .await?;
        match started {
            Some(handle) => {
                let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
                *slot = Some(handle);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn respawn(&self, app: &str) {
        let config = self.config.current();
        let spawned = SpawnRequest::for_app(&config, app).and_then(|req| self.spawner.spawn(&req));
        match spawned {
            Ok(pid) => info!("Respawned former host app '{}' (pid {})", app, pid),
            Err(e) => error!("Failed to respawn former host app '{}': {}", app, e),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn address(temp: &TempDir) -> ControlAddress {
        ControlAddress::for_config(temp.path().join("fleet.json")).unwrap()
    }

    #[tokio::test]
    async fn test_claim_then_contend() {
        let temp = TempDir::new().unwrap();
        let addr = address(&temp);

        let first = claim(&addr).await.unwrap();
        assert!(first.is_some());
        assert!(claim(&addr).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_reclaims_stale_socket() {
        let temp = TempDir::new().unwrap();
        let addr = address(&temp);

        // A dropped std listener leaves its socket file behind.
        drop(std::os::unix::net::UnixListener::bind(addr.path()).unwrap());
        assert!(addr.exists());

        assert!(claim(&addr).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remove_stale_keeps_live_socket() {
        let temp = TempDir::new().unwrap();
        let addr = address(&temp);

        let _live = claim(&addr).await.unwrap().unwrap();
        assert!(!remove_stale(&addr).await.unwrap());
        assert!(addr.exists());
    }

    #[tokio::test]
    async fn test_remove_stale_without_artifact() {
        let temp = TempDir::new().unwrap();
        assert!(!remove_stale(&address(&temp)).await.unwrap());
    }
}
