//! Spawning app entries.

use crate::config::ControlConfig;
use crate::error::{FleetError, Result};
use crate::manifest::FleetConfig;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, error, info};

#[cfg(unix)]
use std::os::unix::process::CommandExt;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Everything needed to start one app process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub app: String,
    /// Program to run.
    pub entry: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Appended to, not truncated.
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

impl SpawnRequest {
    /// Build the request that starts `app` as `<entry> <app>`.
    ///
    /// The child learns where the fleet config lives and which app it is
    /// through `FLEET_CONFIG` and `FLEET_APP`, on top of the app's own env.
    pub fn for_app(config: &FleetConfig, app: &str) -> Result<Self> {
        let app_config = config.app(app).ok_or_else(|| FleetError::UnknownApp {
            app: app.to_string(),
        })?;
        let entry = config.entry_for(app_config).ok_or_else(|| FleetError::Config {
            message: format!("No entry configured for app '{}'", app),
        })?;

        let mut env = app_config.env.clone();
        env.insert(
            ControlConfig::CONFIG_ENV_VAR.to_string(),
            config.path.display().to_string(),
        );
        env.insert(ControlConfig::APP_ENV_VAR.to_string(), app.to_string());

        Ok(Self {
            app: app.to_string(),
            entry,
            args: vec![app.to_string()],
            env,
            working_dir: Some(config.dir().to_path_buf()),
            stdout: app_config.stdout.as_deref().map(|p| config.resolve(p)),
            stderr: app_config.stderr.as_deref().map(|p| config.resolve(p)),
        })
    }
}

/// Starts app processes. Returns the new process id.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<u32>;
}

/// Spawns detached child processes with `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandSpawner;

impl ProcessSpawner for CommandSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<u32> {
        let mut cmd = Command::new(&request.entry);
        cmd.args(&request.args);
        cmd.envs(&request.env);
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(open_log(request.stdout.as_deref())?);
        cmd.stderr(open_log(request.stderr.as_deref())?);

        // Own process group, so a signal aimed at the spawner's group does not
        // take the app down with it.
        #[cfg(unix)]
        cmd.process_group(0);

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        info!(
            "Launching app '{}' from {}",
            request.app,
            request.entry.display()
        );
        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn app '{}': {}", request.app, e);
            FleetError::io_with_path(e, &request.entry)
        })?;
        let pid = child.id();
        info!("Launched app '{}' with PID {}", request.app, pid);

        // Reap the child when it exits so it does not linger as a zombie.
        let app = request.app.clone();
        std::thread::spawn(move || match child.wait() {
            Ok(status) => debug!("App '{}' (pid {}) exited: {}", app, pid, status),
            Err(e) => debug!("Waiting on app '{}' (pid {}) failed: {}", app, pid, e),
        });

        Ok(pid)
    }
}

fn open_log(path: Option<&Path>) -> Result<Stdio> {
    let Some(path) = path else {
        return Ok(Stdio::null());
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok();
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| FleetError::io_with_path(e, path))?;
    Ok(Stdio::from(file))
}
