//! Process metrics for `stat` replies and `list` rows.

use crate::manifest::AppConfig;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// One sample of this process, as sent in a `stat` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub pid: u32,
    /// Seconds since the process started.
    pub uptime: u64,
    /// Resident memory in bytes.
    pub memory: u64,
    /// CPU usage in percent since the previous sample.
    pub cpu: f32,
}

/// Samples the current process through sysinfo.
pub struct ProcessMetrics {
    system: System,
    pid: Pid,
}

impl ProcessMetrics {
    pub fn current() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    pub fn sample(&mut self) -> ProcessSample {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );
        let pid = self.pid.as_u32();
        match self.system.process(self.pid) {
            Some(process) => ProcessSample {
                pid,
                uptime: process.run_time(),
                memory: process.memory(),
                cpu: process.cpu_usage(),
            },
            None => ProcessSample {
                pid,
                uptime: 0,
                memory: 0,
                cpu: 0.0,
            },
        }
    }
}

/// One row of a `list` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStat {
    pub app: String,
    pub uri: String,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f32>,
}

impl AppStat {
    /// A row for `app`; unavailable when no sample was collected.
    pub fn new(app: &AppConfig, sample: Option<ProcessSample>) -> Self {
        Self {
            app: app.name.clone(),
            uri: app.uri.clone(),
            available: sample.is_some(),
            pid: sample.as_ref().map(|s| s.pid),
            uptime: sample.as_ref().map(|s| s.uptime),
            memory: sample.as_ref().map(|s| s.memory),
            cpu: sample.as_ref().map(|s| s.cpu),
        }
    }
}
