//! Process support: spawning app entries and sampling this process's metrics.

mod launcher;
mod stats;

pub use launcher::{CommandSpawner, ProcessSpawner, SpawnRequest};
pub use stats::{AppStat, ProcessMetrics, ProcessSample};
