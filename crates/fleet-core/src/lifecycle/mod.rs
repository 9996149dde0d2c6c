//! Lifecycle of a fleet member: boot, reload and stop.

mod app;
mod clients;
mod options;
mod server;

pub use app::FleetApp;
pub use options::FleetOptions;
