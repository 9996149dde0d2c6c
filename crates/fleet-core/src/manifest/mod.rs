//! Fleet configuration: the apps a fleet runs and the services they declare.
//!
//! The config is a JSON file. It is loaded wholesale and replaced wholesale on
//! reload; [`ConfigCell`] is the shared handle every component reads the
//! current version through.

mod app;
mod fleet;
mod tls;

pub use app::{AppConfig, Scheme};
pub use fleet::{ConfigCell, FleetConfig};
pub use tls::TlsMaterial;
