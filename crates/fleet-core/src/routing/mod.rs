//! Service routing: which app endpoint answers a call for a service name.

pub mod client;
pub mod registry;

pub use client::{ClientRegistry, ServiceClient};
pub use registry::{RouteEntry, RouteTable, ServiceEndpoint};
