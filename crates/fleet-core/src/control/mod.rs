//! Control plane: host election, guest membership and command routing.
//!
//! # Architecture
//!
//! - **Codec**: newline-delimited JSON messages
//! - **Address**: control socket derived from the fleet config path
//! - **Election**: whoever binds the address is host; a lock file serialises
//!   stale-socket cleanup and the bind
//! - **Host**: one event loop owning guests and pending commands
//! - **Guest**: per-process connection with reconnect and command delivery

pub mod address;
pub mod codec;
pub mod election;
pub mod guest;
pub mod host;
pub mod socket;

pub use address::ControlAddress;
pub use codec::{Command, ControlDecoder, ControlMessage};
pub use election::{HostCandidate, HostElection};
pub use guest::{GuestConnector, GuestOptions, GuestState, InboundCommand};
pub use host::{HostCoordinator, HostHandle, HostSlot};
