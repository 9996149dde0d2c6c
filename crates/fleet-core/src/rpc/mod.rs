//! Data plane: transport traits and the default JSON-RPC transport.
//!
//! # Architecture
//!
//! - **Transport**: `RpcTransport` binds listeners and opens channels; the
//!   lifecycle only talks to these traits
//! - **Protocol**: length-prefixed JSON-RPC 2.0 frames
//! - **Server**: TCP listener dispatching to installed `Service`s
//! - **Client**: lazily connecting channel with connectivity state

pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::JsonRpcChannel;
pub use protocol::{RpcCall, RpcError, RpcReply};
pub use server::{RpcServer, RpcServerHandle};
pub use transport::{
    ChannelState, JsonRpcTransport, RpcChannel, RpcListener, RpcTransport, ServerSpec, ServiceMap,
};
