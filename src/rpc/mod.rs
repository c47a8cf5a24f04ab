//! WebSocket RPC Layer (C7): wire frame shapes and the connection server.

pub mod frame;
pub mod server;

pub use frame::{ClientRequest, ServerFrame};
pub use server::{BoundRpcServer, RpcServer};
