//! Client Library (C9): forks the query server process, owns the
//! WebSocket, and demultiplexes responses and events (§4.8).
//!
//! Primarily exercised by integration tests; the real extension-side
//! client lives outside this core's scope.

pub mod connection;
pub mod document;

pub use connection::{ClientError, ServerProcess};
pub use document::DocumentHandle;
