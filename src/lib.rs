//! An interactive query server for GDX (GAMS Data eXchange) files.
//!
//! The server owns an embedded analytics engine, materializes one table
//! per opened (document, symbol) pair on demand, and serves a WebSocket
//! JSON-RPC protocol with strict per-connection operation ordering, a
//! two-phase preview/materialize pipeline with progress events and
//! cancellation, and crash recovery when the embedded engine enters an
//! unrecoverable state.

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all, clippy::pedantic)]

pub mod client;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod filter;
pub mod materializer;
pub mod model;
pub mod registry;
pub mod resolver;
pub mod rpc;
pub mod supervisor;
