//! The embedded analytics engine boundary (C1): a pluggable trait plus a
//! concrete DuckDB-backed implementation and a test-only in-memory fake.

pub mod adapter;
pub mod fake;

pub use adapter::{DuckDbAdapter, EngineAdapter, EngineConnection, Progress, QueryResult};
