//! An in-memory fake [`EngineAdapter`] for tests that don't want a real
//! DuckDB instance, grounded in the teacher's `MockBackend` shape: track
//! calls, answer canned results keyed off the statement text.

use std::collections::HashMap;
use std::sync::Mutex;

use super::adapter::{EngineAdapter, EngineConnection, Progress, QueryResult, Row};
use crate::error::QueryError;

/// A scripted response for one SQL statement (matched by exact text).
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Rows(QueryResult),
    Fatal(String),
    Transient(String),
}

/// A fake engine: statements are answered from a pre-loaded script, or a
/// default empty result when unscripted.
pub struct FakeEngineAdapter {
    script: Mutex<HashMap<String, ScriptedResponse>>,
    initialized: Mutex<bool>,
    run_log: Mutex<Vec<String>>,
}

impl FakeEngineAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: Mutex::new(HashMap::new()),
            initialized: Mutex::new(false),
            run_log: Mutex::new(Vec::new()),
        }
    }

    /// Script a response for a statement matched by exact text.
    pub fn script(&self, sql: impl Into<String>, response: ScriptedResponse) {
        self.script.lock().unwrap().insert(sql.into(), response);
    }

    /// Every statement passed to `run` or `query`, in order.
    #[must_use]
    pub fn run_log(&self) -> Vec<String> {
        self.run_log.lock().unwrap().clone()
    }

    fn answer(&self, sql: &str) -> Result<QueryResult, QueryError> {
        self.run_log.lock().unwrap().push(sql.to_owned());
        match self.script.lock().unwrap().get(sql) {
            Some(ScriptedResponse::Rows(result)) => Ok(result.clone()),
            Some(ScriptedResponse::Fatal(msg)) => {
                Err(QueryError::FatalEngine(msg.clone()))
            }
            Some(ScriptedResponse::Transient(msg)) => {
                Err(QueryError::TransientEngine(msg.clone()))
            }
            None => Ok(QueryResult::default()),
        }
    }
}

impl Default for FakeEngineAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EngineAdapter for FakeEngineAdapter {
    async fn initialize(&self, _db_path: Option<&str>) -> Result<(), QueryError> {
        *self.initialized.lock().unwrap() = true;
        Ok(())
    }

    async fn run(&self, sql: &str) -> Result<(), QueryError> {
        self.answer(sql).map(|_| ())
    }

    async fn query(&self, sql: &str) -> Result<QueryResult, QueryError> {
        self.answer(sql)
    }

    async fn background_connection(&self) -> Result<Box<dyn EngineConnection>, QueryError> {
        Ok(Box::new(FakeConnection {
            script: self.script.lock().unwrap().clone(),
            run_log: Mutex::new(Vec::new()),
        }))
    }

    async fn register_blob(&self, name: &str, _bytes: Vec<u8>) -> Result<String, QueryError> {
        Ok(format!("/tmp/{name}"))
    }

    async fn dispose(&self) -> Result<(), QueryError> {
        *self.initialized.lock().unwrap() = false;
        Ok(())
    }
}

struct FakeConnection {
    script: HashMap<String, ScriptedResponse>,
    run_log: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl EngineConnection for FakeConnection {
    async fn run(&self, sql: &str) -> Result<(), QueryError> {
        self.query(sql).await.map(|_| ())
    }

    async fn query(&self, sql: &str) -> Result<QueryResult, QueryError> {
        self.run_log.lock().unwrap().push(sql.to_owned());
        match self.script.get(sql) {
            Some(ScriptedResponse::Rows(result)) => Ok(result.clone()),
            Some(ScriptedResponse::Fatal(msg)) => Err(QueryError::FatalEngine(msg.clone())),
            Some(ScriptedResponse::Transient(msg)) => {
                Err(QueryError::TransientEngine(msg.clone()))
            }
            None => Ok(QueryResult::default()),
        }
    }

    fn interrupt(&self) {}

    async fn progress(&self) -> Progress {
        Progress::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
        let mut map = Row::new();
        for (k, v) in pairs {
            map.insert((*k).to_owned(), v.clone());
        }
        map
    }

    #[tokio::test]
    async fn unscripted_statement_returns_empty_result() {
        let engine = FakeEngineAdapter::new();
        engine.initialize(None).await.unwrap();
        let result = engine.query("SELECT * FROM whatever").await.unwrap();
        assert!(result.columns.is_empty());
        assert!(result.rows.is_empty());
    }

    #[tokio::test]
    async fn scripted_statement_returns_configured_rows() {
        let engine = FakeEngineAdapter::new();
        let result = QueryResult {
            columns: vec!["dim_1".to_owned(), "value".to_owned()],
            rows: vec![row(&[
                ("dim_1", serde_json::json!("seattle")),
                ("value", serde_json::json!(1.5)),
            ])],
        };
        engine.script("SELECT * FROM demand", ScriptedResponse::Rows(result.clone()));
        let got = engine.query("SELECT * FROM demand").await.unwrap();
        assert_eq!(got, result);
    }

    #[tokio::test]
    async fn scripted_fatal_error_propagates_as_fatal() {
        let engine = FakeEngineAdapter::new();
        engine.script(
            "SELECT 1",
            ScriptedResponse::Fatal("database has been invalidated".to_owned()),
        );
        let err = engine.query("SELECT 1").await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn run_log_records_statements_in_order() {
        let engine = FakeEngineAdapter::new();
        engine.run("CREATE TABLE t (x INT)").await.unwrap();
        engine.query("SELECT * FROM t").await.unwrap();
        assert_eq!(
            engine.run_log(),
            vec!["CREATE TABLE t (x INT)".to_owned(), "SELECT * FROM t".to_owned()]
        );
    }

    #[tokio::test]
    async fn background_connection_interrupt_is_a_no_op() {
        let engine = FakeEngineAdapter::new();
        let conn = engine.background_connection().await.unwrap();
        conn.interrupt();
        assert_eq!(conn.progress().await, Progress::default());
    }
}
