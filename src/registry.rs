//! Document Registry (C5): owns [`DocumentState`]s keyed by `documentId`.
//!
//! Backed by a `tokio::sync::RwLock<HashMap<...>>` exactly as the teacher's
//! `SessionManager` wraps its session map: a single struct, cheaply
//! `Arc`-cloneable, with async read/write accessors. Force-reload's
//! cross-document engine reset is orchestrated by the dispatcher (C6),
//! which owns the only handle to the engine; this registry supplies the
//! per-document bookkeeping the reset needs before and after it runs.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::engine::EngineAdapter;
use crate::error::QueryError;
use crate::model::{DocumentId, DocumentState, MaterializedSymbol, Symbol, SymbolType};
use crate::resolver::SourceResolver;

/// Owns every open document's state.
#[derive(Clone)]
pub struct DocumentRegistry {
    resolver: SourceResolver,
    documents: Arc<RwLock<HashMap<DocumentId, DocumentState>>>,
}

impl DocumentRegistry {
    #[must_use]
    pub fn new(resolver: SourceResolver) -> Self {
        Self {
            resolver,
            documents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// `open(documentId, source, forceReload)` for the non-reload paths:
    /// a cache hit returns the stored catalog; a miss resolves the source
    /// and reads a fresh one. Force-reload is handled by the dispatcher
    /// calling [`DocumentRegistry::reload_all`] after it resets the engine.
    pub async fn open(
        &self,
        engine: &dyn EngineAdapter,
        document_id: &DocumentId,
        source: &crate::model::Source,
    ) -> Result<Vec<Symbol>, QueryError> {
        if let Some(state) = self.documents.read().await.get(document_id) {
            return Ok(state.symbols.clone());
        }

        let (local_path, symbols) = self.read_catalog(engine, source).await?;
        let state = DocumentState::new(source.clone(), local_path, symbols.clone());
        self.documents.write().await.insert(document_id.clone(), state);
        Ok(symbols)
    }

    /// Resolve `source` to a local path and read its symbol catalog via
    /// `gdx_symbols(path)`.
    async fn read_catalog(
        &self,
        engine: &dyn EngineAdapter,
        source: &crate::model::Source,
    ) -> Result<(String, Vec<Symbol>), QueryError> {
        let local_path = self.resolver.resolve(source).await?;
        let sql = format!("SELECT * FROM gdx_symbols('{}')", escape_literal(&local_path));
        let result = engine.query(&sql).await?;
        let symbols = result
            .rows
            .iter()
            .map(symbol_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((local_path, symbols))
    }

    /// Re-resolve and re-read the symbol catalog for every currently open
    /// document, replacing each `DocumentState` (minus any materialized
    /// tables, which no longer exist after the reset that motivated this
    /// call). Returns the updated catalog for `document_id`, inserting a
    /// fresh entry for it first if it was not already tracked.
    pub async fn reload_all(
        &self,
        engine: &dyn EngineAdapter,
        document_id: &DocumentId,
        source: &crate::model::Source,
    ) -> Result<Vec<Symbol>, QueryError> {
        let mut documents = self.documents.write().await;
        if !documents.contains_key(document_id) {
            documents.insert(
                document_id.clone(),
                DocumentState::new(source.clone(), String::new(), Vec::new()),
            );
        }

        let ids: Vec<(DocumentId, crate::model::Source)> = documents
            .iter()
            .map(|(id, state)| (id.clone(), state.source.clone()))
            .collect();
        drop(documents);

        let mut reread = HashMap::with_capacity(ids.len());
        for (id, doc_source) in ids {
            let (local_path, symbols) = self.read_catalog(engine, &doc_source).await?;
            reread.insert(id, DocumentState::new(doc_source, local_path, symbols));
        }

        let result = reread
            .get(document_id)
            .map(|state| state.symbols.clone())
            .unwrap_or_default();
        *self.documents.write().await = reread;
        Ok(result)
    }

    /// Remove `document_id` from the registry, returning its prior state
    /// (if any) so the caller can drop its materialized tables and
    /// checkpoint the engine.
    pub async fn close(&self, document_id: &DocumentId) -> Option<DocumentState> {
        self.documents.write().await.remove(document_id)
    }

    /// A clone of the current state for `document_id`, if open.
    pub async fn get(&self, document_id: &DocumentId) -> Option<DocumentState> {
        self.documents.read().await.get(document_id).cloned()
    }

    /// Every currently tracked document id.
    pub async fn document_ids(&self) -> Vec<DocumentId> {
        self.documents.read().await.keys().cloned().collect()
    }

    pub async fn is_materialized(&self, document_id: &DocumentId, symbol_name: &str) -> bool {
        self.documents
            .read()
            .await
            .get(document_id)
            .is_some_and(|s| s.materialized.contains_key(symbol_name))
    }

    pub async fn columns_of(&self, document_id: &DocumentId, symbol_name: &str) -> Option<Vec<String>> {
        self.documents
            .read()
            .await
            .get(document_id)
            .and_then(|s| s.materialized.get(symbol_name))
            .map(|m| m.columns.clone())
    }

    pub async fn table_name_of(&self, document_id: &DocumentId, symbol_name: &str) -> Option<String> {
        self.documents
            .read()
            .await
            .get(document_id)
            .and_then(|s| s.materialized.get(symbol_name))
            .map(|m| m.table_name.clone())
    }

    /// Record a freshly materialized symbol, called by the materializer
    /// once phase 2 completes.
    pub async fn record_materialized(
        &self,
        document_id: &DocumentId,
        symbol_name: &str,
        materialized: MaterializedSymbol,
    ) {
        if let Some(state) = self.documents.write().await.get_mut(document_id) {
            state.materialized.insert(symbol_name.to_owned(), materialized);
        }
    }

    /// Drop all materialized entries tracked for `document_id` (the
    /// underlying engine tables are dropped by the caller).
    pub async fn clear_materialized(&self, document_id: &DocumentId) {
        if let Some(state) = self.documents.write().await.get_mut(document_id) {
            state.materialized.clear();
        }
    }
}

fn symbol_from_row(row: &crate::engine::adapter::Row) -> Result<Symbol, QueryError> {
    let name = row
        .get("name")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| QueryError::TransientEngine("gdx_symbols row missing name".to_owned()))?
        .to_owned();
    let symbol_type = row
        .get("type")
        .and_then(serde_json::Value::as_str)
        .map(SymbolType::from_engine_str)
        .unwrap_or(SymbolType::Other);
    let dimension_count = row
        .get("dimension_count")
        .or_else(|| row.get("dim"))
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0) as u32;
    let record_count = row
        .get("record_count")
        .or_else(|| row.get("records"))
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);

    Ok(Symbol {
        name,
        symbol_type,
        dimension_count,
        record_count,
    })
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{FakeEngineAdapter, ScriptedResponse};
    use crate::engine::QueryResult;
    use crate::model::Source;

    fn symbols_result() -> QueryResult {
        let mut row = crate::engine::adapter::Row::new();
        row.insert("name".to_owned(), serde_json::json!("demand"));
        row.insert("type".to_owned(), serde_json::json!("parameter"));
        row.insert("dimension_count".to_owned(), serde_json::json!(2));
        row.insert("record_count".to_owned(), serde_json::json!(120));
        QueryResult {
            columns: vec![
                "name".to_owned(),
                "type".to_owned(),
                "dimension_count".to_owned(),
                "record_count".to_owned(),
            ],
            rows: vec![row],
        }
    }

    #[tokio::test]
    async fn open_new_document_reads_catalog() {
        let engine = FakeEngineAdapter::new();
        engine.script(
            "SELECT * FROM gdx_symbols('/data/transport.gdx')",
            ScriptedResponse::Rows(symbols_result()),
        );
        let registry = DocumentRegistry::new(SourceResolver::new(true, std::env::temp_dir()));
        let id = DocumentId("doc1".to_owned());
        let symbols = registry
            .open(&engine, &id, &Source("/data/transport.gdx".to_owned()))
            .await
            .unwrap();
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].name, "demand");
        assert_eq!(symbols[0].record_count, 120);
    }

    #[tokio::test]
    async fn open_cached_document_does_not_requery() {
        let engine = FakeEngineAdapter::new();
        engine.script(
            "SELECT * FROM gdx_symbols('/data/transport.gdx')",
            ScriptedResponse::Rows(symbols_result()),
        );
        let registry = DocumentRegistry::new(SourceResolver::new(true, std::env::temp_dir()));
        let id = DocumentId("doc1".to_owned());
        let source = Source("/data/transport.gdx".to_owned());
        registry.open(&engine, &id, &source).await.unwrap();
        registry.open(&engine, &id, &source).await.unwrap();
        assert_eq!(engine.run_log().len(), 1);
    }

    #[tokio::test]
    async fn close_removes_document() {
        let engine = FakeEngineAdapter::new();
        engine.script(
            "SELECT * FROM gdx_symbols('/data/transport.gdx')",
            ScriptedResponse::Rows(symbols_result()),
        );
        let registry = DocumentRegistry::new(SourceResolver::new(true, std::env::temp_dir()));
        let id = DocumentId("doc1".to_owned());
        let source = Source("/data/transport.gdx".to_owned());
        registry.open(&engine, &id, &source).await.unwrap();
        let removed = registry.close(&id).await;
        assert!(removed.is_some());
        assert!(registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn reload_all_rereads_every_tracked_document() {
        let engine = FakeEngineAdapter::new();
        engine.script(
            "SELECT * FROM gdx_symbols('/data/transport.gdx')",
            ScriptedResponse::Rows(symbols_result()),
        );
        let registry = DocumentRegistry::new(SourceResolver::new(true, std::env::temp_dir()));
        let id = DocumentId("doc1".to_owned());
        let source = Source("/data/transport.gdx".to_owned());
        registry.open(&engine, &id, &source).await.unwrap();
        registry.record_materialized(
            &id,
            "demand",
            MaterializedSymbol {
                table_name: "doc1__demand".to_owned(),
                columns: vec!["dim_1".to_owned()],
                total_row_count: 120,
            },
        );

        let symbols = registry.reload_all(&engine, &id, &source).await.unwrap();
        assert_eq!(symbols.len(), 1);
        assert!(!registry.is_materialized(&id, "demand").await);
    }
}
