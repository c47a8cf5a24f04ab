//! Wire frame shapes (§4.7) and per-method request/response bodies (§6).
//!
//! These mirror the teacher's proto request/response structs
//! (`HandshakeRequest`/`HandshakeResponse`, `ExecuteRequest`/
//! `ExecuteResponse`) but are plain `serde`-derived Rust structs instead
//! of protobuf messages, since the wire format here is JSON.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::engine::adapter::Row;
use crate::error::ResponseError;
use crate::model::{DocumentId, Filter, Source, Symbol};

/// An inbound `{type:"request", requestId, method, params}` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientRequest {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// An outbound frame: either `{type:"response", ...}` or `{type:"event", ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Response {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ResponseError>,
    },
    Event {
        event: String,
        data: serde_json::Value,
    },
}

impl ServerFrame {
    #[must_use]
    pub fn ok(request_id: String, result: serde_json::Value) -> Self {
        Self::Response {
            request_id,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn err(request_id: String, error: ResponseError) -> Self {
        Self::Response {
            request_id,
            result: None,
            error: Some(error),
        }
    }

    #[must_use]
    pub fn event(event: &str, data: serde_json::Value) -> Self {
        Self::Event {
            event: event.to_owned(),
            data,
        }
    }
}

// ============================================================================
// Per-method params/results (§6)
// ============================================================================

/// `ping` additionally round-trips a client-supplied sequence number so
/// tests can assert strict FIFO ordering on the main queue without
/// depending on wall-clock timestamps.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingParams {
    #[serde(default)]
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PingResult {
    pub pong: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenDocumentParams {
    pub document_id: DocumentId,
    pub source: Source,
    #[serde(default)]
    pub force_reload: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenDocumentResult {
    pub symbols: Vec<Symbol>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseDocumentParams {
    pub document_id: DocumentId,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseDocumentResult {
    pub success: bool,
}

fn default_page_size() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializeSymbolParams {
    pub document_id: DocumentId,
    pub symbol_name: String,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
}

/// `materializeSymbol`'s result is one of two shapes depending on
/// whether the symbol was already materialized (§6).
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MaterializeSymbolResult {
    Materialized {
        #[serde(rename = "tableName")]
        table_name: String,
        columns: Vec<String>,
        #[serde(rename = "totalRowCount")]
        total_row_count: u64,
        status: &'static str,
    },
    Preview {
        #[serde(rename = "tableName")]
        table_name: Option<String>,
        columns: Vec<String>,
        #[serde(rename = "totalRowCount")]
        total_row_count: u64,
        status: &'static str,
        #[serde(rename = "previewRows")]
        preview_rows: Vec<Row>,
        #[serde(rename = "previewRowCount")]
        preview_row_count: usize,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelMaterializationParams {
    pub document_id: DocumentId,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelMaterializationResult {
    pub success: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteQueryParams {
    pub document_id: DocumentId,
    pub sql: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteQueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub row_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDomainValuesParams {
    pub document_id: DocumentId,
    pub symbol: String,
    pub dim_index: u32,
    #[serde(default)]
    pub dimension_filters: Vec<Filter>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetDomainValuesResult {
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetFilterOptionsParams {
    pub document_id: DocumentId,
    pub symbol_name: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetFilterOptionsResult {
    pub filter_options: HashMap<String, Vec<String>>,
}
