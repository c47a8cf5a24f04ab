//! A typed, per-document handle over a [`ServerProcess`] (§4.8).
//!
//! Mirrors the teacher's `GqlSession`: typed methods over the raw
//! request/response transport, one per RPC method, so integration tests
//! read like calls rather than hand-built JSON frames.

use crate::client::connection::{ClientError, ServerProcess};
use crate::model::{DocumentId, Filter, Source, Symbol};

/// A document opened against a [`ServerProcess`].
pub struct DocumentHandle<'a> {
    server: &'a ServerProcess,
    document_id: DocumentId,
}

impl<'a> DocumentHandle<'a> {
    /// Open `source` under `document_id`, returning its symbol catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server reports one.
    pub async fn open(
        server: &'a ServerProcess,
        document_id: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<(Self, Vec<Symbol>), ClientError> {
        let document_id = DocumentId(document_id.into());
        let result = server
            .call(
                "openDocument",
                serde_json::json!({
                    "documentId": document_id.0,
                    "source": source.into(),
                }),
            )
            .await?;
        let symbols = decode_field(&result, "symbols")?;
        Ok((
            Self {
                server,
                document_id,
            },
            symbols,
        ))
    }

    /// Re-open this document with `forceReload: true`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server reports one.
    pub async fn force_reload(&self, source: &Source) -> Result<Vec<Symbol>, ClientError> {
        let result = self
            .server
            .call(
                "openDocument",
                serde_json::json!({
                    "documentId": self.document_id.0,
                    "source": source.as_str(),
                    "forceReload": true,
                }),
            )
            .await?;
        decode_field(&result, "symbols")
    }

    /// `materializeSymbol`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server reports one.
    pub async fn materialize_symbol(
        &self,
        symbol_name: &str,
        page_size: Option<u64>,
    ) -> Result<serde_json::Value, ClientError> {
        self.server
            .call(
                "materializeSymbol",
                serde_json::json!({
                    "documentId": self.document_id.0,
                    "symbolName": symbol_name,
                    "pageSize": page_size,
                }),
            )
            .await
    }

    /// `cancelMaterialization`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server reports one.
    pub async fn cancel_materialization(&self) -> Result<(), ClientError> {
        self.server
            .call(
                "cancelMaterialization",
                serde_json::json!({"documentId": self.document_id.0}),
            )
            .await?;
        Ok(())
    }

    /// `executeQuery`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server reports one.
    pub async fn execute_query(&self, sql: &str) -> Result<serde_json::Value, ClientError> {
        self.server
            .call(
                "executeQuery",
                serde_json::json!({"documentId": self.document_id.0, "sql": sql}),
            )
            .await
    }

    /// `getDomainValues`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server reports one.
    pub async fn get_domain_values(
        &self,
        symbol: &str,
        dim_index: u32,
        dimension_filters: &[Filter],
    ) -> Result<Vec<String>, ClientError> {
        let result = self
            .server
            .call(
                "getDomainValues",
                serde_json::json!({
                    "documentId": self.document_id.0,
                    "symbol": symbol,
                    "dimIndex": dim_index,
                    "dimensionFilters": dimension_filters,
                }),
            )
            .await?;
        decode_field(&result, "values")
    }

    /// `getFilterOptions`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server reports one.
    pub async fn get_filter_options(
        &self,
        symbol_name: &str,
        filters: &[Filter],
    ) -> Result<std::collections::HashMap<String, Vec<String>>, ClientError> {
        let result = self
            .server
            .call(
                "getFilterOptions",
                serde_json::json!({
                    "documentId": self.document_id.0,
                    "symbolName": symbol_name,
                    "filters": filters,
                }),
            )
            .await?;
        decode_field(&result, "filterOptions")
    }

    /// `closeDocument`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server reports one.
    pub async fn close(self) -> Result<(), ClientError> {
        self.server
            .call(
                "closeDocument",
                serde_json::json!({"documentId": self.document_id.0}),
            )
            .await?;
        Ok(())
    }
}

fn decode_field<T: serde::de::DeserializeOwned>(
    result: &serde_json::Value,
    field: &str,
) -> Result<T, ClientError> {
    let value = result.get(field).cloned().unwrap_or(serde_json::Value::Null);
    serde_json::from_value(value).map_err(ClientError::from)
}
