//! Data model shared across the query server: sources, symbols, filters,
//! and the per-document state the registry and materializer operate on.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// An opaque client-supplied key identifying a logical document.
///
/// The server never interprets this string; clients use it so that the
/// same underlying [`Source`] may appear under multiple logical documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub String);

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user-visible identifier for a GDX input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Source(pub String);

impl Source {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The kind of a GDX symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolType {
    Set,
    Parameter,
    Variable,
    Equation,
    Alias,
    Other,
}

impl SymbolType {
    /// Parse the string produced by `gdx_symbols()`, defaulting to `Other`
    /// for anything not recognized rather than failing the whole catalog.
    #[must_use]
    pub fn from_engine_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "set" => Self::Set,
            "parameter" => Self::Parameter,
            "variable" => Self::Variable,
            "equation" => Self::Equation,
            "alias" => Self::Alias,
            _ => Self::Other,
        }
    }
}

/// One named tabular object inside a GDX file, as reported by
/// `gdx_symbols(path)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Symbol {
    pub name: String,
    #[serde(rename = "type")]
    pub symbol_type: SymbolType,
    pub dimension_count: u32,
    pub record_count: u64,
}

/// The result of fully caching one symbol as a table inside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializedSymbol {
    pub table_name: String,
    pub columns: Vec<String>,
    pub total_row_count: u64,
}

/// Per-document state owned by the [`crate::registry::DocumentRegistry`].
#[derive(Debug, Clone)]
pub struct DocumentState {
    pub source: Source,
    pub local_path: String,
    pub symbols: Vec<Symbol>,
    pub materialized: HashMap<String, MaterializedSymbol>,
}

impl DocumentState {
    #[must_use]
    pub fn new(source: Source, local_path: String, symbols: Vec<Symbol>) -> Self {
        Self {
            source,
            local_path,
            symbols,
            materialized: HashMap::new(),
        }
    }

    #[must_use]
    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }
}

// ============================================================================
// Filters
// ============================================================================

/// A text-column filter: keep rows whose value is one of `selected_values`.
///
/// An empty set is equivalent to no filter on this column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextFilterValue {
    pub selected_values: Vec<String>,
}

/// Sentinel GDX special values a numeric filter can individually hide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialValue {
    Eps,
    Na,
    Undf,
    PosInf,
    NegInf,
}

impl SpecialValue {
    /// The literal DuckDB `CAST(... AS VARCHAR)` label for string-typed
    /// specials. `PosInf`/`NegInf` are compiled differently (§4.3) and
    /// have no label here.
    #[must_use]
    pub fn varchar_label(self) -> Option<&'static str> {
        match self {
            Self::Eps => Some("EPS"),
            Self::Na => Some("NA"),
            Self::Undf => Some("UNDF"),
            Self::PosInf | Self::NegInf => None,
        }
    }
}

/// A numeric-column filter: range bounds plus special-value visibility flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumericFilterValue {
    pub min: Option<f64>,
    pub max: Option<f64>,
    #[serde(default)]
    pub exclude: bool,
    #[serde(rename = "showEPS", default = "default_true")]
    pub show_eps: bool,
    #[serde(rename = "showNA", default = "default_true")]
    pub show_na: bool,
    #[serde(default = "default_true")]
    pub show_pos_inf: bool,
    #[serde(default = "default_true")]
    pub show_neg_inf: bool,
    #[serde(rename = "showUNDF", default = "default_true")]
    pub show_undf: bool,
    /// Present in the wire format but has no compilation effect; the
    /// filter compiler never reads it (§9 Open Questions).
    #[serde(default = "default_true")]
    pub show_acronyms: bool,
}

fn default_true() -> bool {
    true
}

impl Default for NumericFilterValue {
    fn default() -> Self {
        Self {
            min: None,
            max: None,
            exclude: false,
            show_eps: true,
            show_na: true,
            show_pos_inf: true,
            show_neg_inf: true,
            show_undf: true,
            show_acronyms: true,
        }
    }
}

impl NumericFilterValue {
    /// The set of specials whose `show*` flag is false, in a stable order.
    #[must_use]
    pub fn hidden_specials(&self) -> Vec<SpecialValue> {
        let mut hidden = Vec::new();
        if !self.show_pos_inf {
            hidden.push(SpecialValue::PosInf);
        }
        if !self.show_neg_inf {
            hidden.push(SpecialValue::NegInf);
        }
        if !self.show_eps {
            hidden.push(SpecialValue::Eps);
        }
        if !self.show_na {
            hidden.push(SpecialValue::Na);
        }
        if !self.show_undf {
            hidden.push(SpecialValue::Undf);
        }
        hidden
    }
}

/// A tagged union of text/numeric filter values.
///
/// The wire discriminator is structural: an object carrying an `exclude`
/// field is numeric, otherwise text (§9). We parse this by hand rather
/// than relying on `#[serde(tag = ...)]`, since the wire format never
/// carries an explicit tag, and re-emit it as a proper enum so downstream
/// code never has to sniff fields again.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Text(TextFilterValue),
    Numeric(NumericFilterValue),
}

impl<'de> Deserialize<'de> for FilterValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = serde_json::Value::deserialize(deserializer)?;
        if raw.get("exclude").is_some() {
            let numeric: NumericFilterValue =
                serde_json::from_value(raw).map_err(serde::de::Error::custom)?;
            Ok(Self::Numeric(numeric))
        } else {
            let text: TextFilterValue =
                serde_json::from_value(raw).map_err(serde::de::Error::custom)?;
            Ok(Self::Text(text))
        }
    }
}

impl Serialize for FilterValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::Text(v) => v.serialize(serializer),
            Self::Numeric(v) => v.serialize(serializer),
        }
    }
}

/// One column filter, as received from the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub column_name: String,
    pub filter_value: FilterValue,
}

// ============================================================================
// Active materialization bookkeeping (transient, not serialized)
// ============================================================================

/// Metadata the dispatcher and RPC layer need about the one materialization
/// that may be in flight for a document; the connection and task handle
/// themselves live in [`crate::materializer::MaterializationManager`].
#[derive(Debug, Clone)]
pub struct ActiveMaterializationInfo {
    pub document_id: DocumentId,
    pub symbol_name: String,
}
