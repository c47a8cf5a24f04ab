//! Filter Compiler (C3): compiles an ordered list of [`Filter`]s into a
//! single SQL `WHERE` fragment.
//!
//! Pure and engine-free, in the same spirit as the teacher's `status`
//! module: constants and helper functions, no I/O, heavily unit-tested.

use crate::model::{Filter, FilterValue, NumericFilterValue, SpecialValue};

/// Compile a list of filters into a `WHERE` fragment (without the
/// leading `WHERE` keyword), or an empty string if no filter applies.
///
/// `exclude_column`, when set, skips any filter on that column name —
/// this is how cross-filtering (§4.6) asks for "the domain of column
/// `c` under every filter except the one on `c` itself".
#[must_use]
pub fn compile(filters: &[Filter], exclude_column: Option<&str>) -> String {
    let clauses: Vec<String> = filters
        .iter()
        .filter(|f| exclude_column != Some(f.column_name.as_str()))
        .filter_map(compile_one)
        .collect();

    clauses.join(" AND ")
}

fn compile_one(filter: &Filter) -> Option<String> {
    match &filter.filter_value {
        FilterValue::Text(text) => compile_text(&filter.column_name, &text.selected_values),
        FilterValue::Numeric(numeric) => compile_numeric(&filter.column_name, numeric),
    }
}

fn compile_text(column: &str, selected_values: &[String]) -> Option<String> {
    if selected_values.is_empty() {
        return None;
    }
    let list = selected_values
        .iter()
        .map(|v| quote_literal(v))
        .collect::<Vec<_>>()
        .join(",");
    Some(format!("{} IN ({list})", quote_ident(column)))
}

fn compile_numeric(column: &str, numeric: &NumericFilterValue) -> Option<String> {
    let hidden = numeric.hidden_specials();
    if hidden.is_empty() && numeric.min.is_none() && numeric.max.is_none() {
        return None;
    }

    let ident = quote_ident(column);
    let mut conjuncts = Vec::new();

    for special in &hidden {
        match special {
            SpecialValue::PosInf => {
                conjuncts.push(format!("{ident} != CAST('Infinity' AS DOUBLE)"));
            }
            SpecialValue::NegInf => {
                conjuncts.push(format!("{ident} != CAST('-Infinity' AS DOUBLE)"));
            }
            SpecialValue::Eps | SpecialValue::Na | SpecialValue::Undf => {}
        }
    }

    let string_labels: Vec<&'static str> =
        hidden.iter().filter_map(|s| s.varchar_label()).collect();
    if !string_labels.is_empty() {
        let list = string_labels
            .iter()
            .map(|l| quote_literal(l))
            .collect::<Vec<_>>()
            .join(",");
        conjuncts.push(format!("CAST({ident} AS VARCHAR) NOT IN ({list})"));
    }

    if let Some(min) = numeric.min {
        conjuncts.push(format!("{ident} >= {}", format_number(min)));
    }
    if let Some(max) = numeric.max {
        conjuncts.push(format!("{ident} <= {}", format_number(max)));
    }

    let conjunction = conjuncts.join(" AND ");
    let conjunction = if numeric.exclude {
        format!("NOT ({conjunction})")
    } else {
        conjunction
    };

    Some(format!("({conjunction})"))
}

/// Double-quote an identifier, per §4.3.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a string literal, escaping `'` as `''`, per §4.3.
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render a float without a trailing `.0` suffix oddity while still being
/// a valid SQL numeric literal for both integral and fractional values.
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.is_finite() {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TextFilterValue;

    fn text_filter(column: &str, values: &[&str]) -> Filter {
        Filter {
            column_name: column.to_owned(),
            filter_value: FilterValue::Text(TextFilterValue {
                selected_values: values.iter().map(|v| v.to_string()).collect(),
            }),
        }
    }

    fn numeric_filter(column: &str, value: NumericFilterValue) -> Filter {
        Filter {
            column_name: column.to_owned(),
            filter_value: FilterValue::Numeric(value),
        }
    }

    #[test]
    fn empty_filter_list_yields_empty_string() {
        assert_eq!(compile(&[], None), "");
    }

    #[test]
    fn text_filter_skips_empty_selection() {
        let filters = vec![text_filter("dim_1", &[])];
        assert_eq!(compile(&filters, None), "");
    }

    #[test]
    fn text_filter_emits_in_list() {
        let filters = vec![text_filter("dim_1", &["a", "b"])];
        assert_eq!(compile(&filters, None), r#""dim_1" IN ('a','b')"#);
    }

    #[test]
    fn text_filter_escapes_quotes() {
        let filters = vec![text_filter("dim_1", &["o'brien"])];
        assert_eq!(compile(&filters, None), r#""dim_1" IN ('o''brien')"#);
    }

    #[test]
    fn numeric_filter_all_shown_and_unbounded_is_skipped() {
        let filters = vec![numeric_filter("value", NumericFilterValue::default())];
        assert_eq!(compile(&filters, None), "");
    }

    #[test]
    fn s6_numeric_filter_matches_spec_example() {
        let value = NumericFilterValue {
            min: Some(0.0),
            max: Some(10.0),
            exclude: true,
            show_eps: false,
            show_na: true,
            show_pos_inf: true,
            show_neg_inf: true,
            show_undf: true,
            show_acronyms: true,
        };
        let filters = vec![numeric_filter("value", value)];
        let sql = compile(&filters, None);
        let normalized: String = sql.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(
            normalized,
            r#"(NOT (CAST("value" AS VARCHAR) NOT IN ('EPS') AND "value" >= 0.0 AND "value" <= 10.0))"#
        );
    }

    #[test]
    fn numeric_filter_hides_infinities() {
        let value = NumericFilterValue {
            show_pos_inf: false,
            show_neg_inf: false,
            ..NumericFilterValue::default()
        };
        let filters = vec![numeric_filter("value", value)];
        let sql = compile(&filters, None);
        assert_eq!(
            sql,
            r#"("value" != CAST('Infinity' AS DOUBLE) AND "value" != CAST('-Infinity' AS DOUBLE))"#
        );
    }

    #[test]
    fn conjoins_multiple_filters_with_and() {
        let filters = vec![
            text_filter("dim_1", &["a"]),
            numeric_filter(
                "value",
                NumericFilterValue {
                    min: Some(1.0),
                    ..NumericFilterValue::default()
                },
            ),
        ];
        let sql = compile(&filters, None);
        assert_eq!(sql, r#""dim_1" IN ('a') AND ("value" >= 1.0)"#);
    }

    #[test]
    fn exclude_column_skips_its_own_filter() {
        let filters = vec![text_filter("dim_1", &["a"]), text_filter("dim_2", &["x"])];
        let sql = compile(&filters, Some("dim_1"));
        assert_eq!(sql, r#""dim_2" IN ('x')"#);
    }

    #[test]
    fn show_acronyms_is_a_no_op() {
        let with_false = numeric_filter(
            "value",
            NumericFilterValue {
                min: Some(1.0),
                show_acronyms: false,
                ..NumericFilterValue::default()
            },
        );
        let with_true = numeric_filter(
            "value",
            NumericFilterValue {
                min: Some(1.0),
                show_acronyms: true,
                ..NumericFilterValue::default()
            },
        );
        assert_eq!(compile(&[with_false], None), compile(&[with_true], None));
    }
}
