use std::collections::HashSet;

use rusqlite::types::Value as SqlValue;
use serde_json::Value as JsonValue;

use super::filter::FilterCompiler;
use super::{Aggregation, TimeRange};
use crate::date_util::sqlite_datetime;
use crate::error::{Error, Result};

/// Quote a SQLite identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Builder for a single-scalar aggregate over one collection.
#[derive(Debug, Clone)]
pub struct AggregateQuery {
    collection: String,
    function: Aggregation,
    field: Option<String>,
    filter: Option<JsonValue>,
    range: Option<(String, TimeRange)>,
}

impl AggregateQuery {
    pub fn new(collection: &str, function: Aggregation) -> Self {
        Self {
            collection: collection.to_string(),
            function,
            field: None,
            filter: None,
            range: None,
        }
    }

    pub fn field(mut self, name: &str) -> Self {
        self.field = Some(name.to_string());
        self
    }

    pub fn filter(mut self, filter: &JsonValue) -> Self {
        self.filter = Some(filter.clone());
        self
    }

    /// Bound rows to `range` on the given timestamp column.
    pub fn between(mut self, timestamp_field: &str, range: TimeRange) -> Self {
        self.range = Some((timestamp_field.to_string(), range));
        self
    }

    /// Every column the query touches, for schema checks.
    pub fn referenced_columns(&self) -> Vec<&str> {
        let mut cols = Vec::new();
        if let Some(ref f) = self.field {
            cols.push(f.as_str());
        }
        if let Some((ref ts, _)) = self.range {
            cols.push(ts.as_str());
        }
        cols
    }

    /// Build the SQL text and its positional parameters.
    ///
    /// When `columns` is given, filter fields outside it are rejected as
    /// schema errors.
    pub fn build_sql(&self, columns: Option<&HashSet<String>>) -> Result<(String, Vec<SqlValue>)> {
        let mut params: Vec<SqlValue> = Vec::new();
        let mut wheres = Vec::new();

        let target = match (self.function, self.field.as_deref()) {
            (Aggregation::Count, None) => "COUNT(*)".to_string(),
            (Aggregation::Count, Some(f)) => format!("COUNT({})", quote_ident(f)),
            // TOTAL() yields 0.0 for an empty cohort where SUM() yields NULL.
            (Aggregation::Sum, Some(f)) => format!("TOTAL({})", quote_ident(f)),
            (Aggregation::Avg, Some(f)) => format!("AVG({})", quote_ident(f)),
            (Aggregation::Min, Some(f)) => format!("MIN({})", quote_ident(f)),
            (Aggregation::Max, Some(f)) => format!("MAX({})", quote_ident(f)),
            (function, None) => {
                return Err(Error::Config(format!(
                    "{function} on {} requires a field",
                    self.collection
                )))
            }
        };

        if let Some(ref filter) = self.filter {
            let mut compiler = FilterCompiler::new(&mut params);
            if let Some(cols) = columns {
                compiler = compiler.with_columns(cols);
            }
            if let Some(sql) = compiler.compile(filter)? {
                wheres.push(sql);
            }
        }

        if let Some((ref ts, range)) = self.range {
            params.push(SqlValue::Text(sqlite_datetime(&range.from)));
            let from_idx = params.len();
            params.push(SqlValue::Text(sqlite_datetime(&range.to)));
            let to_idx = params.len();
            wheres.push(format!(
                "datetime({}) BETWEEN ?{from_idx} AND ?{to_idx}",
                quote_ident(ts)
            ));
        }

        let mut sql = format!("SELECT {target} FROM {}", quote_ident(&self.collection));
        if !wheres.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&wheres.join(" AND "));
        }

        Ok((sql, params))
    }
}
