use std::collections::HashSet;

use rusqlite::types::Value as SqlValue;
use serde_json::Value as JsonValue;

use super::builder::quote_ident;
use crate::error::{Error, Result};

/// Compiles a JSON filter document into a SQL boolean expression.
///
/// The document follows the dashboard filter dialect:
/// `{"status": {"_eq": "active"}}`, with several keys in one object AND-ed
/// together and `{"_and": [...]}` / `{"_or": [...]}` for explicit nesting.
/// Values are appended to `params` and referenced as `?N`.
pub struct FilterCompiler<'a> {
    columns: Option<&'a HashSet<String>>,
    params: &'a mut Vec<SqlValue>,
}

impl<'a> FilterCompiler<'a> {
    pub fn new(params: &'a mut Vec<SqlValue>) -> Self {
        Self {
            columns: None,
            params,
        }
    }

    /// Reject fields that are not among `columns`.
    pub fn with_columns(mut self, columns: &'a HashSet<String>) -> Self {
        self.columns = Some(columns);
        self
    }

    /// Returns `None` when the filter places no constraint (null or empty).
    pub fn compile(&mut self, filter: &JsonValue) -> Result<Option<String>> {
        match filter {
            JsonValue::Null => Ok(None),
            JsonValue::Object(map) => {
                let mut parts = Vec::new();
                for (key, operand) in map {
                    match key.as_str() {
                        "_and" | "_or" => {
                            let children = operand.as_array().ok_or_else(|| {
                                Error::Config(format!("{key} expects an array of filters"))
                            })?;
                            let bound_before = self.params.len();
                            let mut compiled = Vec::new();
                            let mut unconstrained = false;
                            for child in children {
                                match self.compile(child)? {
                                    Some(sql) => compiled.push(sql),
                                    None => unconstrained = true,
                                }
                            }
                            // An empty branch matches every row, so the whole `_or` does too.
                            if key == "_or" && unconstrained {
                                self.params.truncate(bound_before);
                                continue;
                            }
                            if compiled.is_empty() {
                                continue;
                            }
                            let joiner = if key == "_and" { " AND " } else { " OR " };
                            parts.push(format!("({})", compiled.join(joiner)));
                        }
                        op if op.starts_with('_') => {
                            return Err(Error::Config(format!("unsupported filter operator: {op}")));
                        }
                        field => {
                            if let Some(sql) = self.compile_field(field, operand)? {
                                parts.push(sql);
                            }
                        }
                    }
                }
                if parts.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(parts.join(" AND ")))
                }
            }
            other => Err(Error::Config(format!("filter must be a JSON object, got {other}"))),
        }
    }

    fn compile_field(&mut self, field: &str, operand: &JsonValue) -> Result<Option<String>> {
        if let Some(columns) = self.columns {
            if !columns.contains(field) {
                return Err(Error::Schema(format!("filter references unknown field: {field}")));
            }
        }
        let ops = operand.as_object().ok_or_else(|| {
            Error::Config(format!("filter for {field} must be an object of operators"))
        })?;

        let col = quote_ident(field);
        let mut conditions = Vec::new();
        for (op, value) in ops {
            conditions.push(self.condition(&col, field, op, value)?);
        }
        match conditions.len() {
            0 => Ok(None),
            1 => Ok(conditions.pop().map(|c| format!("({c})"))),
            _ => Ok(Some(format!("({})", conditions.join(" AND ")))),
        }
    }

    fn condition(&mut self, col: &str, field: &str, op: &str, value: &JsonValue) -> Result<String> {
        let sql = match op {
            "_eq" if value.is_null() => format!("{col} IS NULL"),
            "_eq" => format!("{col} = {}", self.bind(value)?),
            "_neq" if value.is_null() => format!("{col} IS NOT NULL"),
            "_neq" => format!("{col} IS NOT {}", self.bind(value)?),
            "_lt" => format!("{col} < {}", self.bind_non_null(field, op, value)?),
            "_lte" => format!("{col} <= {}", self.bind_non_null(field, op, value)?),
            "_gt" => format!("{col} > {}", self.bind_non_null(field, op, value)?),
            "_gte" => format!("{col} >= {}", self.bind_non_null(field, op, value)?),
            "_in" | "_nin" => {
                let items = value.as_array().ok_or_else(|| {
                    Error::Config(format!("{op} on {field} expects an array"))
                })?;
                if items.is_empty() {
                    // Nothing is in the empty set.
                    return Ok(if op == "_in" { "0".into() } else { "1".into() });
                }
                let placeholders = items
                    .iter()
                    .map(|v| self.bind(v))
                    .collect::<Result<Vec<_>>>()?
                    .join(", ");
                let not = if op == "_nin" { "NOT " } else { "" };
                format!("{col} {not}IN ({placeholders})")
            }
            "_null" | "_nnull" => {
                let flag = expect_bool(field, op, value)?;
                if flag == (op == "_null") {
                    format!("{col} IS NULL")
                } else {
                    format!("{col} IS NOT NULL")
                }
            }
            "_empty" | "_nempty" => {
                let flag = expect_bool(field, op, value)?;
                if flag == (op == "_empty") {
                    format!("({col} IS NULL OR {col} = '')")
                } else {
                    format!("({col} IS NOT NULL AND {col} != '')")
                }
            }
            "_contains" => format!("instr({col}, {}) > 0", self.bind_non_null(field, op, value)?),
            "_icontains" => format!(
                "instr(lower({col}), lower({})) > 0",
                self.bind_non_null(field, op, value)?
            ),
            "_ncontains" => {
                let p = self.bind_non_null(field, op, value)?;
                format!("({col} IS NULL OR instr({col}, {p}) = 0)")
            }
            "_starts_with" => {
                let p = self.bind_non_null(field, op, value)?;
                format!("substr({col}, 1, length({p})) = {p}")
            }
            "_ends_with" => {
                let p = self.bind_non_null(field, op, value)?;
                format!("substr({col}, -length({p})) = {p}")
            }
            "_between" | "_nbetween" => {
                let bounds = value.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                    Error::Config(format!("{op} on {field} expects [low, high]"))
                })?;
                let low = self.bind_non_null(field, op, &bounds[0])?;
                let high = self.bind_non_null(field, op, &bounds[1])?;
                let not = if op == "_nbetween" { "NOT " } else { "" };
                format!("{col} {not}BETWEEN {low} AND {high}")
            }
            other => {
                return Err(Error::Config(format!(
                    "unsupported filter operator {other} on {field}"
                )))
            }
        };
        Ok(sql)
    }

    fn bind_non_null(&mut self, field: &str, op: &str, value: &JsonValue) -> Result<String> {
        if value.is_null() {
            return Err(Error::Config(format!("{op} on {field} requires a value")));
        }
        self.bind(value)
    }

    fn bind(&mut self, value: &JsonValue) -> Result<String> {
        self.params.push(json_to_sql(value)?);
        Ok(format!("?{}", self.params.len()))
    }
}

fn expect_bool(field: &str, op: &str, value: &JsonValue) -> Result<bool> {
    match value {
        JsonValue::Bool(b) => Ok(*b),
        JsonValue::String(s) if s == "true" => Ok(true),
        JsonValue::String(s) if s == "false" => Ok(false),
        _ => Err(Error::Config(format!("{op} on {field} expects true or false"))),
    }
}

fn json_to_sql(value: &JsonValue) -> Result<SqlValue> {
    match value {
        JsonValue::Null => Ok(SqlValue::Null),
        JsonValue::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Ok(SqlValue::Integer(i)),
            None => n
                .as_f64()
                .map(SqlValue::Real)
                .ok_or_else(|| Error::Config(format!("unrepresentable number in filter: {n}"))),
        },
        JsonValue::String(s) => Ok(SqlValue::Text(s.clone())),
        other => Err(Error::Config(format!("filter values must be scalars, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(filter: JsonValue) -> (Option<String>, Vec<SqlValue>) {
        let mut params = Vec::new();
        let sql = FilterCompiler::new(&mut params).compile(&filter).unwrap();
        (sql, params)
    }

    #[test]
    fn test_empty_filters() {
        assert_eq!(compile(JsonValue::Null).0, None);
        assert_eq!(compile(json!({})).0, None);
        assert_eq!(compile(json!({"_and": []})).0, None);
    }

    #[test]
    fn test_eq() {
        let (sql, params) = compile(json!({"status": {"_eq": "active"}}));
        assert_eq!(sql.as_deref(), Some("(\"status\" = ?1)"));
        assert_eq!(params, vec![SqlValue::Text("active".into())]);
    }

    #[test]
    fn test_eq_null() {
        let (sql, params) = compile(json!({"deleted_at": {"_eq": null}}));
        assert_eq!(sql.as_deref(), Some("(\"deleted_at\" IS NULL)"));
        assert!(params.is_empty());
    }

    #[test]
    fn test_multiple_fields_are_anded() {
        let (sql, params) = compile(json!({
            "plan": {"_eq": "pro"},
            "seats": {"_gte": 5}
        }));
        let sql = sql.unwrap();
        assert!(sql.contains(" AND "));
        assert!(sql.contains("\"plan\" = ?"));
        assert!(sql.contains("\"seats\" >= ?"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_or_nesting() {
        let (sql, params) = compile(json!({
            "_or": [
                {"status": {"_eq": "active"}},
                {"status": {"_eq": "trial"}}
            ]
        }));
        assert_eq!(
            sql.as_deref(),
            Some("((\"status\" = ?1) OR (\"status\" = ?2))")
        );
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_or_with_empty_branch_is_unconstrained() {
        let (sql, params) = compile(json!({
            "_or": [{}, {"status": {"_eq": "x"}}]
        }));
        assert_eq!(sql, None);
        assert!(params.is_empty());

        let (sql, params) = compile(json!({
            "plan": {"_eq": "pro"},
            "_or": [{"status": {"_eq": "x"}}, {"_and": []}]
        }));
        assert_eq!(sql.as_deref(), Some("(\"plan\" = ?1)"));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_and_with_empty_branch_keeps_others() {
        let (sql, params) = compile(json!({
            "_and": [{}, {"status": {"_eq": "x"}}]
        }));
        assert_eq!(sql.as_deref(), Some("((\"status\" = ?1))"));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_in_and_empty_in() {
        let (sql, params) = compile(json!({"region": {"_in": ["eu", "us"]}}));
        assert_eq!(sql.as_deref(), Some("(\"region\" IN (?1, ?2))"));
        assert_eq!(params.len(), 2);

        let (sql, _) = compile(json!({"region": {"_in": []}}));
        assert_eq!(sql.as_deref(), Some("(0)"));
        let (sql, _) = compile(json!({"region": {"_nin": []}}));
        assert_eq!(sql.as_deref(), Some("(1)"));
    }

    #[test]
    fn test_null_checks() {
        assert_eq!(
            compile(json!({"cancelled_at": {"_nnull": true}})).0.as_deref(),
            Some("(\"cancelled_at\" IS NOT NULL)")
        );
        assert_eq!(
            compile(json!({"cancelled_at": {"_null": false}})).0.as_deref(),
            Some("(\"cancelled_at\" IS NOT NULL)")
        );
    }

    #[test]
    fn test_between_and_starts_with() {
        let (sql, params) = compile(json!({"amount": {"_between": [10, 20.5]}}));
        assert_eq!(sql.as_deref(), Some("(\"amount\" BETWEEN ?1 AND ?2)"));
        assert_eq!(params, vec![SqlValue::Integer(10), SqlValue::Real(20.5)]);

        let (sql, params) = compile(json!({"email": {"_starts_with": "ops"}}));
        assert_eq!(
            sql.as_deref(),
            Some("(substr(\"email\", 1, length(?1)) = ?1)")
        );
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_bool_values_bind_as_integers() {
        let (_, params) = compile(json!({"is_paying": {"_eq": true}}));
        assert_eq!(params, vec![SqlValue::Integer(1)]);
    }

    #[test]
    fn test_params_continue_numbering() {
        let mut params = vec![SqlValue::Text("already bound".into())];
        let sql = FilterCompiler::new(&mut params)
            .compile(&json!({"a": {"_gt": 1}}))
            .unwrap();
        assert_eq!(sql.as_deref(), Some("(\"a\" > ?2)"));
    }

    #[test]
    fn test_unknown_operator_is_config_error() {
        let mut params = Vec::new();
        let err = FilterCompiler::new(&mut params)
            .compile(&json!({"a": {"_regex": "x"}}))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = FilterCompiler::new(&mut params)
            .compile(&json!({"_not": []}))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_relational_filter_rejected() {
        let mut params = Vec::new();
        let err = FilterCompiler::new(&mut params)
            .compile(&json!({"customer": {"name": {"_eq": "x"}}}))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_unknown_column_is_schema_error() {
        let columns: HashSet<String> = ["status".to_string()].into_iter().collect();
        let mut params = Vec::new();
        let err = FilterCompiler::new(&mut params)
            .with_columns(&columns)
            .compile(&json!({"plan": {"_eq": "pro"}}))
            .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_non_object_filter() {
        let mut params = Vec::new();
        let err = FilterCompiler::new(&mut params)
            .compile(&json!("status = 'x'"))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
