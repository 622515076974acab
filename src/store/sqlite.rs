use std::collections::HashMap;

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;

use super::{AggregateRequest, DataStore, Scalar};
use crate::error::{Error, Result};
use crate::query::builder::AggregateQuery;
use crate::storage::{schema, Database};

/// Timestamp column assumed when neither the registry nor config names one.
pub const DEFAULT_TIMESTAMP_FIELD: &str = "date_created";

/// Which column date-bounds each collection.
#[derive(Debug, Clone)]
pub struct TimestampFields {
    default: String,
    overrides: HashMap<String, String>,
}

impl Default for TimestampFields {
    fn default() -> Self {
        Self::new(DEFAULT_TIMESTAMP_FIELD)
    }
}

impl TimestampFields {
    pub fn new(default: &str) -> Self {
        Self {
            default: default.to_string(),
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, collection: &str, field: &str) -> Self {
        self.overrides
            .insert(collection.to_string(), field.to_string());
        self
    }

    pub fn for_collection(&self, collection: &str) -> &str {
        self.overrides
            .get(collection)
            .map(String::as_str)
            .unwrap_or(&self.default)
    }
}

/// [`DataStore`] over SQLite tables: collections are tables or views,
/// fields are columns, timestamps are ISO-8601 text.
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
    timestamps: TimestampFields,
}

impl SqliteStore {
    pub fn new(db: Database, timestamps: TimestampFields) -> Self {
        Self { db, timestamps }
    }

    fn build_query(&self, request: &AggregateRequest) -> AggregateQuery {
        let mut query = AggregateQuery::new(&request.collection, request.function);
        if let Some(ref field) = request.field {
            query = query.field(field);
        }
        if let Some(ref filter) = request.filter {
            query = query.filter(filter);
        }
        if let Some(range) = request.range {
            query = query.between(self.timestamps.for_collection(&request.collection), range);
        }
        query
    }
}

#[async_trait]
impl DataStore for SqliteStore {
    async fn aggregate(&self, request: &AggregateRequest) -> Result<Scalar> {
        let query = self.build_query(request);
        let collection = request.collection.clone();
        self.db
            .reader()
            .call(move |conn| Ok::<_, rusqlite::Error>(run_aggregate(conn, &collection, &query)))
            .await
            .map_err(|e| Error::DataSource(e.to_string()))?
    }
}

fn run_aggregate(conn: &Connection, collection: &str, query: &AggregateQuery) -> Result<Scalar> {
    let columns = schema::collection_columns(conn, collection).map_err(data_source)?;
    if columns.is_empty() {
        return Err(Error::Schema(format!("collection not found: {collection}")));
    }
    for col in query.referenced_columns() {
        if !columns.contains(col) {
            return Err(Error::Schema(format!(
                "field {col} not found in collection {collection}"
            )));
        }
    }

    let (sql, params) = query.build_sql(Some(&columns))?;
    log::trace!("aggregate sql: {sql}");
    let value: SqlValue = conn
        .query_row(&sql, rusqlite::params_from_iter(params.iter()), |row| row.get(0))
        .map_err(data_source)?;

    Ok(match value {
        SqlValue::Null => Scalar::Null,
        SqlValue::Integer(i) => Scalar::Number(i as f64),
        SqlValue::Real(f) => Scalar::Number(f),
        SqlValue::Text(s) => Scalar::Text(s),
        SqlValue::Blob(b) => Scalar::Text(String::from_utf8_lossy(&b).into_owned()),
    })
}

fn data_source(e: rusqlite::Error) -> Error {
    Error::DataSource(e.to_string())
}
