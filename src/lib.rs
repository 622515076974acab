pub mod date_util;
pub mod error;
pub mod meter;
pub mod query;
pub mod storage;
pub mod store;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use error::{Error, Result};
pub use meter::options::{parse_config_json, PanelOptions};
pub use meter::{
    compute_meter, validate, EvalContext, MeterConfiguration, MeterSession, MetricResult,
    Violation,
};
pub use query::variables::{VariableMap, Variables};
pub use query::{Aggregation, TimeRange};
pub use storage::Database;
pub use store::{AggregationClient, DataStore, SqliteStore, TimestampFields};

// Re-export repository types needed by the binary crate, but not the module itself
pub use storage::repository::StoredMeter;

use storage::{repository, schema};
use store::sqlite::DEFAULT_TIMESTAMP_FIELD;

/// Config key naming the timestamp column used when a collection has none registered.
pub const DEFAULT_TIMESTAMP_FIELD_KEY: &str = "default_timestamp_field";

/// A data collection visible to aggregations.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub row_count: i64,
    pub timestamp_field: String,
    /// Whether the timestamp field was registered explicitly.
    pub registered: bool,
}

/// Main entry point: saved meters, variables and settings live in `db`,
/// aggregations run against `data`.
pub struct MeterEngine {
    db: Database,
    data: Database,
}

impl MeterEngine {
    /// Use one database for both settings and data collections.
    pub fn new(db: Database) -> Self {
        Self {
            data: db.clone(),
            db,
        }
    }

    pub fn with_data_store(db: Database, data: Database) -> Self {
        Self { db, data }
    }

    // ── Evaluation ─────────────────────────────────────────────────

    /// Build an aggregation client over the data store, honoring the
    /// timestamp registry.
    pub async fn client(&self) -> Result<AggregationClient> {
        let timestamps = self.timestamp_fields().await?;
        let store = SqliteStore::new(self.data.clone(), timestamps);
        Ok(AggregationClient::new(Arc::new(store)))
    }

    /// A session whose evaluations supersede one another.
    pub async fn session(&self) -> Result<MeterSession> {
        Ok(MeterSession::new(self.client().await?))
    }

    /// Evaluation context anchored at `now` (or the current time) with the
    /// stored variables.
    pub async fn context(&self, now: Option<DateTime<Utc>>) -> Result<EvalContext> {
        let variables = self.variables().await?;
        Ok(EvalContext::at(now.unwrap_or_else(Utc::now)).with_variables(variables))
    }

    pub async fn evaluate(
        &self,
        config: &MeterConfiguration,
        now: Option<DateTime<Utc>>,
    ) -> Result<MetricResult> {
        let client = self.client().await?;
        let ctx = self.context(now).await?;
        compute_meter(&client, config, &ctx).await
    }

    pub async fn evaluate_saved(
        &self,
        name: &str,
        now: Option<DateTime<Utc>>,
    ) -> Result<MetricResult> {
        let config = self.meter(name).await?;
        log::debug!("evaluating saved meter {name}");
        self.evaluate(&config, now).await
    }

    // ── Saved meters ───────────────────────────────────────────────

    /// Validate and store a meter under `name`, replacing any existing one.
    pub async fn save_meter(&self, name: &str, config: &MeterConfiguration) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::Config("meter name must not be empty".into()));
        }
        let violations = validate(config);
        if !violations.is_empty() {
            return Err(Error::Validation(violations));
        }
        let json = serde_json::to_string(config)?;
        let name = name.to_string();
        let mode = config.mode();
        self.db
            .writer()
            .call(move |conn| repository::upsert_meter(conn, &name, mode, &json))
            .await?;
        Ok(())
    }

    pub async fn meter_record(&self, name: &str) -> Result<StoredMeter> {
        let key = name.to_string();
        self.db
            .reader()
            .call(move |conn| repository::get_meter(conn, &key))
            .await?
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Load a saved meter's configuration.
    pub async fn meter(&self, name: &str) -> Result<MeterConfiguration> {
        let record = self.meter_record(name).await?;
        parse_config_json(&record.config_json)
    }

    pub async fn list_meters(&self) -> Result<Vec<StoredMeter>> {
        let meters = self
            .db
            .reader()
            .call(|conn| repository::list_meters(conn))
            .await?;
        Ok(meters)
    }

    pub async fn remove_meter(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        let removed = self
            .db
            .writer()
            .call(move |conn| repository::remove_meter(conn, &name))
            .await?;
        Ok(removed)
    }

    // ── Variables ──────────────────────────────────────────────────

    pub async fn set_variable(&self, name: &str, value: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::Config("variable name must not be empty".into()));
        }
        let name = name.trim().to_string();
        let value = value.to_string();
        self.db
            .writer()
            .call(move |conn| repository::set_variable(conn, &name, &value))
            .await?;
        Ok(())
    }

    pub async fn variable(&self, name: &str) -> Result<Option<String>> {
        let name = name.to_string();
        let value = self
            .db
            .reader()
            .call(move |conn| repository::get_variable(conn, &name))
            .await?;
        Ok(value)
    }

    pub async fn remove_variable(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        let removed = self
            .db
            .writer()
            .call(move |conn| repository::remove_variable(conn, &name))
            .await?;
        Ok(removed)
    }

    pub async fn list_variables(&self) -> Result<Vec<(String, String)>> {
        let vars = self
            .db
            .reader()
            .call(|conn| repository::list_variables(conn))
            .await?;
        Ok(vars)
    }

    pub async fn variables(&self) -> Result<VariableMap> {
        Ok(self.list_variables().await?.into_iter().collect())
    }

    // ── Collections ────────────────────────────────────────────────

    /// Designate the timestamp column that date-bounds `collection`.
    /// Both must exist in the data store.
    pub async fn register_collection(&self, collection: &str, timestamp_field: &str) -> Result<()> {
        let columns = {
            let collection = collection.to_string();
            self.data
                .reader()
                .call(move |conn| schema::collection_columns(conn, &collection))
                .await?
        };
        if columns.is_empty() {
            return Err(Error::Schema(format!("collection not found: {collection}")));
        }
        if !columns.contains(timestamp_field) {
            return Err(Error::Schema(format!(
                "field {timestamp_field} not found in collection {collection}"
            )));
        }

        let collection = collection.to_string();
        let field = timestamp_field.to_string();
        self.db
            .writer()
            .call(move |conn| repository::set_timestamp_field(conn, &collection, &field))
            .await?;
        Ok(())
    }

    pub async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        let timestamps = self.timestamp_fields().await?;
        let registered: Vec<String> = self
            .db
            .reader()
            .call(|conn| repository::list_timestamp_fields(conn))
            .await?
            .into_iter()
            .map(|(collection, _)| collection)
            .collect();

        let counted = self
            .data
            .reader()
            .call(|conn| {
                let mut out = Vec::new();
                for name in schema::list_collections(conn)? {
                    let rows = schema::collection_row_count(conn, &name)?;
                    out.push((name, rows));
                }
                Ok::<_, rusqlite::Error>(out)
            })
            .await?;

        Ok(counted
            .into_iter()
            .map(|(name, row_count)| CollectionInfo {
                timestamp_field: timestamps.for_collection(&name).to_string(),
                registered: registered.contains(&name),
                name,
                row_count,
            })
            .collect())
    }

    async fn timestamp_fields(&self) -> Result<TimestampFields> {
        let (default, overrides) = self
            .db
            .reader()
            .call(|conn| {
                let default = repository::get_config(conn, DEFAULT_TIMESTAMP_FIELD_KEY)?;
                let overrides = repository::list_timestamp_fields(conn)?;
                Ok::<_, rusqlite::Error>((default, overrides))
            })
            .await?;

        let mut fields =
            TimestampFields::new(default.as_deref().unwrap_or(DEFAULT_TIMESTAMP_FIELD));
        for (collection, field) in overrides {
            fields = fields.with_override(&collection, &field);
        }
        Ok(fields)
    }

    // ── Config commands ────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        let val = self
            .db
            .reader()
            .call(move |conn| repository::get_config(conn, &key))
            .await?;
        Ok(val)
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.db
            .writer()
            .call(move |conn| repository::set_config(conn, &key, &value))
            .await?;
        Ok(())
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        let items = self
            .db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await?;
        Ok(items)
    }
}
