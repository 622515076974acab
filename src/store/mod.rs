pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::meter::CohortSpec;
use crate::query::{Aggregation, TimeRange};

pub use sqlite::{SqliteStore, TimestampFields};

/// One aggregation request as sent to a data store.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRequest {
    pub collection: String,
    pub function: Aggregation,
    pub field: Option<String>,
    pub filter: Option<JsonValue>,
    pub range: Option<TimeRange>,
}

/// The raw scalar a store hands back, before numeric coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Number(f64),
    Text(String),
}

/// A backend able to answer aggregate requests.
///
/// Implementations report missing collections or fields as
/// [`Error::Schema`] and transport failures as [`Error::DataSource`].
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn aggregate(&self, request: &AggregateRequest) -> Result<Scalar>;
}

/// Evaluates cohort specs against a [`DataStore`] and coerces the answers to numbers.
#[derive(Clone)]
pub struct AggregationClient {
    store: Arc<dyn DataStore>,
}

impl AggregationClient {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    pub async fn evaluate(
        &self,
        spec: &CohortSpec,
        function: Aggregation,
        range: Option<TimeRange>,
    ) -> Result<f64> {
        if function.requires_field() && spec.field.as_deref().is_none_or(str::is_empty) {
            return Err(Error::Config(format!(
                "{function} on {} requires a field",
                spec.collection
            )));
        }

        let request = AggregateRequest {
            collection: spec.collection.clone(),
            function,
            field: spec.field.clone().filter(|f| !f.is_empty()),
            filter: spec.filter.clone(),
            range,
        };
        log::debug!(
            "aggregate {}({}) on {} range={:?}",
            function,
            request.field.as_deref().unwrap_or("*"),
            request.collection,
            request.range
        );

        let scalar = self.store.aggregate(&request).await?;
        coerce(function, &request.collection, scalar)
    }
}

fn coerce(function: Aggregation, collection: &str, scalar: Scalar) -> Result<f64> {
    let number = match scalar {
        Scalar::Number(n) => Some(n),
        Scalar::Text(ref s) => s.trim().parse::<f64>().ok(),
        Scalar::Null => None,
    };
    match number {
        Some(n) if n.is_finite() => Ok(n),
        Some(n) => Err(Error::DataSource(format!(
            "{function} on {collection} returned a non-finite value: {n}"
        ))),
        None if function == Aggregation::Count => Ok(0.0),
        None => Err(Error::DataSource(format!(
            "{function} on {collection} returned a non-numeric value: {scalar:?}"
        ))),
    }
}
