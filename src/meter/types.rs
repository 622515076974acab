use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::query::{Aggregation, TimeRange};

/// A request for one scalar: collection, optional field, optional filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortSpec {
    pub collection: String,
    /// Absent when counting rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<JsonValue>,
}

impl CohortSpec {
    pub fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            field: None,
            filter: None,
        }
    }

    pub fn field(mut self, name: &str) -> Self {
        self.field = Some(name.to_string());
        self
    }

    pub fn filter(mut self, filter: JsonValue) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// A cohort plus the function that reduces it to one value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpec {
    #[serde(flatten)]
    pub cohort: CohortSpec,
    #[serde(default)]
    pub aggregation: Aggregation,
}

impl AggregateSpec {
    pub fn new(cohort: CohortSpec, aggregation: Aggregation) -> Self {
        Self { cohort, aggregation }
    }
}

/// Where the standard-mode denominator comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SecondaryValue {
    Manual { value: u64 },
    Collection(AggregateSpec),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    Percentage,
    Numeric,
}

/// Minimum value at which `color` applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub value: f64,
    pub color: String,
}

impl Threshold {
    pub fn new(value: f64, color: &str) -> Self {
        Self {
            value,
            color: color.to_string(),
        }
    }
}

/// The five-step red-to-green table used when none is configured.
pub fn default_thresholds() -> Vec<Threshold> {
    vec![
        Threshold::new(0.0, "#ff4444"),
        Threshold::new(25.0, "#ffa500"),
        Threshold::new(50.0, "#ffeb3b"),
        Threshold::new(75.0, "#90ee90"),
        Threshold::new(90.0, "#32cd32"),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayOptions {
    #[serde(default)]
    pub display_mode: DisplayMode,
    #[serde(default = "default_thresholds")]
    pub thresholds: Vec<Threshold>,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            display_mode: DisplayMode::default(),
            thresholds: default_thresholds(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardConfig {
    pub primary: AggregateSpec,
    pub secondary: SecondaryValue,
    #[serde(flatten)]
    pub display: DisplayOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub from_date: String,
    pub to_date: String,
    /// Customers at start (S).
    pub start: CohortSpec,
    /// Customers at end (E).
    pub end: CohortSpec,
    /// Cancelled customers (N).
    pub cancelled: CohortSpec,
    #[serde(flatten)]
    pub display: DisplayOptions,
}

/// Everything needed to evaluate one meter, selected by `mode`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MeterConfiguration {
    Standard(StandardConfig),
    Retention(RetentionConfig),
}

impl MeterConfiguration {
    pub fn mode(&self) -> &'static str {
        match self {
            MeterConfiguration::Standard(_) => "standard",
            MeterConfiguration::Retention(_) => "retention",
        }
    }

    pub fn display(&self) -> &DisplayOptions {
        match self {
            MeterConfiguration::Standard(c) => &c.display,
            MeterConfiguration::Retention(c) => &c.display,
        }
    }
}

/// The unscaled inputs behind a metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RawValues {
    Standard { primary: f64, secondary: f64 },
    Retention { start: f64, end: f64, cancelled: f64 },
}

/// What the renderer receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricResult {
    /// Percentage in percentage display; the raw value in numeric display.
    pub value: f64,
    pub raw: RawValues,
    pub color: String,
    /// Set when the denominator was zero; `value` is then 0.
    pub undefined_ratio: bool,
    pub display_mode: DisplayMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<TimeRange>,
    pub evaluated_at: DateTime<Utc>,
}
