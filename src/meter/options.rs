use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::types::{
    default_thresholds, AggregateSpec, CohortSpec, DisplayMode, DisplayOptions,
    MeterConfiguration, RetentionConfig, SecondaryValue, StandardConfig, Threshold,
};
use super::validate::{validate, Violation};
use crate::error::{Error, Result};
use crate::query::Aggregation;

const DEFAULT_MANUAL_VALUE: u64 = 100;

/// The flat option record a dashboard configuration form produces.
///
/// Every field is optional; [`PanelOptions::to_config`] applies the form's
/// defaults and turns the record into a [`MeterConfiguration`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PanelOptions {
    pub meter_mode: Option<String>,

    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub start_collection: Option<String>,
    pub start_field: Option<String>,
    pub start_filter: Option<JsonValue>,
    pub end_collection: Option<String>,
    pub end_field: Option<String>,
    pub end_filter: Option<JsonValue>,
    pub cancelled_collection: Option<String>,
    pub cancelled_field: Option<String>,
    pub cancelled_filter: Option<JsonValue>,

    pub primary_collection: Option<String>,
    pub primary_field: Option<String>,
    pub primary_aggregation: Option<String>,
    pub primary_filter: Option<JsonValue>,
    pub secondary_mode: Option<String>,
    pub manual_value: Option<JsonValue>,
    pub secondary_collection: Option<String>,
    pub secondary_field: Option<String>,
    pub secondary_aggregation: Option<String>,
    pub secondary_filter: Option<JsonValue>,

    pub display_mode: Option<String>,
    /// A JSON array, or a string holding one.
    pub thresholds: Option<JsonValue>,
}

impl PanelOptions {
    /// Apply defaults and validate, returning every problem found at once.
    pub fn to_config(&self) -> Result<MeterConfiguration> {
        let mut violations = Vec::new();

        let display_mode = match non_empty(&self.display_mode) {
            None | Some("percentage") => DisplayMode::Percentage,
            Some("numeric") => DisplayMode::Numeric,
            Some(other) => {
                violations.push(Violation::new(
                    "displayMode",
                    format!("unknown display mode: {other}"),
                ));
                DisplayMode::Percentage
            }
        };
        let display = DisplayOptions {
            display_mode,
            thresholds: parse_thresholds(&self.thresholds, &mut violations),
        };

        let config = match non_empty(&self.meter_mode) {
            None | Some("standard") => MeterConfiguration::Standard(StandardConfig {
                primary: AggregateSpec::new(
                    cohort(
                        &self.primary_collection,
                        &self.primary_field,
                        &self.primary_filter,
                        "primaryFilter",
                        &mut violations,
                    ),
                    aggregation(
                        &self.primary_aggregation,
                        Aggregation::Sum,
                        "primaryAggregation",
                        &mut violations,
                    ),
                ),
                secondary: self.secondary(&mut violations),
                display,
            }),
            Some("retention") => MeterConfiguration::Retention(RetentionConfig {
                from_date: self.from_date.clone().unwrap_or_default(),
                to_date: self.to_date.clone().unwrap_or_default(),
                start: cohort(
                    &self.start_collection,
                    &self.start_field,
                    &self.start_filter,
                    "startFilter",
                    &mut violations,
                ),
                end: cohort(
                    &self.end_collection,
                    &self.end_field,
                    &self.end_filter,
                    "endFilter",
                    &mut violations,
                ),
                cancelled: cohort(
                    &self.cancelled_collection,
                    &self.cancelled_field,
                    &self.cancelled_filter,
                    "cancelledFilter",
                    &mut violations,
                ),
                display,
            }),
            Some(other) => {
                violations.push(Violation::new(
                    "meterMode",
                    format!("unknown meter mode: {other}"),
                ));
                return Err(Error::Validation(violations));
            }
        };

        violations.extend(validate(&config));
        if violations.is_empty() {
            Ok(config)
        } else {
            Err(Error::Validation(violations))
        }
    }

    fn secondary(&self, violations: &mut Vec<Violation>) -> SecondaryValue {
        match non_empty(&self.secondary_mode) {
            None | Some("manual") => SecondaryValue::Manual {
                value: manual_value(self.manual_value.as_ref(), violations),
            },
            Some("collection") => SecondaryValue::Collection(AggregateSpec::new(
                cohort(
                    &self.secondary_collection,
                    &self.secondary_field,
                    &self.secondary_filter,
                    "secondaryFilter",
                    violations,
                ),
                aggregation(
                    &self.secondary_aggregation,
                    Aggregation::Count,
                    "secondaryAggregation",
                    violations,
                ),
            )),
            Some(other) => {
                violations.push(Violation::new(
                    "secondaryMode",
                    format!("unknown secondary mode: {other}"),
                ));
                SecondaryValue::Manual { value: DEFAULT_MANUAL_VALUE }
            }
        }
    }
}

/// Parse a stored meter configuration in either the tagged form
/// (`{"mode": "standard", ...}`) or the flat panel form.
pub fn parse_config_json(text: &str) -> Result<MeterConfiguration> {
    let value: JsonValue = serde_json::from_str(text)?;
    if value.get("mode").is_some() {
        let config: MeterConfiguration = serde_json::from_value(value)?;
        let violations = validate(&config);
        if !violations.is_empty() {
            return Err(Error::Validation(violations));
        }
        return Ok(config);
    }
    let options: PanelOptions = serde_json::from_value(value)?;
    options.to_config()
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn cohort(
    collection: &Option<String>,
    field: &Option<String>,
    filter: &Option<JsonValue>,
    filter_name: &str,
    violations: &mut Vec<Violation>,
) -> CohortSpec {
    CohortSpec {
        collection: non_empty(collection).unwrap_or_default().to_string(),
        field: non_empty(field).map(str::to_string),
        filter: parse_filter(filter.as_ref(), filter_name, violations),
    }
}

/// Filters arrive as objects, or as code-editor text containing one.
fn parse_filter(
    filter: Option<&JsonValue>,
    name: &str,
    violations: &mut Vec<Violation>,
) -> Option<JsonValue> {
    let value = match filter? {
        JsonValue::Null => return None,
        JsonValue::String(s) if s.trim().is_empty() => return None,
        JsonValue::String(s) => match serde_json::from_str::<JsonValue>(s) {
            Ok(v) => v,
            Err(e) => {
                violations.push(Violation::new(name, format!("invalid JSON: {e}")));
                return None;
            }
        },
        other => other.clone(),
    };
    match value {
        JsonValue::Object(ref map) if map.is_empty() => None,
        JsonValue::Null => None,
        v => Some(v),
    }
}

fn aggregation(
    value: &Option<String>,
    default: Aggregation,
    name: &str,
    violations: &mut Vec<Violation>,
) -> Aggregation {
    match non_empty(value) {
        None => default,
        Some(s) => Aggregation::from_str(s).unwrap_or_else(|_| {
            violations.push(Violation::new(name, format!("unknown aggregation: {s}")));
            default
        }),
    }
}

fn manual_value(value: Option<&JsonValue>, violations: &mut Vec<Violation>) -> u64 {
    let number = match value {
        None | Some(JsonValue::Null) => return DEFAULT_MANUAL_VALUE,
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) if s.trim().is_empty() => return DEFAULT_MANUAL_VALUE,
        Some(JsonValue::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };
    match number {
        Some(n) if n < 0.0 => {
            violations.push(Violation::new("manualValue", "must not be negative"));
            DEFAULT_MANUAL_VALUE
        }
        Some(n) if n.fract() == 0.0 && n <= u64::MAX as f64 => n as u64,
        Some(_) => {
            violations.push(Violation::new("manualValue", "must be a whole number"));
            DEFAULT_MANUAL_VALUE
        }
        None => {
            violations.push(Violation::new("manualValue", "must be a number"));
            DEFAULT_MANUAL_VALUE
        }
    }
}

fn parse_thresholds(value: &Option<JsonValue>, violations: &mut Vec<Violation>) -> Vec<Threshold> {
    let parsed = match value {
        None | Some(JsonValue::Null) => return default_thresholds(),
        Some(JsonValue::String(s)) if s.trim().is_empty() => return default_thresholds(),
        Some(JsonValue::String(s)) => serde_json::from_str::<Vec<Threshold>>(s),
        Some(v) => serde_json::from_value::<Vec<Threshold>>(v.clone()),
    };
    parsed.unwrap_or_else(|e| {
        violations.push(Violation::new("thresholds", format!("invalid threshold table: {e}")));
        default_thresholds()
    })
}
