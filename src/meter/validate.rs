use serde::Serialize;

use super::types::{AggregateSpec, CohortSpec, DisplayOptions, MeterConfiguration, SecondaryValue};
use crate::query::date_expr::DateExpr;

/// A single problem with a configuration, keyed by the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub field: String,
    pub reason: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Check that every field the active mode needs is present and well formed.
///
/// An empty list means the configuration may be evaluated. Whether the
/// collections and fields exist in the data store is only discovered at
/// evaluation time.
pub fn validate(config: &MeterConfiguration) -> Vec<Violation> {
    let mut out = Vec::new();
    match config {
        MeterConfiguration::Standard(c) => {
            check_aggregate(&mut out, "primary", &c.primary);
            if let SecondaryValue::Collection(ref spec) = c.secondary {
                check_aggregate(&mut out, "secondary", spec);
            }
            check_display(&mut out, &c.display);
        }
        MeterConfiguration::Retention(c) => {
            check_date(&mut out, "from_date", &c.from_date);
            check_date(&mut out, "to_date", &c.to_date);
            check_cohort(&mut out, "start", &c.start);
            check_cohort(&mut out, "end", &c.end);
            check_cohort(&mut out, "cancelled", &c.cancelled);
            check_display(&mut out, &c.display);
        }
    }
    out
}

fn check_cohort(out: &mut Vec<Violation>, name: &str, cohort: &CohortSpec) {
    if cohort.collection.trim().is_empty() {
        out.push(Violation::new(format!("{name}.collection"), "is required"));
    }
    if let Some(ref filter) = cohort.filter {
        if !(filter.is_object() || filter.is_null()) {
            out.push(Violation::new(format!("{name}.filter"), "must be a JSON object"));
        }
    }
}

fn check_aggregate(out: &mut Vec<Violation>, name: &str, spec: &AggregateSpec) {
    check_cohort(out, name, &spec.cohort);
    let has_field = spec
        .cohort
        .field
        .as_deref()
        .is_some_and(|f| !f.trim().is_empty());
    if spec.aggregation.requires_field() && !has_field {
        out.push(Violation::new(
            format!("{name}.field"),
            format!("is required for {}", spec.aggregation),
        ));
    }
}

fn check_date(out: &mut Vec<Violation>, name: &str, expr: &str) {
    if expr.trim().is_empty() {
        out.push(Violation::new(name, "is required"));
    } else if let Err(e) = DateExpr::parse(expr) {
        out.push(Violation::new(name, e.to_string()));
    }
}

fn check_display(out: &mut Vec<Violation>, display: &DisplayOptions) {
    for (i, t) in display.thresholds.iter().enumerate() {
        if !t.value.is_finite() {
            out.push(Violation::new(format!("thresholds[{i}].value"), "must be a finite number"));
        }
        if t.color.trim().is_empty() {
            out.push(Violation::new(format!("thresholds[{i}].color"), "is required"));
        }
    }
}
