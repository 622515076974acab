pub mod options;
pub mod session;
pub mod threshold;
pub mod types;
pub mod validate;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::query::date_expr;
use crate::query::variables::{VariableMap, Variables};
use crate::query::{Aggregation, TimeRange};
use crate::store::AggregationClient;

pub use session::MeterSession;
pub use types::{
    default_thresholds, AggregateSpec, CohortSpec, DisplayMode, DisplayOptions,
    MeterConfiguration, MetricResult, RawValues, RetentionConfig, SecondaryValue, StandardConfig,
    Threshold,
};
pub use validate::{validate, Violation};

/// The instant an evaluation is anchored to, plus the variables substituted
/// into date expressions.
#[derive(Clone)]
pub struct EvalContext {
    pub now: DateTime<Utc>,
    pub variables: Arc<dyn Variables>,
}

impl EvalContext {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            variables: Arc::new(VariableMap::new()),
        }
    }

    pub fn with_variables(mut self, variables: impl Variables + 'static) -> Self {
        self.variables = Arc::new(variables);
        self
    }
}

/// Evaluate a meter: validate, dispatch the cohort queries concurrently,
/// then scale and color the result.
pub async fn compute_meter(
    client: &AggregationClient,
    config: &MeterConfiguration,
    ctx: &EvalContext,
) -> Result<MetricResult> {
    let violations = validate(config);
    if !violations.is_empty() {
        return Err(Error::Validation(violations));
    }

    let display = config.display();
    let (raw, numerator, denominator, numeric, range) = match config {
        MeterConfiguration::Standard(c) => {
            let (primary, secondary) = tokio::try_join!(
                cohort(client, "primary", &c.primary.cohort, c.primary.aggregation, None),
                async {
                    match c.secondary {
                        SecondaryValue::Manual { value } => Ok(value as f64),
                        SecondaryValue::Collection(ref spec) => {
                            cohort(client, "secondary", &spec.cohort, spec.aggregation, None).await
                        }
                    }
                },
            )?;
            let raw = RawValues::Standard { primary, secondary };
            (raw, primary, secondary, primary, None)
        }
        MeterConfiguration::Retention(c) => {
            let from = resolve_bound("from_date", &c.from_date, ctx)?;
            let to = resolve_bound("to_date", &c.to_date, ctx)?;
            let range = TimeRange::new(from, to)?;
            log::debug!(
                "retention range {} .. {}",
                range.from.to_rfc3339(),
                range.to.to_rfc3339()
            );

            let (start, end, cancelled) = tokio::try_join!(
                cohort(client, "start", &c.start, Aggregation::Count, Some(range)),
                cohort(client, "end", &c.end, Aggregation::Count, Some(range)),
                cohort(client, "cancelled", &c.cancelled, Aggregation::Count, Some(range)),
            )?;
            let retained = end - cancelled;
            let raw = RawValues::Retention { start, end, cancelled };
            (raw, retained, start, retained, Some(range))
        }
    };

    let (value, undefined_ratio) = match display.display_mode {
        DisplayMode::Numeric => (numeric, false),
        DisplayMode::Percentage => match ratio(numerator, denominator) {
            Some(pct) => (pct, false),
            None => {
                log::warn!(
                    "{} meter has an undefined ratio ({numerator} / {denominator}); reporting 0",
                    config.mode()
                );
                (0.0, true)
            }
        },
    };
    let color = threshold::color_for(value, &display.thresholds);
    log::info!("{} meter evaluated: {value} ({color})", config.mode());

    Ok(MetricResult {
        value,
        raw,
        color,
        undefined_ratio,
        display_mode: display.display_mode,
        range,
        evaluated_at: ctx.now,
    })
}

async fn cohort(
    client: &AggregationClient,
    name: &'static str,
    spec: &CohortSpec,
    function: Aggregation,
    range: Option<TimeRange>,
) -> Result<f64> {
    client
        .evaluate(spec, function, range)
        .await
        .map_err(|e| Error::in_cohort(name, e))
}

fn resolve_bound(field: &str, expr: &str, ctx: &EvalContext) -> Result<DateTime<Utc>> {
    let substituted = ctx.variables.substitute(expr);
    date_expr::resolve(&substituted, ctx.now).map_err(|e| match e {
        Error::DateParse(msg) => Error::DateParse(format!("{field}: {msg}")),
        Error::UnresolvedVariable(msg) => Error::UnresolvedVariable(format!("{field}: {msg}")),
        other => other,
    })
}

/// `numerator / denominator` as a percentage; `None` when undefined.
fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator == 0.0 {
        return None;
    }
    let pct = numerator * 100.0 / denominator;
    pct.is_finite().then_some(pct)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::store::testing::ScriptedStore;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 31, 12, 0, 0).unwrap()
    }

    fn standard(secondary: SecondaryValue) -> MeterConfiguration {
        MeterConfiguration::Standard(StandardConfig {
            primary: AggregateSpec::new(
                CohortSpec::new("orders").field("amount"),
                Aggregation::Sum,
            ),
            secondary,
            display: DisplayOptions::default(),
        })
    }

    fn retention(from: &str, to: &str) -> RetentionConfig {
        RetentionConfig {
            from_date: from.into(),
            to_date: to.into(),
            start: CohortSpec::new("start_customers"),
            end: CohortSpec::new("end_customers"),
            cancelled: CohortSpec::new("cancellations"),
            display: DisplayOptions::default(),
        }
    }

    fn retention_store(s: f64, e: f64, n: f64) -> ScriptedStore {
        ScriptedStore::new()
            .answer("start_customers", s)
            .answer("end_customers", e)
            .answer("cancellations", n)
    }

    fn client(store: &Arc<ScriptedStore>) -> AggregationClient {
        AggregationClient::new(store.clone())
    }

    #[tokio::test]
    async fn test_standard_percentage_with_manual_target() {
        let store = Arc::new(ScriptedStore::new().answer("orders", 50.0));
        let config = standard(SecondaryValue::Manual { value: 200 });
        let result = compute_meter(&client(&store), &config, &EvalContext::at(now()))
            .await
            .unwrap();

        assert_eq!(result.value, 25.0);
        assert_eq!(result.color, "#ffa500");
        assert!(!result.undefined_ratio);
        assert_eq!(result.raw, RawValues::Standard { primary: 50.0, secondary: 200.0 });
        assert!(result.range.is_none());
        assert_eq!(store.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_standard_secondary_collection() {
        let store = Arc::new(ScriptedStore::new().answer("orders", 30.0).answer("tickets", 40.0));
        let config = standard(SecondaryValue::Collection(AggregateSpec::new(
            CohortSpec::new("tickets"),
            Aggregation::Count,
        )));
        let result = compute_meter(&client(&store), &config, &EvalContext::at(now()))
            .await
            .unwrap();
        assert_eq!(result.value, 75.0);
        assert_eq!(result.color, "#90ee90");
    }

    #[tokio::test]
    async fn test_standard_ratio_is_not_clamped() {
        let store = Arc::new(ScriptedStore::new().answer("orders", 300.0));
        let config = standard(SecondaryValue::Manual { value: 100 });
        let result = compute_meter(&client(&store), &config, &EvalContext::at(now()))
            .await
            .unwrap();
        assert_eq!(result.value, 300.0);
        assert_eq!(result.color, "#32cd32");
    }

    #[tokio::test]
    async fn test_standard_zero_denominator() {
        let store = Arc::new(ScriptedStore::new().answer("orders", 50.0));
        let config = standard(SecondaryValue::Manual { value: 0 });
        let result = compute_meter(&client(&store), &config, &EvalContext::at(now()))
            .await
            .unwrap();
        assert_eq!(result.value, 0.0);
        assert!(result.undefined_ratio);
        assert_eq!(result.color, "#ff4444");
    }

    #[tokio::test]
    async fn test_numeric_display_skips_ratio() {
        let store = Arc::new(ScriptedStore::new().answer("orders", 1234.5));
        let mut config = standard(SecondaryValue::Manual { value: 0 });
        if let MeterConfiguration::Standard(ref mut c) = config {
            c.display.display_mode = DisplayMode::Numeric;
        }
        let result = compute_meter(&client(&store), &config, &EvalContext::at(now()))
            .await
            .unwrap();
        assert_eq!(result.value, 1234.5);
        assert!(!result.undefined_ratio);
        assert_eq!(result.display_mode, DisplayMode::Numeric);
    }

    #[tokio::test]
    async fn test_retention_rate() {
        let store = Arc::new(retention_store(100.0, 80.0, 10.0));
        let config = MeterConfiguration::Retention(retention("$NOW(-1 MONTH)", "$NOW"));
        let result = compute_meter(&client(&store), &config, &EvalContext::at(now()))
            .await
            .unwrap();

        assert_eq!(result.value, 70.0);
        assert_eq!(result.color, "#ffeb3b");
        assert_eq!(
            result.raw,
            RawValues::Retention { start: 100.0, end: 80.0, cancelled: 10.0 }
        );

        let range = result.range.unwrap();
        assert_eq!(range.from, Utc.with_ymd_and_hms(2025, 2, 28, 12, 0, 0).unwrap());
        assert_eq!(range.to, now());

        let requests = store.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        for r in requests.iter() {
            assert_eq!(r.function, Aggregation::Count);
            assert_eq!(r.range, Some(range));
        }
    }

    #[tokio::test]
    async fn test_retention_numeric_is_retained_count() {
        let store = Arc::new(retention_store(100.0, 80.0, 10.0));
        let mut r = retention("2025-01-01", "2025-03-31");
        r.display.display_mode = DisplayMode::Numeric;
        let result = compute_meter(
            &client(&store),
            &MeterConfiguration::Retention(r),
            &EvalContext::at(now()),
        )
        .await
        .unwrap();
        assert_eq!(result.value, 70.0);
        assert_eq!(result.display_mode, DisplayMode::Numeric);
    }

    #[tokio::test]
    async fn test_retention_zero_start() {
        let store = Arc::new(retention_store(0.0, 5.0, 1.0));
        let config = MeterConfiguration::Retention(retention("2025-01-01", "2025-03-31"));
        let result = compute_meter(&client(&store), &config, &EvalContext::at(now()))
            .await
            .unwrap();
        assert_eq!(result.value, 0.0);
        assert!(result.undefined_ratio);
    }

    #[tokio::test]
    async fn test_retention_variables_are_substituted() {
        let store = Arc::new(retention_store(10.0, 10.0, 0.0));
        let config = MeterConfiguration::Retention(retention("{{quarter_start}}", "$NOW"));
        let ctx = EvalContext::at(now())
            .with_variables(VariableMap::new().with("quarter_start", "2025-01-01"));
        let result = compute_meter(&client(&store), &config, &ctx).await.unwrap();
        assert_eq!(
            result.range.unwrap().from,
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(result.value, 100.0);
    }

    #[tokio::test]
    async fn test_retention_unresolved_variable() {
        let store = Arc::new(retention_store(10.0, 10.0, 0.0));
        let config = MeterConfiguration::Retention(retention("{{quarter_start}}", "$NOW"));
        let err = compute_meter(&client(&store), &config, &EvalContext::at(now()))
            .await
            .unwrap_err();
        match err {
            Error::UnresolvedVariable(msg) => assert!(msg.starts_with("from_date:"), "{msg}"),
            other => panic!("expected unresolved variable, got {other:?}"),
        }
        assert!(store.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retention_inverted_range() {
        let store = Arc::new(retention_store(10.0, 10.0, 0.0));
        let config = MeterConfiguration::Retention(retention("2025-03-01", "2025-01-01"));
        let err = compute_meter(&client(&store), &config, &EvalContext::at(now()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
    }

    #[tokio::test]
    async fn test_failure_names_cohort() {
        let store = Arc::new(
            ScriptedStore::new()
                .answer("start_customers", 100.0)
                .answer("end_customers", 80.0)
                .fail("cancellations", "connection reset"),
        );
        let config = MeterConfiguration::Retention(retention("2025-01-01", "2025-03-31"));
        let err = compute_meter(&client(&store), &config, &EvalContext::at(now()))
            .await
            .unwrap_err();
        match err {
            Error::Cohort { cohort, ref source } => {
                assert_eq!(cohort, "cancelled");
                assert!(matches!(**source, Error::DataSource(_)));
            }
            ref other => panic!("expected cohort error, got {other:?}"),
        }
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_validation_fails_before_io() {
        let store = Arc::new(ScriptedStore::new().answer("orders", 1.0));
        let config = MeterConfiguration::Standard(StandardConfig {
            primary: AggregateSpec::new(CohortSpec::new("orders"), Aggregation::Avg),
            secondary: SecondaryValue::Manual { value: 10 },
            display: DisplayOptions::default(),
        });
        let err = compute_meter(&client(&store), &config, &EvalContext::at(now()))
            .await
            .unwrap_err();
        match err {
            Error::Validation(v) => assert_eq!(v[0].field, "primary.field"),
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(store.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_filter_reaches_store() {
        let store = Arc::new(retention_store(4.0, 3.0, 1.0));
        let mut r = retention("2025-01-01", "2025-03-31");
        r.end.filter = Some(json!({"status": {"_eq": "active"}}));
        compute_meter(
            &client(&store),
            &MeterConfiguration::Retention(r),
            &EvalContext::at(now()),
        )
        .await
        .unwrap();
        let requests = store.requests.lock().unwrap();
        let end = requests
            .iter()
            .find(|r| r.collection == "end_customers")
            .unwrap();
        assert_eq!(end.filter, Some(json!({"status": {"_eq": "active"}})));
    }

    #[tokio::test]
    async fn test_cohort_queries_run_concurrently() {
        let store = Arc::new(retention_store(100.0, 80.0, 10.0));
        let gates = [
            store.gate("start_customers"),
            store.gate("end_customers"),
            store.gate("cancellations"),
        ];
        let config = MeterConfiguration::Retention(retention("2025-01-01", "2025-03-31"));
        let task = {
            let client = client(&store);
            tokio::spawn(async move {
                compute_meter(&client, &config, &EvalContext::at(now())).await
            })
        };

        // All three requests must be in flight while every gate is still closed.
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.requests.lock().unwrap().len() < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("sub-queries were not dispatched concurrently");
        assert_eq!(store.completed.load(Ordering::SeqCst), 0);

        for gate in &gates {
            gate.notify_one();
        }
        let result = task.await.unwrap().unwrap();
        assert_eq!(result.value, 70.0);
    }

    #[test]
    fn test_ratio() {
        assert_eq!(ratio(50.0, 200.0), Some(25.0));
        assert_eq!(ratio(70.0, 100.0), Some(70.0));
        assert_eq!(ratio(1.0, 0.0), None);
        assert_eq!(ratio(0.0, -0.0), None);
        assert_eq!(ratio(f64::MAX, f64::MIN_POSITIVE), None);
    }
}
