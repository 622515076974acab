use std::fmt;
use thiserror::Error;

use crate::meter::validate::Violation;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {}", format_violations(.0))]
    Validation(Vec<Violation>),

    #[error("Invalid date expression: {0}")]
    DateParse(String),

    #[error("Unresolved variable in date expression: {0}")]
    UnresolvedVariable(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Data source error: {0}")]
    DataSource(String),

    #[error("Query for {cohort} failed: {source}")]
    Cohort {
        cohort: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("Evaluation superseded by a newer request")]
    Superseded,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Meter not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap a sub-query failure with the name of the cohort it belongs to.
    pub fn in_cohort(cohort: &'static str, source: Error) -> Self {
        Error::Cohort {
            cohort,
            source: Box::new(source),
        }
    }

    /// Transient data-store failures may be retried by the caller.
    /// Structural and configuration errors never resolve on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::DataSource(_) => true,
            Error::Cohort { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.field, v.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Migration(e.to_string())
    }
}

impl<E: fmt::Display> From<tokio_rusqlite::Error<E>> for Error {
    fn from(e: tokio_rusqlite::Error<E>) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Other(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::DataSource("timeout".into()).is_retryable());
        assert!(!Error::Schema("no table".into()).is_retryable());
        assert!(Error::in_cohort("start", Error::DataSource("busy".into())).is_retryable());
        assert!(!Error::in_cohort("end", Error::Config("x".into())).is_retryable());
    }

    #[test]
    fn test_validation_display() {
        let e = Error::Validation(vec![
            Violation::new("primary.collection", "must not be empty"),
            Violation::new("to_date", "must not be empty"),
        ]);
        assert_eq!(
            e.to_string(),
            "Invalid configuration: primary.collection: must not be empty; to_date: must not be empty"
        );
    }

    #[test]
    fn test_cohort_display() {
        let e = Error::in_cohort("cancelled", Error::Schema("collection not found: churn".into()));
        assert_eq!(
            e.to_string(),
            "Query for cancelled failed: Schema error: collection not found: churn"
        );
    }
}
