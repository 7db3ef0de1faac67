//! Error types for dbslice.

use thiserror::Error;

/// Result type alias using dbslice's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for dbslice operations.
///
/// Variants map onto the error kinds a plan execution can produce: bad
/// configuration, an unmet precondition, a catalog object missing from the
/// source, a failed statement, or a consistency check that did not hold
/// after data was placed.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Plan is missing required fields, references an unknown group, or
    /// names an unsupported selector/redaction strategy.
    #[error("configuration error: {0}")]
    Config(String),

    /// A precondition required before a mutation did not hold (schema
    /// absent when it must exist, `old` schema present when it must not).
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// An object named in configuration was not found in the source schema.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// A database statement failed during execution outside of sqlx's own
    /// error path (e.g. an aggregated multi-statement failure).
    #[error("execution error: {0}")]
    Execution(String),

    /// A consistency check did not hold after data was in place (foreign
    /// key validation failure, mismatched row counts).
    #[error("consistency error: {0}")]
    Consistency(String),

    /// YAML (de)serialization failed.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// File I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The exit code a CLI invocation should use for this error, per the
    /// propagation policy: configuration/precondition/catalog errors are a
    /// distinct class from execution/consistency failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 2,
            Error::Precondition(_) | Error::Catalog(_) => 2,
            Error::Database(_) | Error::Execution(_) | Error::Consistency(_) => 3,
            Error::Yaml(_) | Error::Io(_) => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_config() {
        let err = Error::Config("missing source_schema".to_string());
        assert_eq!(err.to_string(), "configuration error: missing source_schema");
    }

    #[test]
    fn test_error_display_precondition() {
        let err = Error::Precondition("old schema exists".to_string());
        assert_eq!(err.to_string(), "precondition failed: old schema exists");
    }

    #[test]
    fn test_error_display_catalog() {
        let err = Error::Catalog("table widget not found".to_string());
        assert_eq!(err.to_string(), "catalog error: table widget not found");
    }

    #[test]
    fn test_error_display_consistency() {
        let err = Error::Consistency("fk not validated".to_string());
        assert_eq!(err.to_string(), "consistency error: fk not validated");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::Config("x".into()).exit_code(), 2);
        assert_eq!(Error::Precondition("x".into()).exit_code(), 2);
        assert_eq!(Error::Catalog("x".into()).exit_code(), 2);
        assert_eq!(Error::Execution("x".into()).exit_code(), 3);
        assert_eq!(Error::Consistency("x".into()).exit_code(), 3);
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
