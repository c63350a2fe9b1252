//! Error types for folio-enrich.

use thiserror::Error;

/// Result type for enrichment operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for enrichment operations.
///
/// The taxonomy mirrors how failures propagate through the pipeline:
/// input problems fail the job outright, transient dependency failures
/// degrade the affected stage after one retry, and everything else is
/// recorded as a quality signal rather than escaping the orchestrator.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Unsupported format, unparseable document, or oversize input.
    /// Never retried.
    #[error("invalid input: {0}")]
    Input(String),

    /// A language-model or embedding call timed out or failed upstream.
    #[error("transient dependency failure: {0}")]
    Transient(String),

    /// Unknown IRI or unexpected ontology shape.
    #[error("ontology error: {0}")]
    Ontology(String),

    /// The language model returned output that does not conform to the
    /// requested schema.
    #[error("schema error: {0}")]
    Schema(String),

    /// Cooperative cancellation was requested.
    #[error("cancelled")]
    Cancelled,

    /// A job id that the store does not know.
    #[error("job not found: {0}")]
    JobNotFound(uuid::Uuid),

    /// An annotation id that the job does not contain.
    #[error("annotation not found: {0}")]
    AnnotationNotFound(uuid::Uuid),

    /// IO error from the job store.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stage failed in a way not covered above.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Create an input error.
    pub fn input(msg: impl Into<String>) -> Self {
        Error::Input(msg.into())
    }

    /// Create a transient dependency error.
    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient(msg.into())
    }

    /// Create an ontology error.
    pub fn ontology(msg: impl Into<String>) -> Self {
        Error::Ontology(msg.into())
    }

    /// Create a schema error.
    pub fn schema(msg: impl Into<String>) -> Self {
        Error::Schema(msg.into())
    }

    /// Create a fatal error.
    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }

    /// True for failures that are worth retrying once.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Schema(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::transient("timeout").is_retryable());
        assert!(Error::schema("bad json").is_retryable());
        assert!(!Error::input("too big").is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn display_messages() {
        let e = Error::ontology("unknown IRI");
        assert_eq!(e.to_string(), "ontology error: unknown IRI");
    }
}
