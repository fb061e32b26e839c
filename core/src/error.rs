//! Error types shared across the engine.
//!
//! None of these ever reach the host page: lookup failures become cached
//! failure results, host failures skip the affected element, and setup
//! failures stop only this engine instance.

use thiserror::Error;

/// Failure to obtain a detection result for an image URL.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LookupError {
    #[error("network error: {0}")]
    Network(String),

    #[error("backend returned HTTP {0}")]
    Status(u16),

    #[error("malformed detection payload: {0}")]
    Malformed(String),

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("invalid request url: {0}")]
    InvalidUrl(String),

    #[error("lookup abandoned before completion")]
    Abandoned,
}

/// Failure of a document operation performed through the host.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HostError {
    #[error("document is not ready")]
    DocumentNotReady,

    #[error("host operation `{op}` failed: {message}")]
    Operation { op: &'static str, message: String },
}

impl HostError {
    pub fn op(op: &'static str, message: impl Into<String>) -> Self {
        Self::Operation {
            op,
            message: message.into(),
        }
    }
}

/// Fatal to one engine instance.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("observer setup failed: {0}")]
    ObserverSetup(#[source] HostError),

    #[error("document is not ready")]
    DocumentNotReady,

    #[error(transparent)]
    Config(#[from] iris_types::ConfigError),
}

impl From<HostError> for EngineError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::DocumentNotReady => Self::DocumentNotReady,
            other => Self::ObserverSetup(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_error_messages() {
        assert_eq!(
            LookupError::Status(503).to_string(),
            "backend returned HTTP 503"
        );
        assert!(
            LookupError::Malformed("missing field `exists`".to_string())
                .to_string()
                .contains("exists")
        );
    }

    #[test]
    fn test_host_error_converts_to_engine_error() {
        let err: EngineError = HostError::DocumentNotReady.into();
        assert!(matches!(err, EngineError::DocumentNotReady));

        let err: EngineError = HostError::op("observe", "boom").into();
        assert!(err.to_string().contains("observe"));
    }
}
