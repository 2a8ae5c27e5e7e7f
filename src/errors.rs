use thiserror::Error;

use crate::rpc;

/// Typed error hierarchy for patchbay.
///
/// Use at module boundaries (supervisor dispatch, router handling, scheduler
/// execution). Internal/leaf functions can continue using `anyhow::Result` —
/// the `Internal` variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum PatchbayError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("unauthorised: {0}")]
    Unauthorised(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("downstream error {code}: {message}")]
    Downstream { code: i64, message: String },

    #[error("server '{0}' is quarantined")]
    Quarantined(String),

    #[error("cancelled by user")]
    UserCancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using PatchbayError.
pub type PatchbayResult<T> = std::result::Result<T, PatchbayError>;

impl PatchbayError {
    /// Machine-readable error kind, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            PatchbayError::NotFound(_) => "NotFound",
            PatchbayError::InvalidParams(_) => "InvalidParams",
            PatchbayError::Unauthorised(_) => "Unauthorised",
            PatchbayError::Timeout(_) => "Timeout",
            PatchbayError::TransportFailure(_) => "TransportFailure",
            PatchbayError::Downstream { .. } => "DownstreamError",
            PatchbayError::Quarantined(_) => "Quarantined",
            PatchbayError::UserCancelled => "UserCancelled",
            PatchbayError::Internal(_) => "Internal",
        }
    }

    /// Whether this error counts against the originating server's health.
    /// Downstream tool errors and bad parameters are the caller's problem,
    /// not the transport's.
    pub fn affects_health(&self) -> bool {
        matches!(
            self,
            PatchbayError::Timeout(_) | PatchbayError::TransportFailure(_)
        )
    }

    /// Map to a JSON-RPC error code for the upstream surface.
    pub fn rpc_code(&self) -> i64 {
        match self {
            PatchbayError::InvalidParams(_) => rpc::INVALID_PARAMS,
            PatchbayError::NotFound(_) => rpc::INVALID_PARAMS,
            PatchbayError::Downstream { code, .. } => *code,
            // Internal errors are deliberately generic toward the client
            _ => rpc::INTERNAL_ERROR,
        }
    }

    /// Message shown to the upstream client. Internal details stay in logs.
    pub fn client_message(&self) -> String {
        match self {
            PatchbayError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_affects_health() {
        assert!(PatchbayError::Timeout(8000).affects_health());
        assert!(PatchbayError::TransportFailure("eof".into()).affects_health());
    }

    #[test]
    fn downstream_error_does_not_affect_health() {
        let err = PatchbayError::Downstream {
            code: -32000,
            message: "tool blew up".into(),
        };
        assert!(!err.affects_health());
        assert_eq!(err.kind(), "DownstreamError");
        assert_eq!(err.rpc_code(), -32000);
    }

    #[test]
    fn internal_is_masked_toward_client() {
        let err: PatchbayError = anyhow::anyhow!("sqlite index corrupted at page 9").into();
        assert_eq!(err.client_message(), "internal error");
        assert_eq!(err.kind(), "Internal");
    }

    #[test]
    fn invalid_params_maps_to_rpc_code() {
        let err = PatchbayError::InvalidParams("missing field 'tool'".into());
        assert_eq!(err.rpc_code(), rpc::INVALID_PARAMS);
    }

    #[test]
    fn quarantined_display() {
        let err = PatchbayError::Quarantined("alpha".into());
        assert_eq!(err.to_string(), "server 'alpha' is quarantined");
    }
}
