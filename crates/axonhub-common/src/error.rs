use bytes::Bytes;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

/// Unified error taxonomy surfaced through inbound transformers.
///
/// Upstream errors keep the provider's status code so the retry policy and
/// the client-visible response can both see it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("model not supported by any candidate channel: {0}")]
    InvalidModel(String),

    #[error("invalid api key")]
    InvalidApiKey,

    #[error("invalid jwt")]
    InvalidJwt,

    #[error("invalid password")]
    InvalidPassword,

    #[error("api key scope required: {0}")]
    ApiKeyScopeRequired(String),

    #[error("service account key required")]
    ServiceAccountRequired,

    #[error("upstream transport error: {message}")]
    UpstreamTransport {
        kind: TransportErrorKind,
        message: String,
    },

    #[error("upstream returned status {status}")]
    UpstreamStatus {
        status: u16,
        /// Raw upstream error body, passed through where the inbound format
        /// allows it.
        body: Bytes,
    },

    #[error("request canceled by client")]
    Canceled,

    #[error("data storage error: {0}")]
    InternalStorage(String),

    #[error("internal error [{correlation_id}]")]
    Internal { correlation_id: String },
}

impl GatewayError {
    pub fn internal() -> Self {
        GatewayError::Internal {
            correlation_id: crate::correlation_id(),
        }
    }

    pub fn upstream_status(status: u16, body: impl Into<Bytes>) -> Self {
        GatewayError::UpstreamStatus {
            status,
            body: body.into(),
        }
    }

    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        GatewayError::UpstreamTransport {
            kind,
            message: message.into(),
        }
    }

    /// HTTP status to answer the client with when this error terminates the
    /// request.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::InvalidRequest(_) => 400,
            GatewayError::InvalidModel(_) => 404,
            GatewayError::InvalidApiKey
            | GatewayError::InvalidJwt
            | GatewayError::InvalidPassword => 401,
            GatewayError::ApiKeyScopeRequired(_) | GatewayError::ServiceAccountRequired => 403,
            GatewayError::UpstreamTransport { .. } => 502,
            GatewayError::UpstreamStatus { status, .. } => *status,
            GatewayError::Canceled => 499,
            GatewayError::InternalStorage(_) | GatewayError::Internal { .. } => 500,
        }
    }

    /// Upstream status code, when the error carries one.
    pub fn upstream_status_code(&self) -> Option<u16> {
        match self {
            GatewayError::UpstreamStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, GatewayError::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_is_passed_through() {
        let err = GatewayError::upstream_status(429, "rate limited");
        assert_eq!(err.http_status(), 429);
        assert_eq!(err.upstream_status_code(), Some(429));
    }

    #[test]
    fn canceled_maps_to_client_closed() {
        assert_eq!(GatewayError::Canceled.http_status(), 499);
        assert!(GatewayError::Canceled.is_canceled());
    }
}
