use thiserror::Error;

/// Transport-level failures while establishing or using a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("DNS resolution failed: {0}")]
    DnsResolutionFailed(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("connection timeout")]
    Timeout,

    #[error("transport error: {0}")]
    TransportError(String),
}

impl ConnectionError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConnectionError::AuthenticationFailed(_))
    }
}

/// Session-level failures surfaced by the public client operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a session is already active")]
    ConnectionConflict,

    #[error("no active session")]
    NotConnected,

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("registration rejected: the username is already taken")]
    RegistrationConflict,

    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error("account removal failed: {0}")]
    RemovalFailed(String),

    #[error("stanza send failed: {0}")]
    SendFailed(String),

    #[error("malformed stanza: {0}")]
    Malformed(String),

    #[error("invalid JID: {0}")]
    InvalidJid(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_failure_is_non_retryable() {
        let error = ConnectionError::AuthenticationFailed("invalid credentials".to_string());
        assert!(!error.is_retryable());
        assert!(ConnectionError::Timeout.is_retryable());
    }

    #[test]
    fn connection_errors_pass_through_session_errors() {
        let error = SessionError::from(ConnectionError::Timeout);
        assert_eq!(error.to_string(), "connection timeout");
    }
}
