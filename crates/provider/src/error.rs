use govconnect_circuit::HttpError;

/// Tagged classification every provider call collapses into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    NetworkError,
    Timeout,
    AuthError,
    ValidationError,
    ServerError,
    ConfigError,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::NetworkError => "NETWORK_ERROR",
            ProviderErrorKind::Timeout => "TIMEOUT",
            ProviderErrorKind::AuthError => "AUTH_ERROR",
            ProviderErrorKind::ValidationError => "VALIDATION_ERROR",
            ProviderErrorKind::ServerError => "SERVER_ERROR",
            ProviderErrorKind::ConfigError => "CONFIG_ERROR",
        }
    }
}

#[derive(Debug)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub status_code: Option<u16>,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}", self.message, self.kind.as_str())?;
        if let Some(status) = self.status_code {
            write!(f, " {status}")?;
        }
        write!(f, "]")
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::ConfigError, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::ValidationError, message)
    }

    /// Transient failures a caller may retry later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::NetworkError
                | ProviderErrorKind::Timeout
                | ProviderErrorKind::ServerError
        )
    }
}

impl From<HttpError> for ProviderError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Status { status, body, service } => {
                let kind = match status {
                    401 | 403 => ProviderErrorKind::AuthError,
                    400 | 422 => ProviderErrorKind::ValidationError,
                    s if s >= 500 => ProviderErrorKind::ServerError,
                    _ => ProviderErrorKind::ValidationError,
                };
                let preview: String = body.chars().take(200).collect();
                Self {
                    kind,
                    message: format!("{service}: {preview}"),
                    status_code: Some(status),
                }
            }
            HttpError::Timeout { service } => Self::new(
                ProviderErrorKind::Timeout,
                format!("{service} timed out"),
            ),
            HttpError::Network { service, message } => Self::new(
                ProviderErrorKind::NetworkError,
                format!("{service}: {message}"),
            ),
            // Fail-fast surfaces as transient so retry timers pick it up
            // once the breaker closes again.
            HttpError::CircuitOpen { service, retry_in_ms } => Self::new(
                ProviderErrorKind::NetworkError,
                format!("{service} circuit open, retry in {retry_in_ms}ms"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_documented_kinds() {
        let cases = [
            (401, ProviderErrorKind::AuthError),
            (403, ProviderErrorKind::AuthError),
            (400, ProviderErrorKind::ValidationError),
            (422, ProviderErrorKind::ValidationError),
            (500, ProviderErrorKind::ServerError),
            (503, ProviderErrorKind::ServerError),
        ];
        for (status, kind) in cases {
            let err: ProviderError = HttpError::Status {
                service: "wa".into(),
                status,
                body: String::new(),
            }
            .into();
            assert_eq!(err.kind, kind, "status {status}");
            assert_eq!(err.status_code, Some(status));
        }
    }

    #[test]
    fn transient_kinds_are_retriable() {
        assert!(ProviderError::new(ProviderErrorKind::Timeout, "t").is_transient());
        assert!(!ProviderError::config("no token").is_transient());
    }
}
