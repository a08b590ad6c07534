use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failure the core surfaces maps to exactly one of these kinds.
///
/// Recoverable kinds carry enough information for the caller to retry; the
/// security-relevant kinds are reported to users through
/// [`Fault::public_message`], which collapses them into one generic message
/// (the specific cause goes to the audit log only).
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Fault {
    #[error("password does not meet the strength policy")]
    WeakPassword,
    #[error("unknown user")]
    UnknownUser,
    #[error("unknown recipient")]
    UnknownRecipient,
    #[error("account is locked")]
    Locked,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("a one-time code is required")]
    TotpRequired,
    #[error("invalid one-time code")]
    InvalidTotp,
    #[error("token has expired")]
    TokenExpired,
    #[error("token has been revoked")]
    TokenRevoked,
    #[error("send queue is full")]
    QueueFull,
    #[error("circuit breaker is open")]
    BreakerOpen,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("relay dial failed: {0}")]
    TransportDial(String),
    #[error("relay tls failed: {0}")]
    TransportTls(String),
    #[error("relay auth failed: {0}")]
    TransportAuth(String),
    #[error("relay protocol error: {0}")]
    TransportProtocol(String),
    #[error("stored record failed authentication")]
    DecryptAuthFailure,
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("backend unavailable")]
    BackendUnavailable,
    #[error("server is shutting down")]
    ShuttingDown,
}

impl Fault {
    /// Stable machine-readable kind, as used on the JSON surface.
    pub fn code(&self) -> &'static str {
        match self {
            Fault::WeakPassword => "weak-password",
            Fault::UnknownUser => "unknown-user",
            Fault::UnknownRecipient => "unknown-recipient",
            Fault::Locked => "locked",
            Fault::InvalidCredentials => "invalid-credentials",
            Fault::TotpRequired => "totp-required",
            Fault::InvalidTotp => "invalid-totp",
            Fault::TokenExpired => "token-expired",
            Fault::TokenRevoked => "token-revoked",
            Fault::QueueFull => "queue-full",
            Fault::BreakerOpen => "breaker-open",
            Fault::RateLimited => "rate-limited",
            Fault::TransportDial(_) => "transport-dial",
            Fault::TransportTls(_) => "transport-tls",
            Fault::TransportAuth(_) => "transport-auth",
            Fault::TransportProtocol(_) => "transport-protocol",
            Fault::DecryptAuthFailure => "decrypt-auth-failure",
            Fault::ValidationFailed(_) => "validation-failed",
            Fault::BackendUnavailable => "backend-unavailable",
            Fault::ShuttingDown => "shutting-down",
        }
    }

    /// Whether the caller may retry the same operation later.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Fault::QueueFull
                | Fault::BreakerOpen
                | Fault::RateLimited
                | Fault::BackendUnavailable
                | Fault::ShuttingDown
                | Fault::TransportDial(_)
                | Fault::TransportTls(_)
                | Fault::TransportAuth(_)
                | Fault::TransportProtocol(_)
        )
    }

    /// The message shown to end users. Authentication failures share one
    /// generic message with uniform wording; the specific kind stays in the
    /// audit log.
    pub fn public_message(&self) -> String {
        match self {
            Fault::InvalidCredentials | Fault::InvalidTotp | Fault::Locked => {
                "authentication failed".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Fault;

    #[test]
    fn codes_are_kebab_case() {
        assert_eq!(Fault::WeakPassword.code(), "weak-password");
        assert_eq!(
            Fault::TransportDial("refused".into()).code(),
            "transport-dial"
        );
    }

    #[test]
    fn transport_faults_are_retryable() {
        assert!(Fault::TransportDial("refused".into()).retryable());
        assert!(Fault::QueueFull.retryable());
        assert!(!Fault::InvalidCredentials.retryable());
    }

    #[test]
    fn auth_failures_share_one_public_message() {
        assert_eq!(
            Fault::InvalidCredentials.public_message(),
            Fault::InvalidTotp.public_message()
        );
        assert_eq!(
            Fault::Locked.public_message(),
            Fault::InvalidCredentials.public_message()
        );
    }
}
