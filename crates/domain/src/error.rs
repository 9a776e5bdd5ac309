/// Shared error type used across all Verdant crates.
///
/// The backend variants carry a structured classification so the retry
/// policy can act on error *kinds* instead of matching on message text:
/// [`Error::BackendTransient`] and [`Error::Timeout`] are the only
/// retryable failures.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Missing or invalid caller input (empty message, bad conversation id).
    #[error("{0}")]
    BadRequest(String),

    /// Conversation id does not resolve in the store.
    #[error("Conversation \"{0}\" was not found.")]
    NotFound(String),

    /// Missing or placeholder credential / broken deployment config.
    #[error("{0}")]
    Misconfigured(String),

    /// Retryable backend failure: HTTP 5xx or transport-level reachability.
    #[error("backend {backend}: {message}")]
    BackendTransient { backend: String, message: String },

    /// Non-retryable backend failure: explicit error payload, 4xx status,
    /// malformed stream.
    #[error("backend {backend}: {message}")]
    BackendFatal { backend: String, message: String },

    /// The backend produced no usable text.
    #[error("{0} returned an empty assistant response.")]
    EmptyResponse(String),

    #[error("timeout: {0}")]
    Timeout(String),

    /// The client cancelled the request or disconnected.
    #[error("request aborted")]
    Aborted,

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the failover policy may retry the same candidate after this
    /// error. Only 5xx-class backend failures and timeouts qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::BackendTransient { .. } | Error::Timeout(_))
    }

    /// HTTP status code this error maps to at the request boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::BadRequest(_) => 400,
            Error::NotFound(_) => 404,
            _ => 500,
        }
    }

    /// A client-safe rendering of this error.
    ///
    /// Raw upstream messages can leak credential or infrastructure hints;
    /// anything outside the recognized caller-facing categories is rewritten
    /// to generic operator guidance.
    pub fn client_message(&self) -> String {
        match self {
            Error::BadRequest(_)
            | Error::NotFound(_)
            | Error::Misconfigured(_)
            | Error::EmptyResponse(_)
            | Error::Aborted => self.to_string(),
            Error::BackendTransient { .. } | Error::Timeout(_) => {
                "The completion backend is temporarily unavailable. Please retry.".into()
            }
            Error::BackendFatal { message, .. } => message.clone(),
            _ => "Internal server error. Check the gateway logs for details.".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_timeout_are_retryable() {
        let transient = Error::BackendTransient {
            backend: "dedalus".into(),
            message: "HTTP 503".into(),
        };
        assert!(transient.is_retryable());
        assert!(Error::Timeout("20000ms".into()).is_retryable());
    }

    #[test]
    fn fatal_and_caller_errors_are_not_retryable() {
        let fatal = Error::BackendFatal {
            backend: "dedalus".into(),
            message: "invalid model".into(),
        };
        assert!(!fatal.is_retryable());
        assert!(!Error::BadRequest("empty message".into()).is_retryable());
        assert!(!Error::EmptyResponse("dedalus".into()).is_retryable());
        assert!(!Error::Aborted.is_retryable());
    }

    #[test]
    fn status_codes() {
        assert_eq!(Error::BadRequest("x".into()).status_code(), 400);
        assert_eq!(Error::NotFound("abc".into()).status_code(), 404);
        assert_eq!(Error::Misconfigured("x".into()).status_code(), 500);
        assert_eq!(
            Error::BackendFatal {
                backend: "dedalus".into(),
                message: "x".into()
            }
            .status_code(),
            500
        );
    }

    #[test]
    fn not_found_message_format() {
        let err = Error::NotFound("conversation7".into());
        assert_eq!(
            err.to_string(),
            "Conversation \"conversation7\" was not found."
        );
    }

    #[test]
    fn transient_client_message_is_sanitized() {
        let err = Error::BackendTransient {
            backend: "dedalus".into(),
            message: "HTTP 502 - upstream at 10.0.3.17:8443 refused".into(),
        };
        let msg = err.client_message();
        assert!(!msg.contains("10.0.3.17"));
        assert!(msg.contains("temporarily unavailable"));
    }

    #[test]
    fn internal_client_message_is_generic() {
        let err = Error::Other("secret key sk-abc123 leaked".into());
        assert!(!err.client_message().contains("sk-abc123"));
    }
}
