//! Shared helpers for backend adapters.

use verdant_domain::error::Error;

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
///
/// Timeouts map to [`Error::Timeout`]; connect and transfer failures are
/// reachability problems and map to [`Error::BackendTransient`].
pub(crate) fn from_reqwest(backend: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::BackendTransient {
            backend: backend.to_owned(),
            message: e.to_string(),
        }
    }
}

/// Pull a human-readable message out of an API error body.
///
/// Prefers the standard `{"error": {"message": ...}}` shape; otherwise
/// returns the supplied default, with up to 500 bytes of the raw body
/// appended when there is one.
pub(crate) fn extract_error_message(raw_body: &str, default: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<serde_json::Value>(raw_body) {
        if let Some(message) = payload
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            if !message.trim().is_empty() {
                return message.to_owned();
            }
        }
    }

    let body = raw_body.trim();
    if body.is_empty() {
        default.to_owned()
    } else {
        let snippet: String = body.chars().take(500).collect();
        format!("{default} {snippet}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_structured_error_message() {
        let body = r#"{"error": {"message": "model overloaded", "code": 529}}"#;
        assert_eq!(
            extract_error_message(body, "request failed."),
            "model overloaded"
        );
    }

    #[test]
    fn falls_back_to_truncated_body() {
        let msg = extract_error_message("<html>bad gateway</html>", "request failed.");
        assert_eq!(msg, "request failed. <html>bad gateway</html>");
    }

    #[test]
    fn empty_body_yields_default() {
        assert_eq!(extract_error_message("  ", "request failed."), "request failed.");
    }

    #[test]
    fn blank_structured_message_falls_through() {
        let body = r#"{"error": {"message": "   "}}"#;
        let msg = extract_error_message(body, "request failed.");
        assert!(msg.starts_with("request failed."));
    }
}
