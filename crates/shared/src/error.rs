use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            400 | 409 | 422 => Self::Validation,
            429 => Self::RateLimited,
            _ => Self::Internal,
        }
    }
}

/// Error body returned by the hosted platform. The data API reports
/// `message`/`details`/`hint`, the auth API reports `error_description` or `msg`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
}

impl PlatformErrorBody {
    pub fn summary(&self) -> Option<String> {
        self.message
            .clone()
            .or_else(|| self.error_description.clone())
            .or_else(|| self.msg.clone())
    }
}

#[derive(Debug, Error)]
#[error("{code:?} ({status}): {message}")]
pub struct PlatformError {
    pub code: ErrorCode,
    pub status: u16,
    pub message: String,
}

impl PlatformError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::from_status(status),
            status,
            message: message.into(),
        }
    }

    /// Builds an error from a raw response body, falling back to the body text.
    pub fn from_body(status: u16, raw: &str) -> Self {
        let message = serde_json::from_str::<PlatformErrorBody>(raw)
            .ok()
            .and_then(|body| body.summary())
            .unwrap_or_else(|| {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    format!("request failed with status {status}")
                } else {
                    trimmed.to_string()
                }
            });
        Self::new(status, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_data_api_message_over_raw_body() {
        let err = PlatformError::from_body(
            400,
            r#"{"code":"22P02","message":"invalid input syntax for type uuid","details":null}"#,
        );
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(err.message, "invalid input syntax for type uuid");
    }

    #[test]
    fn reads_auth_error_description() {
        let err = PlatformError::from_body(
            400,
            r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#,
        );
        assert_eq!(err.message, "Invalid login credentials");
    }

    #[test]
    fn falls_back_to_plain_text_body() {
        let err = PlatformError::from_body(503, "upstream unavailable\n");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "upstream unavailable");
        assert_eq!(PlatformError::from_body(401, "").message, "request failed with status 401");
    }
}
