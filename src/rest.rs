//! REST envelope shared by every control-plane endpoint.
//!
//! Login, report and resource responses all arrive as
//! `{"success": bool, "code": int, "message": string, "data": any}`. The HTTP
//! status alone is not authoritative; `code == 200` is what marks success.

use serde::{Deserialize, Serialize};
use serde_json::Value;

const ERROR_BODY_SNIPPET_LEN: usize = 220;

/// Application-level success code carried in [`RestResult::code`].
pub const REST_CODE_OK: i64 = 200;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RestResult {
    #[serde(default)]
    pub success: bool,
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl RestResult {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn is_ok(&self) -> bool {
        self.code == REST_CODE_OK
    }

    /// Returns the `data` field when it is a string.
    pub fn data_str(&self) -> Option<&str> {
        self.data.as_str()
    }
}

/// Reduces an error response body to a short human-readable detail.
///
/// Prefers a JSON `message`, `error` or `reason` field and falls back to the
/// leading characters of the raw body.
pub(crate) fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed
            .message
            .filter(|message| !message.is_empty())
            .or(parsed.error)
            .or(parsed.reason)
        {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
