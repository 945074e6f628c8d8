pub mod generate_content;

use serde::{Deserialize, Serialize};

/// Gemini error envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
    pub status: String,
}

impl ErrorResponse {
    pub fn new(code: i32, status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code,
                message: message.into(),
                status: status.into(),
            },
        }
    }
}
