//! The error contract. Every failure that crosses the engine boundary is a
//! [`DomainError`] with a stable code; adapters map them 1:1 onto their own
//! responses.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable error codes relied upon by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    Unauthorized,
    Forbidden,
    NotFound,
    ValidationError,
    InvalidBody,
    ApprovalOrderBlocked,
    MergeGateBlocked,
    Conflict,
    ServerError,
}

impl Code {
    /// The HTTP-shaped status an adapter should map this code to.
    pub fn status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::ValidationError | Self::InvalidBody => 422,
            Self::ApprovalOrderBlocked | Self::MergeGateBlocked | Self::Conflict => 409,
            Self::ServerError => 500,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::InvalidBody => "INVALID_BODY",
            Self::ApprovalOrderBlocked => "APPROVAL_ORDER_BLOCKED",
            Self::MergeGateBlocked => "MERGE_GATE_BLOCKED",
            Self::Conflict => "CONFLICT",
            Self::ServerError => "SERVER_ERROR",
        };
        write!(f, "{code}")
    }
}

/// A structured governance error.
#[derive(Debug, Clone, thiserror::Error, Serialize)]
#[error("{code}: {message}")]
#[serde(rename_all = "camelCase")]
pub struct DomainError {
    pub status: u16,
    pub code: Code,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl DomainError {
    pub fn new(code: Code, message: impl ToString) -> Self {
        Self {
            status: code.status(),
            code,
            message: message.to_string(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn unauthorized(message: impl ToString) -> Self {
        Self::new(Code::Unauthorized, message)
    }

    pub fn forbidden(message: impl ToString) -> Self {
        Self::new(Code::Forbidden, message)
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::new(Code::NotFound, format!("{what} not found"))
    }

    /// A field-level input error. The offending field is carried in
    /// `details` so callers can surface it.
    pub fn validation(field: &str, message: impl ToString) -> Self {
        Self::new(Code::ValidationError, message)
            .with_details(serde_json::json!({ "field": field }))
    }

    pub fn conflict(message: impl ToString) -> Self {
        Self::new(Code::Conflict, message)
    }

    /// Infrastructure failure. The source is logged by callers; only the
    /// message crosses the boundary.
    pub fn server(err: impl fmt::Display) -> Self {
        Self::new(Code::ServerError, format!("internal error: {err}"))
    }

    /// An approval attempted before its dependencies were granted.
    pub fn approval_order_blocked(blockers: Vec<String>) -> Self {
        Self::new(
            Code::ApprovalOrderBlocked,
            "approval is blocked by unmet dependencies",
        )
        .with_details(serde_json::json!({ "blockers": blockers }))
    }

    /// A merge attempted while the gate still lists blockers.
    pub fn merge_gate_blocked(details: Value) -> Self {
        Self::new(Code::MergeGateBlocked, "merge gate is blocked").with_details(details)
    }
}
