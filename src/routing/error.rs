use crate::converter::ConversionError;
use serde_json::{json, Value};
use std::error::Error as _;

/// The error type returned by method handlers.
///
/// A failing handler never tears the consumer down: the server logs the error and replies
/// with [`HandlerError::to_payload`] so the caller does not have to wait for a timeout.
#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error("The request body is malformed")]
    MalformedRequest(#[source] ConversionError),
    #[error("The request payload does not match the method's arguments")]
    InvalidArguments(#[source] serde_json::Error),
    #[error("The method's result cannot be serialized")]
    InvalidResult(#[source] serde_json::Error),
    #[error("The method failed")]
    Failed(#[source] anyhow::Error),
}

impl HandlerError {
    /// A stable, machine-readable tag for this class of failure.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedRequest(_) => "malformed_request",
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::InvalidResult(_) => "invalid_result",
            Self::Failed(_) => "failed",
        }
    }

    /// The best-effort error payload sent back to the caller:
    /// `{"error": {"kind": ..., "message": ...}}`.
    pub fn to_payload(&self) -> Value {
        let mut message = self.to_string();
        let mut source = self.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        json!({ "error": { "kind": self.kind(), "message": message } })
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(err)
    }
}

#[cfg(test)]
mod tests {
    use super::HandlerError;
    use serde_json::json;

    #[test]
    fn the_payload_carries_the_whole_error_chain() {
        let err = HandlerError::from(anyhow::anyhow!("insufficient funds"));

        let payload = err.to_payload();

        assert_eq!(
            payload,
            json!({"error": {"kind": "failed", "message": "The method failed: insufficient funds"}})
        );
    }
}
