//! Core error types.
//!
//! `CoreError` covers caller-facing failures (broker lifecycle, invalid
//! input, pipeline state). A subscriber's own failure is a [`SubscriberError`]:
//! it is isolated inside `publish` and surfaced only through the delivery
//! report, never as a returned error.

/// Errors returned to callers of the broker and coordinator.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("duplicate project: {0}")]
    DuplicateProject(String),

    #[error("unknown project: {0}")]
    UnknownProject(String),

    #[error("pipeline failed: {0}")]
    PipelineFailed(String),
}

/// A failure raised by a subscriber callback during delivery.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct SubscriberError(pub String);

impl SubscriberError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for SubscriberError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for SubscriberError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}
