use thiserror::Error;

/// An expected reason for skipping a link. Never escapes the evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct LinkMismatch(pub String);

impl LinkMismatch {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Operator mistakes surfaced as soon as the configuration is used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("not allowed to set only_binary and no_binary at the same time")]
    ConflictingFormatControl,
    #[error("invalid find-links location `{0}`: not an existing path or a URL")]
    InvalidFindLinks(String),
    #[error("invalid index URL `{url}`: {reason}")]
    InvalidIndexUrl { url: String, reason: String },
}
