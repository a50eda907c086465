use std::fmt;

use serde::Serialize;

/// Where links for a project are discovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Source {
    /// A simple-repository index root; project pages live under it.
    Index { url: String },
    /// A page, file URL or local path listing artifacts directly.
    FindLinks { url: String },
}

impl Source {
    pub fn index(url: impl Into<String>) -> Self {
        Self::Index { url: url.into() }
    }

    pub fn find_links(url: impl Into<String>) -> Self {
        Self::FindLinks { url: url.into() }
    }

    pub fn url(&self) -> &str {
        match self {
            Self::Index { url } | Self::FindLinks { url } => url,
        }
    }

    pub fn is_index(&self) -> bool {
        matches!(self, Self::Index { .. })
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index { url } => write!(f, "index {url}"),
            Self::FindLinks { url } => write!(f, "find-links {url}"),
        }
    }
}
