use std::{fmt, io::Read};

use anyhow::{bail, Context, Result};
use url::Url;

/// Media type of a PEP 691 project page.
pub const SIMPLE_JSON: &str = "application/vnd.pypi.simple.v1+json";

/// A fetched resource with a streaming body.
pub struct Response {
    pub url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn error_for_status(self) -> Result<Self> {
        match self.status {
            400..=499 => bail!("client error ({}) for {}", self.status, self.url),
            500..=599 => bail!("server error ({}) for {}", self.status, self.url),
            _ => Ok(self),
        }
    }

    pub fn text(mut self) -> Result<String> {
        let mut text = String::new();
        self.body
            .read_to_string(&mut text)
            .with_context(|| format!("failed to read response body from {}", self.url))?;
        Ok(text)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url.as_str())
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Fetches remote and local resources for the finder and its collaborators.
///
/// Retries, credentials and certificate policy belong to the implementation.
pub trait Transport {
    fn get(&self, url: &Url, accept: Option<&str>) -> Result<Response>;

    /// Whether links may be collected from `url` at all.
    fn is_secure_origin(&self, url: &Url) -> bool;
}
