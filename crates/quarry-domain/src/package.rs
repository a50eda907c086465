use std::{fmt, str::FromStr};

use pep440_rs::Version;
use serde::Serialize;

use crate::link::{Link, LinkRecord};

/// A link that passed every evaluator check, with its extracted version.
///
/// `version` is `None` only for direct URL requirements.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Package {
    name: String,
    version: Option<String>,
    link: Link,
}

impl Package {
    pub fn new(name: impl Into<String>, version: Option<String>, link: Link) -> Self {
        Self {
            name: name.into(),
            version,
            link,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn parsed_version(&self) -> Option<Version> {
        self.version
            .as_deref()
            .and_then(|raw| Version::from_str(raw).ok())
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn to_record(&self) -> PackageRecord {
        PackageRecord {
            name: self.name.clone(),
            version: self.version.clone(),
            reference: self.link.to_record(),
        }
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}=={version}", self.name),
            None => write!(f, "{} @ {}", self.name, self.link),
        }
    }
}

/// Serializable shape `{name, version, reference: {url, ...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageRecord {
    pub name: String,
    pub version: Option<String>,
    pub reference: LinkRecord,
}
