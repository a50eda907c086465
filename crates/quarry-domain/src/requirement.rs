use std::{fmt, str::FromStr};

use anyhow::{Context, Result};
use pep440_rs::VersionSpecifiers;
use pep508_rs::{Requirement as PepRequirement, VersionOrUrl};

use crate::specifier::{any_version, parse_specifiers};

/// A single dependency request: `name[extras] specifier ; marker` or `name @ url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementSpec {
    name: String,
    extras: Vec<String>,
    specifier: VersionSpecifiers,
    url: Option<String>,
    marker: Option<String>,
}

impl RequirementSpec {
    pub fn new(name: impl Into<String>, specifier: VersionSpecifiers) -> Self {
        Self {
            name: name.into(),
            extras: Vec::new(),
            specifier,
            url: None,
            marker: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extras(&self) -> &[String] {
        &self.extras
    }

    pub fn specifier(&self) -> &VersionSpecifiers {
        &self.specifier
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn marker(&self) -> Option<&str> {
        self.marker.as_deref()
    }
}

impl FromStr for RequirementSpec {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let requirement = PepRequirement::from_str(trimmed)
            .with_context(|| format!("invalid requirement `{trimmed}`"))?;
        let (specifier, url) = match requirement.version_or_url.as_ref() {
            Some(VersionOrUrl::VersionSpecifier(specifiers)) => (
                parse_specifiers(&specifiers.to_string())
                    .with_context(|| format!("invalid specifier in `{trimmed}`"))?,
                None,
            ),
            Some(VersionOrUrl::Url(url)) => (any_version(), Some(url.to_string())),
            None => (any_version(), None),
        };
        Ok(Self {
            name: requirement.name.to_string(),
            extras: requirement
                .extras
                .iter()
                .map(ToString::to_string)
                .collect(),
            specifier,
            url,
            marker: requirement.marker.as_ref().map(ToString::to_string),
        })
    }
}

impl fmt::Display for RequirementSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.extras.join(","))?;
        }
        match &self.url {
            Some(url) => write!(f, " @ {url}")?,
            None => write!(f, "{}", self.specifier)?,
        }
        if let Some(marker) = &self.marker {
            write!(f, "; {marker}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::canonicalize_name;

    #[test]
    fn parses_specifier_requirement() -> Result<()> {
        let requirement: RequirementSpec = "Foo[bar]>=1.0,<2".parse()?;
        assert_eq!(canonicalize_name(requirement.name()), "foo");
        assert_eq!(requirement.extras(), ["bar".to_string()]);
        assert_eq!(requirement.specifier().len(), 2);
        assert!(requirement.url().is_none());
        Ok(())
    }

    #[test]
    fn parses_url_requirement() -> Result<()> {
        let requirement: RequirementSpec =
            "demo @ https://files.example/demo-1.0.tar.gz".parse()?;
        assert_eq!(
            requirement.url(),
            Some("https://files.example/demo-1.0.tar.gz")
        );
        assert!(requirement.specifier().is_empty());
        Ok(())
    }

    #[test]
    fn keeps_marker() -> Result<()> {
        let requirement: RequirementSpec = "demo; python_version >= '3.8'".parse()?;
        assert!(requirement.marker().is_some());
        assert!("not a requirement!!".parse::<RequirementSpec>().is_err());
        Ok(())
    }
}
