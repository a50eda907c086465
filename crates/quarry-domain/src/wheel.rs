use std::{collections::HashSet, str::FromStr};

use pep440_rs::Version;
use thiserror::Error;

use crate::{
    archive::WHEEL_EXTENSION,
    name::canonicalize_name,
    tags::{parse_tag, Tag},
};

/// Optional wheel build number plus its trailing label (`1a` is `(1, "a")`).
pub type BuildTag = Option<(u64, String)>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WheelFilenameError {
    #[error("invalid wheel filename (extension must be '.whl'): {0}")]
    Extension(String),
    #[error("invalid wheel filename (wrong number of parts): {0}")]
    Parts(String),
    #[error("invalid project name: {0}")]
    Name(String),
    #[error("invalid wheel filename (invalid version): {0}")]
    Version(String),
    #[error("invalid build number: {0}")]
    Build(String),
    #[error("invalid wheel filename (invalid tags): {0}")]
    Tags(String),
}

/// The parsed components of a `.whl` file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelFilename {
    pub name: String,
    pub version: Version,
    pub build: BuildTag,
    pub tags: HashSet<Tag>,
}

impl WheelFilename {
    pub fn parse(filename: &str) -> Result<Self, WheelFilenameError> {
        let stem = filename
            .strip_suffix(WHEEL_EXTENSION)
            .ok_or_else(|| WheelFilenameError::Extension(filename.to_string()))?;
        let parts: Vec<&str> = stem.split('-').collect();
        if !matches!(parts.len(), 5 | 6) {
            return Err(WheelFilenameError::Parts(filename.to_string()));
        }

        let raw_name = parts[0];
        if raw_name.is_empty()
            || raw_name.contains("__")
            || !raw_name
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.'))
        {
            return Err(WheelFilenameError::Name(filename.to_string()));
        }

        let version = Version::from_str(parts[1])
            .map_err(|_| WheelFilenameError::Version(filename.to_string()))?;

        let build = if parts.len() == 6 {
            Some(parse_build(parts[2]).ok_or_else(|| WheelFilenameError::Build(parts[2].to_string()))?)
        } else {
            None
        };

        let tag_triple = parts[parts.len() - 3..].join("-");
        let tags =
            parse_tag(&tag_triple).map_err(|_| WheelFilenameError::Tags(filename.to_string()))?;

        Ok(Self {
            name: canonicalize_name(raw_name),
            version,
            build,
            tags,
        })
    }
}

fn parse_build(raw: &str) -> Option<(u64, String)> {
    let digits = raw.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let number = raw[..digits].parse().ok()?;
    Some((number, raw[digits..].to_string()))
}
