//! Version specifier helpers shared by the evaluator and the finder.

use std::str::FromStr;

use pep440_rs::{Operator, Version, VersionSpecifiers};
use thiserror::Error;

use crate::tags::PythonVersion;

const OPERATORS: &[&str] = &["===", "~=", "==", "!=", "<=", ">=", "<", ">"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid specifier `{specifier}`: {reason}")]
pub struct InvalidSpecifier {
    pub specifier: String,
    pub reason: String,
}

/// A specifier that admits every version.
pub fn any_version() -> VersionSpecifiers {
    std::iter::empty().collect()
}

pub fn parse_specifiers(specifier: &str) -> Result<VersionSpecifiers, InvalidSpecifier> {
    if specifier.trim().is_empty() {
        return Ok(any_version());
    }
    VersionSpecifiers::from_str(specifier).map_err(|err| InvalidSpecifier {
        specifier: specifier.to_string(),
        reason: err.to_string(),
    })
}

/// Rewrite clauses that older metadata used but current grammar rejects.
///
/// Wildcards on ordering operators become `.0` bounds (`>4.*` means `>=4.0`,
/// `<=4.*` means `<4.0`) and local labels are dropped from ordering clauses.
/// `==` and `!=` clauses are left alone.
pub fn fix_legacy_specifier(specifier: &str) -> String {
    specifier
        .split(',')
        .map(|clause| fix_clause(clause.trim()))
        .collect::<Vec<_>>()
        .join(",")
}

fn fix_clause(clause: &str) -> String {
    let Some(operator) = OPERATORS.iter().find(|op| clause.starts_with(**op)) else {
        return clause.to_string();
    };
    let version = clause[operator.len()..].trim();
    match *operator {
        "==" | "!=" | "===" | "~=" => clause.to_string(),
        _ if version.contains(".*") => {
            let version = version.replace(".*", ".0");
            let operator = match *operator {
                "<" | "<=" => "<",
                _ => ">=",
            };
            format!("{operator}{version}")
        }
        _ => {
            let version = version.split_once('+').map_or(version, |(public, _)| public);
            format!("{operator}{version}")
        }
    }
}

/// Parse a `requires-python` declaration.
///
/// A bare major number `N` means `>=N,<N+1`; everything else goes through
/// [`fix_legacy_specifier`] first.
pub fn parse_requires_python(requires_python: &str) -> Result<VersionSpecifiers, InvalidSpecifier> {
    let trimmed = requires_python.trim();
    if !trimmed.is_empty() && trimmed.chars().all(|ch| ch.is_ascii_digit()) {
        let out_of_range = || InvalidSpecifier {
            specifier: requires_python.to_string(),
            reason: "major version out of range".to_string(),
        };
        let major: u64 = trimmed.parse().map_err(|_| out_of_range())?;
        let next = major.checked_add(1).ok_or_else(out_of_range)?;
        return parse_specifiers(&format!(">={major},<{next}"));
    }
    parse_specifiers(&fix_legacy_specifier(trimmed))
}

/// Whether `python` satisfies the `requires-python` declaration; pre-releases
/// of the interpreter are always admitted.
pub fn python_satisfies(
    requires_python: &str,
    python: PythonVersion,
) -> Result<bool, InvalidSpecifier> {
    let specifiers = parse_requires_python(requires_python)?;
    let version = Version::from_str(&python.to_string()).map_err(|err| InvalidSpecifier {
        specifier: python.to_string(),
        reason: err.to_string(),
    })?;
    Ok(specifiers.contains(&version))
}

/// True when any clause pins with `==` or `===`.
pub fn is_equality_specifier(specifiers: &VersionSpecifiers) -> bool {
    specifiers
        .iter()
        .any(|spec| matches!(spec.operator(), Operator::Equal | Operator::ExactEqual))
}

/// Whether pre-releases are admitted when the caller expresses no preference:
/// only if an inclusive clause names a pre-release version.
pub fn implies_prereleases(specifiers: &VersionSpecifiers) -> bool {
    specifiers.iter().any(|spec| {
        matches!(
            spec.operator(),
            Operator::Equal
                | Operator::EqualStar
                | Operator::ExactEqual
                | Operator::GreaterThanEqual
                | Operator::LessThanEqual
                | Operator::TildeEqual
        ) && spec.version().any_prerelease()
    })
}

/// Check `version` against `specifiers` with an explicit or inferred
/// pre-release policy.
pub fn contains(
    specifiers: &VersionSpecifiers,
    version: &Version,
    allow_prereleases: Option<bool>,
) -> bool {
    let allow_prereleases = allow_prereleases.unwrap_or_else(|| implies_prereleases(specifiers));
    if version.any_prerelease() && !allow_prereleases {
        return false;
    }
    specifiers.contains(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(raw: &str) -> Version {
        Version::from_str(raw).expect("valid version")
    }

    #[test]
    fn legacy_wildcards_become_bounds() {
        assert_eq!(fix_legacy_specifier(">=4.*"), ">=4.0");
        assert_eq!(fix_legacy_specifier(">4.*"), ">=4.0");
        assert_eq!(fix_legacy_specifier("<=4.*"), "<4.0");
        assert_eq!(fix_legacy_specifier(">=3.6, !=3.7.*"), ">=3.6,!=3.7.*");
        assert_eq!(fix_legacy_specifier(">=1.0+local"), ">=1.0");
        assert_eq!(fix_legacy_specifier("==1.0+local"), "==1.0+local");
    }

    #[test]
    fn bare_major_requires_python() -> Result<(), InvalidSpecifier> {
        assert!(python_satisfies("3", PythonVersion::new(3, 11))?);
        assert!(!python_satisfies("2", PythonVersion::new(3, 11))?);
        Ok(())
    }

    #[test]
    fn oversized_major_is_rejected() {
        let err = parse_requires_python("18446744073709551615").expect_err("no next major");
        assert_eq!(err.reason, "major version out of range");
        assert!(parse_requires_python("99999999999999999999999").is_err());
        assert!(python_satisfies("18446744073709551615", PythonVersion::new(3, 12)).is_err());
    }

    #[test]
    fn requires_python_bounds() -> Result<(), InvalidSpecifier> {
        assert!(!python_satisfies(">=3.9", PythonVersion::new(3, 8))?);
        assert!(python_satisfies(">=3.9", PythonVersion::new(3, 10))?);
        assert!(python_satisfies(">=3.6, <4.*", PythonVersion::new(3, 12))?);
        assert!(python_satisfies("not a specifier", PythonVersion::new(3, 12)).is_err());
        Ok(())
    }

    #[test]
    fn equality_detection() -> Result<(), InvalidSpecifier> {
        assert!(is_equality_specifier(&parse_specifiers("==1.0")?));
        assert!(is_equality_specifier(&parse_specifiers(">=1,===1.2")?));
        assert!(!is_equality_specifier(&parse_specifiers(">=1.0")?));
        assert!(!is_equality_specifier(&any_version()));
        Ok(())
    }

    #[test]
    fn prerelease_policy_is_inferred() -> Result<(), InvalidSpecifier> {
        let plain = parse_specifiers(">=1.0")?;
        assert!(!contains(&plain, &version("2.0a1"), None));
        assert!(contains(&plain, &version("2.0a1"), Some(true)));
        assert!(contains(&plain, &version("2.0"), None));

        let pinned = parse_specifiers(">=2.0b1")?;
        assert!(contains(&pinned, &version("2.0b2"), None));
        assert!(!contains(&pinned, &version("2.0b2"), Some(false)));

        assert!(!contains(&any_version(), &version("1.0rc1"), None));
        Ok(())
    }
}
