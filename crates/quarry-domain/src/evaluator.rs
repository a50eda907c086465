//! Per-link admission checks.

use std::{rc::Rc, str::FromStr};

use pep440_rs::Version;
use tracing::debug;

use crate::{
    archive::{is_known_extension, splitext},
    error::{ConfigError, LinkMismatch},
    link::Link,
    name::{canonicalize_name, strip_extras},
    package::Package,
    requirement::RequirementSpec,
    specifier::{self, python_satisfies},
    tags::TargetPython,
    wheel::WheelFilename,
};

/// Which distribution formats a name may use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatControl {
    only_binary: bool,
    no_binary: bool,
}

impl FormatControl {
    pub fn new(only_binary: bool, no_binary: bool) -> Result<Self, ConfigError> {
        if only_binary && no_binary {
            return Err(ConfigError::ConflictingFormatControl);
        }
        Ok(Self {
            only_binary,
            no_binary,
        })
    }

    pub fn only_binary(self) -> bool {
        self.only_binary
    }

    pub fn no_binary(self) -> bool {
        self.no_binary
    }

    pub fn check_format(self, link: &Link, project_name: &str) -> Result<(), LinkMismatch> {
        if self.only_binary && !link.is_wheel() {
            return Err(LinkMismatch::new(format!(
                "only binaries are allowed for {project_name}"
            )));
        }
        if self.no_binary && link.is_wheel() {
            return Err(LinkMismatch::new(format!(
                "no binary is allowed for {project_name}"
            )));
        }
        Ok(())
    }
}

/// Find where the project name ends inside a `name-version` token.
///
/// Each prefix is canonicalized and compared with `canonical_name`; the first
/// prefix that matches and is followed by `-` or `_` splits off the version.
pub fn parse_version_from_egg_info<'a>(egg_info: &'a str, canonical_name: &str) -> Option<&'a str> {
    egg_info
        .char_indices()
        .find(|&(idx, ch)| {
            matches!(ch, '-' | '_') && canonicalize_name(&egg_info[..idx]) == canonical_name
        })
        .map(|(idx, ch)| &egg_info[idx + ch.len_utf8()..])
}

/// Decides whether links are admissible candidates for one project name.
#[derive(Debug, Clone)]
pub struct Evaluator {
    package_name: String,
    canonical_name: String,
    target_python: Rc<TargetPython>,
    ignore_compatibility: bool,
    allow_yanked: bool,
    format_control: FormatControl,
}

impl Evaluator {
    pub fn new(package_name: &str, target_python: Rc<TargetPython>) -> Self {
        Self {
            package_name: package_name.to_string(),
            canonical_name: canonicalize_name(package_name),
            target_python,
            ignore_compatibility: false,
            allow_yanked: false,
            format_control: FormatControl::default(),
        }
    }

    #[must_use]
    pub fn ignore_compatibility(mut self, ignore: bool) -> Self {
        self.ignore_compatibility = ignore;
        self
    }

    #[must_use]
    pub fn allow_yanked(mut self, allow: bool) -> Self {
        self.allow_yanked = allow;
        self
    }

    #[must_use]
    pub fn format_control(mut self, format_control: FormatControl) -> Self {
        self.format_control = format_control;
        self
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn target_python(&self) -> &TargetPython {
        &self.target_python
    }

    pub fn check_yanked(&self, link: &Link) -> Result<(), LinkMismatch> {
        match link.yank_reason() {
            Some(reason) if !self.allow_yanked => Err(LinkMismatch::new(if reason.is_empty() {
                "yanked".to_string()
            } else {
                format!("yanked due to {reason}")
            })),
            _ => Ok(()),
        }
    }

    pub fn check_requires_python(&self, link: &Link) -> Result<(), LinkMismatch> {
        let Some(requires_python) = link.requires_python().filter(|raw| !raw.is_empty()) else {
            return Ok(());
        };
        if self.ignore_compatibility {
            return Ok(());
        }
        let python = self.target_python.effective_version();
        match python_satisfies(requires_python, python) {
            Ok(true) => Ok(()),
            Ok(false) => Err(LinkMismatch::new(format!(
                "the target python version ({python}) doesn't match the requires-python specifier {requires_python}"
            ))),
            Err(_) => Err(LinkMismatch::new(format!(
                "invalid requires-python: {requires_python}"
            ))),
        }
    }

    fn check_wheel(&self, link: &Link) -> Result<String, LinkMismatch> {
        let wheel = WheelFilename::parse(&link.filename())
            .map_err(|err| LinkMismatch::new(err.to_string()))?;
        if wheel.name != self.canonical_name {
            return Err(LinkMismatch::new(format!(
                "the package name doesn't match {}",
                wheel.name
            )));
        }
        if !self.ignore_compatibility {
            let supported = self.target_python.supported_tags();
            if !supported.iter().any(|tag| wheel.tags.contains(tag)) {
                let mut tags: Vec<String> = wheel.tags.iter().map(ToString::to_string).collect();
                tags.sort();
                return Err(LinkMismatch::new(format!(
                    "none of the wheel tags ({}) are compatible",
                    tags.join(", ")
                )));
            }
        }
        Ok(wheel.version.to_string())
    }

    fn check_sdist(&self, link: &Link) -> Result<String, LinkMismatch> {
        let filename = link.filename();
        let egg_info = match link.egg_fragment() {
            Some(egg) => strip_extras(&egg).to_string(),
            None => {
                let (stem, ext) = splitext(&filename);
                if ext.is_empty() {
                    return Err(LinkMismatch::new(format!("not a file: {filename}")));
                }
                if !is_known_extension(&ext.to_ascii_lowercase()) {
                    return Err(LinkMismatch::new(format!(
                        "unsupported archive format: {filename}"
                    )));
                }
                stem.to_string()
            }
        };
        let version = parse_version_from_egg_info(&egg_info, &self.canonical_name)
            .ok_or_else(|| LinkMismatch::new(format!("missing version in the filename {egg_info}")))?;
        Version::from_str(version).map_err(|_| {
            LinkMismatch::new(format!("invalid version in the filename {egg_info}: {version}"))
        })?;
        Ok(version.to_string())
    }

    /// Run every check in order, stopping at the first mismatch.
    pub fn check_link(&self, link: &Link) -> Result<Package, LinkMismatch> {
        self.format_control.check_format(link, &self.package_name)?;
        self.check_yanked(link)?;
        self.check_requires_python(link)?;
        let version = if link.is_wheel() {
            self.check_wheel(link)?
        } else {
            self.check_sdist(link)?
        };
        Ok(Package::new(&self.package_name, Some(version), link.clone()))
    }

    /// The package for `link`, or `None` when any check rejects it.
    pub fn evaluate_link(&self, link: &Link) -> Option<Package> {
        match self.check_link(link) {
            Ok(package) => Some(package),
            Err(reason) => {
                debug!(link = %link, %reason, "skipping link");
                None
            }
        }
    }
}

/// Whether `package` satisfies the requirement's name and version specifier.
pub fn evaluate_package(
    package: &Package,
    requirement: &RequirementSpec,
    allow_prereleases: Option<bool>,
) -> bool {
    if canonicalize_name(package.name()) != canonicalize_name(requirement.name()) {
        debug!(%package, requirement = requirement.name(), "skipping package: name mismatch");
        return false;
    }
    if package.version().is_some() {
        let admitted = package.parsed_version().is_some_and(|version| {
            specifier::contains(requirement.specifier(), &version, allow_prereleases)
        });
        if !admitted {
            debug!(
                %package,
                specifier = %requirement.specifier(),
                "skipping package: version doesn't match"
            );
            return false;
        }
    }
    true
}
