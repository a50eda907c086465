//! Compatibility tags and the target interpreter they are derived from.

use std::{collections::HashSet, env, fmt, str::FromStr};

use anyhow::{anyhow, bail, Result};
use indexmap::IndexSet;
use once_cell::unsync::OnceCell;

/// Interpreter version assumed for the host when nothing else is configured.
pub const DEFAULT_PYTHON_VERSION: PythonVersion = PythonVersion {
    major: 3,
    minor: 12,
};
const DEFAULT_GLIBC: (u32, u32) = (2, 28);
const DEFAULT_MACOS: (u32, u32) = (14, 0);

/// An `(interpreter, abi, platform)` triple such as `cp312-cp312-manylinux_2_17_x86_64`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    interpreter: String,
    abi: String,
    platform: String,
}

impl Tag {
    pub fn new(interpreter: &str, abi: &str, platform: &str) -> Self {
        Self {
            interpreter: interpreter.to_ascii_lowercase(),
            abi: abi.to_ascii_lowercase(),
            platform: platform.to_ascii_lowercase(),
        }
    }

    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    pub fn abi(&self) -> &str {
        &self.abi
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.interpreter, self.abi, self.platform)
    }
}

/// Expand a compressed tag triple (`py2.py3-none-any`) into its tags.
pub fn parse_tag(tag: &str) -> Result<HashSet<Tag>> {
    let mut parts = tag.split('-');
    let (Some(interpreters), Some(abis), Some(platforms), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        bail!("invalid compatibility tag `{tag}`");
    };
    let mut tags = HashSet::new();
    for interpreter in interpreters.split('.') {
        for abi in abis.split('.') {
            for platform in platforms.split('.') {
                tags.insert(Tag::new(interpreter, abi, platform));
            }
        }
    }
    Ok(tags)
}

/// A `major.minor` interpreter version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PythonVersion {
    pub major: u32,
    pub minor: u32,
}

impl PythonVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    fn nodot(self) -> String {
        format!("{}{}", self.major, self.minor)
    }
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for PythonVersion {
    type Err = anyhow::Error;

    /// Accepts `3.11` or `3.11.4`; components past the minor are ignored.
    fn from_str(value: &str) -> Result<Self> {
        let mut parts = value.trim().split('.');
        let parse = |part: Option<&str>| -> Result<u32> {
            part.and_then(|raw| raw.parse().ok())
                .ok_or_else(|| anyhow!("invalid python version `{value}`, expected MAJOR.MINOR"))
        };
        let major = parse(parts.next())?;
        let minor = parse(parts.next())?;
        Ok(Self { major, minor })
    }
}

/// Facts about the running machine used when a [`TargetPython`] field is unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEnvironment {
    pub python_version: PythonVersion,
    pub implementation: String,
    pub platforms: Vec<String>,
}

impl HostEnvironment {
    /// Describe the current machine, assuming `python_version` for the interpreter.
    pub fn detect(python_version: PythonVersion) -> Self {
        Self {
            python_version,
            implementation: "cp".to_string(),
            platforms: host_platforms(env::consts::OS, env::consts::ARCH),
        }
    }
}

impl Default for HostEnvironment {
    fn default() -> Self {
        Self::detect(DEFAULT_PYTHON_VERSION)
    }
}

/// The environment candidates must be compatible with.
///
/// Unset fields fall back to the [`HostEnvironment`]. The supported tag list
/// is computed on first use and cached.
#[derive(Debug, Clone, Default)]
pub struct TargetPython {
    py_ver: Option<PythonVersion>,
    abis: Option<Vec<String>>,
    implementation: Option<String>,
    platforms: Option<Vec<String>>,
    host: HostEnvironment,
    valid_tags: OnceCell<Vec<Tag>>,
}

impl TargetPython {
    pub fn new(
        py_ver: Option<PythonVersion>,
        abis: Option<Vec<String>>,
        implementation: Option<String>,
        platforms: Option<Vec<String>>,
    ) -> Self {
        Self {
            py_ver,
            abis,
            implementation,
            platforms,
            host: HostEnvironment::default(),
            valid_tags: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn with_host(mut self, host: HostEnvironment) -> Self {
        self.host = host;
        self.valid_tags = OnceCell::new();
        self
    }

    pub fn py_ver(&self) -> Option<PythonVersion> {
        self.py_ver
    }

    /// The configured interpreter version, or the host's.
    pub fn effective_version(&self) -> PythonVersion {
        self.py_ver.unwrap_or(self.host.python_version)
    }

    /// Supported tags, most preferred first.
    pub fn supported_tags(&self) -> &[Tag] {
        self.valid_tags.get_or_init(|| self.compute_tags())
    }

    fn compute_tags(&self) -> Vec<Tag> {
        let version = self.effective_version();
        let implementation = self
            .implementation
            .clone()
            .unwrap_or_else(|| self.host.implementation.clone());
        let platforms = match &self.platforms {
            Some(platforms) => expand_allowed_platforms(platforms),
            None => self.host.platforms.clone(),
        };
        let interpreter = format!("{implementation}{}", version.nodot());

        let mut tags = IndexSet::new();
        if implementation == "cp" {
            cpython_tags(version, self.abis.as_deref(), &platforms, &mut tags);
        } else {
            generic_tags(&interpreter, self.abis.as_deref(), &platforms, &mut tags);
        }
        compatible_tags(version, &interpreter, &platforms, &mut tags);
        tags.into_iter().collect()
    }
}

fn cpython_tags(
    version: PythonVersion,
    abis: Option<&[String]>,
    platforms: &[String],
    out: &mut IndexSet<Tag>,
) {
    let interpreter = format!("cp{}", version.nodot());
    let abis: Vec<String> = match abis {
        Some(abis) => abis
            .iter()
            .filter(|abi| !matches!(abi.as_str(), "abi3" | "none"))
            .cloned()
            .collect(),
        None if (version.major, version.minor) >= (3, 8) => vec![format!("cp{}", version.nodot())],
        None => vec![format!("cp{}m", version.nodot())],
    };
    let abi3 = (version.major, version.minor) >= (3, 2);

    for abi in &abis {
        for platform in platforms {
            out.insert(Tag::new(&interpreter, abi, platform));
        }
    }
    if abi3 {
        for platform in platforms {
            out.insert(Tag::new(&interpreter, "abi3", platform));
        }
    }
    for platform in platforms {
        out.insert(Tag::new(&interpreter, "none", platform));
    }
    if abi3 {
        for minor in (2..version.minor).rev() {
            let older = format!("cp{}{}", version.major, minor);
            for platform in platforms {
                out.insert(Tag::new(&older, "abi3", platform));
            }
        }
    }
}

fn generic_tags(
    interpreter: &str,
    abis: Option<&[String]>,
    platforms: &[String],
    out: &mut IndexSet<Tag>,
) {
    let mut abis: Vec<String> = abis.map(<[String]>::to_vec).unwrap_or_default();
    if !abis.iter().any(|abi| abi == "none") {
        abis.push("none".to_string());
    }
    for abi in &abis {
        for platform in platforms {
            out.insert(Tag::new(interpreter, abi, platform));
        }
    }
}

fn py_interpreter_range(version: PythonVersion) -> Vec<String> {
    let mut range = vec![
        format!("py{}", version.nodot()),
        format!("py{}", version.major),
    ];
    range.extend((0..version.minor).rev().map(|minor| format!("py{}{minor}", version.major)));
    range
}

fn compatible_tags(
    version: PythonVersion,
    interpreter: &str,
    platforms: &[String],
    out: &mut IndexSet<Tag>,
) {
    let range = py_interpreter_range(version);
    for py in &range {
        for platform in platforms {
            out.insert(Tag::new(py, "none", platform));
        }
    }
    out.insert(Tag::new(interpreter, "none", "any"));
    for py in &range {
        out.insert(Tag::new(py, "none", "any"));
    }
}

/// Expand user supplied platforms into every platform they imply.
fn expand_allowed_platforms(platforms: &[String]) -> Vec<String> {
    let mut seen = IndexSet::new();
    for platform in platforms {
        for expanded in custom_platforms(platform) {
            seen.insert(expanded);
        }
    }
    seen.into_iter().collect()
}

fn custom_platforms(arch: &str) -> Vec<String> {
    let (prefix, suffix) = arch.split_once('_').unwrap_or((arch, ""));
    if arch.starts_with("macosx") {
        custom_mac_platforms(arch)
    } else if prefix == "manylinux2014" {
        let mut arches = vec![arch.to_string()];
        if matches!(suffix, "i686" | "x86_64") {
            arches.push(format!("manylinux2010_{suffix}"));
            arches.push(format!("manylinux1_{suffix}"));
        }
        arches
    } else if prefix == "manylinux2010" {
        vec![arch.to_string(), format!("manylinux1_{suffix}")]
    } else {
        vec![arch.to_string()]
    }
}

fn custom_mac_platforms(arch: &str) -> Vec<String> {
    let mut parts = arch.splitn(4, '_');
    let (Some(_), Some(major), Some(minor), Some(cpu)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return vec![arch.to_string()];
    };
    match (major.parse::<u32>(), minor.parse::<u32>()) {
        (Ok(major), Ok(minor)) => mac_platforms((major, minor), cpu),
        _ => vec![arch.to_string()],
    }
}

fn mac_binary_formats(version: (u32, u32), cpu: &str) -> Vec<String> {
    let mut formats = vec![cpu.to_string()];
    if cpu == "x86_64" {
        if version < (10, 4) {
            return Vec::new();
        }
        formats.extend(["intel", "fat64", "fat32"].map(String::from));
    }
    if matches!(cpu, "arm64" | "x86_64") {
        formats.push("universal2".to_string());
    }
    if cpu == "x86_64" {
        formats.push("universal".to_string());
    }
    formats
}

fn mac_platforms(version: (u32, u32), cpu: &str) -> Vec<String> {
    let mut out = Vec::new();
    if (10..11).contains(&version.0) {
        for minor in (0..=version.1).rev() {
            for format in mac_binary_formats((10, minor), cpu) {
                out.push(format!("macosx_10_{minor}_{format}"));
            }
        }
    }
    if version.0 >= 11 {
        for major in (11..=version.0).rev() {
            for format in mac_binary_formats((major, 0), cpu) {
                out.push(format!("macosx_{major}_0_{format}"));
            }
        }
        for minor in (4..=16).rev() {
            if cpu == "x86_64" {
                for format in mac_binary_formats((10, minor), cpu) {
                    out.push(format!("macosx_10_{minor}_{format}"));
                }
            } else {
                out.push(format!("macosx_10_{minor}_universal2"));
            }
        }
    }
    out
}

fn manylinux_platforms(glibc: (u32, u32), arch: &str) -> Vec<String> {
    let floor = if matches!(arch, "x86_64" | "i686") { 5 } else { 17 };
    let mut out = Vec::new();
    for minor in (floor..=glibc.1).rev() {
        out.push(format!("manylinux_2_{minor}_{arch}"));
        let legacy = match minor {
            17 => Some("manylinux2014"),
            12 => Some("manylinux2010"),
            5 => Some("manylinux1"),
            _ => None,
        };
        if let Some(legacy) = legacy {
            out.push(format!("{legacy}_{arch}"));
        }
    }
    out
}

fn host_platforms(os: &str, arch: &str) -> Vec<String> {
    match os {
        "linux" => {
            let arch = match arch {
                "x86" => "i686",
                other => other,
            };
            let mut platforms = manylinux_platforms(DEFAULT_GLIBC, arch);
            platforms.push(format!("linux_{arch}"));
            platforms
        }
        "macos" => {
            let cpu = if arch == "aarch64" { "arm64" } else { arch };
            mac_platforms(DEFAULT_MACOS, cpu)
        }
        "windows" => vec![match arch {
            "x86" => "win32".to_string(),
            "aarch64" => "win_arm64".to_string(),
            _ => "win_amd64".to_string(),
        }],
        other => vec![format!("{other}_{arch}")],
    }
}
