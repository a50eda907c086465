#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod archive;
pub mod error;
pub mod evaluator;
pub mod lazy;
pub mod link;
pub mod name;
pub mod package;
pub mod requirement;
pub mod source;
pub mod specifier;
pub mod tags;
pub mod wheel;

pub use archive::{is_archive_file, splitext, ArchiveKind, WHEEL_EXTENSION};
pub use error::{ConfigError, LinkMismatch};
pub use evaluator::{evaluate_package, parse_version_from_egg_info, Evaluator, FormatControl};
pub use lazy::{FindError, LazySequence};
pub use link::{HashOption, Link, LinkRecord, SUPPORTED_HASHES};
pub use name::{canonicalize_name, strip_extras};
pub use package::{Package, PackageRecord};
pub use requirement::RequirementSpec;
pub use source::Source;
pub use specifier::{fix_legacy_specifier, is_equality_specifier, parse_requires_python};
pub use tags::{HostEnvironment, PythonVersion, Tag, TargetPython, DEFAULT_PYTHON_VERSION};
pub use wheel::{BuildTag, WheelFilename, WheelFilenameError};
