//! Archive extensions recognised for source and binary distributions.

use std::path::Path;

pub const WHEEL_EXTENSION: &str = ".whl";
pub const BZ2_EXTENSIONS: &[&str] = &[".tar.bz2", ".tbz"];
pub const XZ_EXTENSIONS: &[&str] = &[".tar.xz", ".txz", ".tlz", ".tar.lz", ".tar.lzma"];
pub const ZIP_EXTENSIONS: &[&str] = &[".zip", WHEEL_EXTENSION];
pub const TAR_EXTENSIONS: &[&str] = &[".tar.gz", ".tgz", ".tar"];

/// The compression family used to unpack an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
    TarBz2,
    TarXz,
}

impl ArchiveKind {
    /// Detect the archive family from a file name.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let lower = filename.to_ascii_lowercase();
        if ZIP_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            Some(Self::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if BZ2_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            Some(Self::TarBz2)
        } else if XZ_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            Some(Self::TarXz)
        } else if lower.ends_with(".tar") {
            Some(Self::Tar)
        } else {
            None
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_name()
            .and_then(|name| name.to_str())
            .and_then(Self::from_filename)
    }
}

fn is_archive_extension(ext: &str) -> bool {
    ZIP_EXTENSIONS
        .iter()
        .chain(BZ2_EXTENSIONS)
        .chain(TAR_EXTENSIONS)
        .chain(XZ_EXTENSIONS)
        .any(|known| *known == ext)
}

/// Split a file name into `(stem, extension)`, keeping `.tar` with its
/// compression suffix (`demo-1.0.tar.gz` splits into `demo-1.0` and `.tar.gz`).
///
/// Leading dots belong to the stem, so `..gz` has no extension.
pub fn splitext(filename: &str) -> (&str, &str) {
    let name_start = filename.rfind(['/', '\\']).map_or(0, |idx| idx + 1);
    let has_stem = |dot: usize| filename[name_start..dot].bytes().any(|b| b != b'.');
    let (mut base, mut ext) = match filename.rfind('.') {
        Some(dot) if dot > name_start && has_stem(dot) => filename.split_at(dot),
        _ => (filename, ""),
    };
    if base.to_ascii_lowercase().ends_with(".tar") {
        let split = base.len() - 4;
        ext = &filename[split..];
        base = &filename[..split];
    }
    (base, ext)
}

/// Whether the file name carries a known archive extension.
pub fn is_archive_file(filename: &str) -> bool {
    let (_, ext) = splitext(filename);
    is_archive_extension(&ext.to_ascii_lowercase())
}

/// Whether `ext` (as returned by [`splitext`]) is an accepted archive suffix.
pub fn is_known_extension(ext: &str) -> bool {
    is_archive_extension(ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitext_keeps_tar_suffix_together() {
        assert_eq!(splitext("demo-1.0.tar.gz"), ("demo-1.0", ".tar.gz"));
        assert_eq!(splitext("demo-1.0.tar"), ("demo-1.0", ".tar"));
        assert_eq!(splitext("demo-1.0.zip"), ("demo-1.0", ".zip"));
        assert_eq!(splitext("demo"), ("demo", ""));
        assert_eq!(splitext(".hidden"), (".hidden", ""));
    }

    #[test]
    fn splitext_keeps_leading_dots_in_the_stem() {
        assert_eq!(splitext("..gz"), ("..gz", ""));
        assert_eq!(splitext("dist/..gz"), ("dist/..gz", ""));
        assert_eq!(splitext("dist/.demo.zip"), ("dist/.demo", ".zip"));
        assert_eq!(splitext(".tar.gz"), ("", ".tar.gz"));
        assert_eq!(splitext("dir.d/file"), ("dir.d/file", ""));
    }

    #[test]
    fn recognises_archives() {
        assert!(is_archive_file("demo-1.0.tar.bz2"));
        assert!(is_archive_file("demo-1.0-py3-none-any.whl"));
        assert!(is_archive_file("DEMO-1.0.TGZ"));
        assert!(!is_archive_file("demo-1.0.exe"));
        assert!(!is_archive_file("index.html"));
    }

    #[test]
    fn detects_kind_from_name() {
        assert_eq!(ArchiveKind::from_filename("a.tar.gz"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::from_filename("a.tbz"), Some(ArchiveKind::TarBz2));
        assert_eq!(ArchiveKind::from_filename("a.tar.xz"), Some(ArchiveKind::TarXz));
        assert_eq!(ArchiveKind::from_filename("a.whl"), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::from_filename("a.tar"), Some(ArchiveKind::Tar));
        assert_eq!(ArchiveKind::from_filename("a.rar"), None);
    }
}
