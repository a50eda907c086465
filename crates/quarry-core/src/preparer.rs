//! Fetching chosen artifacts and unpacking source archives.

use std::{
    fs::{self, File},
    io::{self, BufReader, Read, Write},
    path::{Component, Path, PathBuf},
};

use anyhow::{Context, Result};
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use quarry_domain::{ArchiveKind, HashOption, Link};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use xz2::read::XzDecoder;
use zip::ZipArchive;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::{error::UnpackError, hashes::HashValidator, transport::Transport};

const CHUNK_SIZE: usize = 64 * 1024;

/// Turns a chosen link into an installable path on disk.
pub trait Unpacker {
    /// Fetch `link` (remote files go to `download_dir`) and return the
    /// installable path: the wheel itself, or `location` with the source
    /// archive unpacked into it.
    fn unpack(
        &self,
        transport: &dyn Transport,
        link: &Link,
        download_dir: &Path,
        location: &Path,
        hashes: Option<&HashOption>,
    ) -> Result<PathBuf>;
}

/// Default [`Unpacker`] handling zip, tar, gzip, bzip2 and xz archives.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveUnpacker;

impl Unpacker for ArchiveUnpacker {
    fn unpack(
        &self,
        transport: &dyn Transport,
        link: &Link,
        download_dir: &Path,
        location: &Path,
        hashes: Option<&HashOption>,
    ) -> Result<PathBuf> {
        unpack_link(transport, link, download_dir, location, hashes)
    }
}

pub fn unpack_link(
    transport: &dyn Transport,
    link: &Link,
    download_dir: &Path,
    location: &Path,
    hashes: Option<&HashOption>,
) -> Result<PathBuf> {
    if let Some(parent) = location.parent() {
        fs::create_dir_all(parent)?;
    }
    let validator = HashValidator::new(link, hashes)?;
    let artifact = match link.file_path() {
        Some(path) if path.is_dir() => {
            info!(path = %path.display(), "using local directory directly");
            return Ok(path);
        }
        Some(path) => {
            validator.validate_path(&path)?;
            path
        }
        None => {
            let artifact = download_dir.join(link.filename());
            if !check_downloaded(link, &artifact, hashes)? {
                download(transport, link, &artifact, validator)?;
            }
            artifact
        }
    };

    if link.is_wheel() {
        if link.is_file() {
            return Ok(artifact);
        }
        let target = location.join(link.filename());
        if target != artifact {
            persist_or_copy(&artifact, &target)
                .with_context(|| format!("failed to move wheel to {}", target.display()))?;
        }
        return Ok(target);
    }

    unpack_archive(&artifact, location)?;
    Ok(location.to_path_buf())
}

/// Whether a previous download can be reused; stale files are removed.
fn check_downloaded(link: &Link, path: &Path, hashes: Option<&HashOption>) -> Result<bool> {
    if !path.is_file() {
        return Ok(false);
    }
    match HashValidator::new(link, hashes)?.validate_path(path) {
        Ok(()) => {
            info!(path = %path.display(), "using previously downloaded file");
            Ok(true)
        }
        Err(err) => {
            debug!(path = %path.display(), %err, "existing download does not match, removing");
            fs::remove_file(path)?;
            Ok(false)
        }
    }
}

fn download(
    transport: &dyn Transport,
    link: &Link,
    dest: &Path,
    mut validator: HashValidator,
) -> Result<()> {
    let response = transport.get(&link.url_without_fragment(), None)?;
    if !response.is_success() {
        return Err(UnpackError::DownloadFailed {
            link: link.redacted(),
            status: response.status,
        }
        .into());
    }
    let size = response
        .content_length
        .map_or_else(|| "unknown size".to_string(), |len| format!("{len} bytes"));
    info!(link = %link, size = %size, "downloading");
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    let mut body = response.body;
    let mut buffer = vec![0_u8; CHUNK_SIZE];
    loop {
        let read = body
            .read(&mut buffer)
            .with_context(|| format!("stream error for {}", link.filename()))?;
        if read == 0 {
            break;
        }
        validator.update(&buffer[..read]);
        tmp.write_all(&buffer[..read])?;
    }
    validator.validate()?;
    tmp.persist(dest)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to persist {}", dest.display()))?;
    Ok(())
}

fn persist_or_copy(src: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(err) if is_cross_device(&err) => fs::copy(src, dest).map(|_| ()),
        Err(err) => Err(err),
    }
}

fn is_cross_device(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(18))
}

/// Unpack `archive` into `dest`, dropping a single shared top-level directory.
pub fn unpack_archive(archive: &Path, dest: &Path) -> Result<()> {
    let kind = ArchiveKind::from_path(archive)
        .ok_or_else(|| UnpackError::UnknownArchive(archive.display().to_string()))?;
    fs::create_dir_all(dest)?;
    match kind {
        ArchiveKind::Zip => unzip_archive(archive, dest),
        _ => untar_archive(archive, kind, dest),
    }
    .with_context(|| format!("failed to unpack {}", archive.display()))
}

fn first_component(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_start_matches(['/', '\\']);
    match trimmed.find(['/', '\\']) {
        Some(idx) => Some((&trimmed[..idx], &trimmed[idx + 1..])),
        None => Some((trimmed, "")).filter(|(prefix, _)| !prefix.is_empty()),
    }
}

/// True when every entry lives under the same top-level directory.
fn has_leading_dir<'a>(paths: impl IntoIterator<Item = &'a str>) -> bool {
    let mut common: Option<&str> = None;
    for path in paths {
        let Some((prefix, _)) = first_component(path) else {
            return false;
        };
        match common {
            None => common = Some(prefix),
            Some(existing) if existing != prefix => return false,
            Some(_) => {}
        }
    }
    common.is_some()
}

/// Resolve an archive entry name to a path under `dest`, refusing escapes.
fn entry_target(name: &str, strip_leading: bool, dest: &Path) -> Result<Option<PathBuf>, UnpackError> {
    let relative = if strip_leading {
        first_component(name).map_or("", |(_, rest)| rest)
    } else {
        name
    };
    let relative = Path::new(relative);
    let mut target = dest.to_path_buf();
    let mut empty = true;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                target.push(part);
                empty = false;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(UnpackError::UnsafeEntry {
                    entry: name.to_string(),
                    dest: dest.to_path_buf(),
                });
            }
        }
    }
    Ok((!empty).then_some(target))
}

fn unzip_archive(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(BufReader::new(file))?;
    let leading = has_leading_dir(zip.file_names());
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let name = entry.name().to_string();
        if entry.enclosed_name().is_none() {
            return Err(UnpackError::UnsafeEntry {
                entry: name,
                dest: dest.to_path_buf(),
            }
            .into());
        }
        let Some(target) = entry_target(&name, leading, dest)? else {
            continue;
        };
        if entry.is_dir() || name.ends_with('/') {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&target)?;
        io::copy(&mut entry, &mut outfile)?;
        #[cfg(unix)]
        {
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
            }
        }
    }
    Ok(())
}

fn open_tar(archive: &Path, kind: ArchiveKind) -> Result<tar::Archive<Box<dyn Read>>> {
    let reader = BufReader::new(File::open(archive)?);
    let reader: Box<dyn Read> = match kind {
        ArchiveKind::TarGz => Box::new(GzDecoder::new(reader)),
        ArchiveKind::TarBz2 => Box::new(BzDecoder::new(reader)),
        ArchiveKind::TarXz => Box::new(XzDecoder::new(reader)),
        ArchiveKind::Tar | ArchiveKind::Zip => Box::new(reader),
    };
    Ok(tar::Archive::new(reader))
}

fn untar_archive(archive: &Path, kind: ArchiveKind, dest: &Path) -> Result<()> {
    let mut names = Vec::new();
    for entry in open_tar(archive, kind)?.entries()? {
        let entry = entry?;
        names.push(entry.path()?.to_string_lossy().into_owned());
    }
    let leading = has_leading_dir(names.iter().map(String::as_str));

    for entry in open_tar(archive, kind)?.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let Some(target) = entry_target(&name, leading, dest)? else {
            continue;
        };
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if !entry_type.is_file() {
            debug!(entry = %name, "skipping non-regular archive member");
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&target)
            .with_context(|| format!("failed to extract {name}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Response;
    use sha2::{Digest, Sha256};
    use std::{cell::Cell, io::Cursor};
    use url::Url;
    use zip::write::FileOptions;

    struct BytesTransport {
        body: Vec<u8>,
        status: u16,
        calls: Cell<usize>,
    }

    impl BytesTransport {
        fn new(body: Vec<u8>) -> Self {
            Self {
                body,
                status: 200,
                calls: Cell::new(0),
            }
        }
    }

    impl Transport for BytesTransport {
        fn get(&self, url: &Url, _accept: Option<&str>) -> Result<Response> {
            self.calls.set(self.calls.get() + 1);
            Ok(Response {
                url: url.clone(),
                status: self.status,
                content_type: None,
                content_length: Some(self.body.len() as u64),
                body: Box::new(Cursor::new(self.body.clone())),
            })
        }

        fn is_secure_origin(&self, _url: &Url) -> bool {
            true
        }
    }

    fn tar_gz(entries: &[(&str, &[u8])]) -> Result<Vec<u8>> {
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data)?;
        }
        Ok(builder.into_inner()?.finish()?)
    }

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Result<Vec<u8>> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer.start_file(*name, FileOptions::default())?;
            writer.write_all(data)?;
        }
        Ok(writer.finish()?.into_inner())
    }

    #[test]
    fn leading_directory_detection() {
        assert!(has_leading_dir(["demo-1.0/setup.py", "demo-1.0/src/a.py"]));
        assert!(!has_leading_dir(["demo-1.0/setup.py", "other/a.py"]));
        assert!(!has_leading_dir(Vec::<&str>::new()));
    }

    #[test]
    fn entry_targets_refuse_escapes() {
        let dest = Path::new("/tmp/out");
        assert!(matches!(
            entry_target("demo/../../etc/passwd", true, dest),
            Err(UnpackError::UnsafeEntry { .. })
        ));
        assert_eq!(
            entry_target("demo/pkg/a.py", true, dest).ok().flatten(),
            Some(dest.join("pkg/a.py"))
        );
        assert_eq!(entry_target("demo/", true, dest).ok().flatten(), None);
    }

    #[test]
    fn remote_sdist_is_downloaded_and_unpacked() -> Result<()> {
        let archive = tar_gz(&[
            ("demo-1.0/setup.py", b"print('hi')"),
            ("demo-1.0/demo/__init__.py", b""),
        ])?;
        let digest = hex::encode(Sha256::digest(&archive));
        let transport = BytesTransport::new(archive);
        let downloads = tempfile::tempdir()?;
        let dest = tempfile::tempdir()?;
        let location = dest.path().join("demo");
        let link = Link::parse("https://files.example/demo-1.0.tar.gz")?;
        let hashes = HashOption::from([("sha256".to_string(), vec![digest])]);

        let path = unpack_link(&transport, &link, downloads.path(), &location, Some(&hashes))?;
        assert_eq!(path, location);
        assert!(location.join("setup.py").is_file());
        assert!(location.join("demo/__init__.py").is_file());
        assert!(downloads.path().join("demo-1.0.tar.gz").is_file());

        unpack_link(&transport, &link, downloads.path(), &location, Some(&hashes))?;
        assert_eq!(transport.calls.get(), 1, "cached download is reused");
        Ok(())
    }

    #[test]
    fn hash_mismatch_is_fatal() -> Result<()> {
        let transport = BytesTransport::new(b"not what was promised".to_vec());
        let downloads = tempfile::tempdir()?;
        let dest = tempfile::tempdir()?;
        let link = Link::parse("https://files.example/demo-1.0.tar.gz")?;
        let hashes = HashOption::from([("sha256".to_string(), vec!["00".to_string()])]);
        let err = unpack_link(&transport, &link, downloads.path(), dest.path(), Some(&hashes))
            .expect_err("mismatch");
        assert!(matches!(
            err.downcast_ref::<UnpackError>(),
            Some(UnpackError::HashMismatch { .. })
        ));
        assert!(!downloads.path().join("demo-1.0.tar.gz").exists());
        Ok(())
    }

    #[test]
    fn failed_downloads_report_status() -> Result<()> {
        let mut transport = BytesTransport::new(Vec::new());
        transport.status = 404;
        let downloads = tempfile::tempdir()?;
        let link = Link::parse("https://files.example/demo-1.0.tar.gz")?;
        let err = unpack_link(&transport, &link, downloads.path(), downloads.path(), None)
            .expect_err("404");
        assert!(matches!(
            err.downcast_ref::<UnpackError>(),
            Some(UnpackError::DownloadFailed { status: 404, .. })
        ));
        Ok(())
    }

    #[test]
    fn remote_wheels_are_moved_not_unpacked() -> Result<()> {
        let wheel = zip_bytes(&[("demo/__init__.py", b"")])?;
        let transport = BytesTransport::new(wheel);
        let downloads = tempfile::tempdir()?;
        let dest = tempfile::tempdir()?;
        let link = Link::parse("https://files.example/demo-1.0-py3-none-any.whl")?;
        let path = unpack_link(&transport, &link, downloads.path(), dest.path(), None)?;
        assert_eq!(path, dest.path().join("demo-1.0-py3-none-any.whl"));
        assert!(path.is_file());
        Ok(())
    }

    #[test]
    fn local_wheels_and_directories_are_used_in_place() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let wheel_path = dir.path().join("demo-1.0-py3-none-any.whl");
        fs::write(&wheel_path, zip_bytes(&[("demo/__init__.py", b"")])?)?;
        let transport = BytesTransport::new(Vec::new());
        let dest = tempfile::tempdir()?;

        let wheel = Link::from_path(&wheel_path)?;
        assert_eq!(
            unpack_link(&transport, &wheel, dir.path(), dest.path(), None)?,
            wheel_path
        );
        let local_dir = Link::from_path(dir.path())?;
        assert_eq!(
            unpack_link(&transport, &local_dir, dir.path(), dest.path(), None)?,
            dir.path()
        );
        assert_eq!(transport.calls.get(), 0);
        Ok(())
    }

    #[test]
    fn zip_sdists_strip_their_top_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let archive = dir.path().join("demo-1.0.zip");
        fs::write(
            &archive,
            zip_bytes(&[("demo-1.0/setup.py", b""), ("demo-1.0/README", b"hi")])?,
        )?;
        let dest = dir.path().join("out");
        unpack_archive(&archive, &dest)?;
        assert_eq!(fs::read_to_string(dest.join("README"))?, "hi");
        Ok(())
    }

    #[test]
    fn unknown_archives_are_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let archive = dir.path().join("demo-1.0.rar");
        fs::write(&archive, b"")?;
        let err = unpack_archive(&archive, dir.path()).expect_err("unknown");
        assert!(matches!(
            err.downcast_ref::<UnpackError>(),
            Some(UnpackError::UnknownArchive(_))
        ));
        Ok(())
    }
}
