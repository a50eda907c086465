//! Digest computation and the per-finder hash cache.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    fs::File,
    io::Read,
    path::Path,
    str::FromStr,
};

use anyhow::{Context, Result};
use md5::Md5;
use quarry_domain::{HashOption, Link, Package};
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use tracing::debug;

use crate::{error::UnpackError, transport::Transport};

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

/// Algorithms tried when a digest has to be computed, strongest first.
const FETCH_PREFERENCE: &[HashAlgorithm] = &[
    HashAlgorithm::Sha256,
    HashAlgorithm::Sha512,
    HashAlgorithm::Sha384,
    HashAlgorithm::Sha224,
    HashAlgorithm::Sha1,
    HashAlgorithm::Md5,
];

impl HashAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha224 => "sha224",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = UnpackError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha224" => Ok(Self::Sha224),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            _ => Err(UnpackError::UnknownHash(name.to_string())),
        }
    }
}

enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha224(Sha224),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Md5 => Self::Md5(Md5::new()),
            HashAlgorithm::Sha1 => Self::Sha1(Sha1::new()),
            HashAlgorithm::Sha224 => Self::Sha224(Sha224::new()),
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            HashAlgorithm::Sha384 => Self::Sha384(Sha384::new()),
            HashAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        match self {
            Self::Md5(hasher) => hasher.update(chunk),
            Self::Sha1(hasher) => hasher.update(chunk),
            Self::Sha224(hasher) => hasher.update(chunk),
            Self::Sha256(hasher) => hasher.update(chunk),
            Self::Sha384(hasher) => hasher.update(chunk),
            Self::Sha512(hasher) => hasher.update(chunk),
        }
    }

    fn hexdigest(self) -> String {
        match self {
            Self::Md5(hasher) => hex::encode(hasher.finalize()),
            Self::Sha1(hasher) => hex::encode(hasher.finalize()),
            Self::Sha224(hasher) => hex::encode(hasher.finalize()),
            Self::Sha256(hasher) => hex::encode(hasher.finalize()),
            Self::Sha384(hasher) => hex::encode(hasher.finalize()),
            Self::Sha512(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

/// Stream `reader` through `algorithm`, returning the hex digest.
pub fn hash_reader(algorithm: HashAlgorithm, reader: &mut dyn Read) -> Result<String> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = vec![0_u8; CHUNK_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.hexdigest())
}

/// Checks streamed bytes against a set of allowed digests.
///
/// The check passes when any requested algorithm produced an allowed digest.
pub struct HashValidator {
    link: String,
    allowed: HashOption,
    got: Vec<(String, Hasher)>,
}

impl HashValidator {
    pub fn new(link: &Link, hashes: Option<&HashOption>) -> Result<Self, UnpackError> {
        let allowed: HashOption = hashes
            .map(|hashes| {
                hashes
                    .iter()
                    .map(|(name, values)| {
                        let mut values = values.clone();
                        values.sort();
                        (name.clone(), values)
                    })
                    .collect()
            })
            .unwrap_or_default();
        let got = allowed
            .keys()
            .map(|name| -> Result<(String, Hasher), UnpackError> {
                Ok((name.clone(), Hasher::new(name.parse()?)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            link: link.redacted(),
            allowed,
            got,
        })
    }

    pub fn update(&mut self, chunk: &[u8]) {
        for (_, hasher) in &mut self.got {
            hasher.update(chunk);
        }
    }

    pub fn validate(self) -> Result<(), UnpackError> {
        if self.allowed.is_empty() {
            return Ok(());
        }
        let mut gots = Vec::new();
        for (name, hasher) in self.got {
            let digest = hasher.hexdigest();
            if self.allowed.get(&name).is_some_and(|allowed| allowed.contains(&digest)) {
                return Ok(());
            }
            gots.push(format!("{name}:{digest}"));
        }
        let expected = self
            .allowed
            .iter()
            .flat_map(|(name, values)| values.iter().map(move |value| format!("{name}:{value}")))
            .collect::<Vec<_>>()
            .join(", ");
        Err(UnpackError::HashMismatch {
            link: self.link,
            expected,
            got: gots.join(", "),
        })
    }

    pub fn validate_path(mut self, path: &Path) -> Result<()> {
        if self.allowed.is_empty() {
            return Ok(());
        }
        let mut file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut buffer = vec![0_u8; CHUNK_SIZE];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            self.update(&buffer[..read]);
        }
        self.validate()?;
        Ok(())
    }
}

/// Digests computed for links during a finder's lifetime, keyed by URL.
///
/// Links stay immutable; fetched digests are recorded here instead.
#[derive(Debug, Default)]
pub struct HashCache {
    digests: RefCell<HashMap<String, BTreeMap<String, String>>>,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, link: &Link, algorithm: &str) -> Option<String> {
        self.digests
            .borrow()
            .get(link.url_without_fragment().as_str())
            .and_then(|digests| digests.get(algorithm).cloned())
    }

    pub fn insert(&self, link: &Link, algorithm: &str, digest: String) {
        self.digests
            .borrow_mut()
            .entry(link.url_without_fragment().to_string())
            .or_default()
            .insert(algorithm.to_string(), digest);
    }

    /// The digest for `link`, downloading the artifact once if necessary.
    pub fn get_or_fetch(
        &self,
        transport: &dyn Transport,
        link: &Link,
        algorithm: &str,
    ) -> Result<String> {
        if let Some(digest) = self.get(link, algorithm) {
            return Ok(digest);
        }
        let parsed: HashAlgorithm = algorithm.parse()?;
        debug!(link = %link, algorithm, "fetching artifact to compute its hash");
        let response = transport
            .get(&link.url_without_fragment(), None)?
            .error_for_status()?;
        let mut body = response.body;
        let digest = hash_reader(parsed, &mut body)
            .with_context(|| format!("failed to hash {link}"))?;
        self.insert(link, algorithm, digest.clone());
        Ok(digest)
    }
}

/// Whether `package` carries or produces a digest listed in `hashes`.
///
/// Known digests (on the link or cached) are checked first; otherwise the
/// artifact is fetched and hashed with the strongest requested algorithm.
/// Requests naming only unknown algorithms never match.
pub fn validate_hashes(
    package: &Package,
    hashes: &HashOption,
    transport: &dyn Transport,
    cache: &HashCache,
) -> Result<bool> {
    if hashes.is_empty() {
        return Ok(true);
    }
    let link = package.link();
    if let Some(link_hashes) = link.hash_option() {
        for (name, allowed) in hashes {
            if let Some(given) = link_hashes.get(name).and_then(|values| values.first()) {
                return Ok(allowed.contains(given));
            }
        }
    }
    for (name, allowed) in hashes {
        if let Some(digest) = cache.get(link, name) {
            return Ok(allowed.contains(&digest));
        }
    }
    let requested = FETCH_PREFERENCE.iter().find_map(|algorithm| {
        hashes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(algorithm.name()))
    });
    let Some((name, allowed)) = requested else {
        debug!(link = %link, "no computable hash algorithm requested");
        return Ok(false);
    };
    let digest = cache.get_or_fetch(transport, link, name)?;
    Ok(allowed.contains(&digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Response;
    use std::{cell::Cell, io::Cursor};
    use url::Url;

    struct CountingTransport {
        body: &'static [u8],
        calls: Cell<usize>,
    }

    impl Transport for CountingTransport {
        fn get(&self, url: &Url, _accept: Option<&str>) -> Result<Response> {
            self.calls.set(self.calls.get() + 1);
            Ok(Response {
                url: url.clone(),
                status: 200,
                content_type: None,
                content_length: Some(self.body.len() as u64),
                body: Box::new(Cursor::new(self.body)),
            })
        }

        fn is_secure_origin(&self, _url: &Url) -> bool {
            true
        }
    }

    fn sha256(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn package(url: &str) -> Result<Package> {
        Ok(Package::new("demo", Some("1.0".into()), Link::parse(url)?))
    }

    #[test]
    fn link_digests_are_trusted_without_fetching() -> Result<()> {
        let transport = CountingTransport {
            body: b"payload",
            calls: Cell::new(0),
        };
        let cache = HashCache::new();
        let package = package("https://f.example/demo-1.0.tar.gz#sha256=abc")?;
        let good = HashOption::from([("sha256".to_string(), vec!["abc".to_string()])]);
        let bad = HashOption::from([("sha256".to_string(), vec!["def".to_string()])]);
        assert!(validate_hashes(&package, &good, &transport, &cache)?);
        assert!(!validate_hashes(&package, &bad, &transport, &cache)?);
        assert_eq!(transport.calls.get(), 0);
        Ok(())
    }

    #[test]
    fn missing_digests_are_fetched_once_and_cached() -> Result<()> {
        let transport = CountingTransport {
            body: b"payload",
            calls: Cell::new(0),
        };
        let cache = HashCache::new();
        let package = package("https://f.example/demo-1.0.tar.gz")?;
        let hashes = HashOption::from([("sha256".to_string(), vec![sha256(b"payload")])]);
        assert!(validate_hashes(&package, &hashes, &transport, &cache)?);
        assert!(validate_hashes(&package, &hashes, &transport, &cache)?);
        assert_eq!(transport.calls.get(), 1);
        assert!(package.link().hashes().is_empty());
        assert_eq!(
            cache.get(package.link(), "sha256"),
            Some(sha256(b"payload"))
        );
        Ok(())
    }

    #[test]
    fn strongest_requested_algorithm_is_fetched() -> Result<()> {
        let transport = CountingTransport {
            body: b"payload",
            calls: Cell::new(0),
        };
        let cache = HashCache::new();
        let package = package("https://f.example/demo-1.0.tar.gz")?;
        let hashes = HashOption::from([
            ("md5".to_string(), vec!["0".repeat(32)]),
            ("sha256".to_string(), vec![sha256(b"payload")]),
        ]);
        assert!(validate_hashes(&package, &hashes, &transport, &cache)?);
        assert!(cache.get(package.link(), "md5").is_none());
        Ok(())
    }

    #[test]
    fn unknown_algorithms_exclude_without_failing() -> Result<()> {
        let transport = CountingTransport {
            body: b"payload",
            calls: Cell::new(0),
        };
        let cache = HashCache::new();
        let package = package("https://f.example/demo-1.0.tar.gz")?;
        let hashes = HashOption::from([("whirlpool".to_string(), vec!["00".to_string()])]);
        assert!(!validate_hashes(&package, &hashes, &transport, &cache)?);
        assert_eq!(transport.calls.get(), 0);

        let md5 = HashOption::from([(
            "md5".to_string(),
            vec![hex::encode(Md5::digest(b"payload"))],
        )]);
        assert!(validate_hashes(&package, &md5, &transport, &cache)?);
        Ok(())
    }

    #[test]
    fn validator_reports_mismatch() -> Result<()> {
        let link = Link::parse("https://f.example/demo-1.0.tar.gz")?;
        let hashes = HashOption::from([("sha256".to_string(), vec![sha256(b"expected")])]);
        let mut validator = HashValidator::new(&link, Some(&hashes))?;
        validator.update(b"something else");
        assert!(matches!(
            validator.validate(),
            Err(UnpackError::HashMismatch { .. })
        ));

        let mut validator = HashValidator::new(&link, Some(&hashes))?;
        validator.update(b"expected");
        assert!(validator.validate().is_ok());
        Ok(())
    }

    #[test]
    fn unknown_algorithms_are_rejected() -> Result<()> {
        let link = Link::parse("https://f.example/demo-1.0.tar.gz")?;
        let hashes = HashOption::from([("whirlpool".to_string(), vec!["00".to_string()])]);
        assert!(matches!(
            HashValidator::new(&link, Some(&hashes)),
            Err(UnpackError::UnknownHash(_))
        ));
        Ok(())
    }
}
