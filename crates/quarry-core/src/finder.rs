//! Locating, ranking and fetching distributions across configured sources.

use std::{
    cmp::Reverse,
    collections::{BTreeSet, HashSet},
    iter,
    path::{Path, PathBuf},
    rc::Rc,
};

use anyhow::{Context, Result};
use pep440_rs::Version;
use quarry_domain::{
    canonicalize_name, evaluate_package, is_equality_specifier, BuildTag, ConfigError, Evaluator,
    FindError, FormatControl, HashOption, LazySequence, Link, Package, RequirementSpec, Source,
    TargetPython, WheelFilename,
};
use tracing::{debug, info};
use url::Url;

use crate::{
    collector::{JsonLinkCollector, LinkCollector},
    hashes::{validate_hashes, HashCache},
    preparer::{ArchiveUnpacker, Unpacker},
    session::{PyPISession, SessionOptions},
    transport::Transport,
};

/// Name-set marker selecting every project.
pub const ALL_NAMES: &str = ":all:";

/// Descending ranking key: not yanked, preferred binary, version, tag fit, build.
type SortKey = (bool, bool, Option<Version>, Reverse<usize>, BuildTag);

/// The outcome of [`PackageFinder::find_best_match`].
///
/// `applicable` is a filtered view over `candidates`; both are lazy and
/// share one cache, so inspecting `best` only evaluates what it needs.
#[derive(Debug, Clone)]
pub struct BestMatch<'a> {
    pub best: Option<Package>,
    pub applicable: LazySequence<'a, Package>,
    pub candidates: LazySequence<'a, Package>,
}

/// Finds distributions for requirements across index and find-links sources.
///
/// A finder is single-threaded: its caches are shared through `Rc`, so it
/// cannot be moved to another thread.
///
/// ```compile_fail
/// fn assert_send<T: Send>() {}
/// assert_send::<quarry_core::PackageFinder>();
/// ```
pub struct PackageFinder {
    sources: Vec<Source>,
    target_python: Rc<TargetPython>,
    ignore_compatibility: bool,
    no_binary: BTreeSet<String>,
    only_binary: BTreeSet<String>,
    prefer_binary: BTreeSet<String>,
    respect_source_order: bool,
    transport: Box<dyn Transport>,
    collector: Box<dyn LinkCollector>,
    unpacker: Box<dyn Unpacker>,
    hash_cache: HashCache,
}

#[must_use]
pub struct PackageFinderBuilder {
    sources: Vec<Source>,
    target_python: TargetPython,
    ignore_compatibility: bool,
    no_binary: BTreeSet<String>,
    only_binary: BTreeSet<String>,
    prefer_binary: BTreeSet<String>,
    respect_source_order: bool,
    session: SessionOptions,
    transport: Option<Box<dyn Transport>>,
    collector: Option<Box<dyn LinkCollector>>,
    unpacker: Option<Box<dyn Unpacker>>,
}

fn name_set<I, S>(names: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|name| {
            let name = name.as_ref().trim();
            if name == ALL_NAMES {
                name.to_string()
            } else {
                canonicalize_name(name)
            }
        })
        .collect()
}

impl PackageFinderBuilder {
    fn new() -> Self {
        Self {
            sources: Vec::new(),
            target_python: TargetPython::default(),
            ignore_compatibility: false,
            no_binary: BTreeSet::new(),
            only_binary: BTreeSet::new(),
            prefer_binary: BTreeSet::new(),
            respect_source_order: false,
            session: SessionOptions::default(),
            transport: None,
            collector: None,
            unpacker: None,
        }
    }

    pub fn index_url(mut self, url: impl Into<String>) -> Self {
        self.sources.push(Source::index(url));
        self
    }

    pub fn find_links(mut self, url: impl Into<String>) -> Self {
        self.sources.push(Source::find_links(url));
        self
    }

    pub fn trusted_host(mut self, host: impl Into<String>) -> Self {
        self.session.trusted_hosts.push(host.into());
        self
    }

    pub fn target_python(mut self, target_python: TargetPython) -> Self {
        self.target_python = target_python;
        self
    }

    pub fn ignore_compatibility(mut self, ignore: bool) -> Self {
        self.ignore_compatibility = ignore;
        self
    }

    pub fn no_binary<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.no_binary.extend(name_set(names));
        self
    }

    pub fn only_binary<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.only_binary.extend(name_set(names));
        self
    }

    pub fn prefer_binary<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.prefer_binary.extend(name_set(names));
        self
    }

    pub fn respect_source_order(mut self, respect: bool) -> Self {
        self.respect_source_order = respect;
        self
    }

    /// Options for the default [`PyPISession`]; ignored with a custom transport.
    pub fn session_options(mut self, options: SessionOptions) -> Self {
        let trusted = std::mem::take(&mut self.session.trusted_hosts);
        self.session = options;
        self.session.trusted_hosts.extend(trusted);
        self
    }

    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    pub fn collector(mut self, collector: impl LinkCollector + 'static) -> Self {
        self.collector = Some(Box::new(collector));
        self
    }

    pub fn unpacker(mut self, unpacker: impl Unpacker + 'static) -> Self {
        self.unpacker = Some(Box::new(unpacker));
        self
    }

    pub fn build(self) -> Result<PackageFinder> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Box::new(PyPISession::new(self.session)?),
        };
        Ok(PackageFinder {
            sources: self.sources,
            target_python: Rc::new(self.target_python),
            ignore_compatibility: self.ignore_compatibility,
            no_binary: self.no_binary,
            only_binary: self.only_binary,
            prefer_binary: self.prefer_binary,
            respect_source_order: self.respect_source_order,
            transport,
            collector: self
                .collector
                .unwrap_or_else(|| Box::new(JsonLinkCollector::new())),
            unpacker: self.unpacker.unwrap_or_else(|| Box::new(ArchiveUnpacker)),
            hash_cache: HashCache::new(),
        })
    }
}

fn flatten_results<T>(result: Result<Vec<T>, FindError>) -> Vec<Result<T, FindError>> {
    match result {
        Ok(items) => items.into_iter().map(Ok).collect(),
        Err(err) => vec![Err(err)],
    }
}

/// A predicate keeping the first package seen for each link.
fn first_per_link() -> impl FnMut(&Package) -> bool {
    let mut seen = HashSet::new();
    move |package| seen.insert(package.link().clone())
}

fn build_find_link(location: &str) -> Result<Link, ConfigError> {
    let invalid = || ConfigError::InvalidFindLinks(location.to_string());
    let path = Path::new(location);
    if path.exists() {
        return Link::from_path(path).map_err(|_| invalid());
    }
    if location.contains("://") {
        return Link::parse(location).map_err(|_| invalid());
    }
    Err(invalid())
}

fn build_index_page_link(index_url: &str, package_name: &str) -> Result<Link, ConfigError> {
    let invalid = |err: url::ParseError| ConfigError::InvalidIndexUrl {
        url: index_url.to_string(),
        reason: err.to_string(),
    };
    let base = Url::parse(&format!("{}/", index_url.trim_end_matches('/'))).map_err(invalid)?;
    let page = base
        .join(&format!("{}/", canonicalize_name(package_name)))
        .map_err(invalid)?;
    Ok(Link::from_url(page))
}

impl PackageFinder {
    pub fn builder() -> PackageFinderBuilder {
        PackageFinderBuilder::new()
    }

    pub fn add_index_url(&mut self, url: impl Into<String>) {
        self.sources.push(Source::index(url));
    }

    /// Register a find-links location; it is resolved when a search runs.
    pub fn add_find_links(&mut self, url: impl Into<String>) {
        self.sources.push(Source::find_links(url));
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn target_python(&self) -> &TargetPython {
        &self.target_python
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn hash_cache(&self) -> &HashCache {
        &self.hash_cache
    }

    fn selects(names: &BTreeSet<String>, canonical: &str) -> bool {
        names.contains(canonical) || names.contains(ALL_NAMES)
    }

    /// An evaluator for `package_name` under this finder's format policy.
    pub fn build_evaluator(
        &self,
        package_name: &str,
        allow_yanked: bool,
    ) -> Result<Evaluator, ConfigError> {
        let canonical = canonicalize_name(package_name);
        let format_control = FormatControl::new(
            Self::selects(&self.only_binary, &canonical),
            Self::selects(&self.no_binary, &canonical),
        )?;
        Ok(Evaluator::new(package_name, Rc::clone(&self.target_python))
            .ignore_compatibility(self.ignore_compatibility)
            .allow_yanked(allow_yanked)
            .format_control(format_control))
    }

    /// Position of the best supported tag the package's wheel carries.
    ///
    /// Source archives rank after every supported tag; wheels without a
    /// supported tag rank last.
    fn tag_priority(&self, link: &Link) -> (usize, BuildTag) {
        let tags = self.target_python.supported_tags();
        if !link.is_wheel() {
            return (tags.len(), None);
        }
        match WheelFilename::parse(&link.filename()) {
            Ok(wheel) => {
                let priority = tags
                    .iter()
                    .position(|tag| wheel.tags.contains(tag))
                    .unwrap_or(tags.len() + 1);
                (priority, wheel.build)
            }
            Err(_) => (tags.len() + 1, None),
        }
    }

    fn sort_key(&self, package: &Package) -> SortKey {
        let link = package.link();
        let (priority, build) = self.tag_priority(link);
        let prefer_binary =
            link.is_wheel() && Self::selects(&self.prefer_binary, &canonicalize_name(package.name()));
        (
            !link.is_yanked(),
            prefer_binary,
            package.parsed_version(),
            Reverse(priority),
            build,
        )
    }

    /// Order packages best first; ties keep their discovery order.
    pub fn sort_packages(&self, packages: &mut [Package]) {
        packages.sort_by_cached_key(|package| Reverse(self.sort_key(package)));
    }

    fn source_location(&self, source: &Source, package_name: &str) -> Result<(Link, bool), ConfigError> {
        match source {
            Source::Index { url } => Ok((build_index_page_link(url, package_name)?, false)),
            Source::FindLinks { url } => Ok((build_find_link(url)?, true)),
        }
    }

    fn evaluate_source(
        &self,
        evaluator: &Evaluator,
        location: &Link,
        expand: bool,
    ) -> Result<Vec<Package>, FindError> {
        let links = self
            .collector
            .collect(self.transport.as_ref(), location, expand)?;
        let mut packages: Vec<Package> = links
            .filter_map(|link| evaluator.evaluate_link(&link))
            .collect();
        debug!(
            location = %location,
            found = packages.len(),
            package = evaluator.package_name(),
            "evaluated source"
        );
        if self.respect_source_order {
            self.sort_packages(&mut packages);
        }
        Ok(packages)
    }

    fn find_packages(
        &self,
        package_name: &str,
        allow_yanked: bool,
    ) -> Result<LazySequence<'_, Package>, FindError> {
        let evaluator = self.build_evaluator(package_name, allow_yanked)?;
        let locations = self
            .sources
            .iter()
            .map(|source| self.source_location(source, package_name))
            .collect::<Result<Vec<_>, _>>()?;
        let per_source = move |(location, expand): (Link, bool)| {
            self.evaluate_source(&evaluator, &location, expand)
        };

        if self.respect_source_order {
            let mut unique = first_per_link();
            return Ok(LazySequence::new(
                locations
                    .into_iter()
                    .map(per_source)
                    .flat_map(flatten_results)
                    .filter(move |result| match result {
                        Ok(package) => unique(package),
                        Err(_) => true,
                    }),
            ));
        }
        let ranked = iter::once_with(move || -> Result<Vec<Package>, FindError> {
            let mut all = Vec::new();
            for location in locations {
                all.extend(per_source(location)?);
            }
            self.sort_packages(&mut all);
            all.retain(first_per_link());
            Ok(all)
        });
        Ok(LazySequence::new(ranked.flat_map(flatten_results)))
    }

    fn check_hashes(&self, package: &Package, hashes: &HashOption) -> Result<bool, FindError> {
        Ok(validate_hashes(
            package,
            hashes,
            self.transport.as_ref(),
            &self.hash_cache,
        )?)
    }

    fn with_hashes<'a>(
        &'a self,
        packages: LazySequence<'a, Package>,
        hashes: Option<&HashOption>,
    ) -> LazySequence<'a, Package> {
        match hashes.filter(|hashes| !hashes.is_empty()) {
            Some(hashes) => {
                let hashes = hashes.clone();
                packages.try_filtered(move |package| self.check_hashes(package, &hashes))
            }
            None => packages,
        }
    }

    /// Every admissible package named `package_name`, best first.
    ///
    /// Find-links locations are resolved before anything is collected, so
    /// an invalid one fails here rather than during iteration.
    pub fn find_all_packages(
        &self,
        package_name: &str,
        allow_yanked: bool,
        hashes: Option<&HashOption>,
    ) -> Result<LazySequence<'_, Package>, FindError> {
        let packages = self.find_packages(package_name, allow_yanked)?;
        Ok(self.with_hashes(packages, hashes))
    }

    fn find_packages_from_requirement(
        &self,
        requirement: &RequirementSpec,
        allow_yanked: Option<bool>,
    ) -> Result<LazySequence<'_, Package>, FindError> {
        if let Some(url) = requirement.url() {
            let link = Link::parse(url)?;
            return Ok(LazySequence::from_items([Package::new(
                requirement.name(),
                None,
                link,
            )]));
        }
        let allow_yanked =
            allow_yanked.unwrap_or_else(|| is_equality_specifier(requirement.specifier()));
        self.find_packages(requirement.name(), allow_yanked)
    }

    fn applicable<'a>(
        &'a self,
        packages: &LazySequence<'a, Package>,
        requirement: &RequirementSpec,
        allow_prereleases: Option<bool>,
        hashes: Option<&HashOption>,
    ) -> LazySequence<'a, Package> {
        let requirement = requirement.clone();
        let matching = packages
            .filtered(move |package| evaluate_package(package, &requirement, allow_prereleases));
        self.with_hashes(matching, hashes)
    }

    /// Packages satisfying `requirement`, best first.
    ///
    /// Without an explicit `allow_yanked`, yanked files are admitted only for
    /// `==`/`===` pins.
    pub fn find_matches(
        &self,
        requirement: &RequirementSpec,
        allow_yanked: Option<bool>,
        allow_prereleases: Option<bool>,
        hashes: Option<&HashOption>,
    ) -> Result<LazySequence<'_, Package>, FindError> {
        let packages = self.find_packages_from_requirement(requirement, allow_yanked)?;
        Ok(self.applicable(&packages, requirement, allow_prereleases, hashes))
    }

    /// The best package for `requirement` plus the sequences it came from.
    pub fn find_best_match(
        &self,
        requirement: &RequirementSpec,
        allow_yanked: Option<bool>,
        allow_prereleases: Option<bool>,
        hashes: Option<&HashOption>,
    ) -> Result<BestMatch<'_>, FindError> {
        let candidates = self.find_packages_from_requirement(requirement, allow_yanked)?;
        let applicable = self.applicable(&candidates, requirement, allow_prereleases, hashes);
        let best = applicable.first()?;
        match &best {
            Some(package) => debug!(%package, "best match"),
            None => debug!(requirement = %requirement, "no applicable candidates"),
        }
        Ok(BestMatch {
            best,
            applicable,
            candidates,
        })
    }

    /// Fetch `link` and return the installable path under `location`.
    ///
    /// Remote files are kept in `download_dir`, or in a scratch directory
    /// removed afterwards. Hashes default to the ones the link declares.
    pub fn download_and_unpack(
        &self,
        link: &Link,
        location: &Path,
        download_dir: Option<&Path>,
        hashes: Option<&HashOption>,
    ) -> Result<PathBuf> {
        let declared = link.hash_option();
        let hashes = hashes.or(declared.as_ref());
        let scratch;
        let download_dir = match download_dir {
            Some(dir) => dir,
            None => {
                scratch = tempfile::Builder::new()
                    .prefix("quarry-download-")
                    .tempdir()
                    .context("failed to create a download directory")?;
                scratch.path()
            }
        };
        info!(link = %link, location = %location.display(), "preparing artifact");
        let path = self
            .unpacker
            .unpack(self.transport.as_ref(), link, download_dir, location, hashes)?;
        Ok(match link.subdirectory() {
            Some(subdirectory) => path.join(subdirectory),
            None => path,
        })
    }
}
