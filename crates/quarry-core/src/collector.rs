//! Link discovery from index pages and find-links locations.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    fs,
    path::Path,
    rc::Rc,
};

use anyhow::{bail, Context, Result};
use quarry_domain::{is_archive_file, Link};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::transport::{Transport, SIMPLE_JSON};

const SUPPORTED_CONTENT_TYPES: &[&str] = &[SIMPLE_JSON, "application/json"];
const LOCAL_INDEX: &str = "index.json";

/// Produces the links found at a location.
pub trait LinkCollector {
    /// Links at `location`. With `expand`, a local directory contributes
    /// every file it contains instead of only its `index.json`.
    fn collect<'a>(
        &'a self,
        transport: &'a dyn Transport,
        location: &Link,
        expand: bool,
    ) -> Result<Box<dyn Iterator<Item = Link> + 'a>>;
}

#[derive(Debug, Deserialize)]
struct ProjectPage {
    #[serde(default)]
    files: Vec<ProjectFile>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Yanked {
    Flag(bool),
    Reason(String),
}

#[derive(Debug, Deserialize)]
struct ProjectFile {
    url: Option<String>,
    #[serde(rename = "requires-python")]
    requires_python: Option<String>,
    yanked: Option<Yanked>,
    hashes: Option<BTreeMap<String, String>>,
}

/// Parse a PEP 691 project page, resolving file URLs against `base`.
pub fn parse_json_page(base: &Url, content: &str) -> Result<Vec<Link>> {
    let page: ProjectPage = serde_json::from_str(content)
        .with_context(|| format!("invalid project page at {base}"))?;
    let comes_from = base.to_string();
    let mut links = Vec::with_capacity(page.files.len());
    for file in page.files {
        let Some(raw) = file.url.filter(|url| !url.is_empty()) else {
            continue;
        };
        let url = match base.join(&raw) {
            Ok(url) => url,
            Err(err) => {
                debug!(url = %raw, %err, "skipping unparsable file URL");
                continue;
            }
        };
        let mut link = Link::from_url(url).with_comes_from(comes_from.clone());
        match file.yanked {
            Some(Yanked::Flag(true)) => link = link.with_yank_reason(""),
            Some(Yanked::Reason(reason)) if !reason.is_empty() => {
                link = link.with_yank_reason(reason);
            }
            _ => {}
        }
        if let Some(requires_python) = file.requires_python.filter(|value| !value.is_empty()) {
            link = link.with_requires_python(requires_python);
        }
        if let Some(hashes) = file.hashes {
            link = link.with_hashes(hashes);
        }
        links.push(link);
    }
    Ok(links)
}

/// Reads PEP 691 JSON pages and local directories.
///
/// Pages are memoized per URL for the collector's lifetime, so repeated
/// queries against the same finder do not refetch them.
#[derive(Debug, Default)]
pub struct JsonLinkCollector {
    pages: RefCell<HashMap<Url, Rc<Vec<Link>>>>,
}

impl JsonLinkCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn fetch_page(&self, transport: &dyn Transport, location: &Url) -> Result<Rc<Vec<Link>>> {
        if let Some(page) = self.pages.borrow().get(location) {
            return Ok(Rc::clone(page));
        }
        debug!(url = %location, "fetching index page");
        let response = transport.get(location, Some(SIMPLE_JSON))?.error_for_status()?;
        let content_type = response
            .content_type
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        let lowered = content_type.to_ascii_lowercase();
        if !SUPPORTED_CONTENT_TYPES
            .iter()
            .any(|supported| lowered.starts_with(supported))
        {
            bail!(
                "content-type unsupported: {content_type}; expected one of {}",
                SUPPORTED_CONTENT_TYPES.join(", ")
            );
        }
        let base = response.url.clone();
        let links = Rc::new(parse_json_page(&base, &response.text()?)?);
        self.pages
            .borrow_mut()
            .insert(location.clone(), Rc::clone(&links));
        Ok(links)
    }

    /// Links from one page; untrusted or failing pages yield nothing.
    fn collect_from_index(&self, transport: &dyn Transport, location: &Url) -> Vec<Link> {
        if !transport.is_secure_origin(location) {
            return Vec::new();
        }
        match self.fetch_page(transport, location) {
            Ok(links) => links.as_ref().clone(),
            Err(err) => {
                warn!(url = %location, "failed to collect links: {err:#}");
                Vec::new()
            }
        }
    }

    fn collect_directory(
        &self,
        transport: &dyn Transport,
        dir: &Path,
        expand: bool,
    ) -> Result<Vec<Link>> {
        if !expand {
            let index = Link::from_path(&dir.join(LOCAL_INDEX))?;
            return Ok(self.collect_from_index(transport, index.url()));
        }
        let mut children = fs::read_dir(dir)
            .with_context(|| format!("failed to list {}", dir.display()))?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<Result<Vec<_>, _>>()?;
        children.sort();
        let mut links = Vec::new();
        for child in children {
            let link = Link::from_path(&child)?;
            if child.extension().is_some_and(|ext| ext == "json") {
                links.extend(self.collect_from_index(transport, link.url()));
            } else {
                links.push(link);
            }
        }
        Ok(links)
    }
}

impl LinkCollector for JsonLinkCollector {
    fn collect<'a>(
        &'a self,
        transport: &'a dyn Transport,
        location: &Link,
        expand: bool,
    ) -> Result<Box<dyn Iterator<Item = Link> + 'a>> {
        debug!(location = %location, expand, "collecting links");
        let links = match location.file_path() {
            Some(path) if path.is_dir() => self.collect_directory(transport, &path, expand)?,
            _ if is_archive_file(&location.filename()) => vec![location.clone()],
            _ => self.collect_from_index(transport, &location.url_without_fragment()),
        };
        Ok(Box::new(links.into_iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Response;
    use std::{cell::Cell, io::Cursor};

    struct StaticTransport {
        body: String,
        content_type: &'static str,
        secure: bool,
        calls: Cell<usize>,
    }

    impl StaticTransport {
        fn new(body: &str) -> Self {
            Self {
                body: body.to_string(),
                content_type: SIMPLE_JSON,
                secure: true,
                calls: Cell::new(0),
            }
        }
    }

    impl Transport for StaticTransport {
        fn get(&self, url: &Url, _accept: Option<&str>) -> Result<Response> {
            self.calls.set(self.calls.get() + 1);
            Ok(Response {
                url: url.clone(),
                status: 200,
                content_type: Some(self.content_type.to_string()),
                content_length: None,
                body: Box::new(Cursor::new(self.body.clone().into_bytes())),
            })
        }

        fn is_secure_origin(&self, _url: &Url) -> bool {
            self.secure
        }
    }

    const PAGE: &str = r#"{
        "meta": {"api-version": "1.0"},
        "name": "demo",
        "files": [
            {"filename": "demo-1.0.tar.gz", "url": "../../files/demo-1.0.tar.gz",
             "hashes": {"sha256": "aa"}, "requires-python": ">=3.8"},
            {"filename": "demo-0.9.tar.gz", "url": "https://cdn.example/demo-0.9.tar.gz",
             "hashes": {}, "yanked": "broken build"},
            {"filename": "demo-0.8.tar.gz", "url": "https://cdn.example/demo-0.8.tar.gz",
             "hashes": {}, "yanked": true},
            {"filename": "demo-0.7.tar.gz", "url": "https://cdn.example/demo-0.7.tar.gz",
             "hashes": {}, "yanked": false, "requires-python": null}
        ]
    }"#;

    #[test]
    fn parses_project_files() -> Result<()> {
        let base = Url::parse("https://index.example/simple/demo/")?;
        let links = parse_json_page(&base, PAGE)?;
        assert_eq!(links.len(), 4);
        assert_eq!(links[0].as_str(), "https://index.example/files/demo-1.0.tar.gz");
        assert_eq!(links[0].requires_python(), Some(">=3.8"));
        assert_eq!(links[0].hashes()["sha256"], "aa");
        assert_eq!(links[0].comes_from(), Some("https://index.example/simple/demo/"));
        assert_eq!(links[1].yank_reason(), Some("broken build"));
        assert_eq!(links[2].yank_reason(), Some(""));
        assert!(!links[3].is_yanked());
        assert!(links[3].requires_python().is_none());
        Ok(())
    }

    #[test]
    fn pages_are_memoized() -> Result<()> {
        let transport = StaticTransport::new(PAGE);
        let collector = JsonLinkCollector::new();
        let location = Link::parse("https://index.example/simple/demo/")?;
        let first: Vec<_> = collector.collect(&transport, &location, false)?.collect();
        let second: Vec<_> = collector.collect(&transport, &location, false)?.collect();
        assert_eq!(first, second);
        assert_eq!(transport.calls.get(), 1);
        Ok(())
    }

    #[test]
    fn untrusted_and_unsupported_pages_yield_nothing() -> Result<()> {
        let location = Link::parse("http://insecure.example/simple/demo/")?;
        let mut transport = StaticTransport::new(PAGE);
        transport.secure = false;
        let collector = JsonLinkCollector::new();
        assert_eq!(collector.collect(&transport, &location, false)?.count(), 0);
        assert_eq!(transport.calls.get(), 0);

        let mut html = StaticTransport::new("<html></html>");
        html.content_type = "text/html";
        assert_eq!(collector.collect(&html, &location, false)?.count(), 0);
        Ok(())
    }

    #[test]
    fn expanded_directories_list_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("demo-1.0.tar.gz"), b"")?;
        fs::write(dir.path().join("demo-1.0-py3-none-any.whl"), b"")?;
        let transport = StaticTransport::new(PAGE);
        let collector = JsonLinkCollector::new();
        let location = Link::from_path(dir.path())?;
        let names: Vec<String> = collector
            .collect(&transport, &location, true)?
            .map(|link| link.filename())
            .collect();
        assert_eq!(names, vec!["demo-1.0-py3-none-any.whl", "demo-1.0.tar.gz"]);
        Ok(())
    }

    #[test]
    fn unexpanded_directories_read_their_index() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("demo-1.0.tar.gz"), b"")?;
        let transport = StaticTransport::new(PAGE);
        let collector = JsonLinkCollector::new();
        let location = Link::from_path(dir.path())?;
        let links: Vec<_> = collector.collect(&transport, &location, false)?.collect();
        assert_eq!(links.len(), 4);
        assert_eq!(transport.calls.get(), 1);
        Ok(())
    }
}
