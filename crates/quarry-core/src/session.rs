//! The default blocking transport over HTTP(S) and `file://` URLs.

use std::{
    fs::{self, File},
    io::Cursor,
    net::IpAddr,
    path::PathBuf,
    thread,
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use reqwest::{
    blocking::Client,
    header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE},
    Certificate,
};
use tracing::{debug, warn};
use url::{Host, Url};

use crate::{
    config::{Config, DEFAULT_RETRIES, DEFAULT_TIMEOUT},
    transport::{Response, Transport},
};

const USER_AGENT: &str = concat!("quarry/", env!("CARGO_PKG_VERSION"));
/// Transient statuses from S3 (500, 503) and Cloudflare (520, 527).
const RETRY_STATUSES: &[u16] = &[500, 503, 520, 527];
const BACKOFF_FACTOR: f64 = 0.25;
const MAX_BACKOFF: Duration = Duration::from_secs(120);

/// `(scheme, host, port)` patterns that are always considered secure.
const SECURE_ORIGINS: &[(&str, &str, &str)] = &[
    ("https", "*", "*"),
    ("wss", "*", "*"),
    ("*", "localhost", "*"),
    ("*", "127.0.0.0/8", "*"),
    ("*", "::1/128", "*"),
    ("file", "*", "*"),
];

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub retries: usize,
    pub timeout: Duration,
    pub trusted_hosts: Vec<String>,
    pub ca_certificates: Option<PathBuf>,
    pub online: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            timeout: DEFAULT_TIMEOUT,
            trusted_hosts: Vec::new(),
            ca_certificates: None,
            online: true,
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retries: config.retries,
            timeout: config.timeout,
            online: config.online,
            ..Self::default()
        }
    }
}

/// Blocking session with retries and per-host certificate policy.
///
/// Trusted hosts are fetched with certificate verification disabled and are
/// treated as secure origins even over plain HTTP.
#[derive(Debug)]
pub struct PyPISession {
    secure: Client,
    insecure: Client,
    retries: usize,
    trusted_hosts: Vec<(String, Option<u16>)>,
    online: bool,
}

impl PyPISession {
    pub fn new(options: SessionOptions) -> Result<Self> {
        let mut secure = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(options.timeout);
        if let Some(path) = &options.ca_certificates {
            let pem = fs::read(path)
                .with_context(|| format!("failed to read CA bundle {}", path.display()))?;
            let certificate = Certificate::from_pem(&pem)
                .with_context(|| format!("invalid CA bundle {}", path.display()))?;
            secure = secure.add_root_certificate(certificate);
        }
        let secure = secure.build().context("failed to build http client")?;
        let insecure = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(options.timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .context("failed to build http client")?;
        let mut session = Self {
            secure,
            insecure,
            retries: options.retries,
            trusted_hosts: Vec::new(),
            online: options.online,
        };
        for host in &options.trusted_hosts {
            session.add_trusted_host(host)?;
        }
        Ok(session)
    }

    /// Trust `host` or `host:port`; without a port every port is trusted.
    pub fn add_trusted_host(&mut self, host: &str) -> Result<()> {
        let entry = parse_netloc(host)?;
        if !self.trusted_hosts.contains(&entry) {
            self.trusted_hosts.push(entry);
        }
        Ok(())
    }

    pub fn trusted_hosts(&self) -> &[(String, Option<u16>)] {
        &self.trusted_hosts
    }

    fn is_trusted(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        self.trusted_hosts.iter().any(|(trusted, port)| {
            trusted.eq_ignore_ascii_case(host)
                && port.is_none_or(|port| url.port_or_known_default() == Some(port))
        })
    }

    fn get_file(url: &Url) -> Result<Response> {
        let path = url
            .to_file_path()
            .map_err(|()| anyhow!("cannot convert {url} to a local path"))?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {
                let file = File::open(&path)
                    .with_context(|| format!("failed to open {}", path.display()))?;
                Ok(Response {
                    url: url.clone(),
                    status: 200,
                    content_type: Some(guess_content_type(url.path()).to_string()),
                    content_length: Some(meta.len()),
                    body: Box::new(file),
                })
            }
            Ok(_) => Ok(not_found(url, "IsADirectoryError: not a file")),
            Err(err) => Ok(not_found(url, &format!("{err}"))),
        }
    }

    fn get_remote(&self, url: &Url, accept: Option<&str>) -> Result<Response> {
        if !self.online {
            bail!("network access is disabled (QUARRY_ONLINE=0); cannot fetch {url}");
        }
        let client = if self.is_trusted(url) {
            &self.insecure
        } else {
            &self.secure
        };
        let mut attempt = 0;
        loop {
            let mut request = client.get(url.clone());
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept).header(CACHE_CONTROL, "max-age=0");
            }
            match request.send() {
                Ok(response)
                    if RETRY_STATUSES.contains(&response.status().as_u16())
                        && attempt < self.retries =>
                {
                    debug!(url = %url, status = response.status().as_u16(), attempt, "retrying request");
                }
                Ok(response) => {
                    let content_type = response
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|value| value.to_str().ok())
                        .map(ToOwned::to_owned);
                    return Ok(Response {
                        url: response.url().clone(),
                        status: response.status().as_u16(),
                        content_type,
                        content_length: response.content_length(),
                        body: Box::new(response),
                    });
                }
                Err(err) if (err.is_connect() || err.is_timeout()) && attempt < self.retries => {
                    debug!(url = %url, %err, attempt, "retrying request");
                }
                Err(err) => return Err(err).with_context(|| format!("failed to fetch {url}")),
            }
            thread::sleep(backoff(attempt));
            attempt += 1;
        }
    }
}

impl Transport for PyPISession {
    fn get(&self, url: &Url, accept: Option<&str>) -> Result<Response> {
        match url.scheme() {
            "file" => Self::get_file(url),
            "http" | "https" => self.get_remote(url, accept),
            other => bail!("unsupported URL scheme `{other}` in {url}"),
        }
    }

    fn is_secure_origin(&self, url: &Url) -> bool {
        let scheme = url.scheme().rsplit('+').next().unwrap_or_default();
        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_ascii_lowercase(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => String::new(),
        };
        let port = url
            .port()
            .map_or_else(|| "*".to_string(), |port| port.to_string());
        let trusted = self.trusted_hosts.iter().map(|(host, port)| {
            (
                "*",
                host.as_str(),
                port.map_or_else(|| "*".to_string(), |port| port.to_string()),
            )
        });
        let secure = SECURE_ORIGINS
            .iter()
            .map(|(scheme, host, port)| (*scheme, *host, (*port).to_string()))
            .chain(trusted)
            .any(|(secure_scheme, secure_host, secure_port)| {
                origin_part_matches(secure_scheme, scheme)
                    && host_matches(secure_host, &host)
                    && origin_part_matches(&secure_port, &port)
            });
        if !secure {
            warn!(
                url = %url,
                "skipping location that is not trusted; add it to the trusted hosts"
            );
        }
        secure
    }
}

fn origin_part_matches(allowed: &str, actual: &str) -> bool {
    allowed == "*" || allowed.eq_ignore_ascii_case(actual)
}

fn host_matches(allowed: &str, actual: &str) -> bool {
    match (actual.parse::<IpAddr>(), parse_network(allowed)) {
        (Ok(addr), Some((network, prefix))) => in_network(addr, network, prefix),
        _ => origin_part_matches(allowed, actual),
    }
}

fn parse_network(raw: &str) -> Option<(IpAddr, u32)> {
    let (addr, prefix) = match raw.split_once('/') {
        Some((addr, prefix)) => (addr.parse().ok()?, prefix.parse().ok()?),
        None => {
            let addr: IpAddr = raw.parse().ok()?;
            let prefix = if addr.is_ipv4() { 32 } else { 128 };
            (addr, prefix)
        }
    };
    Some((addr, prefix))
}

fn in_network(addr: IpAddr, network: IpAddr, prefix: u32) -> bool {
    match (addr, network) {
        (IpAddr::V4(addr), IpAddr::V4(network)) => {
            let mask = u32::MAX.checked_shl(32 - prefix.min(32)).unwrap_or(0);
            u32::from(addr) & mask == u32::from(network) & mask
        }
        (IpAddr::V6(addr), IpAddr::V6(network)) => {
            let mask = u128::MAX.checked_shl(128 - prefix.min(128)).unwrap_or(0);
            u128::from(addr) & mask == u128::from(network) & mask
        }
        _ => false,
    }
}

/// Split `host[:port]`, accepting bracketed IPv6 literals.
fn parse_netloc(netloc: &str) -> Result<(String, Option<u16>)> {
    let netloc = netloc.trim();
    let url = Url::parse(&format!("https://{netloc}"))
        .with_context(|| format!("invalid trusted host `{netloc}`"))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("invalid trusted host `{netloc}`"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    Ok((host, url.port()))
}

fn backoff(attempt: usize) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let seconds = BACKOFF_FACTOR * 2f64.powi(exponent);
    Duration::from_secs_f64(seconds.min(MAX_BACKOFF.as_secs_f64()))
}

fn not_found(url: &Url, reason: &str) -> Response {
    Response {
        url: url.clone(),
        status: 404,
        content_type: Some("text/plain".to_string()),
        content_length: None,
        body: Box::new(Cursor::new(reason.as_bytes().to_vec())),
    }
}

fn guess_content_type(path: &str) -> &'static str {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".json") {
        "application/json"
    } else if lower.ends_with(".html") || lower.ends_with(".htm") {
        "text/html"
    } else if lower.ends_with(".whl") || lower.ends_with(".zip") {
        "application/zip"
    } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") || lower.ends_with(".tar") {
        "application/x-tar"
    } else {
        "text/plain"
    }
}
