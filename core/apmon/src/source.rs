//! Loading of the configuration sources: local files, URLs and literal destinations.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::{ConfigError, ParsedConfig, parse_config};
use crate::destinations::{DestinationSpec, Markers};
use crate::logging::{Logger, fine, info, warning};

/// Where the destinations come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// A configuration file, that can be reloaded.
    File(PathBuf),
    /// A list of URLs and literal `host[:port] [password]` entries. The URLs can be reloaded.
    List(Vec<String>),
    /// A fixed list of destinations, without reloading.
    Direct(Vec<DestinationSpec>),
}

impl ConfigSource {
    /// Builds a source from a file path or a URL.
    pub fn from_location(location: &str) -> Self {
        if is_url(location) {
            ConfigSource::List(vec![location.to_owned()])
        } else {
            ConfigSource::File(PathBuf::from(location))
        }
    }

    /// Returns true if the source can be checked for modifications.
    pub fn is_reloadable(&self) -> bool {
        !matches!(self, ConfigSource::Direct(_))
    }
}

fn is_url(entry: &str) -> bool {
    entry.starts_with("http://") || entry.starts_with("https://")
}

/// A configuration that has been read from a [`ConfigSource`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedConfig {
    pub parsed: ParsedConfig,
    pub markers: Markers,
}

/// The content of a remote configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteContent {
    pub body: String,
    pub last_modified: Option<String>,
}

/// The answer to a request that only asks for the headers of a remote configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHead {
    /// True if the server answered with `200 OK`.
    pub ok: bool,
    pub last_modified: Option<String>,
}

/// Fetches remote configurations.
pub trait RemoteFetcher: Send + Sync {
    /// Downloads a configuration. Any status other than `200 OK` is an error.
    fn fetch(&self, url: &str) -> Result<RemoteContent, ConfigError>;

    /// Gets the headers of a configuration without downloading it.
    fn head(&self, url: &str) -> Result<RemoteHead, ConfigError>;
}

impl<F: RemoteFetcher + ?Sized> RemoteFetcher for Arc<F> {
    fn fetch(&self, url: &str) -> Result<RemoteContent, ConfigError> {
        (**self).fetch(url)
    }

    fn head(&self, url: &str) -> Result<RemoteHead, ConfigError> {
        (**self).head(url)
    }
}

/// Timeout of the HTTP requests.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// [`RemoteFetcher`] based on a blocking HTTP client.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("apmon-rs/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

fn last_modified_header(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get(reqwest::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

impl RemoteFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<RemoteContent, ConfigError> {
        let http_err = |source| ConfigError::Http {
            url: url.to_owned(),
            source,
        };
        let response = self.client.get(url).send().map_err(http_err)?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ConfigError::HttpStatus {
                url: url.to_owned(),
                status: status.as_u16(),
            });
        }
        let last_modified = last_modified_header(response.headers());
        let body = response.text().map_err(http_err)?;
        Ok(RemoteContent { body, last_modified })
    }

    fn head(&self, url: &str) -> Result<RemoteHead, ConfigError> {
        let response = self.client.head(url).send().map_err(|source| ConfigError::Http {
            url: url.to_owned(),
            source,
        })?;
        Ok(RemoteHead {
            ok: response.status() == reqwest::StatusCode::OK,
            last_modified: last_modified_header(response.headers()),
        })
    }
}

fn file_mtime(path: &Path) -> Result<SystemTime, ConfigError> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })
}

/// Reads a configuration source.
///
/// When `first_time` is true, an entry of a list that cannot be loaded is reported and skipped.
/// Otherwise the first failure aborts the loading, so that a reload never installs a partial configuration.
pub fn load(
    source: &ConfigSource,
    fetcher: &dyn RemoteFetcher,
    first_time: bool,
    logger: &Logger,
) -> Result<LoadedConfig, ConfigError> {
    match source {
        ConfigSource::File(path) => {
            info!(logger, "loading file {}", path.display());
            let file_modified = Some(file_mtime(path)?);
            let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let parsed = parse_config(&text, &path.display().to_string(), logger)?;
            Ok(LoadedConfig {
                parsed,
                markers: Markers {
                    file_modified,
                    url_modified: Vec::new(),
                },
            })
        }
        ConfigSource::List(entries) => {
            let mut loaded = LoadedConfig::default();
            for entry in entries {
                match load_entry(entry, fetcher, logger) {
                    Ok((parsed, url_marker)) => {
                        loaded.parsed.extend(parsed);
                        loaded.markers.url_modified.extend(url_marker);
                    }
                    Err(e) if first_time => {
                        warning!(logger, "skipping configuration entry {entry}: {e}");
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(loaded)
        }
        ConfigSource::Direct(destinations) => Ok(LoadedConfig {
            parsed: ParsedConfig {
                destinations: destinations.clone(),
                directives: Vec::new(),
            },
            markers: Markers::default(),
        }),
    }
}

type UrlMarker = Option<(String, Option<String>)>;

fn load_entry(entry: &str, fetcher: &dyn RemoteFetcher, logger: &Logger) -> Result<(ParsedConfig, UrlMarker), ConfigError> {
    if is_url(entry) {
        info!(logger, "loading configuration from {entry}");
        let content = fetcher.fetch(entry)?;
        let parsed = parse_config(&content.body, entry, logger)?;
        Ok((parsed, Some((entry.to_owned(), content.last_modified))))
    } else {
        let destination = entry.parse::<DestinationSpec>()?;
        let parsed = ParsedConfig {
            destinations: vec![destination],
            directives: Vec::new(),
        };
        Ok((parsed, None))
    }
}

/// Checks whether the configuration has changed since it was loaded.
pub fn modified(
    source: &ConfigSource,
    markers: &Markers,
    fetcher: &dyn RemoteFetcher,
    logger: &Logger,
) -> Result<bool, ConfigError> {
    if let ConfigSource::File(path) = source {
        fine!(logger, "checking for modifications of {}", path.display());
        let mtime = file_mtime(path)?;
        if Some(mtime) != markers.file_modified {
            info!(logger, "file {} modified", path.display());
            return Ok(true);
        }
    }

    for (url, last_modified) in &markers.url_modified {
        fine!(logger, "checking for modifications of {url}");
        let head = fetcher.head(url)?;
        if !head.ok {
            continue;
        }
        if head.last_modified.is_none() || head.last_modified != *last_modified {
            info!(logger, "{url} modified");
            return Ok(true);
        }
    }
    Ok(false)
}
