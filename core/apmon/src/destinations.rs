//! Destinations of the datagrams.
//!
//! The registry holds an immutable [`DestinationSet`] behind an `Arc`.
//! Senders take a snapshot with [`DestinationRegistry::current`] and iterate over it
//! without holding any lock, while [`DestinationRegistry::replace`] installs a new
//! set in one step. A send that started before a reload finishes with the old set.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4, ToSocketAddrs};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use rustc_hash::FxHashSet;

use crate::logging::{Logger, fatal, fine, info, warning};

/// Port used when a destination does not specify one.
pub const DEFAULT_PORT: u16 = 8884;
/// Maximum number of destinations, extra destinations are ignored.
pub const MAX_N_DESTINATIONS: usize = 30;

/// A destination as written in a configuration source, before name resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationSpec {
    pub host: String,
    pub port: u16,
    pub password: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseDestinationError {
    #[error("empty destination")]
    Empty,
    #[error("invalid port '{port}' in destination '{line}'")]
    InvalidPort { line: String, port: String },
}

impl DestinationSpec {
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            password: password.into(),
        }
    }
}

impl FromStr for DestinationSpec {
    type Err = ParseDestinationError;

    /// Parses `host[:port] [password]`.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut tokens = line.split_whitespace();
        let address = tokens.next().ok_or(ParseDestinationError::Empty)?;
        let password = tokens.next().unwrap_or_default();

        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| ParseDestinationError::InvalidPort {
                    line: line.to_owned(),
                    port: port.to_owned(),
                })?;
                (host, port)
            }
            None => (address, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(ParseDestinationError::Empty);
        }
        Ok(DestinationSpec::new(host, port, password))
    }
}

impl fmt::Display for DestinationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)?;
        if !self.password.is_empty() {
            f.write_str(" ****")?;
        }
        Ok(())
    }
}

/// A resolved destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub addr: SocketAddrV4,
    pub password: String,
}

/// What the configuration looked like when the destinations were loaded.
///
/// The recheck action compares these markers with the current state of the sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Markers {
    /// Modification time of the configuration file.
    pub file_modified: Option<SystemTime>,
    /// `Last-Modified` header of each configuration URL.
    pub url_modified: Vec<(String, Option<String>)>,
}

/// An immutable set of destinations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationSet {
    destinations: Vec<Destination>,
    markers: Markers,
}

impl DestinationSet {
    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    pub fn markers(&self) -> &Markers {
        &self.markers
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no destination could be resolved, the previous destinations are kept")]
    NoDestinations,
}

/// Resolves host names to IP addresses.
pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolves names with the system resolver (`getaddrinfo`).
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        let addrs = (host, port).to_socket_addrs()?.map(|a| a.ip()).collect();
        Ok(addrs)
    }
}

/// Picks the address to send to: the first non-loopback IPv4 address, or a loopback one.
pub(crate) fn pick_ipv4(addrs: &[IpAddr]) -> Option<Ipv4Addr> {
    let v4 = || {
        addrs.iter().filter_map(|a| match a {
            IpAddr::V4(a) => Some(*a),
            IpAddr::V6(_) => None,
        })
    };
    v4().find(|a| !a.is_loopback()).or_else(|| v4().next())
}

pub struct DestinationRegistry {
    current: Mutex<Arc<DestinationSet>>,
    resolver: Box<dyn Resolver>,
    logger: Logger,
}

impl DestinationRegistry {
    pub fn new(logger: Logger) -> Self {
        Self::with_resolver(Box::new(SystemResolver), logger)
    }

    pub fn with_resolver(resolver: Box<dyn Resolver>, logger: Logger) -> Self {
        Self {
            current: Mutex::new(Arc::new(DestinationSet::default())),
            resolver,
            logger,
        }
    }

    /// Returns a snapshot of the current destinations.
    pub fn current(&self) -> Arc<DestinationSet> {
        self.current.lock().unwrap().clone()
    }

    /// Resolves the destinations, removing the duplicates and the unresolvable ones.
    ///
    /// Two destinations with the same IP address are considered equal, the first one is kept.
    pub fn resolve(&self, specs: &[DestinationSpec]) -> Vec<Destination> {
        let mut seen = FxHashSet::default();
        let mut destinations = Vec::with_capacity(specs.len().min(MAX_N_DESTINATIONS));
        for spec in specs {
            let ip = match spec.host.parse::<Ipv4Addr>() {
                Ok(ip) => ip,
                Err(_) => match self.resolver.resolve(&spec.host, spec.port) {
                    Ok(addrs) => match pick_ipv4(&addrs) {
                        Some(ip) => ip,
                        None => {
                            fatal!(self.logger, "no IPv4 address found for {}, skipping it", spec.host);
                            continue;
                        }
                    },
                    Err(e) => {
                        fatal!(self.logger, "failed to resolve {}, skipping it: {e}", spec.host);
                        continue;
                    }
                },
            };
            if !seen.insert(ip) {
                fine!(self.logger, "destination {spec} resolves to {ip}, which is already registered");
                continue;
            }
            if destinations.len() == MAX_N_DESTINATIONS {
                warning!(
                    self.logger,
                    "too many destinations, at most {MAX_N_DESTINATIONS} are used: ignoring {spec}"
                );
                continue;
            }
            destinations.push(Destination {
                addr: SocketAddrV4::new(ip, spec.port),
                password: spec.password.clone(),
            });
        }
        destinations
    }

    /// Replaces the destinations.
    ///
    /// If no destination can be resolved, the current set is left untouched and an error is returned.
    /// Name resolution happens before the lock is taken.
    pub fn replace(&self, specs: &[DestinationSpec], markers: Markers, first_time: bool) -> Result<usize, RegistryError> {
        let destinations = self.resolve(specs);
        if destinations.is_empty() {
            return Err(RegistryError::NoDestinations);
        }

        let n = destinations.len();
        for d in &destinations {
            fine!(self.logger, "destination: {}", d.addr);
        }
        let new_set = Arc::new(DestinationSet { destinations, markers });
        *self.current.lock().unwrap() = new_set;

        if first_time {
            info!(self.logger, "{n} destination(s) registered");
        } else {
            info!(self.logger, "configuration reloaded, {n} destination(s) registered");
        }
        Ok(n)
    }
}

impl fmt::Debug for DestinationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationRegistry")
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}
