//! Interface between the monitor and the code that gathers host and job statistics.
//!
//! Parameters are grouped in three categories: system (sampled periodically),
//! general (static host information) and job (per monitored process).
//! Each category has a fixed table of parameter names that can be individually
//! enabled or disabled, either by the configuration or automatically when a
//! collector reports that a value can never be obtained.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::datagram::Param;

pub const SYS_PARAMS: [&str; 30] = [
    "cpu_usr",
    "cpu_sys",
    "cpu_idle",
    "cpu_nice",
    "cpu_iowait",
    "cpu_irq",
    "cpu_softirq",
    "cpu_steal",
    "cpu_guest",
    "cpu_usage",
    "pages_in",
    "pages_out",
    "swap_in",
    "swap_out",
    "load1",
    "load5",
    "load15",
    "mem_used",
    "mem_free",
    "mem_usage",
    "swap_used",
    "swap_free",
    "swap_usage",
    "net_in",
    "net_out",
    "net_errs",
    "processes",
    "uptime",
    "net_sockets",
    "net_tcp_details",
];

pub const GEN_PARAMS: [&str; 11] = [
    "hostname",
    "ip",
    "cpu_MHz",
    "no_CPUs",
    "total_mem",
    "total_swap",
    "cpu_vendor_id",
    "cpu_family",
    "cpu_model",
    "cpu_model_name",
    "bogomips",
];

pub const JOB_PARAMS: [&str; 12] = [
    "run_time",
    "cpu_time",
    "cpu_usage",
    "mem_usage",
    "workdir_size",
    "disk_total",
    "disk_used",
    "disk_free",
    "disk_usage",
    "virtualmem",
    "rss",
    "open_files",
];

/// States reported by `sockets_tcp_<STATE>` parameters.
pub const TCP_STATES: [&str; 12] = [
    "ESTABLISHED",
    "SYN_SENT",
    "SYN_RECV",
    "FIN_WAIT1",
    "FIN_WAIT2",
    "TIME_WAIT",
    "CLOSED",
    "CLOSE_WAIT",
    "LAST_ACK",
    "LISTEN",
    "CLOSING",
    "UNKNOWN",
];

/// Maximum number of jobs that can be monitored at the same time.
pub const MAX_MONITORED_JOBS: usize = 35;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    System,
    General,
    Job,
}

impl Category {
    pub fn names(&self) -> &'static [&'static str] {
        match self {
            Category::System => &SYS_PARAMS,
            Category::General => &GEN_PARAMS,
            Category::Job => &JOB_PARAMS,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Category::System => "system",
            Category::General => "general",
            Category::Job => "job",
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown parameter category '{0}', expected system, general or job")]
pub struct InvalidCategory(String);

impl FromStr for Category {
    type Err = InvalidCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" | "sys" => Ok(Category::System),
            "general" | "gen" => Ok(Category::General),
            "job" => Ok(Category::Job),
            _ => Err(InvalidCategory(s.to_owned())),
        }
    }
}

/// The enabled/disabled state of each parameter of a category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamTable {
    category: Category,
    enabled: Vec<bool>,
}

impl ParamTable {
    /// Creates a table where every parameter is enabled.
    pub fn new(category: Category) -> Self {
        Self {
            category,
            enabled: vec![true; category.names().len()],
        }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    fn index(&self, name: &str) -> Option<usize> {
        self.category.names().iter().position(|n| *n == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index(name).is_some()
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.index(name).is_some_and(|i| self.enabled[i])
    }

    /// Enables or disables a parameter. Returns false if the name is unknown.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.index(name) {
            Some(i) => {
                self.enabled[i] = enabled;
                true
            }
            None => false,
        }
    }

    pub fn enabled_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.category
            .names()
            .iter()
            .zip(&self.enabled)
            .filter_map(|(name, enabled)| enabled.then_some(*name))
    }
}

/// Failure to obtain the value of a parameter.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    /// The value will never be available on this host.
    #[error("not available: {0:#}")]
    Permanent(anyhow::Error),
    /// The value is not available this time, but may be next time.
    #[error("temporarily unavailable: {0:#}")]
    Transient(anyhow::Error),
    /// The monitored process does not exist anymore.
    #[error("process {0} does not exist")]
    ProcessGone(u32),
}

impl CollectError {
    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        CollectError::Permanent(err.into())
    }

    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        CollectError::Transient(err.into())
    }
}

/// Values obtained by a collector, and the parameters that could not be obtained.
///
/// Failures are reported with the name of the parameter in its table (for example `net_in`),
/// even if the parameter expands to several values (`eth0_in`, `eth1_in`, ...).
#[derive(Debug, Default)]
pub struct Readings {
    pub values: Vec<Param>,
    pub failures: Vec<(&'static str, CollectError)>,
}

impl Readings {
    pub fn push(&mut self, param: Param) {
        self.values.push(param);
    }

    pub fn fail(&mut self, name: &'static str, err: CollectError) {
        self.failures.push((name, err));
    }

    /// Records the result of a fallible reading.
    pub fn record(&mut self, name: &'static str, result: Result<Vec<Param>, CollectError>) {
        match result {
            Ok(values) => self.values.extend(values),
            Err(e) => self.fail(name, e),
        }
    }
}

/// A process whose resource usage is periodically reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredJob {
    pub pid: u32,
    pub workdir: Option<PathBuf>,
    pub cluster: String,
    pub node: String,
}

/// An IPv4 address of a network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub interface: String,
    pub ip: Ipv4Addr,
}

/// Gathers statistics about the host and the monitored jobs.
///
/// Only the parameters enabled in the given table should be collected.
pub trait Collector: Send {
    fn system_info(&mut self, params: &ParamTable) -> Readings;

    fn general_info(&mut self, params: &ParamTable) -> Readings;

    fn job_info(&mut self, job: &MonitoredJob, params: &ParamTable) -> Result<Readings, CollectError>;

    /// Lists the IPv4 addresses of the network interfaces, loopback excluded.
    fn host_addresses(&mut self) -> anyhow::Result<Vec<InterfaceAddress>>;
}

/// A collector that cannot collect anything.
#[derive(Debug, Default)]
pub struct NoopCollector;

impl NoopCollector {
    fn unavailable(params: &ParamTable) -> Readings {
        let mut readings = Readings::default();
        for name in params.enabled_names() {
            readings.fail(name, CollectError::permanent(anyhow::anyhow!("no collector installed")));
        }
        readings
    }
}

impl Collector for NoopCollector {
    fn system_info(&mut self, params: &ParamTable) -> Readings {
        Self::unavailable(params)
    }

    fn general_info(&mut self, params: &ParamTable) -> Readings {
        Self::unavailable(params)
    }

    fn job_info(&mut self, _job: &MonitoredJob, params: &ParamTable) -> Result<Readings, CollectError> {
        Ok(Self::unavailable(params))
    }

    fn host_addresses(&mut self) -> anyhow::Result<Vec<InterfaceAddress>> {
        Ok(Vec::new())
    }
}

/// Chooses the address that identifies this host.
///
/// The first non-loopback address is used, unless a later one is public:
/// in that case the first public address is preferred. Returns `None` if there is no usable address.
pub fn preferred_address(addrs: &[InterfaceAddress]) -> Option<Ipv4Addr> {
    let candidates = || addrs.iter().map(|a| a.ip).filter(|ip| !ip.is_loopback());
    candidates()
        .find(|ip| !ip.is_private())
        .or_else(|| candidates().next())
}
