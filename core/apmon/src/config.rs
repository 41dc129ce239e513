//! Configuration of a monitor: the text format of the destination sources and the monitoring settings.
//!
//! A configuration source is a list of lines:
//!
//! ```text
//! # comment
//! monalisa.example.org:8884 password
//! 10.0.0.4
//! xApMon_loglevel = FINE
//! xApMon_sys_monitoring = on
//! xApMon_sys_interval = 30
//! xApMon_sys_load1 = off
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collect::Category;
use crate::destinations::{DestinationSpec, ParseDestinationError};
use crate::logging::{Level, Logger, warning};
use crate::rate::DEFAULT_MAX_MSG_RATE;

/// Lines longer than this are rejected.
pub const MAX_LINE_LEN: usize = 512;

const DIRECTIVE_PREFIX: &str = "xApMon_";

/// Default interval between two job monitoring datagrams.
pub const DEFAULT_JOB_INTERVAL: Duration = Duration::from_secs(20);
/// Default interval between two system monitoring datagrams.
pub const DEFAULT_SYS_INTERVAL: Duration = Duration::from_secs(20);
/// Default interval between two checks of the configuration sources.
pub const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_secs(600);
/// By default, the general information is sent every 10 system monitoring cycles.
pub const DEFAULT_GEN_INTERVALS: u32 = 10;
/// Longer intervals are shortened to this value.
pub const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 3600);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("line {line} of {source_name} is longer than {MAX_LINE_LEN} bytes")]
    LineTooLong { source_name: String, line: usize },
    #[error("could not read {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("request to {url} failed")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered with HTTP status {status}")]
    HttpStatus { url: String, status: u16 },
    #[error("invalid destination")]
    Destination(#[from] ParseDestinationError),
}

/// A setting found in a configuration source.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    LogLevel(Level),
    JobMonitoring(bool),
    SysMonitoring(bool),
    JobInterval(Duration),
    SysInterval(Duration),
    GeneralInfo(bool),
    ConfRecheck(bool),
    RecheckInterval(Duration),
    AutoDisable(bool),
    MaxMsgRate(i64),
    Param {
        category: Category,
        name: String,
        enabled: bool,
    },
}

/// The content of a configuration source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedConfig {
    pub destinations: Vec<DestinationSpec>,
    pub directives: Vec<Directive>,
}

impl ParsedConfig {
    pub fn extend(&mut self, other: ParsedConfig) {
        self.destinations.extend(other.destinations);
        self.directives.extend(other.directives);
    }
}

/// Parses the content of a configuration source.
///
/// Invalid directives and destinations are reported to the logger and skipped.
/// A line that is too long aborts the parsing.
pub fn parse_config(text: &str, source_name: &str, logger: &Logger) -> Result<ParsedConfig, ConfigError> {
    let mut config = ParsedConfig::default();
    for (i, raw_line) in text.lines().enumerate() {
        if raw_line.len() > MAX_LINE_LEN {
            return Err(ConfigError::LineTooLong {
                source_name: source_name.to_owned(),
                line: i + 1,
            });
        }
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(directive) = line.strip_prefix(DIRECTIVE_PREFIX) {
            match parse_directive(directive) {
                Ok(d) => config.directives.push(d),
                Err(msg) => warning!(logger, "{source_name}, line {}: {msg}", i + 1),
            }
        } else {
            match line.parse::<DestinationSpec>() {
                Ok(d) => config.destinations.push(d),
                Err(e) => warning!(logger, "{source_name}, line {}: {e}", i + 1),
            }
        }
    }
    Ok(config)
}

fn parse_directive(directive: &str) -> Result<Directive, String> {
    let (param, value) = directive
        .split_once('=')
        .map(|(p, v)| (p.trim(), v.trim()))
        .ok_or_else(|| format!("missing value for {DIRECTIVE_PREFIX}{}", directive.trim()))?;

    let flag = value == "on";
    let seconds = || {
        value
            .parse::<u64>()
            .map(|s| Duration::from_secs(s).min(MAX_INTERVAL))
            .map_err(|_| format!("invalid number of seconds for {param}: '{value}'"))
    };

    let directive = match param {
        "loglevel" => Directive::LogLevel(value.parse().map_err(|e| format!("{e}"))?),
        "job_monitoring" => Directive::JobMonitoring(flag),
        "sys_monitoring" => Directive::SysMonitoring(flag),
        "job_interval" => Directive::JobInterval(seconds()?),
        "sys_interval" => Directive::SysInterval(seconds()?),
        "general_info" => Directive::GeneralInfo(flag),
        "conf_recheck" => Directive::ConfRecheck(flag),
        "recheck_interval" => Directive::RecheckInterval(seconds()?),
        "auto_disable" => Directive::AutoDisable(flag),
        "maxMsgRate" => Directive::MaxMsgRate(
            value
                .parse()
                .map_err(|_| format!("invalid message rate: '{value}'"))?,
        ),
        _ => {
            let (category, name) = if let Some(name) = param.strip_prefix("sys_") {
                (Category::System, name)
            } else if let Some(name) = param.strip_prefix("job_") {
                (Category::Job, name)
            } else {
                (Category::General, param)
            };
            if !category.names().contains(&name) {
                return Err(format!("invalid parameter name in the configuration: {param}"));
            }
            Directive::Param {
                category,
                name: name.to_owned(),
                enabled: flag,
            }
        }
    };
    Ok(directive)
}

/// What the monitor sends automatically, and how often.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorSettings {
    pub job_monitoring: bool,
    #[serde(with = "humantime_serde")]
    pub job_interval: Duration,
    pub sys_monitoring: bool,
    #[serde(with = "humantime_serde")]
    pub sys_interval: Duration,
    /// Send the general host information along with the system information.
    pub general_info: bool,
    /// Number of system monitoring cycles between two general information datagrams.
    pub general_info_every: u32,
    /// Periodically reload the configuration if its sources have changed.
    pub conf_recheck: bool,
    #[serde(with = "humantime_serde")]
    pub recheck_interval: Duration,
    /// Stop collecting a parameter after its collector reported a permanent failure.
    pub auto_disable: bool,
    pub max_msg_rate: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            job_monitoring: false,
            job_interval: DEFAULT_JOB_INTERVAL,
            sys_monitoring: false,
            sys_interval: DEFAULT_SYS_INTERVAL,
            general_info: false,
            general_info_every: DEFAULT_GEN_INTERVALS,
            conf_recheck: false,
            recheck_interval: DEFAULT_RECHECK_INTERVAL,
            auto_disable: true,
            max_msg_rate: DEFAULT_MAX_MSG_RATE,
        }
    }
}

/// Returns `interval`, or `default` if `interval` is zero.
pub(crate) fn interval_or(interval: Duration, default: Duration) -> Duration {
    if interval.is_zero() { default } else { interval }
}
