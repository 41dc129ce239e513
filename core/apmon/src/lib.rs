//! Monitoring agent library: sends named parameters to MonALISA-style collectors
//! as XDR-encoded UDP datagrams.
//!
//! ```no_run
//! use apmon::{ApMon, DestinationSpec, Param};
//!
//! let apmon = ApMon::from_destinations([DestinationSpec::new("monalisa.example.org", 8884, "")])?;
//! apmon.send_parameters(Some("MyCluster"), Some("MyNode"), &[Param::new("load", 0.42)])?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Host and job statistics are gathered by a [`Collector`](collect::Collector).
//! This crate only provides [`NoopCollector`](collect::NoopCollector), see the
//! `apmon-procfs` crate for a Linux collector.

pub mod collect;
pub mod config;
pub mod datagram;
pub mod destinations;
pub mod logging;
pub mod monitor;
pub mod rate;
pub mod scheduler;
pub mod source;
pub mod xdr;

pub use collect::{Category, CollectError, Collector, MonitoredJob, ParamTable, Readings};
pub use config::MonitorSettings;
pub use datagram::{Param, Value};
pub use destinations::DestinationSpec;
pub use logging::{Level, Logger};
pub use monitor::{ApMon, ApMonBuilder, InitError, ReloadError, SendError};
pub use source::ConfigSource;
