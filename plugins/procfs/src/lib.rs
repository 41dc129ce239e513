//! Linux collector for apmon, based on the `/proc` file system.
//!
//! ```no_run
//! use apmon::{ApMon, ConfigSource};
//! use apmon_procfs::ProcfsCollector;
//!
//! let apmon = ApMon::builder(ConfigSource::from_location("destinations.conf"))
//!     .collector(ProcfsCollector::new())
//!     .build()?;
//! apmon.send_sys_info()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use apmon::{
    CollectError, Collector, MonitoredJob, ParamTable, Readings,
    collect::InterfaceAddress,
    datagram::Param,
};

pub mod kernel;
pub mod memory;
pub mod network;
pub mod process;

const PROC_STAT: &str = "/proc/stat";
const PROC_VMSTAT: &str = "/proc/vmstat";
const PROC_MEMINFO: &str = "/proc/meminfo";
const PROC_NET_DEV: &str = "/proc/net/dev";
const PROC_UPTIME: &str = "/proc/uptime";

const CPU_PARAMS: [&str; 10] = [
    "cpu_usr",
    "cpu_nice",
    "cpu_sys",
    "cpu_idle",
    "cpu_iowait",
    "cpu_irq",
    "cpu_softirq",
    "cpu_steal",
    "cpu_guest",
    "cpu_usage",
];
const PAGING_PARAMS: [&str; 4] = ["pages_in", "pages_out", "swap_in", "swap_out"];
const LOAD_PARAMS: [&str; 3] = ["load1", "load5", "load15"];
const MEMORY_PARAMS: [&str; 6] = ["mem_used", "mem_free", "mem_usage", "swap_used", "swap_free", "swap_usage"];
const NET_PARAMS: [&str; 3] = ["net_in", "net_out", "net_errs"];
const CPUINFO_PARAMS: [&str; 6] = [
    "cpu_MHz",
    "cpu_vendor_id",
    "cpu_family",
    "cpu_model",
    "cpu_model_name",
    "bogomips",
];

/// Gathers host and job statistics from `/proc`.
///
/// The files that are read periodically are opened once. If one of them cannot be opened,
/// the parameters that depend on it are reported as permanently unavailable.
pub struct ProcfsCollector {
    cpu: Option<kernel::CpuSampler>,
    paging: Option<kernel::PagingSampler>,
    memory: Option<memory::MeminfoReader>,
    network: Option<network::NetworkSampler>,
    jobs: process::JobSampler,
}

fn open<T>(what: &str, res: anyhow::Result<T>) -> Option<T> {
    res.inspect_err(|e| log::warn!("{what} will not be available: {e:#}")).ok()
}

impl Default for ProcfsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcfsCollector {
    pub fn new() -> Self {
        Self {
            cpu: open("cpu usage", kernel::CpuSampler::new(PROC_STAT)),
            paging: open("paging statistics", kernel::PagingSampler::new(PROC_VMSTAT)),
            memory: open("memory usage", memory::MeminfoReader::new(PROC_MEMINFO)),
            network: open("network traffic", network::NetworkSampler::new(PROC_NET_DEV)),
            jobs: process::JobSampler::new(),
        }
    }
}

/// Recreates an error so that it can be reported for several parameters.
fn duplicate(err: &CollectError) -> CollectError {
    match err {
        CollectError::Permanent(e) => CollectError::Permanent(anyhow::anyhow!("{e:#}")),
        CollectError::Transient(e) => CollectError::Transient(anyhow::anyhow!("{e:#}")),
        CollectError::ProcessGone(pid) => CollectError::ProcessGone(*pid),
    }
}

/// Records a group of parameters obtained from the same source.
///
/// On success, only the enabled parameters are kept. On failure, the error is reported for every
/// enabled parameter of the group.
fn record_group(
    readings: &mut Readings,
    params: &ParamTable,
    names: &[&'static str],
    result: Result<Vec<(&'static str, f64)>, CollectError>,
) {
    match result {
        Ok(values) => {
            for (name, v) in values {
                if params.is_enabled(name) {
                    readings.push(Param::new(name, v));
                }
            }
        }
        Err(e) => {
            for name in names.iter().filter(|n| params.is_enabled(n)) {
                readings.fail(*name, duplicate(&e));
            }
        }
    }
}

fn any_enabled(params: &ParamTable, names: &[&str]) -> bool {
    names.iter().any(|n| params.is_enabled(n))
}

fn missing(what: &str) -> CollectError {
    CollectError::permanent(anyhow::anyhow!("{what} could not be opened"))
}

/// Converts the result of a sampler that needs two samples to compute a value.
fn delta<T>(res: anyhow::Result<Option<T>>) -> Result<T, CollectError> {
    match res {
        Ok(Some(v)) => Ok(v),
        Ok(None) => Err(CollectError::transient(anyhow::anyhow!("first sample"))),
        Err(e) => Err(CollectError::Transient(e)),
    }
}

impl ProcfsCollector {
    fn collect_network(&mut self, params: &ParamTable, readings: &mut Readings) {
        let traffic = match &mut self.network {
            Some(sampler) => delta(sampler.sample()),
            None => Err(missing(PROC_NET_DEV)),
        };
        match traffic {
            Ok(interfaces) => {
                for t in interfaces {
                    if params.is_enabled("net_in") {
                        readings.push(Param::new(format!("{}_in", t.interface), t.kb_in));
                    }
                    if params.is_enabled("net_out") {
                        readings.push(Param::new(format!("{}_out", t.interface), t.kb_out));
                    }
                    if params.is_enabled("net_errs") {
                        readings.push(Param::new(format!("{}_errs", t.interface), t.errors as f64));
                    }
                }
            }
            Err(e) => record_group(readings, params, &NET_PARAMS, Err(e)),
        }
    }

    fn collect_sockets(params: &ParamTable, readings: &mut Readings) {
        let totals = params.is_enabled("net_sockets");
        let details = params.is_enabled("net_tcp_details");
        if !totals && !details {
            return;
        }
        match kernel::sockets() {
            Ok(counts) => {
                if totals {
                    readings.values.extend(counts.totals.map(|(name, n)| Param::new(name, n)));
                }
                if details {
                    readings
                        .values
                        .extend(counts.tcp_states.into_iter().map(|(name, n)| Param::new(name, n)));
                }
            }
            Err(e) => {
                let e = CollectError::Transient(e);
                if totals {
                    readings.fail("net_sockets", duplicate(&e));
                }
                if details {
                    readings.fail("net_tcp_details", e);
                }
            }
        }
    }
}

impl Collector for ProcfsCollector {
    fn system_info(&mut self, params: &ParamTable) -> Readings {
        let mut readings = Readings::default();

        if any_enabled(params, &CPU_PARAMS) {
            let res = match &mut self.cpu {
                Some(sampler) => delta(sampler.sample()).map(Vec::from),
                None => Err(missing(PROC_STAT)),
            };
            record_group(&mut readings, params, &CPU_PARAMS, res);
        }
        if any_enabled(params, &PAGING_PARAMS) {
            let res = match &mut self.paging {
                Some(sampler) => delta(sampler.sample()).map(Vec::from),
                None => Err(missing(PROC_VMSTAT)),
            };
            record_group(&mut readings, params, &PAGING_PARAMS, res);
        }
        if any_enabled(params, &LOAD_PARAMS) {
            let res = kernel::load_average()
                .map(Vec::from)
                .map_err(CollectError::Transient);
            record_group(&mut readings, params, &LOAD_PARAMS, res);
        }
        if any_enabled(params, &MEMORY_PARAMS) {
            let res = match &mut self.memory {
                Some(reader) => reader
                    .read()
                    .map(|status| Vec::from(status.usage()))
                    .map_err(CollectError::Transient),
                None => Err(missing(PROC_MEMINFO)),
            };
            record_group(&mut readings, params, &MEMORY_PARAMS, res);
        }
        if any_enabled(params, &NET_PARAMS) {
            self.collect_network(params, &mut readings);
        }
        if params.is_enabled("processes") {
            let res = kernel::process_states()
                .map(|states| {
                    kernel::count_processes(states)
                        .into_iter()
                        .map(|(name, n)| Param::new(name, n))
                        .collect()
                })
                .map_err(CollectError::Transient);
            readings.record("processes", res);
        }
        if params.is_enabled("uptime") {
            let res = kernel::uptime_secs(PROC_UPTIME)
                .map(|secs| vec![Param::new("uptime", secs / 86400.0)])
                .map_err(CollectError::Transient);
            readings.record("uptime", res);
        }
        Self::collect_sockets(params, &mut readings);
        readings
    }

    fn general_info(&mut self, params: &ParamTable) -> Readings {
        let mut readings = Readings::default();

        let wants_cpuinfo = params.is_enabled("no_CPUs") || any_enabled(params, &CPUINFO_PARAMS);
        if wants_cpuinfo {
            match kernel::cpu_info() {
                Ok(info) => {
                    if params.is_enabled("no_CPUs") {
                        readings.push(Param::new("no_CPUs", info.num_cores() as i32));
                    }
                    for name in CPUINFO_PARAMS.into_iter().filter(|n| params.is_enabled(n)) {
                        match kernel::cpu_field(&info, name) {
                            Some(kernel::CpuField::Number(v)) => readings.push(Param::new(name, v)),
                            Some(kernel::CpuField::Text(s)) => readings.push(Param::new(name, s)),
                            None => readings.fail(
                                name,
                                CollectError::permanent(anyhow::anyhow!("not present in /proc/cpuinfo")),
                            ),
                        }
                    }
                }
                Err(e) => {
                    let e = CollectError::Permanent(e);
                    for name in ["no_CPUs"].into_iter().chain(CPUINFO_PARAMS) {
                        if params.is_enabled(name) {
                            readings.fail(name, duplicate(&e));
                        }
                    }
                }
            }
        }

        if any_enabled(params, &["total_mem", "total_swap"]) {
            let res = match &mut self.memory {
                Some(reader) => reader
                    .read()
                    .map(|status| {
                        vec![
                            ("total_mem", status.total_mem_mb()),
                            ("total_swap", status.total_swap_mb()),
                        ]
                    })
                    .map_err(CollectError::Transient),
                None => Err(missing(PROC_MEMINFO)),
            };
            record_group(&mut readings, params, &["total_mem", "total_swap"], res);
        }
        readings
    }

    fn job_info(&mut self, job: &MonitoredJob, params: &ParamTable) -> Result<Readings, CollectError> {
        let mem_total = match &mut self.memory {
            Some(reader) => reader
                .read()
                .inspect_err(|e| log::debug!("total memory: {e:#}"))
                .ok()
                .map(|status| status.mem_total),
            None => None,
        };
        let uptime = kernel::uptime_secs(PROC_UPTIME)
            .inspect_err(|e| log::debug!("uptime: {e:#}"))
            .ok();
        self.jobs.sample(job, params, mem_total, uptime)
    }

    fn host_addresses(&mut self) -> anyhow::Result<Vec<InterfaceAddress>> {
        network::interface_addresses()
    }
}
