//! System-level statistics: CPU, paging, load, processes, sockets and CPU description.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{BufRead, BufReader, Seek},
    time::Instant,
};

use anyhow::Context;
use apmon::collect::TCP_STATES;
use procfs::{
    CpuInfo, CpuTime, Current, ExplicitSystemInfo, FromBufReadSI, KernelStats, LoadAverage, LocalSystemInfo,
    ProcError, SystemInfoInterface, net::TcpState,
};

fn gather_system_info() -> Result<ExplicitSystemInfo, ProcError> {
    let sysinfo = LocalSystemInfo;
    Ok(ExplicitSystemInfo {
        boot_time_secs: sysinfo.boot_time_secs()?,
        ticks_per_second: sysinfo.ticks_per_second(),
        page_size: sysinfo.page_size(),
        is_little_endian: sysinfo.is_little_endian(),
    })
}

/// CPU time counters, in ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTicks {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
}

impl From<&CpuTime> for CpuTicks {
    fn from(t: &CpuTime) -> Self {
        Self {
            user: t.user,
            nice: t.nice,
            system: t.system,
            idle: t.idle,
            iowait: t.iowait.unwrap_or_default(),
            irq: t.irq.unwrap_or_default(),
            softirq: t.softirq.unwrap_or_default(),
            steal: t.steal.unwrap_or_default(),
            guest: t.guest.unwrap_or_default(),
        }
    }
}

impl CpuTicks {
    fn as_array(&self) -> [u64; 9] {
        [
            self.user,
            self.nice,
            self.system,
            self.idle,
            self.iowait,
            self.irq,
            self.softirq,
            self.steal,
            self.guest,
        ]
    }
}

/// Computes the `cpu_*` parameters, in percent of the elapsed CPU time.
///
/// Returns `None` if a counter went backwards or if no time elapsed.
pub fn cpu_usage(prev: &CpuTicks, now: &CpuTicks) -> Option<[(&'static str, f64); 10]> {
    let mut delta = [0u64; 9];
    for (d, (p, n)) in delta.iter_mut().zip(prev.as_array().into_iter().zip(now.as_array())) {
        *d = n.checked_sub(p)?;
    }
    let total: u64 = delta.iter().sum();
    if total == 0 {
        return None;
    }
    let pct = |v: u64| 100.0 * v as f64 / total as f64;
    let [user, nice, system, idle, iowait, irq, softirq, steal, guest] = delta;
    Some([
        ("cpu_usr", pct(user)),
        ("cpu_nice", pct(nice)),
        ("cpu_sys", pct(system)),
        ("cpu_idle", pct(idle)),
        ("cpu_iowait", pct(iowait)),
        ("cpu_irq", pct(irq)),
        ("cpu_softirq", pct(softirq)),
        ("cpu_steal", pct(steal)),
        ("cpu_guest", pct(guest)),
        ("cpu_usage", pct(total - idle)),
    ])
}

/// Reads /proc/stat and computes the CPU usage between two reads.
pub struct CpuSampler {
    /// A reader opened to /proc/stat.
    reader: BufReader<File>,
    sysinfo: ExplicitSystemInfo,
    previous: Option<CpuTicks>,
}

impl CpuSampler {
    pub fn new(proc_stat_path: &str) -> anyhow::Result<Self> {
        let file = File::open(proc_stat_path).with_context(|| format!("could not open {proc_stat_path}"))?;
        Ok(Self {
            reader: BufReader::new(file),
            sysinfo: gather_system_info().context("could not gather system info")?,
            previous: None,
        })
    }

    /// Returns the CPU usage since the previous call, or `None` on the first call.
    pub fn sample(&mut self) -> anyhow::Result<Option<[(&'static str, f64); 10]>> {
        self.reader.rewind()?;
        let stats = KernelStats::from_buf_read(&mut self.reader, &self.sysinfo)?;
        let now = CpuTicks::from(&stats.total);
        let res = self.previous.as_ref().and_then(|prev| cpu_usage(prev, &now));
        self.previous = Some(now);
        Ok(res)
    }
}

/// Paging and swapping counters from /proc/vmstat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagingCounters {
    pub pages_in: u64,
    pub pages_out: u64,
    pub swap_in: u64,
    pub swap_out: u64,
}

impl PagingCounters {
    pub fn parse(reader: impl BufRead) -> anyhow::Result<Self> {
        let mut counters = PagingCounters::default();
        let mut found = 0;
        for line in reader.lines() {
            let line = line.context("could not read line from /proc/vmstat")?;
            let Some((key, value)) = line.split_once(' ') else {
                continue;
            };
            let field = match key {
                "pgpgin" => &mut counters.pages_in,
                "pgpgout" => &mut counters.pages_out,
                "pswpin" => &mut counters.swap_in,
                "pswpout" => &mut counters.swap_out,
                _ => continue,
            };
            *field = value
                .trim()
                .parse()
                .with_context(|| format!("invalid line in /proc/vmstat: {line}"))?;
            found += 1;
        }
        anyhow::ensure!(found == 4, "missing paging counters in /proc/vmstat");
        Ok(counters)
    }

    /// Computes the `pages_*` and `swap_*` rates, per second.
    pub fn rates(&self, prev: &PagingCounters, elapsed_secs: f64) -> Option<[(&'static str, f64); 4]> {
        let rate = |now: u64, prev: u64| Some(now.checked_sub(prev)? as f64 / elapsed_secs);
        Some([
            ("pages_in", rate(self.pages_in, prev.pages_in)?),
            ("pages_out", rate(self.pages_out, prev.pages_out)?),
            ("swap_in", rate(self.swap_in, prev.swap_in)?),
            ("swap_out", rate(self.swap_out, prev.swap_out)?),
        ])
    }
}

pub struct PagingSampler {
    reader: BufReader<File>,
    previous: Option<(Instant, PagingCounters)>,
}

impl PagingSampler {
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let file = File::open(path).with_context(|| format!("could not open {path}"))?;
        Ok(Self {
            reader: BufReader::new(file),
            previous: None,
        })
    }

    pub fn sample(&mut self) -> anyhow::Result<Option<[(&'static str, f64); 4]>> {
        self.reader.rewind()?;
        let now = PagingCounters::parse(&mut self.reader)?;
        let t = Instant::now();
        let res = self.previous.and_then(|(prev_t, prev)| {
            let elapsed = t.duration_since(prev_t).as_secs_f64();
            if elapsed > 0.0 { now.rates(&prev, elapsed) } else { None }
        });
        self.previous = Some((t, now));
        Ok(res)
    }
}

pub fn load_average() -> anyhow::Result<[(&'static str, f64); 3]> {
    let load = LoadAverage::current().context("could not read /proc/loadavg")?;
    Ok([
        ("load1", f64::from(load.one)),
        ("load5", f64::from(load.five)),
        ("load15", f64::from(load.fifteen)),
    ])
}

/// Time elapsed since boot, in seconds.
pub fn uptime_secs(path: &str) -> anyhow::Result<f64> {
    let content = fs::read_to_string(path).with_context(|| format!("could not read {path}"))?;
    content
        .split_ascii_whitespace()
        .next()
        .and_then(|s| s.parse().ok())
        .with_context(|| format!("invalid content in {path}: {content}"))
}

/// States counted by the `processes_<STATE>` parameters.
pub const PROCESS_STATES: [char; 5] = ['D', 'R', 'S', 'T', 'Z'];

/// Counts the processes, in total and per state.
pub fn count_processes(states: impl IntoIterator<Item = char>) -> Vec<(String, f64)> {
    let mut counts = [0u32; PROCESS_STATES.len()];
    let mut total = 0;
    for state in states {
        total += 1;
        if let Some(i) = PROCESS_STATES.iter().position(|s| *s == state) {
            counts[i] += 1;
        }
    }
    let mut res = vec![("processes".to_owned(), f64::from(total))];
    res.extend(
        PROCESS_STATES
            .iter()
            .zip(counts)
            .map(|(s, n)| (format!("processes_{s}"), f64::from(n))),
    );
    res
}

pub fn process_states() -> anyhow::Result<Vec<char>> {
    let mut states = Vec::new();
    for p in procfs::process::all_processes().context("cannot read /proc")? {
        let stat = match p.and_then(|p| p.stat()) {
            Ok(stat) => stat,
            // process vanished, ignore
            Err(ProcError::NotFound(_)) => continue,
            Err(e) => return Err(e).context("cannot read process statistics"),
        };
        states.push(stat.state);
    }
    Ok(states)
}

fn tcp_state_name(state: &TcpState) -> &'static str {
    match state {
        TcpState::Established => "ESTABLISHED",
        TcpState::SynSent => "SYN_SENT",
        TcpState::SynRecv => "SYN_RECV",
        TcpState::FinWait1 => "FIN_WAIT1",
        TcpState::FinWait2 => "FIN_WAIT2",
        TcpState::TimeWait => "TIME_WAIT",
        TcpState::Close => "CLOSED",
        TcpState::CloseWait => "CLOSE_WAIT",
        TcpState::LastAck => "LAST_ACK",
        TcpState::Listen => "LISTEN",
        TcpState::Closing => "CLOSING",
        _ => "UNKNOWN",
    }
}

/// Counts the TCP sockets per state, for the `sockets_tcp_<STATE>` parameters.
pub fn count_tcp_states<'a>(states: impl IntoIterator<Item = &'a TcpState>) -> Vec<(String, f64)> {
    let mut counts: HashMap<&str, u32> = TCP_STATES.iter().map(|s| (*s, 0)).collect();
    for state in states {
        *counts.entry(tcp_state_name(state)).or_default() += 1;
    }
    TCP_STATES
        .iter()
        .map(|s| (format!("sockets_tcp_{s}"), f64::from(counts[s])))
        .collect()
}

/// Number of open sockets.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketCounts {
    /// The `sockets_{tcp,udp,unix,icm}` parameters.
    pub totals: [(&'static str, f64); 4],
    /// The `sockets_tcp_<STATE>` parameters.
    pub tcp_states: Vec<(String, f64)>,
}

pub fn sockets() -> anyhow::Result<SocketCounts> {
    let mut tcp = procfs::net::tcp().context("could not read /proc/net/tcp")?;
    // IPv6 may be disabled
    tcp.extend(procfs::net::tcp6().unwrap_or_default());
    let mut n_udp = procfs::net::udp().context("could not read /proc/net/udp")?.len();
    n_udp += procfs::net::udp6().map(|v| v.len()).unwrap_or_default();
    let n_unix = procfs::net::unix().context("could not read /proc/net/unix")?.len();
    let n_icm = fs::read_to_string("/proc/net/icmp")
        .map(|content| content.lines().skip(1).count())
        .unwrap_or_default();

    Ok(SocketCounts {
        totals: [
            ("sockets_tcp", tcp.len() as f64),
            ("sockets_udp", n_udp as f64),
            ("sockets_unix", n_unix as f64),
            ("sockets_icm", n_icm as f64),
        ],
        tcp_states: count_tcp_states(tcp.iter().map(|entry| &entry.state)),
    })
}

/// Values of the general information read from /proc/cpuinfo.
#[derive(Debug, Clone, PartialEq)]
pub enum CpuField {
    Number(f64),
    Text(String),
}

/// Reads a field of the description of the first CPU, for the `cpu_*` and `bogomips` general parameters.
pub fn cpu_field(info: &CpuInfo, param: &str) -> Option<CpuField> {
    let (field, numeric) = match param {
        "cpu_MHz" => ("cpu MHz", true),
        "bogomips" => ("bogomips", true),
        "cpu_vendor_id" => ("vendor_id", false),
        "cpu_family" => ("cpu family", false),
        "cpu_model" => ("model", false),
        "cpu_model_name" => ("model name", false),
        _ => return None,
    };
    let value = info.get_field(0, field)?.trim();
    if numeric {
        value.parse().ok().map(CpuField::Number)
    } else {
        Some(CpuField::Text(value.to_owned()))
    }
}

pub fn cpu_info() -> anyhow::Result<CpuInfo> {
    CpuInfo::current().context("could not read /proc/cpuinfo")
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use procfs::FromBufRead;

    use super::*;

    #[test]
    fn cpu_percentages() {
        let prev = CpuTicks {
            user: 100,
            system: 50,
            idle: 800,
            ..Default::default()
        };
        let now = CpuTicks {
            user: 150,
            nice: 10,
            system: 70,
            idle: 910,
            iowait: 10,
            ..Default::default()
        };
        let usage = cpu_usage(&prev, &now).unwrap();
        assert_eq!(usage[0], ("cpu_usr", 25.0));
        assert_eq!(usage[1], ("cpu_nice", 5.0));
        assert_eq!(usage[2], ("cpu_sys", 10.0));
        assert_eq!(usage[3], ("cpu_idle", 55.0));
        assert_eq!(usage[4], ("cpu_iowait", 5.0));
        assert_eq!(usage[9], ("cpu_usage", 45.0));

        assert_eq!(cpu_usage(&now, &prev), None);
        assert_eq!(cpu_usage(&now, &now), None);
    }

    #[test]
    fn paging() {
        let text = indoc! {"
            nr_free_pages 123
            pgpgin 1000
            pgpgout 2000
            pswpin 10
            pswpout 20
            pgfault 99
        "};
        let prev = PagingCounters::parse(text.as_bytes()).unwrap();
        let now = PagingCounters {
            pages_in: 1100,
            pages_out: 2400,
            swap_in: 10,
            swap_out: 30,
        };
        assert_eq!(
            now.rates(&prev, 2.0).unwrap(),
            [("pages_in", 50.0), ("pages_out", 200.0), ("swap_in", 0.0), ("swap_out", 5.0)]
        );
        assert_eq!(prev.rates(&now, 2.0), None);
        assert!(PagingCounters::parse("pgpgin 1\n".as_bytes()).is_err());
    }

    #[test]
    fn process_counts() {
        let counts = count_processes(['R', 'S', 'S', 'Z', 'I']);
        assert_eq!(
            counts,
            vec![
                ("processes".to_owned(), 5.0),
                ("processes_D".to_owned(), 0.0),
                ("processes_R".to_owned(), 1.0),
                ("processes_S".to_owned(), 2.0),
                ("processes_T".to_owned(), 0.0),
                ("processes_Z".to_owned(), 1.0),
            ]
        );
    }

    #[test]
    fn tcp_states() {
        let states = [TcpState::Listen, TcpState::Established, TcpState::Listen, TcpState::Close];
        let counts = count_tcp_states(&states);
        assert_eq!(counts.len(), TCP_STATES.len());
        assert_eq!(counts[0], ("sockets_tcp_ESTABLISHED".to_owned(), 1.0));
        assert_eq!(counts[6], ("sockets_tcp_CLOSED".to_owned(), 1.0));
        assert_eq!(counts[9], ("sockets_tcp_LISTEN".to_owned(), 2.0));
    }

    #[test]
    fn cpuinfo_fields() {
        let text = indoc! {"
            processor	: 0
            vendor_id	: GenuineIntel
            cpu family	: 6
            model		: 142
            model name	: Intel(R) Core(TM) i7-8550U CPU @ 1.80GHz
            cpu MHz		: 1992.002
            bogomips	: 3984.00

            processor	: 1
            vendor_id	: GenuineIntel
            cpu family	: 6
            model		: 142
            model name	: Intel(R) Core(TM) i7-8550U CPU @ 1.80GHz
            cpu MHz		: 2100.000
            bogomips	: 3984.00
        "};
        let info = CpuInfo::from_buf_read(text.as_bytes()).unwrap();
        assert_eq!(info.num_cores(), 2);
        assert_eq!(cpu_field(&info, "cpu_MHz"), Some(CpuField::Number(1992.002)));
        assert_eq!(cpu_field(&info, "cpu_family"), Some(CpuField::Text("6".to_owned())));
        assert_eq!(
            cpu_field(&info, "cpu_model_name"),
            Some(CpuField::Text("Intel(R) Core(TM) i7-8550U CPU @ 1.80GHz".to_owned()))
        );
        assert_eq!(cpu_field(&info, "no_CPUs"), None);
    }
}
