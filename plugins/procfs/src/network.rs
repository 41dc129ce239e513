//! Network traffic read from `/proc/net/dev`, and addresses of the network interfaces.

use std::{
    fs::File,
    io::{BufReader, Seek},
    time::Instant,
};

use anyhow::Context;
use apmon::collect::InterfaceAddress;
use nix::net::if_::InterfaceFlags;
use procfs::{FromBufRead, net::InterfaceDeviceStatus};

/// Traffic of one interface since the previous sample.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceTraffic {
    pub interface: String,
    /// Received KB per second.
    pub kb_in: f64,
    /// Sent KB per second.
    pub kb_out: f64,
    /// Total number of receive and transmit errors since boot.
    pub errors: u64,
}

/// Computes the traffic of every interface but the loopback, sorted by interface name.
///
/// An interface that did not exist in `prev`, or whose counters went backwards, is skipped.
pub fn traffic(prev: &InterfaceDeviceStatus, now: &InterfaceDeviceStatus, elapsed_secs: f64) -> Vec<InterfaceTraffic> {
    let mut res: Vec<InterfaceTraffic> = now
        .0
        .iter()
        .filter(|(name, _)| name.as_str() != "lo")
        .filter_map(|(name, now_stats)| {
            let prev_stats = prev.0.get(name)?;
            let received = now_stats.recv_bytes.checked_sub(prev_stats.recv_bytes)?;
            let sent = now_stats.sent_bytes.checked_sub(prev_stats.sent_bytes)?;
            Some(InterfaceTraffic {
                interface: name.clone(),
                kb_in: received as f64 / 1024.0 / elapsed_secs,
                kb_out: sent as f64 / 1024.0 / elapsed_secs,
                errors: now_stats.recv_errs + now_stats.sent_errs,
            })
        })
        .collect();
    res.sort_by(|a, b| a.interface.cmp(&b.interface));
    res
}

/// Reads /proc/net/dev and computes the traffic rates between two reads.
pub struct NetworkSampler {
    reader: BufReader<File>,
    previous: Option<(Instant, InterfaceDeviceStatus)>,
}

impl NetworkSampler {
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let file = File::open(path).with_context(|| format!("cannot open {path}"))?;
        Ok(Self {
            reader: BufReader::new(file),
            previous: None,
        })
    }

    /// Returns the traffic since the previous call, or `None` on the first call.
    pub fn sample(&mut self) -> anyhow::Result<Option<Vec<InterfaceTraffic>>> {
        self.reader.rewind()?;
        let now = InterfaceDeviceStatus::from_buf_read(&mut self.reader).context("error parsing /proc/net/dev")?;
        let t = Instant::now();
        let res = match self.previous.take() {
            Some((prev_t, prev)) => {
                let elapsed = t.duration_since(prev_t).as_secs_f64();
                (elapsed > 0.0).then(|| traffic(&prev, &now, elapsed))
            }
            None => None,
        };
        self.previous = Some((t, now));
        Ok(res)
    }
}

/// Lists the IPv4 addresses of the network interfaces, loopback excluded.
pub fn interface_addresses() -> anyhow::Result<Vec<InterfaceAddress>> {
    let addrs = nix::ifaddrs::getifaddrs().context("could not list the network interfaces")?;
    let mut res = Vec::new();
    for ifaddr in addrs {
        if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            continue;
        }
        let ip = ifaddr
            .address
            .as_ref()
            .and_then(|a| a.as_sockaddr_in())
            .map(|a| a.ip());
        if let Some(ip) = ip {
            res.push(InterfaceAddress {
                interface: ifaddr.interface_name,
                ip,
            });
        }
    }
    Ok(res)
}
