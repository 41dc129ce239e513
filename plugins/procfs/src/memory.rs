//! Memory and swap status.

use std::{
    fs::File,
    io::{BufRead, BufReader, Seek},
};

use anyhow::Context;

/// Memory counters, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStatus {
    pub mem_total: u64,
    pub mem_free: u64,
    pub swap_total: u64,
    pub swap_free: u64,
}

const MIB: f64 = 1024.0 * 1024.0;

impl MemoryStatus {
    /// Parses the content of /proc/meminfo.
    pub fn parse(reader: impl BufRead) -> anyhow::Result<Self> {
        let mut status = MemoryStatus::default();
        let mut found = 0;
        for line in reader.lines() {
            let line = line.context("could not read line from /proc/meminfo")?;
            if line.is_empty() {
                continue;
            }
            let (key, value) =
                parse_meminfo_line(&line).with_context(|| format!("invalid line in /proc/meminfo: {line}"))?;
            let field = match key {
                "MemTotal" => &mut status.mem_total,
                "MemFree" => &mut status.mem_free,
                "SwapTotal" => &mut status.swap_total,
                "SwapFree" => &mut status.swap_free,
                _ => continue,
            };
            *field = value;
            found += 1;
        }
        anyhow::ensure!(found == 4, "missing entries in /proc/meminfo");
        // some kernels report more free memory than the total
        status.mem_total = status.mem_total.max(status.mem_free);
        status.swap_total = status.swap_total.max(status.swap_free);
        Ok(status)
    }

    /// Returns the `mem_*` and `swap_*` parameters: used and free amounts in MB, usage in percent.
    pub fn usage(&self) -> [(&'static str, f64); 6] {
        let used = self.mem_total - self.mem_free;
        let swap_used = self.swap_total - self.swap_free;
        [
            ("mem_used", used as f64 / MIB),
            ("mem_free", self.mem_free as f64 / MIB),
            ("mem_usage", percent(used, self.mem_total)),
            ("swap_used", swap_used as f64 / MIB),
            ("swap_free", self.swap_free as f64 / MIB),
            ("swap_usage", percent(swap_used, self.swap_total)),
        ]
    }

    pub fn total_mem_mb(&self) -> f64 {
        self.mem_total as f64 / MIB
    }

    pub fn total_swap_mb(&self) -> f64 {
        self.swap_total as f64 / MIB
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 { 0.0 } else { 100.0 * part as f64 / total as f64 }
}

/// Reads /proc/meminfo, keeping the file open between two reads.
pub struct MeminfoReader {
    reader: BufReader<File>,
}

impl MeminfoReader {
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let file = File::open(path).with_context(|| format!("could not open {path}"))?;
        Ok(Self {
            reader: BufReader::new(file),
        })
    }

    pub fn read(&mut self) -> anyhow::Result<MemoryStatus> {
        self.reader.rewind()?;
        MemoryStatus::parse(&mut self.reader)
    }
}

fn parse_meminfo_line(line: &str) -> Option<(&str, u64)> {
    let mut s = line.split_ascii_whitespace();
    let key = s.next()?;
    let value = s.next()?;
    let unit = s.next(); // no unit means that the unit is Byte

    let key = key.strip_suffix(':')?;
    let value: u64 = value.parse().ok()?;
    let value = match unit {
        Some(unit) => convert_meminfo_to_bytes(value, unit)?,
        None => value,
    };
    Some((key, value))
}

fn convert_meminfo_to_bytes(value: u64, unit: &str) -> Option<u64> {
    // For meminfo, "kB" actually means "kiB". See the doc of procfs.
    match unit {
        "B" => Some(value),
        "kB" | "KiB" | "kiB" | "KB" => Some(value * 1024),
        "mB" | "MiB" | "miB" | "MB" => Some(value * 1024 * 1024),
        "gB" | "GiB" | "giB" | "GB" => Some(value * 1024 * 1024 * 1024),
        _ => None,
    }
}
