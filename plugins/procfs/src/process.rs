//! Resource usage of monitored jobs: a process and all its descendants.

use std::{
    collections::{HashMap, HashSet},
    io,
    path::Path,
    time::Instant,
};

use anyhow::Context;
use apmon::{CollectError, MonitoredJob, ParamTable, Readings, datagram::Param};
use procfs::{ProcError, process::Process};
use walkdir::WalkDir;

const MIB: f64 = 1024.0 * 1024.0;

/// Returns `root` and the pids of all its descendants, given the `(pid, ppid)` of every process.
pub fn descendants(root: i32, parents: &[(i32, i32)]) -> Vec<i32> {
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for (pid, ppid) in parents {
        children.entry(*ppid).or_default().push(*pid);
    }
    let mut res = vec![root];
    let mut seen = HashSet::from([root]);
    let mut i = 0;
    while i < res.len() {
        if let Some(c) = children.get(&res[i]) {
            for pid in c {
                if seen.insert(*pid) {
                    res.push(*pid);
                }
            }
        }
        i += 1;
    }
    res
}

/// Resources used by a process tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeUsage {
    /// Start time of the root process, in ticks since boot.
    pub start_ticks: u64,
    /// User and system time of all the processes, in ticks.
    pub cpu_ticks: u64,
    pub rss_bytes: u64,
    pub vsize_bytes: u64,
    /// Number of file descriptors, `None` if some of them could not be listed.
    pub open_files: Option<u64>,
}

fn is_gone(err: &ProcError) -> bool {
    match err {
        ProcError::NotFound(_) => true,
        // "No such process" is sometimes reported as a plain I/O error
        ProcError::Io(err, _) => err.raw_os_error() == Some(3) || err.kind() == io::ErrorKind::NotFound,
        _ => false,
    }
}

fn read_tree(root: u32, page_size: u64) -> Result<TreeUsage, CollectError> {
    let gone_or_transient = |e: ProcError| {
        if is_gone(&e) {
            CollectError::ProcessGone(root)
        } else {
            CollectError::transient(e)
        }
    };
    let root_stat = Process::new(root as i32)
        .and_then(|p| p.stat())
        .map_err(gone_or_transient)?;

    let mut processes = HashMap::new();
    let mut parents = Vec::new();
    for p in procfs::process::all_processes()
        .context("cannot read /proc")
        .map_err(CollectError::Transient)?
    {
        // processes can exit at any time, skip them
        let Ok(p) = p else { continue };
        let Ok(stat) = p.stat() else { continue };
        parents.push((stat.pid, stat.ppid));
        processes.insert(stat.pid, (p, stat));
    }

    let mut usage = TreeUsage {
        start_ticks: root_stat.starttime,
        open_files: Some(0),
        ..Default::default()
    };
    for pid in descendants(root_stat.pid, &parents) {
        let Some((process, stat)) = processes.get(&pid) else {
            continue;
        };
        usage.cpu_ticks += stat.utime + stat.stime;
        usage.rss_bytes += stat.rss * page_size;
        usage.vsize_bytes += stat.vsize;
        usage.open_files = match (usage.open_files, process.fd_count()) {
            (Some(n), Ok(fds)) => Some(n + fds as u64),
            _ => None,
        };
    }
    Ok(usage)
}

/// Size of the files in a directory and its sub-directories, in bytes.
pub fn directory_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok()?.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

/// Space of the file system that contains `path`, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

impl DiskSpace {
    pub fn of(path: &Path) -> anyhow::Result<Self> {
        let stat = nix::sys::statvfs::statvfs(path).with_context(|| format!("statvfs failed on {path:?}"))?;
        let frsize = u64::from(stat.fragment_size());
        let blocks = u64::from(stat.blocks());
        Ok(Self {
            total: blocks * frsize,
            used: (blocks - u64::from(stat.blocks_free())) * frsize,
            free: u64::from(stat.blocks_available()) * frsize,
        })
    }

    pub fn usage_percent(&self) -> f64 {
        let usable = self.used + self.free;
        if usable == 0 { 0.0 } else { 100.0 * self.used as f64 / usable as f64 }
    }
}

/// Computes the job parameters, keeping the CPU time of each job between two samples.
pub struct JobSampler {
    ticks_per_second: f64,
    page_size: u64,
    previous: HashMap<u32, (Instant, u64)>,
}

impl Default for JobSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl JobSampler {
    pub fn new() -> Self {
        Self {
            ticks_per_second: procfs::ticks_per_second() as f64,
            page_size: procfs::page_size(),
            previous: HashMap::new(),
        }
    }

    /// Samples a job.
    ///
    /// `mem_total` (bytes) and `uptime` (seconds) are required to compute `mem_usage` and `run_time`.
    pub fn sample(
        &mut self,
        job: &MonitoredJob,
        params: &ParamTable,
        mem_total: Option<u64>,
        uptime: Option<f64>,
    ) -> Result<Readings, CollectError> {
        let usage = match read_tree(job.pid, self.page_size) {
            Ok(usage) => usage,
            Err(e) => {
                if matches!(e, CollectError::ProcessGone(_)) {
                    self.previous.remove(&job.pid);
                }
                return Err(e);
            }
        };
        let now = Instant::now();
        let tps = self.ticks_per_second;
        let mut readings = Readings::default();
        let push = |readings: &mut Readings, name: &'static str, value: Result<f64, CollectError>| {
            if params.is_enabled(name) {
                readings.record(name, value.map(|v| vec![Param::new(name, v)]));
            }
        };

        let run_time = uptime
            .map(|up| (up - usage.start_ticks as f64 / tps).max(0.0))
            .ok_or_else(|| CollectError::transient(anyhow::anyhow!("uptime not available")));
        push(&mut readings, "run_time", run_time);
        push(&mut readings, "cpu_time", Ok(usage.cpu_ticks as f64 / tps));

        let cpu_usage = match self.previous.insert(job.pid, (now, usage.cpu_ticks)) {
            Some((prev_t, prev_ticks)) => {
                let elapsed = now.duration_since(prev_t).as_secs_f64();
                match usage.cpu_ticks.checked_sub(prev_ticks) {
                    Some(delta) if elapsed > 0.0 => Ok(100.0 * delta as f64 / tps / elapsed),
                    // a child exited between the two samples
                    _ => Err(CollectError::transient(anyhow::anyhow!("cpu time went backwards"))),
                }
            }
            None => Err(CollectError::transient(anyhow::anyhow!("first sample"))),
        };
        push(&mut readings, "cpu_usage", cpu_usage);

        let mem_usage = match mem_total {
            Some(total) if total > 0 => Ok(100.0 * usage.rss_bytes as f64 / total as f64),
            _ => Err(CollectError::transient(anyhow::anyhow!("total memory not available"))),
        };
        push(&mut readings, "mem_usage", mem_usage);
        push(&mut readings, "rss", Ok(usage.rss_bytes as f64 / 1024.0));
        push(&mut readings, "virtualmem", Ok(usage.vsize_bytes as f64 / 1024.0));
        let open_files = usage
            .open_files
            .map(|n| n as f64)
            .ok_or_else(|| CollectError::transient(anyhow::anyhow!("cannot list the file descriptors")));
        push(&mut readings, "open_files", open_files);

        if let Some(workdir) = &job.workdir {
            if params.is_enabled("workdir_size") {
                push(&mut readings, "workdir_size", Ok(directory_size(workdir) as f64 / MIB));
            }
            let disk_params = ["disk_total", "disk_used", "disk_free", "disk_usage"];
            if disk_params.iter().any(|p| params.is_enabled(p)) {
                match DiskSpace::of(workdir) {
                    Ok(disk) => {
                        push(&mut readings, "disk_total", Ok(disk.total as f64 / MIB));
                        push(&mut readings, "disk_used", Ok(disk.used as f64 / MIB));
                        push(&mut readings, "disk_free", Ok(disk.free as f64 / MIB));
                        push(&mut readings, "disk_usage", Ok(disk.usage_percent()));
                    }
                    Err(e) => {
                        log::debug!("disk space of {workdir:?}: {e:#}");
                        for p in disk_params {
                            let err = CollectError::transient(anyhow::anyhow!("statvfs failed on {workdir:?}"));
                            push(&mut readings, p, Err(err));
                        }
                    }
                }
            }
        }
        Ok(readings)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use apmon::{Category, datagram::Value};
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn process_tree() {
        let parents = [(1, 0), (10, 1), (11, 10), (12, 10), (13, 11), (20, 1), (21, 20)];
        let mut tree = descendants(10, &parents);
        tree.sort();
        assert_eq!(tree, vec![10, 11, 12, 13]);
        assert_eq!(descendants(21, &parents), vec![21]);
        // unknown root
        assert_eq!(descendants(99, &parents), vec![99]);
    }

    #[test]
    fn directory_size_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), [0u8; 1000]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b"), [0u8; 24]).unwrap();
        assert_eq!(directory_size(dir.path()), 1024);
    }

    #[test]
    fn disk_usage() {
        let disk = DiskSpace {
            total: 1000,
            used: 300,
            free: 600,
        };
        assert_eq!(disk.usage_percent(), 100.0 * 300.0 / 900.0);
    }

    fn own_job(workdir: Option<PathBuf>) -> MonitoredJob {
        MonitoredJob {
            pid: std::process::id(),
            workdir,
            cluster: "c".to_owned(),
            node: "n".to_owned(),
        }
    }

    fn names(readings: &Readings) -> Vec<&str> {
        readings.values.iter().filter_map(|p| p.name.as_deref()).collect()
    }

    #[test]
    fn sample_own_process() {
        let dir = tempfile::tempdir().unwrap();
        let job = own_job(Some(dir.path().to_owned()));
        let params = ParamTable::new(Category::Job);
        let mut sampler = JobSampler::new();

        let first = sampler.sample(&job, &params, Some(1 << 40), Some(1e9)).unwrap();
        // the cpu usage needs two samples
        assert_eq!(first.failures.len(), 1);
        assert_eq!(first.failures[0].0, "cpu_usage");
        assert!(names(&first).contains(&"rss"));
        assert!(names(&first).contains(&"disk_usage"));
        let workdir_size = first.values.iter().find(|p| p.name.as_deref() == Some("workdir_size"));
        assert_eq!(workdir_size.map(|p| &p.value), Some(&Value::Real64(0.0)));

        std::thread::sleep(std::time::Duration::from_millis(20));
        let second = sampler.sample(&job, &params, Some(1 << 40), Some(1e9)).unwrap();
        assert!(names(&second).contains(&"cpu_usage"));
    }

    #[test]
    fn disabled_and_workdir_params() {
        let mut params = ParamTable::new(Category::Job);
        params.set_enabled("rss", false);
        let readings = JobSampler::new().sample(&own_job(None), &params, None, None).unwrap();
        let names = names(&readings);
        assert!(!names.contains(&"rss"));
        assert!(!names.contains(&"workdir_size"));
        assert!(names.contains(&"virtualmem"));
        let failed: Vec<_> = readings.failures.iter().map(|(n, _)| *n).collect();
        assert_eq!(failed, vec!["run_time", "cpu_usage", "mem_usage"]);
    }

    #[test]
    fn missing_process() {
        let job = MonitoredJob {
            pid: i32::MAX as u32,
            ..own_job(None)
        };
        let res = JobSampler::new().sample(&job, &ParamTable::new(Category::Job), None, None);
        assert!(matches!(res, Err(CollectError::ProcessGone(pid)) if pid == i32::MAX as u32));
    }
}
