//! The monitor: user datagrams, background monitoring and configuration reloads.

use std::fmt;
use std::io;
use std::net::{SocketAddrV4, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::collect::{
    Category, CollectError, Collector, InterfaceAddress, MAX_MONITORED_JOBS, MonitoredJob, NoopCollector, ParamTable,
    preferred_address,
};
use crate::config::{
    ConfigError, DEFAULT_GEN_INTERVALS, DEFAULT_JOB_INTERVAL, DEFAULT_RECHECK_INTERVAL, DEFAULT_SYS_INTERVAL, Directive,
    MonitorSettings, interval_or,
};
use crate::datagram::{BodyEncoder, EncodeError, Param, assemble, encode_header};
use crate::destinations::{
    DestinationRegistry, DestinationSet, DestinationSpec, RegistryError, Resolver, SystemResolver, pick_ipv4,
};
use crate::logging::{Level, Logger, fatal, fine, info, warning};
use crate::rate::RateLimiter;
use crate::scheduler::{Action, ScheduledTasks, Scheduler};
use crate::source::{self, ConfigSource, HttpFetcher, RemoteFetcher};

/// Cluster of the user datagrams when none has been given yet.
pub const DEFAULT_USER_CLUSTER: &str = "ApMon_UserSend";
/// Default cluster of the system and general monitoring datagrams.
pub const DEFAULT_SYS_CLUSTER: &str = "ApMon_SysMon";
/// Default cluster of the job monitoring datagrams.
pub const DEFAULT_JOB_CLUSTER: &str = "ApMon_JobMon";
/// Sequence numbers wrap around at this value.
pub const SEQ_MODULO: i32 = 2_000_000_000;
/// Write timeout of the UDP socket.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(20);

const UNKNOWN: &str = "unknown";

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("could not load the configuration")]
    Config(#[from] ConfigError),
    #[error("could not register the destinations")]
    Registry(#[from] RegistryError),
    #[error("could not create the UDP socket")]
    Socket(#[source] io::Error),
    #[error("could not create the HTTP client")]
    Http(#[source] reqwest::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("datagram dropped, the maximum message rate has been reached")]
    RateLimited,
    #[error("could not encode the datagram")]
    Encode(#[from] EncodeError),
    #[error("could not send the datagram to {destination}")]
    Transport {
        destination: SocketAddrV4,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("the destinations have been given directly, there is nothing to reload")]
    NotReloadable,
    #[error("could not load the configuration")]
    Config(#[from] ConfigError),
    #[error("could not register the destinations")]
    Registry(#[from] RegistryError),
}

#[derive(Debug, thiserror::Error)]
#[error("cannot monitor more than {MAX_MONITORED_JOBS} jobs")]
pub struct TooManyJobs;

/// Builds an [`ApMon`] with non-default parts.
pub struct ApMonBuilder {
    source: ConfigSource,
    logger: Logger,
    collector: Box<dyn Collector>,
    fetcher: Option<Box<dyn RemoteFetcher>>,
    resolver: Box<dyn Resolver>,
    settings: MonitorSettings,
}

impl ApMonBuilder {
    fn new(source: ConfigSource) -> Self {
        Self {
            source,
            logger: Logger::default(),
            collector: Box::new(NoopCollector),
            fetcher: None,
            resolver: Box::new(SystemResolver),
            settings: MonitorSettings::default(),
        }
    }

    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn collector(mut self, collector: impl Collector + 'static) -> Self {
        self.collector = Box::new(collector);
        self
    }

    /// Sets the fetcher of remote configurations. By default, an HTTP client is used.
    pub fn fetcher(mut self, fetcher: impl RemoteFetcher + 'static) -> Self {
        self.fetcher = Some(Box::new(fetcher));
        self
    }

    pub fn resolver(mut self, resolver: impl Resolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Sets the initial settings. The directives of the configuration are applied on top of them.
    pub fn settings(mut self, settings: MonitorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Loads the configuration, registers the destinations and starts the
    /// background monitoring if the configuration enables it.
    pub fn build(self) -> Result<ApMon, InitError> {
        let Self {
            source,
            logger,
            mut collector,
            fetcher,
            resolver,
            settings,
        } = self;

        let fetcher = match fetcher {
            Some(f) => f,
            None => Box::new(HttpFetcher::new().map_err(InitError::Http)?),
        };
        let loaded = source::load(&source, &*fetcher, true, &logger)?;

        let identity = HostIdentity::discover(&mut *collector, &*resolver, &logger);
        let registry = DestinationRegistry::with_resolver(resolver, logger.clone());
        registry.replace(&loaded.parsed.destinations, loaded.markers, true)?;

        let socket = bind_socket().map_err(InitError::Socket)?;
        let instance_id = rand::random_range(0..i32::MAX);

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let tasks = MonitorTasks { inner: weak.clone() };
            Inner {
                sender: Mutex::new(Sender {
                    socket,
                    encoder: BodyEncoder::new(logger.clone()),
                    seq: 0,
                    limiter: RateLimiter::new(settings.max_msg_rate, logger.clone()),
                    cluster: DEFAULT_USER_CLUSTER.to_owned(),
                    node: identity.hostname.clone(),
                }),
                monitoring: Mutex::new(Monitoring {
                    settings: settings.clone(),
                    sys_params: ParamTable::new(Category::System),
                    gen_params: ParamTable::new(Category::General),
                    job_params: ParamTable::new(Category::Job),
                    jobs: Vec::new(),
                    collector,
                    sys_cluster: DEFAULT_SYS_CLUSTER.to_owned(),
                    sys_node: identity.ip.clone(),
                    gen_counter: 0,
                }),
                scheduler: Scheduler::new(Box::new(tasks), logger.clone()),
                source,
                fetcher,
                registry,
                identity,
                instance_id,
                logger,
            }
        });
        inner.apply_directives(&loaded.parsed.directives);
        Ok(ApMon { inner })
    }
}

/// Sends monitoring datagrams to a set of destinations.
///
/// User datagrams are sent with [`ApMon::send_parameters`] and its variants.
/// The host and the jobs registered with [`ApMon::add_job_to_monitor`] can also be
/// monitored in the background, see [`ApMon::set_sys_monitoring`] and [`ApMon::set_job_monitoring`].
///
/// All the methods take `&self`: share the monitor between threads with an `Arc`.
pub struct ApMon {
    inner: Arc<Inner>,
}

impl ApMon {
    pub fn builder(source: ConfigSource) -> ApMonBuilder {
        ApMonBuilder::new(source)
    }

    /// Creates a monitor from a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, InitError> {
        Self::builder(ConfigSource::File(path.as_ref().to_path_buf())).build()
    }

    /// Creates a monitor from a configuration file or a configuration URL.
    pub fn from_location(location: &str) -> Result<Self, InitError> {
        Self::builder(ConfigSource::from_location(location)).build()
    }

    /// Creates a monitor from a list of entries: URLs of configurations, or `host[:port] [password]` destinations.
    pub fn from_list<I, S>(entries: I) -> Result<Self, InitError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = entries.into_iter().map(Into::into).collect();
        Self::builder(ConfigSource::List(entries)).build()
    }

    /// Creates a monitor that sends to the given destinations.
    /// The configuration recheck is not available for such a monitor.
    pub fn from_destinations(destinations: impl IntoIterator<Item = DestinationSpec>) -> Result<Self, InitError> {
        Self::builder(ConfigSource::Direct(destinations.into_iter().collect())).build()
    }

    /// Sends parameters.
    ///
    /// If `cluster` is `None`, the cluster and node of the previous call are used
    /// (initially `ApMon_UserSend` and the host name). Otherwise they become the new
    /// default, a missing `node` being replaced by the host name.
    pub fn send_parameters(&self, cluster: Option<&str>, node: Option<&str>, params: &[Param]) -> Result<(), SendError> {
        self.inner.send_user(cluster, node, params, None)
    }

    /// Sends parameters with a timestamp, in seconds since the epoch. Non-positive timestamps are not sent.
    pub fn send_timed_parameters(
        &self,
        cluster: Option<&str>,
        node: Option<&str>,
        params: &[Param],
        timestamp: i32,
    ) -> Result<(), SendError> {
        self.inner.send_user(cluster, node, params, Some(timestamp))
    }

    pub fn send_parameter(&self, cluster: Option<&str>, node: Option<&str>, param: Param) -> Result<(), SendError> {
        self.send_parameters(cluster, node, &[param])
    }

    pub fn send_timed_parameter(
        &self,
        cluster: Option<&str>,
        node: Option<&str>,
        param: Param,
        timestamp: i32,
    ) -> Result<(), SendError> {
        self.send_timed_parameters(cluster, node, &[param], timestamp)
    }

    /// Sends the system information now.
    pub fn send_sys_info(&self) -> Result<(), SendError> {
        self.inner.send_sys_info()
    }

    /// Sends the general information about the host now.
    pub fn send_general_info(&self) -> Result<(), SendError> {
        self.inner.send_general_info()
    }

    /// Sends the information about every monitored job now.
    /// The jobs whose process has exited are removed.
    pub fn send_job_info(&self) -> Result<(), SendError> {
        self.inner.send_job_info()
    }

    /// Starts monitoring a process.
    ///
    /// The datagrams are sent to `cluster` (default `ApMon_JobMon`) and `node`
    /// (default: the IP address of the host). Registering a process twice replaces its entry.
    pub fn add_job_to_monitor(
        &self,
        pid: u32,
        workdir: Option<PathBuf>,
        cluster: Option<&str>,
        node: Option<&str>,
    ) -> Result<(), TooManyJobs> {
        let job = MonitoredJob {
            pid,
            workdir,
            cluster: cluster.unwrap_or(DEFAULT_JOB_CLUSTER).to_owned(),
            node: node.unwrap_or(&self.inner.identity.ip).to_owned(),
        };
        let mut m = self.inner.monitoring.lock().unwrap();
        if let Some(existing) = m.jobs.iter_mut().find(|j| j.pid == pid) {
            *existing = job;
            return Ok(());
        }
        if m.jobs.len() >= MAX_MONITORED_JOBS {
            warning!(self.inner.logger, "cannot monitor process {pid}: {TooManyJobs}");
            return Err(TooManyJobs);
        }
        fine!(self.inner.logger, "monitoring process {pid}");
        m.jobs.push(job);
        Ok(())
    }

    /// Stops monitoring a process. Returns false if the process was not monitored.
    pub fn remove_job_to_monitor(&self, pid: u32) -> bool {
        self.inner.remove_job(pid)
    }

    pub fn monitored_jobs(&self) -> Vec<MonitoredJob> {
        self.inner.monitoring.lock().unwrap().jobs.clone()
    }

    /// Enables or disables the job monitoring. A zero interval selects the default interval.
    pub fn set_job_monitoring(&self, enabled: bool, interval: Duration) {
        self.inner.set_job_monitoring(enabled, interval)
    }

    /// Enables or disables the system monitoring. A zero interval selects the default interval.
    pub fn set_sys_monitoring(&self, enabled: bool, interval: Duration) {
        self.inner.set_sys_monitoring(enabled, interval)
    }

    /// Enables or disables the general information, sent every `every_n` system monitoring cycles.
    /// Enabling it also enables the system monitoring.
    pub fn set_gen_monitoring(&self, enabled: bool, every_n: u32) {
        self.inner.set_gen_monitoring(enabled, every_n)
    }

    /// Enables or disables the periodic check of the configuration.
    /// Ignored, with a warning, when the destinations have been given directly.
    pub fn set_conf_recheck(&self, enabled: bool, interval: Duration) {
        self.inner.set_conf_recheck(enabled, interval)
    }

    /// Enables the configuration recheck with the given interval, or disables it if the interval is zero.
    pub fn set_recheck_interval(&self, interval: Duration) {
        self.inner.set_conf_recheck(!interval.is_zero(), interval)
    }

    /// Changes the maximum number of datagrams per second. Non-positive values are ignored.
    pub fn set_max_msg_rate(&self, rate: i64) {
        self.inner.set_max_msg_rate(rate)
    }

    pub fn set_auto_disable(&self, enabled: bool) {
        self.inner.monitoring.lock().unwrap().settings.auto_disable = enabled;
    }

    pub fn set_log_level(&self, level: Level) {
        self.inner.logger.set_level(level);
    }

    /// Changes the cluster and node of the system and general monitoring datagrams.
    pub fn set_sys_mon_cluster_node(&self, cluster: &str, node: &str) {
        let mut m = self.inner.monitoring.lock().unwrap();
        m.sys_cluster = cluster.to_owned();
        m.sys_node = node.to_owned();
    }

    /// Enables or disables the collection of a parameter. Returns false if the parameter is unknown.
    pub fn set_param_enabled(&self, category: Category, name: &str, enabled: bool) -> bool {
        self.inner.monitoring.lock().unwrap().table_mut(category).set_enabled(name, enabled)
    }

    pub fn is_param_enabled(&self, category: Category, name: &str) -> bool {
        self.inner.monitoring.lock().unwrap().table(category).is_enabled(name)
    }

    pub fn settings(&self) -> MonitorSettings {
        self.inner.settings()
    }

    /// Replaces all the settings at once.
    pub fn apply_settings(&self, settings: MonitorSettings) {
        self.inner.apply_settings(settings)
    }

    /// Reloads the configuration now, whether it has changed or not.
    /// Returns the number of destinations.
    pub fn reload(&self) -> Result<usize, ReloadError> {
        self.inner.reload()
    }

    pub fn destinations(&self) -> Arc<DestinationSet> {
        self.inner.registry.current()
    }

    /// Returns true if the background thread is running.
    pub fn is_background_running(&self) -> bool {
        self.inner.scheduler.is_running()
    }

    pub fn instance_id(&self) -> i32 {
        self.inner.instance_id
    }

    pub fn hostname(&self) -> &str {
        &self.inner.identity.hostname
    }

    /// The IP address that identifies this host, or `unknown`.
    pub fn ip_address(&self) -> &str {
        &self.inner.identity.ip
    }

    pub fn logger(&self) -> &Logger {
        &self.inner.logger
    }
}

impl fmt::Debug for ApMon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApMon")
            .field("instance_id", &self.inner.instance_id)
            .field("source", &self.inner.source)
            .field("destinations", &self.inner.registry.current())
            .finish_non_exhaustive()
    }
}

impl Drop for ApMon {
    fn drop(&mut self) {
        let scheduler = &self.inner.scheduler;
        if scheduler.is_running() && scheduler.is_enabled(Action::JobInfo) {
            if let Err(e) = self.inner.send_job_info() {
                warning!(self.inner.logger, "last job information not sent: {e}");
            }
        }
        scheduler.stop();
    }
}

/// Names and addresses of the host, discovered once.
#[derive(Debug, Clone)]
struct HostIdentity {
    hostname: String,
    ip: String,
    addresses: Vec<InterfaceAddress>,
}

impl HostIdentity {
    fn discover(collector: &mut dyn Collector, resolver: &dyn Resolver, logger: &Logger) -> Self {
        let hostname = match hostname::get() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(e) => {
                warning!(logger, "could not get the host name: {e}");
                UNKNOWN.to_owned()
            }
        };
        let addresses = collector.host_addresses().unwrap_or_else(|e| {
            warning!(logger, "could not list the network interfaces: {e:#}");
            Vec::new()
        });
        let ip = preferred_address(&addresses)
            .or_else(|| {
                // no interface found, ask the resolver
                let addrs = resolver.resolve(&hostname, 0).ok()?;
                pick_ipv4(&addrs).filter(|ip| !ip.is_loopback())
            })
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN.to_owned());
        fine!(logger, "host {hostname}, address {ip}");
        Self {
            hostname,
            ip,
            addresses,
        }
    }
}

fn bind_socket() -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_write_timeout(Some(SOCKET_TIMEOUT))?;
    Ok(socket)
}

/// State of the outgoing datagrams.
struct Sender {
    socket: UdpSocket,
    encoder: BodyEncoder,
    seq: i32,
    limiter: RateLimiter,
    cluster: String,
    node: String,
}

/// State of the background monitoring.
struct Monitoring {
    settings: MonitorSettings,
    sys_params: ParamTable,
    gen_params: ParamTable,
    job_params: ParamTable,
    jobs: Vec<MonitoredJob>,
    collector: Box<dyn Collector>,
    sys_cluster: String,
    sys_node: String,
    gen_counter: u32,
}

impl Monitoring {
    fn table(&self, category: Category) -> &ParamTable {
        match category {
            Category::System => &self.sys_params,
            Category::General => &self.gen_params,
            Category::Job => &self.job_params,
        }
    }

    fn table_mut(&mut self, category: Category) -> &mut ParamTable {
        match category {
            Category::System => &mut self.sys_params,
            Category::General => &mut self.gen_params,
            Category::Job => &mut self.job_params,
        }
    }
}

// Lock order: `monitoring` and `sender` are never held together, and neither is
// held while calling the scheduler, whose `stop` waits for the running action.
struct Inner {
    logger: Logger,
    source: ConfigSource,
    fetcher: Box<dyn RemoteFetcher>,
    registry: DestinationRegistry,
    identity: HostIdentity,
    instance_id: i32,
    sender: Mutex<Sender>,
    monitoring: Mutex<Monitoring>,
    scheduler: Scheduler,
}

impl Inner {
    fn send_user(
        &self,
        cluster: Option<&str>,
        node: Option<&str>,
        params: &[Param],
        timestamp: Option<i32>,
    ) -> Result<(), SendError> {
        let mut sender = self.sender.lock().unwrap();
        if !sender.limiter.should_send() {
            return Err(SendError::RateLimited);
        }
        if let Some(cluster) = cluster {
            sender.cluster = cluster.to_owned();
            sender.node = node.unwrap_or(&self.identity.hostname).to_owned();
        }
        let cluster = sender.cluster.clone();
        let node = sender.node.clone();
        self.transmit(&mut sender, &cluster, &node, params, timestamp)
    }

    /// Sends a monitoring datagram, without changing the default cluster and node of the user datagrams.
    fn send_to(&self, cluster: &str, node: &str, params: &[Param]) -> Result<(), SendError> {
        let mut sender = self.sender.lock().unwrap();
        if !sender.limiter.should_send() {
            fine!(self.logger, "monitoring datagram for {cluster}/{node} dropped by the rate limiter");
            return Err(SendError::RateLimited);
        }
        self.transmit(&mut sender, cluster, node, params, None)
    }

    fn transmit(
        &self,
        sender: &mut Sender,
        cluster: &str,
        node: &str,
        params: &[Param],
        timestamp: Option<i32>,
    ) -> Result<(), SendError> {
        let destinations = self.registry.current();
        let Sender {
            socket, encoder, seq, ..
        } = sender;

        // encode everything before sending anything
        let (body, count) = encoder.encode(cluster, node, params, timestamp)?;
        let mut datagrams = Vec::with_capacity(destinations.len());
        for destination in destinations.destinations() {
            let header = encode_header(&destination.password, self.instance_id, *seq)?;
            datagrams.push((destination.addr, assemble(&header, body)?));
        }

        for (addr, datagram) in &datagrams {
            if let Err(source) = socket.send_to(datagram, addr) {
                warning!(self.logger, "could not send a datagram to {addr}: {source}");
                match bind_socket() {
                    Ok(new_socket) => *socket = new_socket,
                    Err(e) => fatal!(self.logger, "could not recreate the UDP socket: {e}"),
                }
                return Err(SendError::Transport {
                    destination: *addr,
                    source,
                });
            }
        }
        *seq = (*seq + 1) % SEQ_MODULO;
        fine!(
            self.logger,
            "datagram with {count} parameter(s) sent to {} destination(s)",
            datagrams.len()
        );
        Ok(())
    }

    fn send_sys_info(&self) -> Result<(), SendError> {
        let (cluster, node, values) = {
            let mut guard = self.monitoring.lock().unwrap();
            let m = &mut *guard;
            let readings = m.collector.system_info(&m.sys_params);
            record_failures(&self.logger, &mut m.sys_params, readings.failures, m.settings.auto_disable);
            (m.sys_cluster.clone(), m.sys_node.clone(), readings.values)
        };
        if values.is_empty() {
            fine!(self.logger, "no system parameter to send");
            return Ok(());
        }
        self.send_to(&cluster, &node, &values)
    }

    fn send_general_info(&self) -> Result<(), SendError> {
        let (cluster, node, values) = {
            let mut guard = self.monitoring.lock().unwrap();
            let m = &mut *guard;
            let mut values = Vec::new();
            if m.gen_params.is_enabled("hostname") {
                values.push(Param::new("hostname", self.identity.hostname.as_str()));
            }
            if m.gen_params.is_enabled("ip") {
                values.push(Param::new("ip", self.identity.ip.as_str()));
                for a in &self.identity.addresses {
                    values.push(Param::new(format!("ip_{}", a.interface), a.ip.to_string()));
                }
            }

            // the host identity is not the job of the collector
            let mut to_collect = m.gen_params.clone();
            to_collect.set_enabled("hostname", false);
            to_collect.set_enabled("ip", false);
            let readings = m.collector.general_info(&to_collect);
            record_failures(&self.logger, &mut m.gen_params, readings.failures, m.settings.auto_disable);
            values.extend(readings.values);
            (m.sys_cluster.clone(), m.sys_node.clone(), values)
        };
        if values.is_empty() {
            fine!(self.logger, "no general parameter to send");
            return Ok(());
        }
        self.send_to(&cluster, &node, &values)
    }

    fn send_job_info(&self) -> Result<(), SendError> {
        let jobs = self.monitoring.lock().unwrap().jobs.clone();
        let mut result = Ok(());
        for job in jobs {
            let collected = {
                let mut guard = self.monitoring.lock().unwrap();
                let m = &mut *guard;
                m.collector.job_info(&job, &m.job_params).map(|readings| {
                    record_failures(&self.logger, &mut m.job_params, readings.failures, m.settings.auto_disable);
                    readings.values
                })
            };
            match collected {
                Ok(values) if values.is_empty() => {
                    fine!(self.logger, "no parameter to send for process {}", job.pid);
                }
                Ok(values) => {
                    if let Err(e) = self.send_to(&job.cluster, &job.node, &values) {
                        if result.is_ok() {
                            result = Err(e);
                        }
                    }
                }
                Err(CollectError::ProcessGone(pid)) => {
                    info!(self.logger, "process {pid} has exited, it is not monitored anymore");
                    self.remove_job(pid);
                }
                Err(e) => {
                    warning!(self.logger, "could not collect the information of process {}: {e}", job.pid);
                }
            }
        }
        result
    }

    fn remove_job(&self, pid: u32) -> bool {
        let mut m = self.monitoring.lock().unwrap();
        match m.jobs.iter().position(|j| j.pid == pid) {
            Some(i) => {
                m.jobs.remove(i);
                true
            }
            None => {
                warning!(self.logger, "process {pid} is not monitored");
                false
            }
        }
    }

    /// One cycle of the system monitoring, followed by the general information when it is due.
    fn sys_cycle(&self) -> anyhow::Result<()> {
        let sys_result = self.send_sys_info();
        let general_due = {
            let mut m = self.monitoring.lock().unwrap();
            if m.settings.general_info {
                let due = m.gen_counter <= 1;
                m.gen_counter = (m.gen_counter + 1) % m.settings.general_info_every.max(1);
                due
            } else {
                false
            }
        };
        if general_due {
            self.send_general_info()?;
        }
        Ok(sys_result?)
    }

    fn recheck(&self) -> anyhow::Result<()> {
        let current = self.registry.current();
        if source::modified(&self.source, current.markers(), &*self.fetcher, &self.logger)? {
            self.reload()?;
        }
        Ok(())
    }

    fn reload(&self) -> Result<usize, ReloadError> {
        if !self.source.is_reloadable() {
            return Err(ReloadError::NotReloadable);
        }
        let loaded = source::load(&self.source, &*self.fetcher, false, &self.logger)?;
        let n = self
            .registry
            .replace(&loaded.parsed.destinations, loaded.markers, false)?;
        self.apply_directives(&loaded.parsed.directives);
        Ok(n)
    }

    fn settings(&self) -> MonitorSettings {
        self.monitoring.lock().unwrap().settings.clone()
    }

    fn apply_directives(&self, directives: &[Directive]) {
        let mut settings = self.settings();
        for directive in directives {
            match directive {
                Directive::LogLevel(level) => self.logger.set_level(*level),
                Directive::JobMonitoring(on) => settings.job_monitoring = *on,
                Directive::SysMonitoring(on) => settings.sys_monitoring = *on,
                Directive::JobInterval(d) => settings.job_interval = *d,
                Directive::SysInterval(d) => settings.sys_interval = *d,
                Directive::GeneralInfo(on) => settings.general_info = *on,
                Directive::ConfRecheck(on) => settings.conf_recheck = *on,
                Directive::RecheckInterval(d) => settings.recheck_interval = *d,
                Directive::AutoDisable(on) => settings.auto_disable = *on,
                Directive::MaxMsgRate(rate) => match u32::try_from(*rate) {
                    Ok(rate) if rate > 0 => settings.max_msg_rate = rate,
                    _ => warning!(self.logger, "invalid maximum message rate {rate}, ignored"),
                },
                Directive::Param {
                    category,
                    name,
                    enabled,
                } => {
                    self.monitoring
                        .lock()
                        .unwrap()
                        .table_mut(*category)
                        .set_enabled(name, *enabled);
                }
            }
        }
        self.apply_settings(settings);
    }

    fn apply_settings(&self, mut settings: MonitorSettings) {
        settings.job_interval = interval_or(settings.job_interval, DEFAULT_JOB_INTERVAL);
        settings.sys_interval = interval_or(settings.sys_interval, DEFAULT_SYS_INTERVAL);
        settings.recheck_interval = interval_or(settings.recheck_interval, DEFAULT_RECHECK_INTERVAL);
        if settings.general_info_every == 0 {
            settings.general_info_every = DEFAULT_GEN_INTERVALS;
        }
        if settings.general_info {
            settings.sys_monitoring = true;
        }
        if settings.conf_recheck && !self.source.is_reloadable() {
            warning!(
                self.logger,
                "the destinations have been given directly, the configuration recheck is ignored"
            );
            settings.conf_recheck = false;
        }
        if !self.sender.lock().unwrap().limiter.set_max_rate(settings.max_msg_rate.into()) {
            warning!(self.logger, "invalid maximum message rate {}, ignored", settings.max_msg_rate);
        }
        self.monitoring.lock().unwrap().settings = settings.clone();

        self.configure(Action::ConfRecheck, settings.conf_recheck, settings.recheck_interval);
        self.configure(Action::JobInfo, settings.job_monitoring, settings.job_interval);
        self.configure(Action::SysInfo, settings.sys_monitoring, settings.sys_interval);
    }

    fn configure(&self, action: Action, enabled: bool, interval: Duration) {
        if let Err(e) = self.scheduler.configure(action, enabled, interval) {
            fatal!(self.logger, "could not start the background thread: {e}");
        }
    }

    fn set_job_monitoring(&self, enabled: bool, interval: Duration) {
        let interval = interval_or(interval, DEFAULT_JOB_INTERVAL);
        {
            let mut m = self.monitoring.lock().unwrap();
            m.settings.job_monitoring = enabled;
            m.settings.job_interval = interval;
        }
        info!(self.logger, "job monitoring {}, interval {interval:?}", on_off(enabled));
        self.configure(Action::JobInfo, enabled, interval);
    }

    fn set_sys_monitoring(&self, enabled: bool, interval: Duration) {
        let interval = interval_or(interval, DEFAULT_SYS_INTERVAL);
        {
            let mut m = self.monitoring.lock().unwrap();
            m.settings.sys_monitoring = enabled;
            m.settings.sys_interval = interval;
        }
        info!(self.logger, "system monitoring {}, interval {interval:?}", on_off(enabled));
        self.configure(Action::SysInfo, enabled, interval);
    }

    fn set_gen_monitoring(&self, enabled: bool, every_n: u32) {
        let every_n = if every_n == 0 { DEFAULT_GEN_INTERVALS } else { every_n };
        let start_sys = {
            let mut m = self.monitoring.lock().unwrap();
            m.settings.general_info = enabled;
            m.settings.general_info_every = every_n;
            (enabled && !m.settings.sys_monitoring).then_some(m.settings.sys_interval)
        };
        info!(
            self.logger,
            "general information {}, every {every_n} system monitoring cycles",
            on_off(enabled)
        );
        if let Some(sys_interval) = start_sys {
            self.set_sys_monitoring(true, sys_interval);
        }
    }

    fn set_conf_recheck(&self, enabled: bool, interval: Duration) {
        if !self.source.is_reloadable() {
            warning!(
                self.logger,
                "the destinations have been given directly, the configuration recheck is ignored"
            );
            return;
        }
        let interval = interval_or(interval, DEFAULT_RECHECK_INTERVAL);
        {
            let mut m = self.monitoring.lock().unwrap();
            m.settings.conf_recheck = enabled;
            m.settings.recheck_interval = interval;
        }
        info!(self.logger, "configuration recheck {}, interval {interval:?}", on_off(enabled));
        self.configure(Action::ConfRecheck, enabled, interval);
    }

    fn set_max_msg_rate(&self, rate: i64) {
        if !self.sender.lock().unwrap().limiter.set_max_rate(rate) {
            warning!(self.logger, "invalid maximum message rate {rate}, ignored");
            return;
        }
        // set_max_rate only accepts values that fit in a u32
        if let Ok(rate) = u32::try_from(rate) {
            self.monitoring.lock().unwrap().settings.max_msg_rate = rate;
        }
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "enabled" } else { "disabled" }
}

/// Disables the parameters that can never be collected, if `auto_disable` is set.
fn record_failures(
    logger: &Logger,
    table: &mut ParamTable,
    failures: Vec<(&'static str, CollectError)>,
    auto_disable: bool,
) {
    for (name, err) in failures {
        match err {
            CollectError::Permanent(_) if auto_disable => {
                if table.set_enabled(name, false) {
                    info!(logger, "{} parameter {name} disabled: {err}", table.category());
                }
            }
            _ => fine!(logger, "{} parameter {name}: {err}", table.category()),
        }
    }
}

/// The scheduled actions of a monitor.
///
/// Holds a weak reference: the scheduler belongs to the monitor.
struct MonitorTasks {
    inner: Weak<Inner>,
}

impl ScheduledTasks for MonitorTasks {
    fn run(&self, action: Action) -> anyhow::Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        match action {
            Action::ConfRecheck => inner.recheck(),
            Action::JobInfo => Ok(inner.send_job_info()?),
            Action::SysInfo => inner.sys_cycle(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::anyhow;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::collect::Readings;
    use crate::datagram::{Datagram, Value, decode};
    use crate::destinations::testing::StaticResolver;
    use crate::logging::testing::capturing_logger;
    use crate::source::testing::MemoryFetcher;

    /// A collector with fixed values.
    #[derive(Default)]
    struct FakeCollector {
        gone: Vec<u32>,
    }

    impl Collector for FakeCollector {
        fn system_info(&mut self, params: &ParamTable) -> Readings {
            let mut readings = Readings::default();
            for name in params.enabled_names() {
                match name {
                    "load1" => readings.push(Param::new("load1", 0.5)),
                    "processes" => readings.push(Param::new("processes", 120)),
                    "cpu_steal" => readings.fail(name, CollectError::permanent(anyhow!("no steal time"))),
                    "net_in" => readings.fail(name, CollectError::transient(anyhow!("first sample"))),
                    _ => (),
                }
            }
            readings
        }

        fn general_info(&mut self, params: &ParamTable) -> Readings {
            let mut readings = Readings::default();
            if params.is_enabled("no_CPUs") {
                readings.push(Param::new("no_CPUs", 8));
            }
            assert!(!params.is_enabled("hostname"));
            readings
        }

        fn job_info(&mut self, job: &MonitoredJob, params: &ParamTable) -> Result<Readings, CollectError> {
            if self.gone.contains(&job.pid) {
                return Err(CollectError::ProcessGone(job.pid));
            }
            let mut readings = Readings::default();
            if params.is_enabled("rss") {
                readings.push(Param::new("rss", 1024.0));
            }
            Ok(readings)
        }

        fn host_addresses(&mut self) -> anyhow::Result<Vec<InterfaceAddress>> {
            Ok(vec![InterfaceAddress {
                interface: "eth0".to_owned(),
                ip: Ipv4Addr::new(192, 168, 1, 10),
            }])
        }
    }

    fn receiver() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    fn receive(socket: &UdpSocket) -> Datagram {
        let mut buf = [0u8; 9000];
        let (n, _) = socket.recv_from(&mut buf).unwrap();
        decode(&buf[..n]).unwrap()
    }

    fn direct(port: u16) -> ApMonBuilder {
        ApMon::builder(ConfigSource::Direct(vec![DestinationSpec::new("127.0.0.1", port, "pwd")]))
            .collector(FakeCollector::default())
            .fetcher(MemoryFetcher::default())
            .resolver(StaticResolver::default())
    }

    #[test]
    fn user_datagram() {
        let (rx, port) = receiver();
        let apmon = direct(port).build().unwrap();
        apmon
            .send_parameters(
                Some("cluster"),
                Some("node"),
                &[Param::new("x", 1), Param::new("y", 2.5), Param::new("s", "text")],
            )
            .unwrap();

        let d = receive(&rx);
        assert_eq!(d.password(), Some("pwd"));
        assert_eq!(d.instance_id, apmon.instance_id());
        assert_eq!(d.seq, 0);
        assert_eq!(d.cluster, "cluster");
        assert_eq!(d.node, "node");
        assert_eq!(
            d.params,
            vec![Param::new("x", 1), Param::new("y", 2.5), Param::new("s", "text")]
        );
        assert_eq!(d.timestamp, None);
        assert_eq!(apmon.ip_address(), "192.168.1.10");
    }

    #[test]
    fn cluster_and_node_are_remembered() {
        let (rx, port) = receiver();
        let apmon = direct(port).build().unwrap();

        apmon.send_parameter(None, None, Param::new("a", 1)).unwrap();
        let d = receive(&rx);
        assert_eq!((d.cluster.as_str(), d.node.as_str()), (DEFAULT_USER_CLUSTER, apmon.hostname()));

        apmon.send_parameter(Some("c"), Some("n"), Param::new("a", 1)).unwrap();
        apmon.send_timed_parameter(None, None, Param::new("a", 1), 1_700_000_000).unwrap();
        receive(&rx);
        let d = receive(&rx);
        assert_eq!((d.cluster.as_str(), d.node.as_str()), ("c", "n"));
        assert_eq!(d.timestamp, Some(1_700_000_000));
        assert_eq!(d.seq, 2);

        apmon.send_parameter(Some("d"), None, Param::new("a", 1)).unwrap();
        let d = receive(&rx);
        assert_eq!((d.cluster.as_str(), d.node.as_str()), ("d", apmon.hostname()));
    }

    #[test]
    fn oversized_datagram_is_not_sent() {
        let (_rx, port) = receiver();
        let apmon = direct(port).build().unwrap();
        let params: Vec<Param> = (0..1000).map(|i| Param::new(format!("param{i}"), i)).collect();
        let err = apmon.send_parameters(Some("c"), Some("n"), &params).unwrap_err();
        assert!(matches!(err, SendError::Encode(EncodeError::TooLarge { .. })), "{err:?}");
    }

    #[test]
    fn rate_limited() {
        let (_rx, port) = receiver();
        let apmon = direct(port).build().unwrap();
        apmon.set_max_msg_rate(1);
        assert_eq!(apmon.settings().max_msg_rate, 1);
        let dropped = (0..40)
            .map(|_| apmon.send_parameter(None, None, Param::new("a", 1)))
            .filter(|r| matches!(r, Err(SendError::RateLimited)))
            .count();
        assert!(dropped > 0);

        apmon.set_max_msg_rate(-3);
        assert_eq!(apmon.settings().max_msg_rate, 1);
    }

    #[test]
    fn sys_info_and_auto_disable() {
        let (rx, port) = receiver();
        let apmon = direct(port).build().unwrap();
        apmon.set_sys_mon_cluster_node("sys", "me");
        apmon.send_sys_info().unwrap();

        let d = receive(&rx);
        assert_eq!((d.cluster.as_str(), d.node.as_str()), ("sys", "me"));
        assert_eq!(d.params, vec![Param::new("load1", 0.5), Param::new("processes", 120)]);
        assert!(!apmon.is_param_enabled(Category::System, "cpu_steal"));
        assert!(apmon.is_param_enabled(Category::System, "net_in"));

        apmon.set_param_enabled(Category::System, "cpu_steal", true);
        apmon.set_auto_disable(false);
        apmon.send_sys_info().unwrap();
        assert!(apmon.is_param_enabled(Category::System, "cpu_steal"));
    }

    #[test]
    fn general_info() {
        let (rx, port) = receiver();
        let apmon = direct(port).build().unwrap();
        apmon.send_general_info().unwrap();

        let d = receive(&rx);
        assert_eq!((d.cluster.as_str(), d.node.as_str()), (DEFAULT_SYS_CLUSTER, "192.168.1.10"));
        assert_eq!(
            d.params,
            vec![
                Param::new("hostname", apmon.hostname()),
                Param::new("ip", "192.168.1.10"),
                Param::new("ip_eth0", "192.168.1.10"),
                Param::new("no_CPUs", 8),
            ]
        );
    }

    #[test]
    fn jobs() {
        let (rx, port) = receiver();
        let apmon = direct(port)
            .collector(FakeCollector { gone: vec![77] })
            .build()
            .unwrap();
        apmon.add_job_to_monitor(42, None, None, None).unwrap();
        apmon.add_job_to_monitor(77, None, Some("jobs"), Some("n")).unwrap();
        apmon.send_job_info().unwrap();

        let d = receive(&rx);
        assert_eq!((d.cluster.as_str(), d.node.as_str()), (DEFAULT_JOB_CLUSTER, "192.168.1.10"));
        assert_eq!(d.params, vec![Param::new("rss", Value::Real64(1024.0))]);
        let pids: Vec<u32> = apmon.monitored_jobs().iter().map(|j| j.pid).collect();
        assert_eq!(pids, vec![42]);

        assert!(apmon.remove_job_to_monitor(42));
        assert!(!apmon.remove_job_to_monitor(42));
    }

    #[test]
    fn job_limit() {
        let (_rx, port) = receiver();
        let apmon = direct(port).build().unwrap();
        for pid in 0..MAX_MONITORED_JOBS as u32 {
            apmon.add_job_to_monitor(pid + 1, None, None, None).unwrap();
        }
        assert!(apmon.add_job_to_monitor(1000, None, None, None).is_err());
        // replacing an entry is still possible
        apmon.add_job_to_monitor(1, None, Some("other"), None).unwrap();
        assert_eq!(apmon.monitored_jobs().len(), MAX_MONITORED_JOBS);
    }

    #[test]
    fn background_sys_monitoring() {
        let (rx, port) = receiver();
        let apmon = direct(port).build().unwrap();
        assert!(!apmon.is_background_running());

        apmon.set_gen_monitoring(true, 2);
        let settings = apmon.settings();
        assert!(settings.sys_monitoring);
        assert_eq!(settings.sys_interval, DEFAULT_SYS_INTERVAL);

        apmon.set_sys_monitoring(true, Duration::from_millis(20));
        assert!(apmon.is_background_running());
        let mut clusters = Vec::new();
        let mut general = 0;
        for _ in 0..6 {
            let d = receive(&rx);
            if d.params.iter().any(|p| p.name.as_deref() == Some("hostname")) {
                general += 1;
            }
            clusters.push(d.cluster);
        }
        assert!(clusters.iter().all(|c| c == DEFAULT_SYS_CLUSTER));
        assert!(general >= 1);

        apmon.set_sys_monitoring(false, Duration::ZERO);
        apmon.set_gen_monitoring(false, 0);
        assert!(!apmon.is_background_running());
    }

    #[test]
    fn conf_recheck_needs_a_source() {
        let (logger, lines) = capturing_logger(Level::Warning);
        let (_rx, port) = receiver();
        let apmon = direct(port).logger(logger).build().unwrap();
        apmon.set_conf_recheck(true, Duration::from_secs(1));
        apmon.set_recheck_interval(Duration::from_secs(1));
        assert!(!apmon.settings().conf_recheck);
        assert!(!apmon.is_background_running());
        assert!(matches!(apmon.reload(), Err(ReloadError::NotReloadable)));
        assert_eq!(lines.lock().unwrap().len(), 2);
    }

    #[test]
    fn reload_from_url() {
        let (rx1, port1) = receiver();
        let (rx2, port2) = receiver();
        let url = "http://conf.example/apmon.conf";
        let fetcher = Arc::new(MemoryFetcher::default());
        fetcher.set(
            url,
            &format!("127.0.0.1:{port1} first\nxApMon_maxMsgRate = 50\nxApMon_sys_load1 = off\n"),
            Some("Mon, 01 Jan 2024 00:00:00 GMT"),
        );

        let apmon = ApMon::builder(ConfigSource::List(vec![url.to_owned()]))
            .collector(FakeCollector::default())
            .fetcher(fetcher.clone())
            .resolver(StaticResolver::default())
            .build()
            .unwrap();
        assert_eq!(apmon.settings().max_msg_rate, 50);
        assert!(!apmon.is_param_enabled(Category::System, "load1"));
        apmon.send_parameter(None, None, Param::new("a", 1)).unwrap();
        assert_eq!(receive(&rx1).password(), Some("first"));

        fetcher.set(
            url,
            &format!("127.0.0.1:{port2} second\nxApMon_job_monitoring = on\nxApMon_job_interval = 7\n"),
            Some("Tue, 02 Jan 2024 00:00:00 GMT"),
        );
        assert_eq!(apmon.reload().unwrap(), 1);
        let destinations = apmon.destinations();
        assert_eq!(destinations.destinations()[0].addr.port(), port2);
        assert_eq!(destinations.destinations()[0].password, "second");
        let settings = apmon.settings();
        assert!(settings.job_monitoring);
        assert_eq!(settings.job_interval, Duration::from_secs(7));
        assert_eq!(settings.max_msg_rate, 50);
        assert!(apmon.is_background_running());

        // a failed reload keeps the destinations
        fetcher.remove(url);
        assert!(matches!(apmon.reload(), Err(ReloadError::Config(_))));
        assert_eq!(apmon.destinations().destinations()[0].addr.port(), port2);
        apmon.send_parameter(None, None, Param::new("b", 2)).unwrap();
        assert_eq!(receive(&rx2).password(), Some("second"));

        // so does a reload whose destinations cannot be resolved
        fetcher.set(
            url,
            "nowhere.invalid:8884 third\n",
            Some("Wed, 03 Jan 2024 00:00:00 GMT"),
        );
        assert!(matches!(
            apmon.reload(),
            Err(ReloadError::Registry(RegistryError::NoDestinations))
        ));
        assert_eq!(apmon.destinations().len(), 1);
        apmon.send_parameter(None, None, Param::new("c", 3)).unwrap();
        let d = receive(&rx2);
        assert_eq!(d.password(), Some("second"));
        assert_eq!(d.params, vec![Param::new("c", 3)]);
    }

    #[test]
    fn drop_sends_the_last_job_info() {
        let (rx, port) = receiver();
        let apmon = direct(port).build().unwrap();
        apmon.add_job_to_monitor(42, None, Some("last"), Some("n")).unwrap();
        apmon.set_job_monitoring(true, Duration::from_secs(3600));
        assert!(apmon.is_background_running());
        drop(apmon);

        let d = receive(&rx);
        assert_eq!(d.cluster, "last");
    }
}
