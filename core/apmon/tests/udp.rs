use std::{
    collections::BTreeSet,
    io::ErrorKind,
    net::UdpSocket,
    path::Path,
    sync::Arc,
    thread,
    time::{Duration, Instant, SystemTime},
};

use apmon::{
    ApMon, Category, CollectError, Collector, ConfigSource, MonitorSettings, MonitoredJob, Param, ParamTable, Readings,
    SendError,
    collect::InterfaceAddress,
    datagram::{APMON_VERSION, Datagram, IMPL_TAG, decode},
};
use indoc::formatdoc;
use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;

fn init_logger() {
    // Ignore errors because the logger can only be initialized once, and we run multiple tests.
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}

fn receiver() -> (UdpSocket, u16) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let port = socket.local_addr().unwrap().port();
    (socket, port)
}

fn receive(socket: &UdpSocket) -> Datagram {
    try_receive(socket).expect("no datagram received")
}

fn try_receive(socket: &UdpSocket) -> Option<Datagram> {
    let mut buf = [0u8; 9000];
    match socket.recv_from(&mut buf) {
        Ok((n, _)) => Some(decode(&buf[..n]).unwrap()),
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => None,
        Err(e) => panic!("receive failed: {e}"),
    }
}

fn write_config(path: &Path, text: &str) {
    std::fs::write(path, text).unwrap();
}

/// A collector that always reports the same load.
struct ConstantLoad;

impl Collector for ConstantLoad {
    fn system_info(&mut self, params: &ParamTable) -> Readings {
        let mut readings = Readings::default();
        if params.is_enabled("load1") {
            readings.push(Param::new("load1", 1.5));
        }
        readings
    }

    fn general_info(&mut self, _params: &ParamTable) -> Readings {
        Readings::default()
    }

    fn job_info(&mut self, job: &MonitoredJob, _params: &ParamTable) -> Result<Readings, CollectError> {
        Err(CollectError::ProcessGone(job.pid))
    }

    fn host_addresses(&mut self) -> anyhow::Result<Vec<InterfaceAddress>> {
        Ok(vec![InterfaceAddress {
            interface: "eth0".to_owned(),
            ip: "10.1.2.3".parse().unwrap(),
        }])
    }
}

#[test]
fn send_from_a_config_file() {
    init_logger();
    let (rx, port) = receiver();
    let file = NamedTempFile::new().unwrap();
    write_config(
        file.path(),
        &formatdoc! {"
            # test destination
            127.0.0.1:{port} secret
            xApMon_loglevel = WARNING
        "},
    );

    let apmon = ApMon::from_file(file.path()).unwrap();
    assert_eq!(apmon.destinations().len(), 1);
    apmon
        .send_timed_parameters(
            Some("cluster"),
            Some("node"),
            &[Param::new("cpu", 0.25), Param::new("jobs", 3)],
            1_700_000_000,
        )
        .unwrap();

    let d = receive(&rx);
    assert_eq!(d.header, format!("v:{APMON_VERSION}_{IMPL_TAG}p:secret"));
    assert_eq!(d.instance_id, apmon.instance_id());
    assert_eq!(d.seq, 0);
    assert_eq!(d.cluster, "cluster");
    assert_eq!(d.node, "node");
    assert_eq!(d.params, vec![Param::new("cpu", 0.25), Param::new("jobs", 3)]);
    assert_eq!(d.timestamp, Some(1_700_000_000));
}

#[test]
fn sequence_numbers_are_unique_across_threads() {
    let (rx, port) = receiver();
    let apmon = Arc::new(ApMon::from_list([format!("127.0.0.1:{port}")]).unwrap());
    apmon.set_max_msg_rate(1_000_000);

    let threads: Vec<_> = (0..4)
        .map(|t| {
            let apmon = apmon.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    let cluster = format!("thread{t}");
                    apmon
                        .send_parameters(Some(&cluster), Some("n"), &[Param::new("i", i)])
                        .unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let mut seqs = BTreeSet::new();
    let mut last_per_thread = vec![-1; 4];
    for _ in 0..100 {
        let d = receive(&rx);
        let t: usize = d.cluster.trim_start_matches("thread").parse().unwrap();
        // datagrams of the same thread are sent in order
        assert!(d.seq > last_per_thread[t]);
        last_per_thread[t] = d.seq;
        seqs.insert(d.seq);
    }
    assert_eq!(seqs, (0..100).collect());
}

#[test]
fn reload_on_file_change() {
    init_logger();
    let (rx1, port1) = receiver();
    let (rx2, port2) = receiver();
    let file = NamedTempFile::new().unwrap();
    write_config(
        file.path(),
        &formatdoc! {"
            127.0.0.1:{port1} one
            xApMon_conf_recheck = on
            xApMon_recheck_interval = 1
        "},
    );

    let apmon = ApMon::from_file(file.path()).unwrap();
    assert!(apmon.is_background_running());
    apmon.send_parameter(Some("c"), Some("n"), Param::new("x", 1)).unwrap();
    assert_eq!(receive(&rx1).password(), Some("one"));

    write_config(
        file.path(),
        &formatdoc! {"
            127.0.0.1:{port2} two
            xApMon_conf_recheck = on
            xApMon_recheck_interval = 1
        "},
    );
    // make sure that the modification time changes, whatever the resolution of the file system
    let f = std::fs::File::options().write(true).open(file.path()).unwrap();
    f.set_modified(SystemTime::now() + Duration::from_secs(60)).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        // sends keep working while the destinations are replaced
        match apmon.send_parameter(None, None, Param::new("x", 1)) {
            Ok(()) | Err(SendError::RateLimited) => (),
            Err(e) => panic!("send failed during reload: {e}"),
        }
        if apmon.destinations().destinations()[0].addr.port() == port2 {
            break;
        }
        assert!(Instant::now() < deadline, "the configuration has not been reloaded");
        thread::sleep(Duration::from_millis(50));
    }

    apmon.send_parameter(None, None, Param::new("after", 1)).unwrap();
    let d = loop {
        let d = receive(&rx2);
        if d.params[0].name.as_deref() == Some("after") {
            break d;
        }
    };
    assert_eq!(d.password(), Some("two"));
}

#[test]
fn background_monitoring_stops_on_drop() {
    init_logger();
    let (rx, port) = receiver();
    let apmon = ApMon::builder(ConfigSource::List(vec![format!("127.0.0.1:{port}")]))
        .collector(ConstantLoad)
        .build()
        .unwrap();
    apmon.apply_settings(MonitorSettings {
        sys_monitoring: true,
        sys_interval: Duration::from_millis(10),
        ..Default::default()
    });
    assert!(apmon.is_background_running());
    assert!(apmon.is_param_enabled(Category::System, "load1"));

    let d = receive(&rx);
    assert_eq!(d.cluster, "ApMon_SysMon");
    assert_eq!(d.node, "10.1.2.3");
    assert_eq!(d.params, vec![Param::new("load1", 1.5)]);

    drop(apmon);

    // everything sent before the drop returned is already queued
    rx.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    while try_receive(&rx).is_some() {}
    thread::sleep(Duration::from_millis(100));
    assert!(try_receive(&rx).is_none());
}

#[test]
fn exited_jobs_are_forgotten() {
    let (_rx, port) = receiver();
    let apmon = ApMon::builder(ConfigSource::List(vec![format!("127.0.0.1:{port}")]))
        .collector(ConstantLoad)
        .build()
        .unwrap();
    apmon.add_job_to_monitor(12345, None, None, None).unwrap();
    assert_eq!(apmon.monitored_jobs()[0].node, "10.1.2.3");
    apmon.send_job_info().unwrap();
    assert!(apmon.monitored_jobs().is_empty());
}
