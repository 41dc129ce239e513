//! Background thread that runs the periodic actions of a monitor.
//!
//! Three actions share a single worker thread: configuration recheck, job
//! monitoring and system monitoring. Each action has its own enabled flag and
//! interval. The worker sleeps until the earliest deadline, and wakes up early
//! when the settings change or when it is asked to stop.
//!
//! The interval of an action is the gap between the end of one run and the start
//! of the next one: a slow action delays its next run instead of piling up.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::config::{DEFAULT_RECHECK_INTERVAL, MAX_INTERVAL};
use crate::logging::{Logger, debug, info, warning};

/// When a configuration recheck fails, the next one is delayed by this factor.
pub const RECHECK_BACKOFF: u32 = 5;

/// Wait duration of the worker when no action is enabled.
const IDLE_WAIT: Duration = DEFAULT_RECHECK_INTERVAL;

/// A periodic action. When several actions are due at the same time,
/// they run in the order of declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    ConfRecheck = 0,
    JobInfo = 1,
    SysInfo = 2,
}

impl Action {
    pub const ALL: [Action; 3] = [Action::ConfRecheck, Action::JobInfo, Action::SysInfo];
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::ConfRecheck => "configuration recheck",
            Action::JobInfo => "job monitoring",
            Action::SysInfo => "system monitoring",
        })
    }
}

/// The work done by the scheduled actions.
pub trait ScheduledTasks: Send + Sync {
    /// Runs an action. An error is logged and does not stop the scheduler.
    ///
    /// A failed [`Action::ConfRecheck`] increases the interval of the next recheck.
    fn run(&self, action: Action) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct ActionControl {
    enabled: bool,
    interval: Duration,
    /// The interval in use, which differs from `interval` after a failed recheck.
    current_interval: Duration,
    changed: bool,
}

impl Default for ActionControl {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: IDLE_WAIT,
            current_interval: IDLE_WAIT,
            changed: false,
        }
    }
}

#[derive(Debug, Default)]
struct Control {
    actions: [ActionControl; 3],
    /// Stop requested by an action running on the worker thread.
    stop: bool,
    /// Stop requested by another thread, which is waiting for the worker to exit.
    shutdown: bool,
    worker_thread: Option<ThreadId>,
}

impl Control {
    fn exiting(&self) -> bool {
        self.stop || self.shutdown
    }

    fn is_worker_thread(&self) -> bool {
        self.worker_thread == Some(thread::current().id())
    }
}

struct Shared {
    control: Mutex<Control>,
    /// Set to true to interrupt the wait of the worker.
    wake: Mutex<bool>,
    wake_cond: Condvar,
    tasks: Box<dyn ScheduledTasks>,
    logger: Logger,
}

impl Shared {
    fn signal(&self) {
        let mut pending = self.wake.lock().unwrap();
        *pending = true;
        self.wake_cond.notify_one();
    }
}

/// Runs [`ScheduledTasks`] on a background thread.
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(tasks: Box<dyn ScheduledTasks>, logger: Logger) -> Self {
        Self {
            shared: Arc::new(Shared {
                control: Mutex::new(Control::default()),
                wake: Mutex::new(false),
                wake_cond: Condvar::new(),
                tasks,
                logger,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Enables or disables an action, and changes its interval.
    ///
    /// The worker is started if an action is enabled, and stopped if none is.
    /// A running worker takes the change into account immediately.
    /// The interval is capped to [`MAX_INTERVAL`].
    pub fn configure(&self, action: Action, enabled: bool, interval: Duration) -> std::io::Result<()> {
        let any_enabled = {
            let mut control = self.shared.control.lock().unwrap();
            let a = &mut control.actions[action as usize];
            a.enabled = enabled;
            a.interval = interval.clamp(Duration::from_millis(1), MAX_INTERVAL);
            a.current_interval = a.interval;
            a.changed = true;
            control.actions.iter().any(|a| a.enabled)
        };
        if any_enabled {
            self.start()
        } else {
            self.stop();
            Ok(())
        }
    }

    pub fn is_enabled(&self, action: Action) -> bool {
        self.shared.control.lock().unwrap().actions[action as usize].enabled
    }

    pub fn interval(&self, action: Action) -> Duration {
        self.shared.control.lock().unwrap().actions[action as usize].interval
    }

    /// The interval that will be used for the next run, see [`RECHECK_BACKOFF`].
    pub fn current_interval(&self, action: Action) -> Duration {
        self.shared.control.lock().unwrap().actions[action as usize].current_interval
    }

    /// Returns true if the worker thread is running and has not been asked to stop.
    pub fn is_running(&self) -> bool {
        {
            let control = self.shared.control.lock().unwrap();
            if control.is_worker_thread() {
                return !control.exiting();
            }
        }
        let worker = self.worker.lock().unwrap();
        let exiting = self.shared.control.lock().unwrap().exiting();
        worker.as_ref().is_some_and(|h| !h.is_finished()) && !exiting
    }

    /// Starts the worker thread. If it is already running, wakes it up so that it checks its settings.
    pub fn start(&self) -> std::io::Result<()> {
        {
            let mut control = self.shared.control.lock().unwrap();
            if control.is_worker_thread() {
                // cancels a stop requested by the current action
                control.stop = false;
                return Ok(());
            }
        }

        let mut worker = self.worker.lock().unwrap();
        let alive = worker.as_ref().is_some_and(|h| !h.is_finished());
        if alive && !self.shared.control.lock().unwrap().exiting() {
            drop(worker);
            self.shared.signal();
            return Ok(());
        }
        // the previous worker has stopped or is about to stop
        if let Some(handle) = worker.take() {
            join(handle, &self.shared.logger);
        }

        {
            let mut control = self.shared.control.lock().unwrap();
            control.stop = false;
            control.shutdown = false;
            for a in control.actions.iter_mut() {
                a.changed = true;
            }
        }
        *self.shared.wake.lock().unwrap() = false;

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(String::from("apmon-scheduler"))
            .spawn(move || run_worker(shared))?;
        *worker = Some(handle);
        Ok(())
    }

    /// Stops the worker thread and waits for it to exit.
    ///
    /// After this function returns, no action is running and no action will run.
    /// When called from an action, the worker exits as soon as the action returns.
    pub fn stop(&self) {
        {
            let mut control = self.shared.control.lock().unwrap();
            if control.is_worker_thread() {
                control.stop = true;
                return;
            }
        }

        let mut worker = self.worker.lock().unwrap();
        let Some(handle) = worker.take() else {
            return;
        };
        info!(self.shared.logger, "stopping the background thread");
        self.shared.control.lock().unwrap().shutdown = true;
        self.shared.signal();
        join(handle, &self.shared.logger);

        let mut control = self.shared.control.lock().unwrap();
        control.shutdown = false;
        control.stop = false;
        control.worker_thread = None;
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join(handle: JoinHandle<()>, logger: &Logger) {
    if handle.join().is_err() {
        warning!(logger, "the background thread panicked");
    }
}

/// Returns the action with the earliest deadline. Ties go to the action declared first.
fn earliest(deadlines: &[Option<Instant>; 3]) -> Option<(Action, Instant)> {
    let mut next: Option<(Action, Instant)> = None;
    for action in Action::ALL {
        if let Some(deadline) = deadlines[action as usize] {
            if next.is_none_or(|(_, d)| deadline < d) {
                next = Some((action, deadline));
            }
        }
    }
    next
}

/// Next run of an enabled action. An interval too large for an `Instant` means no run.
fn deadline(a: &ActionControl, from: Instant) -> Option<Instant> {
    if a.enabled { from.checked_add(a.current_interval) } else { None }
}

fn run_worker(shared: Arc<Shared>) {
    info!(shared.logger, "background thread started");
    shared.control.lock().unwrap().worker_thread = Some(thread::current().id());
    let mut deadlines: [Option<Instant>; 3] = [None; 3];

    loop {
        // Consume the pending signal before looking at the settings:
        // a change made after this point will interrupt the wait below.
        *shared.wake.lock().unwrap() = false;

        let next = {
            let mut control = shared.control.lock().unwrap();
            if control.exiting() {
                break;
            }
            let now = Instant::now();
            for action in Action::ALL {
                let a = &mut control.actions[action as usize];
                if a.changed {
                    a.changed = false;
                    deadlines[action as usize] = deadline(a, now);
                }
            }
            earliest(&deadlines)
        };

        let timeout = match next {
            Some((_, deadline)) => deadline.saturating_duration_since(Instant::now()),
            None => {
                debug!(shared.logger, "no action to perform");
                IDLE_WAIT
            }
        };

        let timed_out = timeout.is_zero() || {
            let pending = shared.wake.lock().unwrap();
            let (pending, res) = shared
                .wake_cond
                .wait_timeout_while(pending, timeout, |pending| !*pending)
                .unwrap();
            res.timed_out() && !*pending
        };
        if !timed_out {
            continue;
        }
        let Some((action, _)) = next else {
            continue;
        };
        if shared.control.lock().unwrap().exiting() {
            break;
        }

        debug!(shared.logger, "running {action}");
        let result = shared.tasks.run(action);
        if let Err(e) = &result {
            warning!(shared.logger, "{action} failed: {e:#}");
        }

        let mut control = shared.control.lock().unwrap();
        let a = &mut control.actions[action as usize];
        if action == Action::ConfRecheck {
            a.current_interval = match result {
                Ok(()) => a.interval,
                Err(_) => {
                    warning!(shared.logger, "increasing the time interval for reloading the configuration");
                    a.interval.saturating_mul(RECHECK_BACKOFF)
                }
            };
        }
        deadlines[action as usize] = deadline(a, Instant::now());
    }
    info!(shared.logger, "background thread stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        runs: Mutex<Vec<(Action, Instant)>>,
        fail_recheck: bool,
    }

    impl ScheduledTasks for Arc<Recorder> {
        fn run(&self, action: Action) -> anyhow::Result<()> {
            self.runs.lock().unwrap().push((action, Instant::now()));
            if action == Action::ConfRecheck && self.fail_recheck {
                anyhow::bail!("cannot reach the configuration server");
            }
            Ok(())
        }
    }

    fn scheduler(recorder: &Arc<Recorder>) -> Scheduler {
        Scheduler::new(Box::new(recorder.clone()), Logger::default())
    }

    #[test]
    fn earliest_deadline_and_ties() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);
        assert_eq!(earliest(&[None, None, None]), None);
        assert_eq!(
            earliest(&[Some(later), Some(now), Some(now)]),
            Some((Action::JobInfo, now))
        );
        assert_eq!(
            earliest(&[Some(now), Some(now), Some(now)]),
            Some((Action::ConfRecheck, now))
        );
        assert_eq!(earliest(&[None, None, Some(later)]), Some((Action::SysInfo, later)));
    }

    #[test]
    fn change_preempts_wait() {
        let recorder = Arc::new(Recorder::default());
        let s = scheduler(&recorder);
        s.configure(Action::ConfRecheck, true, Duration::from_secs(600)).unwrap();
        assert!(s.is_running());
        thread::sleep(Duration::from_millis(50));

        let t0 = Instant::now();
        s.configure(Action::JobInfo, true, Duration::from_millis(200)).unwrap();
        thread::sleep(Duration::from_millis(500));
        s.stop();

        let runs = recorder.runs.lock().unwrap();
        assert!(!runs.is_empty());
        let (action, at) = runs[0];
        assert_eq!(action, Action::JobInfo);
        let delay = at - t0;
        assert!(delay >= Duration::from_millis(190), "too early: {delay:?}");
        assert!(delay < Duration::from_millis(400), "too late: {delay:?}");
    }

    #[test]
    fn interval_measured_from_completion() {
        struct Slow(AtomicUsize);
        impl ScheduledTasks for Arc<Slow> {
            fn run(&self, _action: Action) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(100));
                Ok(())
            }
        }
        let slow = Arc::new(Slow(AtomicUsize::new(0)));
        let s = Scheduler::new(Box::new(slow.clone()), Logger::default());
        s.configure(Action::SysInfo, true, Duration::from_millis(100)).unwrap();
        thread::sleep(Duration::from_millis(650));
        s.stop();
        // each cycle takes 200ms: 3 runs at most, fixed-rate scheduling would give 6
        let n = slow.0.load(Ordering::SeqCst);
        assert!((2..=3).contains(&n), "{n} runs");
    }

    #[test]
    fn stop_is_synchronous() {
        let recorder = Arc::new(Recorder::default());
        let s = scheduler(&recorder);
        s.configure(Action::SysInfo, true, Duration::from_millis(20)).unwrap();
        thread::sleep(Duration::from_millis(150));
        s.stop();
        assert!(!s.is_running());
        let count = recorder.runs.lock().unwrap().len();
        assert!(count > 0);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(recorder.runs.lock().unwrap().len(), count);

        // stopping again does nothing
        s.stop();
    }

    #[test]
    fn disabling_everything_stops_the_worker() {
        let recorder = Arc::new(Recorder::default());
        let s = scheduler(&recorder);
        s.configure(Action::JobInfo, true, Duration::from_secs(10)).unwrap();
        assert!(s.is_running());
        s.configure(Action::JobInfo, false, Duration::from_secs(10)).unwrap();
        assert!(!s.is_running());

        // and it can be restarted
        s.configure(Action::SysInfo, true, Duration::from_millis(10)).unwrap();
        assert!(s.is_running());
        thread::sleep(Duration::from_millis(100));
        s.stop();
        assert!(recorder.runs.lock().unwrap().iter().all(|(a, _)| *a == Action::SysInfo));
    }

    #[test]
    fn failed_recheck_backs_off() {
        let recorder = Arc::new(Recorder {
            fail_recheck: true,
            ..Default::default()
        });
        let s = scheduler(&recorder);
        s.configure(Action::ConfRecheck, true, Duration::from_millis(30)).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(s.current_interval(Action::ConfRecheck), Duration::from_millis(150));
        assert_eq!(s.interval(Action::ConfRecheck), Duration::from_millis(30));
        s.stop();
        // one run at 30ms, the next one would be at 180ms
        assert_eq!(recorder.runs.lock().unwrap().len(), 1);
    }

    #[test]
    fn huge_interval_does_not_break_the_worker() {
        let recorder = Arc::new(Recorder::default());
        let s = scheduler(&recorder);
        s.configure(Action::JobInfo, true, Duration::from_secs(u64::MAX)).unwrap();
        assert_eq!(s.interval(Action::JobInfo), MAX_INTERVAL);
        thread::sleep(Duration::from_millis(50));
        assert!(s.is_running());

        s.configure(Action::SysInfo, true, Duration::from_millis(10)).unwrap();
        thread::sleep(Duration::from_millis(100));
        s.stop();
        assert!(!s.is_running());
        let runs = recorder.runs.lock().unwrap();
        assert!(!runs.is_empty());
        assert!(runs.iter().all(|(a, _)| *a == Action::SysInfo));
    }

    #[test]
    fn deadline_overflow() {
        let now = Instant::now();
        let mut a = ActionControl {
            enabled: true,
            current_interval: Duration::MAX,
            ..Default::default()
        };
        assert_eq!(deadline(&a, now), None);
        a.current_interval = Duration::from_secs(1);
        assert_eq!(deadline(&a, now), Some(now + Duration::from_secs(1)));
        a.enabled = false;
        assert_eq!(deadline(&a, now), None);
        assert_eq!(MAX_INTERVAL.saturating_mul(RECHECK_BACKOFF), MAX_INTERVAL * RECHECK_BACKOFF);
        assert_eq!(Duration::MAX.saturating_mul(RECHECK_BACKOFF), Duration::MAX);
    }

    #[test]
    fn stop_from_an_action() {
        struct SelfStop {
            scheduler: Mutex<Option<std::sync::Weak<Scheduler>>>,
            runs: AtomicUsize,
        }
        impl ScheduledTasks for Arc<SelfStop> {
            fn run(&self, _action: Action) -> anyhow::Result<()> {
                self.runs.fetch_add(1, Ordering::SeqCst);
                if let Some(s) = self.scheduler.lock().unwrap().as_ref().and_then(|w| w.upgrade()) {
                    s.configure(Action::SysInfo, false, Duration::from_millis(10))?;
                }
                Ok(())
            }
        }
        let tasks = Arc::new(SelfStop {
            scheduler: Mutex::new(None),
            runs: AtomicUsize::new(0),
        });
        let s = Arc::new(Scheduler::new(Box::new(tasks.clone()), Logger::default()));
        *tasks.scheduler.lock().unwrap() = Some(Arc::downgrade(&s));

        s.configure(Action::SysInfo, true, Duration::from_millis(10)).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(tasks.runs.load(Ordering::SeqCst), 1);
        assert!(!s.is_running());

        // a new worker can be started after the previous one stopped itself
        s.configure(Action::SysInfo, true, Duration::from_millis(10)).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(tasks.runs.load(Ordering::SeqCst), 2);
        s.stop();
    }
}
