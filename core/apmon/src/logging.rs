//! Leveled logging shared by every component of a monitor.
//!
//! A [`Logger`] is a cheap handle (an `Arc`) that each component keeps a clone of.
//! Its level can be changed at any time, from any thread, for example when a
//! configuration reload contains an `xApMon_loglevel` directive.
//!
//! By default, messages are forwarded to the [`log`] crate with the target `apmon`,
//! so that applications can route them with `env_logger` or any other backend.
//! A custom sink can be installed with [`Logger::with_sink`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Severity of a log message, from the most to the least important.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Level {
    Fatal = 0,
    Warning = 1,
    #[default]
    Info = 2,
    Fine = 3,
    Debug = 4,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Fatal => "FATAL",
            Level::Warning => "WARNING",
            Level::Info => "INFO",
            Level::Fine => "FINE",
            Level::Debug => "DEBUG",
        }
    }

    /// The equivalent level of the `log` crate.
    fn to_log_level(self) -> log::Level {
        match self {
            Level::Fatal => log::Level::Error,
            Level::Warning => log::Level::Warn,
            Level::Info => log::Level::Info,
            Level::Fine => log::Level::Debug,
            Level::Debug => log::Level::Trace,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid log level '{0}', expected one of FATAL, WARNING, INFO, FINE, DEBUG")]
pub struct InvalidLevel(pub String);

impl FromStr for Level {
    type Err = InvalidLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        [Level::Fatal, Level::Warning, Level::Info, Level::Fine, Level::Debug]
            .into_iter()
            .find(|l| l.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| InvalidLevel(s.to_owned()))
    }
}

type Sink = dyn Fn(Level, &fmt::Arguments) + Send + Sync;

/// A logger with an adjustable level.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

struct LoggerInner {
    level: AtomicU8,
    sink: Option<Box<Sink>>,
}

impl Logger {
    /// Creates a logger that forwards to the `log` crate.
    pub fn new(level: Level) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                level: AtomicU8::new(level.into()),
                sink: None,
            }),
        }
    }

    /// Creates a logger that passes every enabled message to `sink`.
    pub fn with_sink<F>(level: Level, sink: F) -> Self
    where
        F: Fn(Level, &fmt::Arguments) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(LoggerInner {
                level: AtomicU8::new(level.into()),
                sink: Some(Box::new(sink)),
            }),
        }
    }

    pub fn level(&self) -> Level {
        let raw = self.inner.level.load(Ordering::Relaxed);
        Level::try_from(raw).unwrap_or_default()
    }

    pub fn set_level(&self, level: Level) {
        self.inner.level.store(level.into(), Ordering::Relaxed);
    }

    pub fn enabled(&self, level: Level) -> bool {
        level <= self.level()
    }

    pub fn log(&self, level: Level, args: fmt::Arguments) {
        if !self.enabled(level) {
            return;
        }
        match &self.inner.sink {
            Some(sink) => sink(level, &args),
            None => log::log!(target: "apmon", level.to_log_level(), "{args}"),
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger::new(Level::default())
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("level", &self.level())
            .field("custom_sink", &self.inner.sink.is_some())
            .finish()
    }
}

macro_rules! fatal {
    ($logger:expr, $($arg:tt)+) => {
        $logger.log($crate::logging::Level::Fatal, format_args!($($arg)+))
    };
}

macro_rules! warning {
    ($logger:expr, $($arg:tt)+) => {
        $logger.log($crate::logging::Level::Warning, format_args!($($arg)+))
    };
}

macro_rules! info {
    ($logger:expr, $($arg:tt)+) => {
        $logger.log($crate::logging::Level::Info, format_args!($($arg)+))
    };
}

macro_rules! fine {
    ($logger:expr, $($arg:tt)+) => {
        $logger.log($crate::logging::Level::Fine, format_args!($($arg)+))
    };
}

macro_rules! debug {
    ($logger:expr, $($arg:tt)+) => {
        $logger.log($crate::logging::Level::Debug, format_args!($($arg)+))
    };
}

pub(crate) use {debug, fatal, fine, info, warning};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::{Level, Logger};

    /// A logger that records every message, for assertions in tests.
    pub fn capturing_logger(level: Level) -> (Logger, Arc<Mutex<Vec<(Level, String)>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let lines2 = lines.clone();
        let logger = Logger::with_sink(level, move |level, args| {
            lines2.lock().unwrap().push((level, args.to_string()));
        });
        (logger, lines)
    }
}
