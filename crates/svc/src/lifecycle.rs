//! Service lifecycle states and the legal transitions between them.
//!
//! ```text
//!       +-----------+      +----------+
//!       | Starting  |----->| Running  |
//!       +-----------+      +----------+
//!             |                  |
//!             |                  v
//!             |            +-----------+      +------------+
//!             +----------->|  Failed   |      | Stopping   |
//!             |            +-----------+      +------------+
//!             |                                     |
//!             v                                     v
//!       +-----------+                         +------------+
//!       |    New    |                         | Terminated |
//!       +-----------+                         +------------+
//! ```
//!
//! `New` is the state of a registered-but-not-yet-started entry. `Failed`
//! is an error sink reachable from `Starting` or `Running` whenever a
//! supervised task dies; it is terminal except for an explicit `restart`,
//! which re-enters at `Starting` through a freshly constructed entry.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServiceState {
    New = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Terminated = 4,
    Failed = 5,
}

impl ServiceState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::New,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Terminated,
            _ => Self::Failed,
        }
    }

    /// Whether a ticketed lookup considers a service reachable.
    #[must_use]
    pub const fn is_alive(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    /// Whether this state can no longer change without an explicit restart.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// A lock-free cell holding a [`ServiceState`], shared between a service's
/// supervised tasks and anyone polling its status (ticket sweeps,
/// dependency checks, `Container::run`'s shutdown wait).
#[derive(Debug)]
pub struct AtomicServiceState(AtomicU8);

impl AtomicServiceState {
    #[must_use]
    pub const fn new(initial: ServiceState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    #[must_use]
    pub fn load(&self) -> ServiceState {
        ServiceState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: ServiceState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for AtomicServiceState {
    fn default() -> Self {
        Self::new(ServiceState::New)
    }
}

/// A service's own log verbosity, independent of the process-global level
/// set on the command line. Registered services start at [`LogLevel::Info`]
/// and can be raised or lowered individually at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Debug,
            1 => Self::Info,
            2 => Self::Warn,
            _ => Self::Error,
        }
    }

    #[must_use]
    pub const fn to_level_filter(self) -> log::LevelFilter {
        match self {
            Self::Debug => log::LevelFilter::Debug,
            Self::Info => log::LevelFilter::Info,
            Self::Warn => log::LevelFilter::Warn,
            Self::Error => log::LevelFilter::Error,
        }
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(Error::UnknownLogLevel(other.to_string())),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// A lock-free cell holding a [`LogLevel`], so a service's own code can
/// cheaply check its configured verbosity without locking the registry.
#[derive(Debug)]
pub struct AtomicLogLevel(AtomicU8);

impl AtomicLogLevel {
    #[must_use]
    pub const fn new(initial: LogLevel) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    #[must_use]
    pub fn load(&self) -> LogLevel {
        LogLevel::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, level: LogLevel) {
        self.0.store(level as u8, Ordering::Release);
    }
}

impl Default for AtomicLogLevel {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alive_states() {
        assert!(ServiceState::Starting.is_alive());
        assert!(ServiceState::Running.is_alive());
        assert!(!ServiceState::New.is_alive());
        assert!(!ServiceState::Failed.is_alive());
    }

    #[test]
    fn terminal_states() {
        assert!(ServiceState::Terminated.is_terminal());
        assert!(ServiceState::Failed.is_terminal());
        assert!(!ServiceState::Running.is_terminal());
    }

    #[test]
    fn atomic_roundtrip() {
        let cell = AtomicServiceState::default();
        assert_eq!(cell.load(), ServiceState::New);
        cell.store(ServiceState::Running);
        assert_eq!(cell.load(), ServiceState::Running);
    }

    #[test]
    fn log_level_parses_known_names() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("error".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert!("quiet".parse::<LogLevel>().is_err());
    }

    #[test]
    fn log_level_atomic_roundtrip() {
        let cell = AtomicLogLevel::default();
        assert_eq!(cell.load(), LogLevel::Info);
        cell.store(LogLevel::Debug);
        assert_eq!(cell.load(), LogLevel::Debug);
    }
}
