//! The structured error model: a caller-facing [`Error`] enum for container
//! and pipeline-construction failures, plus [`StructuredError`], the
//! `{error_id, severity, kind, service_id, cause}` record that travels with
//! a failed work item and gets logged at every stage boundary.

use std::fmt;

use thiserror::Error as ThisError;

use crate::ids::{CommandId, ErrorId, ServiceId};

pub type SvcResult<T> = Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("container is not alive")]
    ContainerNotAlive,

    #[error("service is not alive")]
    ServiceNotAlive,

    #[error("service is not registered")]
    ServiceNotRegistered,

    #[error("service is already registered")]
    ServiceAlreadyRegistered,

    #[error("service is nil")]
    ServiceNil,

    #[error("service failed to initialize: {0}")]
    ServiceInitFailed(String),

    #[error("{0}(0) is not allowed")]
    IdZero(&'static str),

    #[error("unknown log level: {0}")]
    UnknownLogLevel(String),

    #[error("dependency missing: {0}")]
    DependencyMissing(InterfaceTagDisplay),

    #[error("dependency not running: {0}")]
    DependencyNotRunning(InterfaceTagDisplay),

    #[error("context expired")]
    ContextExpired,

    #[error("stage command failed: {0}")]
    StageCommandFailed(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("invalid rpc spec: {0}")]
    RpcSpecInvalid(String),

    #[error("healthcheck timed out")]
    HealthcheckTimeout,

    #[error("shutdown did not complete within the allotted time")]
    ShutdownTimedOut,
}

impl Error {
    /// Unrecoverable errors (spec: config/RPC-spec failures at startup) must
    /// propagate upward and abort the process rather than fail a single
    /// service registration.
    #[must_use]
    pub const fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::ConfigInvalid(_) | Self::RpcSpecInvalid(_))
    }
}

/// Wraps an [`crate::interface::InterfaceTag`] for display in dependency
/// errors without making `error` depend on `interface`'s full API.
#[derive(Debug)]
pub struct InterfaceTagDisplay(pub String);

impl fmt::Display for InterfaceTagDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Severity of a [`StructuredError`], per the originating error spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    Medium,
    High,
    Fatal,
}

/// Whether an error was anticipated (`KnownEdgeCase`), merely unplanned for
/// (`Unexpected`), or indicates a defect in the command/service itself
/// (`Bug`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    KnownEdgeCase,
    Unexpected,
    Bug,
}

/// A fixed `{error_id, kind, severity}` triple, analogous to the original
/// framework's `ErrSpec`: a compile-time constant describing one class of
/// error, instantiated into a [`StructuredError`] with a concrete cause and
/// originating service at the point of failure.
#[derive(Debug, Clone, Copy)]
pub struct ErrSpec {
    pub error_id: ErrorId,
    pub kind: ErrorKind,
    pub severity: Severity,
}

/// Raised when a work item's cancellation or deadline is observed anywhere
/// in a pipeline. One fixed spec, shared by every stage.
pub const CONTEXT_EXPIRED: ErrSpec = ErrSpec {
    error_id: ErrorId::new(0xd56f_1203_ea74_0414),
    kind: ErrorKind::KnownEdgeCase,
    severity: Severity::Medium,
};

/// Raised when a supervised task panics instead of returning an error.
pub const TASK_PANICKED: ErrSpec = ErrSpec {
    error_id: ErrorId::new(0x7c21_9e88_441a_bb02),
    kind: ErrorKind::Bug,
    severity: Severity::High,
};

/// The `{error_id, severity, kind, originating_service_id, cause}` record
/// from spec section 4.1. Produced by failing stage commands and by
/// context-expiry handling; carried on a work item's error slot and
/// rendered in its entirety when logged.
#[derive(Debug, Clone)]
pub struct StructuredError {
    pub error_id: ErrorId,
    pub severity: Severity,
    pub kind: ErrorKind,
    pub service_id: ServiceId,
    pub command_id: Option<CommandId>,
    pub cause: String,
}

impl StructuredError {
    #[must_use]
    pub fn new(spec: ErrSpec, service_id: ServiceId, cause: impl fmt::Display) -> Self {
        Self {
            error_id: spec.error_id,
            severity: spec.severity,
            kind: spec.kind,
            service_id,
            command_id: None,
            cause: cause.to_string(),
        }
    }

    #[must_use]
    pub fn with_command(mut self, command_id: CommandId) -> Self {
        self.command_id = Some(command_id);
        self
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error={:x} severity={:?} kind={:?} service={:x}",
            self.error_id.get(),
            self.severity,
            self.kind,
            self.service_id.get(),
        )?;
        if let Some(command_id) = self.command_id {
            write!(f, " command={:x}", command_id.get())?;
        }
        write!(f, " cause={}", self.cause)
    }
}

impl std::error::Error for StructuredError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecoverable_classification() {
        assert!(Error::ConfigInvalid("bad yaml".into()).is_unrecoverable());
        assert!(Error::RpcSpecInvalid("bad spec".into()).is_unrecoverable());
        assert!(!Error::ServiceNotAlive.is_unrecoverable());
    }

    #[test]
    fn structured_error_display_includes_all_fields() {
        let err = StructuredError::new(CONTEXT_EXPIRED, ServiceId::new(7), "deadline crossed")
            .with_command(CommandId::new(3));
        let rendered = err.to_string();
        assert!(rendered.contains("error=d56f1203ea740414"));
        assert!(rendered.contains("service=7"));
        assert!(rendered.contains("command=3"));
        assert!(rendered.contains("deadline crossed"));
    }
}
