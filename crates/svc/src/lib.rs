//! A process-wide service container and a staged command pipeline runtime.
//!
//! [`container::Container`] owns the lifecycle of a set of registered
//! [`service::Service`] implementations: it starts them, watches them for
//! failure, answers synchronous and ticketed asynchronous lookups, checks
//! declared dependencies, and drives an orderly shutdown on `SIGTERM` /
//! `SIGINT` / `SIGQUIT`.
//!
//! [`pipeline`] builds a linear chain of stages on top of a registered
//! service: each stage runs a pool of workers over the same command
//! function, connected to its neighbours by rendezvous channels.

pub mod container;
pub mod error;
pub mod ids;
pub mod interface;
pub mod lifecycle;
pub mod metrics;
pub mod pipeline;
pub mod service;
pub mod ticket;

pub use container::{Container, DependencyReport, ServiceConstructor};
pub use error::{Error, SvcResult};
pub use ids::{CommandId, ErrorId, MetricId, ServiceId};
pub use interface::{InterfaceTag, ServiceInterface, ServiceKey};
pub use lifecycle::{LogLevel, ServiceState};
pub use service::{Service, ServiceHandle};
