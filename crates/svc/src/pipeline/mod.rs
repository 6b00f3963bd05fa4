//! A linear chain of stages built on top of a registered service: each
//! stage runs a pool of workers over one pure command, connected to its
//! neighbours by rendezvous channels.

mod config;
mod item;
mod runtime;
mod stage;

pub use config::{PipelineConfig, StageConfig, start_pipeline_from_config};
pub use item::{Envelope, PingProbe, WorkItem};
pub use runtime::{Pipeline, start_pipeline};
pub use stage::{Command, StageSpec, command};
