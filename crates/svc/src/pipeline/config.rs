//! Declarative pipeline configuration.
//!
//! Stands in for the capnp-encoded pipeline configuration message the
//! original framework decoded at startup - that schema compiler step is out
//! of scope here, so [`PipelineConfig`] is a plain `serde` structure instead.
//! Command implementations can't be named in data, so construction takes a
//! lookup table mapping the config's command names to actual [`Command`]
//! values the caller has already built.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::ids::ServiceId;
use crate::metrics::MetricsRegistry;
use crate::pipeline::runtime::{Pipeline, start_pipeline};
use crate::pipeline::stage::{Command, StageSpec};
use crate::service::ServiceHandle;

fn default_workers() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Key into the command lookup table passed to
    /// [`start_pipeline_from_config`].
    pub command: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

/// The decoded shape of an external pipeline-configuration message,
/// addressed at a specific owning service per spec.md §6. `service_id` is
/// checked against the service the caller is actually building the pipeline
/// for - a mismatch is a fatal configuration error, not a recoverable one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub service_id: ServiceId,
    pub stages: Vec<StageConfig>,
}

/// Builds a [`Pipeline`] from a declarative [`PipelineConfig`], resolving
/// each stage's `command` name against `commands`.
///
/// Fails with [`Error::ConfigInvalid`] (unrecoverable, per spec.md §6/§7) if
/// `config.service_id` doesn't match `handle`'s owning service, if no stages
/// are declared, if any stage names an unknown command, or if any stage
/// declares zero workers.
pub fn start_pipeline_from_config<T>(
    handle: &ServiceHandle,
    config: &PipelineConfig,
    commands: &HashMap<String, Arc<dyn Command<T>>>,
    metrics: MetricsRegistry,
) -> Result<Pipeline<T>, Error>
where
    T: Send + Clone + 'static,
{
    let owner = handle.service_id();
    if config.service_id != owner {
        return Err(Error::ConfigInvalid(format!(
            "pipeline config addressed to service {} does not match target service {owner}",
            config.service_id,
        )));
    }
    if config.stages.is_empty() {
        return Err(Error::ConfigInvalid("pipeline config declares no stages".to_string()));
    }

    let mut specs = Vec::with_capacity(config.stages.len());
    for stage in &config.stages {
        let command = commands
            .get(&stage.command)
            .cloned()
            .ok_or_else(|| Error::ConfigInvalid(format!("unknown pipeline command: {}", stage.command)))?;
        if stage.workers == 0 {
            return Err(Error::ConfigInvalid(format!("stage {} must have at least one worker", stage.command)));
        }
        specs.push(StageSpec::new(command, stage.workers));
    }

    Ok(start_pipeline(handle, specs, metrics))
}
