//! Pipeline construction and the worker loop each stage's task pool runs.
//!
//! Stages are connected by `async-channel` channels of capacity zero - a
//! send only completes once a worker on the other side is ready to receive
//! it, so a slow stage applies backpressure all the way up the chain rather
//! than letting work pile up in memory.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{CONTEXT_EXPIRED, Error, StructuredError};
use crate::ids::ServiceId;
use crate::metrics::MetricsRegistry;
use crate::pipeline::item::{Envelope, PingProbe, WorkItem};
use crate::pipeline::stage::{Command, StageSpec};
use crate::service::ServiceHandle;

type Chan<T> = (async_channel::Sender<WorkItem<T>>, async_channel::Receiver<WorkItem<T>>);

/// A running chain of stages. Feed items in via [`Pipeline::input`], read
/// results from [`Pipeline::output`]. Cloning it is cheap: every field is
/// itself a channel handle or a shared handle, shared with whatever other
/// caller looked the pipeline up through the per-service registry.
#[derive(Clone)]
pub struct Pipeline<T> {
    input: async_channel::Sender<WorkItem<T>>,
    output: async_channel::Receiver<WorkItem<T>>,
    stage_inputs: Vec<async_channel::Sender<WorkItem<T>>>,
}

impl<T: Send + Clone + 'static> Pipeline<T> {
    #[must_use]
    pub fn input(&self) -> async_channel::Sender<WorkItem<T>> {
        self.input.clone()
    }

    #[must_use]
    pub fn output(&self) -> async_channel::Receiver<WorkItem<T>> {
        self.output.clone()
    }

    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stage_inputs.len()
    }

    /// Submits a liveness probe at the pipeline's input and waits for it to
    /// emerge, tagged "pong", on the pipeline's output - exactly the path a
    /// real work item takes, except that no stage along the way runs its
    /// command. Returns the probe's round-trip latency.
    ///
    /// Since the output channel is shared with ordinary work items, this is
    /// meant for a quiescent health check, not for use while the pipeline is
    /// also processing unrelated traffic (a concurrent work item could be
    /// delivered to this call's `recv` instead of the pong it's waiting
    /// for).
    pub async fn ping(&self, timeout: Duration) -> Result<Duration, Error> {
        let start = Instant::now();
        self.input
            .send(WorkItem::Ping(PingProbe::new()))
            .await
            .map_err(|_| Error::ContainerNotAlive)?;
        match tokio::time::timeout(timeout, self.output.recv()).await {
            Ok(Ok(WorkItem::Ping(_))) => Ok(start.elapsed()),
            Ok(Ok(WorkItem::Work(_))) => Err(Error::HealthcheckTimeout),
            Ok(Err(_)) => Err(Error::ContainerNotAlive),
            Err(_elapsed) => Err(Error::HealthcheckTimeout),
        }
    }

    /// Closes the pipeline's input and waits for every in-flight item to
    /// drain through before returning. Takes `&self` rather than `self`
    /// because a pipeline may be shared (via the per-service registry) with
    /// other holders of the same `Pipeline<T>` - shutting one down shuts
    /// down the single underlying chain of workers for all of them.
    pub async fn shutdown(&self) {
        self.input.close();
        while !self.output.is_closed() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

type PipelineRegistryMap = HashMap<ServiceId, Arc<dyn Any + Send + Sync>>;

/// Process-wide, service-id-keyed registry of running pipelines, per
/// spec.md §4.4: a second call to [`start_pipeline`] for a service that
/// already has one returns the existing pipeline rather than starting a
/// competing chain of workers, and the entry is removed once the owning
/// service's dying signal fires.
fn pipeline_registry() -> &'static Mutex<PipelineRegistryMap> {
    static REGISTRY: OnceLock<Mutex<PipelineRegistryMap>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Builds a chain of stages on top of `handle`'s owning service, or returns
/// the pipeline already registered for that service if one exists. Workers
/// are spawned into the owning service's supervised task group via
/// [`ServiceHandle::go`], so a worker panic promotes the whole service to
/// [`crate::lifecycle::ServiceState::Failed`] exactly as a panic in the
/// service's own `run` would.
///
/// The whole construction - registry lookup, worker spawn, registry insert
/// - runs under one process-wide lock, so two concurrent callers racing to
/// build a pipeline for the same service can never both win.
///
/// # Panics
///
/// Panics if `stages` is empty - a pipeline with no stages isn't a
/// constructible chain. Also panics if a pipeline is already registered for
/// this service with a different item type `T` - that can only happen if
/// the same service id is reused for two logically different pipelines,
/// which is a caller bug rather than a recoverable condition.
pub fn start_pipeline<T>(
    handle: &ServiceHandle,
    stages: Vec<StageSpec<T>>,
    metrics: MetricsRegistry,
) -> Pipeline<T>
where
    T: Send + Clone + 'static,
{
    let owner = handle.service_id();
    let mut registry = pipeline_registry().lock();

    if let Some(existing) = registry.get(&owner) {
        let existing = Arc::clone(existing);
        drop(registry);
        return match existing.downcast::<Pipeline<T>>() {
            Ok(pipeline) => (*pipeline).clone(),
            Err(_) => panic!("pipeline for service {owner} already registered with a different item type"),
        };
    }

    assert!(!stages.is_empty(), "a pipeline needs at least one stage");

    let dying = handle.dying_signal();
    let stage_count = stages.len();
    let boundaries: Vec<Chan<T>> =
        std::iter::repeat_with(|| async_channel::bounded::<WorkItem<T>>(0)).take(stage_count + 1).collect();

    let input = boundaries[0].0.clone();
    let output = boundaries[stage_count].1.clone();

    let mut stage_inputs = Vec::with_capacity(stage_count);

    for (index, spec) in stages.into_iter().enumerate() {
        let stage_input = boundaries[index].1.clone();
        let next = boundaries[index + 1].0.clone();
        stage_inputs.push(boundaries[index].0.clone());

        let pipeline_output = boundaries[stage_count].0.clone();
        let stage_name = spec.command.name();
        let is_last_stage = index + 1 == stage_count;

        for _ in 0..spec.workers.max(1) {
            handle.go(run_worker(
                owner,
                index == 0,
                is_last_stage,
                stage_input.clone(),
                next.clone(),
                pipeline_output.clone(),
                spec.tap.clone(),
                Arc::clone(&spec.command),
                stage_name,
                metrics.clone(),
                dying.clone(),
            ));
        }
    }

    let pipeline = Pipeline { input, output, stage_inputs };
    let erased: Arc<dyn Any + Send + Sync> = Arc::new(pipeline.clone());
    registry.insert(owner, erased);
    drop(registry);

    handle.go(async move {
        dying.cancelled().await;
        pipeline_registry().lock().remove(&owner);
        Ok(())
    });

    pipeline
}

#[allow(clippy::too_many_arguments)]
async fn run_worker<T>(
    owner: ServiceId,
    is_first_stage: bool,
    is_last_stage: bool,
    input: async_channel::Receiver<WorkItem<T>>,
    next: async_channel::Sender<WorkItem<T>>,
    pipeline_output: async_channel::Sender<WorkItem<T>>,
    tap: Option<async_channel::Sender<WorkItem<T>>>,
    command: Arc<dyn Command<T>>,
    stage_name: &'static str,
    metrics: MetricsRegistry,
    dying: CancellationToken,
) -> Result<(), StructuredError>
where
    T: Send + Clone + 'static,
{
    let owner_label = owner.to_string();

    loop {
        let item = tokio::select! {
            biased;

            () = dying.cancelled() => return Ok(()),
            item = input.recv() => match item {
                Ok(item) => item,
                Err(_) => return Ok(()),
            },
        };

        let mut envelope = match item {
            WorkItem::Ping(probe) => {
                if is_last_stage {
                    metrics.pipeline_ping_replied(&owner_label);
                    let destination = probe.output_override.clone().unwrap_or_else(|| pipeline_output.clone());
                    send_cancellable(&destination, WorkItem::Ping(probe), &dying, None).await;
                } else {
                    send_cancellable(&next, WorkItem::Ping(probe), &dying, None).await;
                }
                continue;
            }
            WorkItem::Work(envelope) => envelope,
        };

        if envelope.error.is_some() {
            deliver(envelope, &pipeline_output, &tap, &dying).await;
            continue;
        }

        if envelope.is_expired() {
            let err = StructuredError::new(CONTEXT_EXPIRED, owner, "item expired before this stage")
                .with_command(command.id());
            log::warn!("{err}");
            metrics.stage_item_failed(stage_name);
            metrics.pipeline_item_expired(&owner_label);
            if is_last_stage {
                metrics.terminal_expired(&owner_label);
            }
            // spec.md §4.4: a cancelled/expired item is dropped outright - it
            // is never forwarded, not even to the pipeline's own output.
            continue;
        }

        if is_first_stage {
            metrics.pipeline_run_started(&owner_label);
        }

        let start = Instant::now();
        match command.call(envelope.payload.clone()) {
            Ok(result) => {
                envelope.payload = result;
                metrics.stage_item_processed(stage_name);
                metrics.stage_latency_observed(stage_name, start.elapsed().as_secs_f64());
                if is_last_stage {
                    metrics.terminal_success(&owner_label);
                    deliver(envelope, &pipeline_output, &tap, &dying).await;
                } else {
                    deliver(envelope, &next, &tap, &dying).await;
                }
            }
            Err(err) => {
                metrics.stage_item_failed(stage_name);
                envelope.error = Some(err.with_command(command.id()));
                if is_last_stage {
                    metrics.terminal_failure(&owner_label);
                }
                deliver(envelope, &pipeline_output, &tap, &dying).await;
            }
        }
    }
}

/// Delivers one item's outcome. A per-item output override always wins over
/// `default_next`; a tap (if set) gets a best-effort copy regardless of
/// where the item itself ends up. The send itself is cancellable against
/// the owning service's dying signal and the item's own cancellation, per
/// spec.md §4.4 ("forward sends are themselves cancellable").
async fn deliver<T>(
    envelope: Envelope<T>,
    default_next: &async_channel::Sender<WorkItem<T>>,
    tap: &Option<async_channel::Sender<WorkItem<T>>>,
    dying: &CancellationToken,
) where
    T: Clone + Send + 'static,
{
    if let Some(tap) = tap {
        let _ = tap.try_send(WorkItem::Work(envelope.clone()));
    }
    let destination = envelope.output_override.clone().unwrap_or_else(|| default_next.clone());
    let cancellation = envelope.cancellation.clone();
    send_cancellable(&destination, WorkItem::Work(envelope), dying, Some(&cancellation)).await;
}

async fn send_cancellable<T>(
    destination: &async_channel::Sender<WorkItem<T>>,
    item: WorkItem<T>,
    dying: &CancellationToken,
    item_cancellation: Option<&CancellationToken>,
) {
    match item_cancellation {
        Some(cancellation) => {
            tokio::select! {
                biased;
                () = dying.cancelled() => {}
                () = cancellation.cancelled() => {}
                result = destination.send(item) => { let _ = result; }
            }
        }
        None => {
            tokio::select! {
                biased;
                () = dying.cancelled() => {}
                result = destination.send(item) => { let _ = result; }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::future::BoxFuture;

    use super::*;
    use crate::ids::CommandId;
    use crate::pipeline::stage::command;
    use crate::service::TaskGroup;

    fn upper_case() -> Arc<dyn Command<String>> {
        command(CommandId::new(1), "upper_case", |s: String| Ok(s.to_uppercase()))
    }

    fn always_fails() -> Arc<dyn Command<String>> {
        command(CommandId::new(2), "always_fails", |s: String| {
            Err(StructuredError::new(CONTEXT_EXPIRED, ServiceId::new(1), format!("cannot process {s}")))
        })
    }

    /// Spawns a bare `TaskGroup` in the background - as the container would
    /// - so that workers spawned via `handle.go` inside `start_pipeline`
    /// actually run, and returns a handle into it plus the group's
    /// cancellation token for the test to trigger a dying signal with.
    fn spawn_group(service_id: ServiceId) -> (ServiceHandle, CancellationToken) {
        let group = TaskGroup::new(service_id);
        let handle = group.handle();
        let dying = group.dying_signal();
        let root: BoxFuture<'static, Result<(), StructuredError>> = {
            let dying = dying.clone();
            Box::pin(async move {
                dying.cancelled().await;
                Ok(())
            })
        };
        tokio::spawn(group.run_until_dead(root));
        (handle, dying)
    }

    #[tokio::test]
    async fn item_flows_through_every_stage() {
        let metrics = MetricsRegistry::new().unwrap();
        let (handle, dying) = spawn_group(ServiceId::new(101));
        let stages = vec![
            StageSpec::new(upper_case(), 1),
            StageSpec::new(command(CommandId::new(3), "exclaim", |s: String| Ok(format!("{s}!"))), 1),
        ];
        let pipeline = start_pipeline(&handle, stages, metrics);

        pipeline.input().send(WorkItem::Work(Envelope::new("hi".to_string()))).await.unwrap();
        let WorkItem::Work(result) = pipeline.output().recv().await.unwrap() else {
            panic!("expected a work item");
        };
        assert_eq!(result.payload, "HI!");
        assert!(result.error.is_none());
        pipeline.shutdown().await;
        dying.cancel();
    }

    #[tokio::test]
    async fn failure_short_circuits_to_output() {
        let metrics = MetricsRegistry::new().unwrap();
        let (handle, dying) = spawn_group(ServiceId::new(102));
        let stages = vec![
            StageSpec::new(always_fails(), 1),
            StageSpec::new(upper_case(), 1),
        ];
        let pipeline = start_pipeline(&handle, stages, metrics);

        pipeline.input().send(WorkItem::Work(Envelope::new("hi".to_string()))).await.unwrap();
        let WorkItem::Work(result) = pipeline.output().recv().await.unwrap() else {
            panic!("expected a work item");
        };
        assert!(result.error.is_some());
        assert_eq!(result.payload, "hi");
        pipeline.shutdown().await;
        dying.cancel();
    }

    #[tokio::test]
    async fn ping_round_trips_without_invoking_any_command() {
        let metrics = MetricsRegistry::new().unwrap();
        let (handle, dying) = spawn_group(ServiceId::new(103));
        let stages = vec![StageSpec::new(always_fails(), 1), StageSpec::new(upper_case(), 1)];
        let pipeline = start_pipeline(&handle, stages, metrics);

        let latency = pipeline.ping(Duration::from_secs(1)).await.unwrap();
        assert!(latency < Duration::from_secs(1));
        pipeline.shutdown().await;
        dying.cancel();
    }

    #[tokio::test]
    async fn cancelled_item_is_never_delivered_to_output() {
        let metrics = MetricsRegistry::new().unwrap();
        let (handle, dying) = spawn_group(ServiceId::new(104));
        let stages = vec![StageSpec::new(upper_case(), 1)];
        let pipeline = start_pipeline(&handle, stages, metrics);

        let envelope = Envelope::new("hi".to_string());
        envelope.cancellation.cancel();
        pipeline.input().send(WorkItem::Work(envelope)).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_millis(200), pipeline.output().recv()).await;
        assert!(outcome.is_err(), "a cancelled item must never reach the pipeline's output");
        pipeline.shutdown().await;
        dying.cancel();
    }

    #[tokio::test]
    async fn dying_signal_drains_workers() {
        let metrics = MetricsRegistry::new().unwrap();
        let (handle, dying) = spawn_group(ServiceId::new(105));
        let stages = vec![StageSpec::new(upper_case(), 1)];
        let pipeline = start_pipeline(&handle, stages, metrics);

        dying.cancel();
        tokio::time::timeout(Duration::from_millis(200), pipeline.shutdown()).await.unwrap();
    }

    #[tokio::test]
    async fn repeated_start_for_the_same_service_returns_the_existing_pipeline() {
        let metrics = MetricsRegistry::new().unwrap();
        let (handle, dying) = spawn_group(ServiceId::new(106));
        let stages = vec![StageSpec::new(upper_case(), 1)];
        let first = start_pipeline(&handle, stages, metrics.clone());

        let more_stages = vec![StageSpec::new(upper_case(), 1)];
        let second = start_pipeline(&handle, more_stages, metrics);

        assert_eq!(first.stage_count(), second.stage_count());
        second.input().send(WorkItem::Work(Envelope::new("hi".to_string()))).await.unwrap();
        let WorkItem::Work(result) = first.output().recv().await.unwrap() else {
            panic!("expected a work item");
        };
        assert_eq!(result.payload, "HI");
        first.shutdown().await;
        dying.cancel();
    }

    #[tokio::test]
    async fn pipeline_is_unregistered_once_owner_dies() {
        let metrics = MetricsRegistry::new().unwrap();
        let (handle, dying) = spawn_group(ServiceId::new(107));
        let stages = vec![StageSpec::new(upper_case(), 1)];
        let _pipeline = start_pipeline(&handle, stages, metrics.clone());
        assert!(pipeline_registry().lock().contains_key(&ServiceId::new(107)));

        dying.cancel();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(!pipeline_registry().lock().contains_key(&ServiceId::new(107)));
    }
}
