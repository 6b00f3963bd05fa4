//! The service registry and supervisor.
//!
//! [`Container`] is the single shared owner of every registered service. Its
//! service map and pending-ticket list are guarded by
//! [`parking_lot::RwLock`] rather than driven through an actor/mailbox, so
//! lookups that don't need to wait never leave the calling task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, join_all};
use parking_lot::{Mutex, RwLock};
use semver::{Version, VersionReq};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, InterfaceTagDisplay, StructuredError};
use crate::ids::ServiceId;
use crate::interface::{InterfaceTag, ServiceInterface, ServiceKey};
use crate::lifecycle::{AtomicLogLevel, AtomicServiceState, LogLevel, ServiceState};
use crate::metrics::MetricsRegistry;
use crate::service::{Service, TaskGroup};
use crate::ticket::{PendingTicket, ServiceTicket};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// A no-arg factory for a service value, supplied to [`Container::register`]
/// and retained for as long as the service stays registered so that
/// [`Container::restart`] can build a genuinely fresh instance rather than
/// re-running the one that just stopped. Receives the container so a
/// constructor can look up the dependencies it needs (e.g. the metrics
/// registry, or another service) at construction time.
pub type ServiceConstructor<S> =
    Arc<dyn Fn(&Container) -> Result<Option<Arc<S>>, String> + Send + Sync>;

type ErasedConstructor =
    Arc<dyn Fn(&Container) -> Result<Option<Arc<dyn Service>>, String> + Send + Sync>;

fn erase_constructor<S: Service>(constructor: ServiceConstructor<S>) -> ErasedConstructor {
    Arc::new(move |container: &Container| {
        constructor(container).map(|maybe| maybe.map(|service| service as Arc<dyn Service>))
    })
}

/// The outcome of [`Container::check_dependencies`]: every declared
/// dependency that failed its check, bucketed by reason. A dependency that
/// is present, running, and satisfies its version constraint appears in
/// neither list.
#[derive(Debug, Clone, Default)]
pub struct DependencyReport {
    pub missing: Vec<InterfaceTag>,
    pub not_running: Vec<InterfaceTag>,
}

impl DependencyReport {
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.missing.is_empty() && self.not_running.is_empty()
    }
}

/// A registered service's bookkeeping record. Returned (cloned, as an
/// `Arc`) from every lookup; the concrete service value is intentionally
/// not reachable through it - callers that need to invoke a service's own
/// API should keep the `Arc<S>` they passed to
/// [`Container::register`] rather than recover it from here.
pub struct ServiceEntry {
    service_id: ServiceId,
    tag: InterfaceTag,
    key: ServiceKey,
    version: Version,
    dependencies: HashMap<InterfaceTag, Option<VersionReq>>,
    state: AtomicServiceState,
    state_tx: watch::Sender<ServiceState>,
    log_level: AtomicLogLevel,
    dying: CancellationToken,
    service: Arc<dyn Service>,
    constructor: ErasedConstructor,
    last_error: Mutex<Option<StructuredError>>,
}

impl ServiceEntry {
    #[must_use]
    pub const fn service_id(&self) -> ServiceId {
        self.service_id
    }

    #[must_use]
    pub const fn tag(&self) -> InterfaceTag {
        self.tag
    }

    #[must_use]
    pub const fn key(&self) -> &ServiceKey {
        &self.key
    }

    #[must_use]
    pub const fn version(&self) -> &Version {
        &self.version
    }

    #[must_use]
    pub const fn dependencies(&self) -> &HashMap<InterfaceTag, Option<VersionReq>> {
        &self.dependencies
    }

    #[must_use]
    pub fn state(&self) -> ServiceState {
        self.state.load()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<StructuredError> {
        self.last_error.lock().clone()
    }

    #[must_use]
    pub fn log_level(&self) -> LogLevel {
        self.log_level.load()
    }

    fn set_state(&self, state: ServiceState) {
        self.state.store(state);
        let _ = self.state_tx.send(state);
    }
}

pub struct Container {
    services: RwLock<HashMap<InterfaceTag, Arc<ServiceEntry>>>,
    pending: RwLock<Vec<PendingTicket<Arc<ServiceEntry>>>>,
    restart_locks: RwLock<HashMap<InterfaceTag, Arc<tokio::sync::Mutex<()>>>>,
    next_id: AtomicU64,
    metrics: MetricsRegistry,
    alive: AtomicBool,
    self_weak: Weak<Container>,
}

impl Container {
    /// Builds an empty container and its metrics registry. Wrapped in an
    /// `Arc` up front, with a `Weak` back-reference stashed alongside it,
    /// because every operation that spawns a supervisor task needs to hand
    /// that task a reference back to the container itself.
    pub fn new() -> Result<Arc<Self>, Error> {
        let metrics = MetricsRegistry::new()?;
        Ok(Arc::new_cyclic(|weak| Self {
            services: RwLock::new(HashMap::new()),
            pending: RwLock::new(Vec::new()),
            restart_locks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            metrics,
            alive: AtomicBool::new(true),
            self_weak: weak.clone(),
        }))
    }

    /// Recovers the `Arc` a caller must already be holding to have reached
    /// this method. Only fails if called before `new` finishes constructing
    /// the container, which a method on `&self` can never observe.
    fn arc(&self) -> Arc<Self> {
        self.self_weak.upgrade().expect("container outlives its own methods")
    }

    #[must_use]
    pub const fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Registers a service built by `constructor` under the marker interface
    /// `I`, starting it immediately. Fails if the container is shutting
    /// down, a service is already registered under `I`, or `constructor`
    /// itself fails or declines to produce a value. `constructor` is
    /// retained for the lifetime of the registration so [`Container::restart`]
    /// can build a fresh instance rather than reusing the one that stopped.
    pub fn register<S, I>(
        &self,
        constructor: ServiceConstructor<S>,
        version: Version,
        dependencies: HashMap<InterfaceTag, Option<VersionReq>>,
    ) -> Result<ServiceId, Error>
    where
        S: Service,
        I: ServiceInterface,
    {
        if !self.alive.load(Ordering::Acquire) {
            return Err(Error::ContainerNotAlive);
        }
        let tag = InterfaceTag::of::<I>();
        if self.services.read().contains_key(&tag) {
            return Err(Error::ServiceAlreadyRegistered);
        }
        let service_id = ServiceId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let key = tag.to_service_key();
        let erased = erase_constructor(constructor);
        let service = match (erased)(self) {
            Ok(Some(service)) => service,
            Ok(None) => return Err(Error::ServiceNil),
            Err(reason) => return Err(Error::ServiceInitFailed(reason)),
        };
        self.spawn_entry(service_id, tag, key, version, dependencies, service, LogLevel::Info, erased);
        Ok(service_id)
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_entry(
        &self,
        service_id: ServiceId,
        tag: InterfaceTag,
        key: ServiceKey,
        version: Version,
        dependencies: HashMap<InterfaceTag, Option<VersionReq>>,
        service: Arc<dyn Service>,
        log_level: LogLevel,
        constructor: ErasedConstructor,
    ) {
        let group = TaskGroup::new(service_id);
        let dying = group.dying_signal();
        let handle = group.handle();
        let (state_tx, _rx) = watch::channel(ServiceState::Starting);

        let entry = Arc::new(ServiceEntry {
            service_id,
            tag,
            key,
            version,
            dependencies,
            state: AtomicServiceState::new(ServiceState::Starting),
            state_tx,
            log_level: AtomicLogLevel::new(log_level),
            dying,
            service: Arc::clone(&service),
            constructor,
            last_error: Mutex::new(None),
        });

        self.services.write().insert(tag, Arc::clone(&entry));

        let root: BoxFuture<'static, Result<(), StructuredError>> = Box::pin(service.run(handle));
        let container = self.arc();
        tokio::spawn(async move {
            container.supervise(entry, group, root).await;
        });
    }

    async fn supervise(
        self: Arc<Self>,
        entry: Arc<ServiceEntry>,
        group: TaskGroup,
        root: BoxFuture<'static, Result<(), StructuredError>>,
    ) {
        entry.set_state(ServiceState::Running);
        self.metrics.service_started();
        self.fulfil_pending(&entry);

        match group.run_until_dead(root).await {
            Some(err) => {
                log::error!("service {} failed: {err}", entry.key);
                *entry.last_error.lock() = Some(err);
                entry.set_state(ServiceState::Failed);
                self.metrics.service_failed(&entry.key.to_string());
            }
            None => {
                log::info!("service {} terminated", entry.key);
                entry.set_state(ServiceState::Terminated);
                self.metrics.service_stopped();
            }
        }
    }

    fn fulfil_pending(&self, entry: &Arc<ServiceEntry>) {
        let mut pending = self.pending.write();
        let mut unmatched = Vec::with_capacity(pending.len());
        for ticket in pending.drain(..) {
            if ticket.tag == entry.tag {
                ticket.fulfil(Arc::clone(entry));
            } else {
                unmatched.push(ticket);
            }
        }
        *pending = unmatched;
    }

    #[must_use]
    pub fn lookup_by_tag(&self, tag: InterfaceTag) -> Option<Arc<ServiceEntry>> {
        self.services.read().get(&tag).cloned()
    }

    #[must_use]
    pub fn lookup_by_key(&self, key: &ServiceKey) -> Option<Arc<ServiceEntry>> {
        self.services.read().values().find(|entry| &entry.key == key).cloned()
    }

    /// A snapshot of every currently registered service. Used by callers
    /// that need to enumerate the whole registry, e.g. to decide a process
    /// exit code from the final state of each service.
    #[must_use]
    pub fn entries(&self) -> Vec<Arc<ServiceEntry>> {
        self.services.read().values().cloned().collect()
    }

    /// Looks up a service by marker interface, resolving once it reaches
    /// [`ServiceState::Running`]. Resolves immediately if it already has.
    #[must_use]
    pub fn lookup_async<I: ServiceInterface>(&self) -> ServiceTicket<Arc<ServiceEntry>> {
        let tag = InterfaceTag::of::<I>();
        let running = self.services.read().get(&tag).cloned().filter(|entry| entry.state().is_alive());
        if let Some(entry) = running {
            let (pending, ticket) = PendingTicket::new(tag);
            pending.fulfil(entry);
            return ticket;
        }
        let (pending, ticket) = PendingTicket::new(tag);
        self.pending.write().push(pending);
        ticket
    }

    /// Snapshots how many outstanding [`ServiceTicket`]s are waiting, per
    /// interface tag. Takes the pending list's read lock once and counts
    /// under it, so the result reflects one consistent instant rather than
    /// being torn by a registration landing mid-count.
    #[must_use]
    pub fn ticket_counts(&self) -> HashMap<InterfaceTag, usize> {
        let pending = self.pending.read();
        let mut counts = HashMap::new();
        for ticket in pending.iter() {
            *counts.entry(ticket.tag).or_insert(0) += 1;
        }
        counts
    }

    /// Checks every dependency declared at registration time for `tag`,
    /// accumulating every failure rather than stopping at the first one: a
    /// dependency that isn't registered at all lands in `missing`, as does
    /// one that is registered but whose version doesn't satisfy the
    /// declared constraint; a dependency that is registered but not in
    /// [`ServiceState::Running`] lands in `not_running`.
    pub fn check_dependencies(&self, tag: InterfaceTag) -> Result<DependencyReport, Error> {
        let services = self.services.read();
        let entry = services.get(&tag).ok_or(Error::ServiceNotRegistered)?;
        let mut report = DependencyReport::default();
        for (dep, constraint) in &entry.dependencies {
            match services.get(dep) {
                None => report.missing.push(*dep),
                Some(dep_entry) => {
                    let version_ok =
                        constraint.as_ref().is_none_or(|req| req.matches(dep_entry.version()));
                    if !version_ok {
                        report.missing.push(*dep);
                    } else if dep_entry.state() != ServiceState::Running {
                        report.not_running.push(*dep);
                    }
                }
            }
        }
        Ok(report)
    }

    /// Convenience wrapper over [`Container::check_dependencies`] for
    /// callers that just want a pass/fail result: returns the first unmet
    /// dependency as a single [`Error`] rather than the full report.
    pub fn ensure_dependencies(&self, tag: InterfaceTag) -> Result<(), Error> {
        let report = self.check_dependencies(tag)?;
        if let Some(dep) = report.missing.first() {
            return Err(Error::DependencyMissing(InterfaceTagDisplay(dep.to_string())));
        }
        if let Some(dep) = report.not_running.first() {
            return Err(Error::DependencyNotRunning(InterfaceTagDisplay(dep.to_string())));
        }
        Ok(())
    }

    /// Raises or lowers one registered service's own log level, independent
    /// of the process-global level the CLI installs.
    pub fn set_log_level(&self, tag: InterfaceTag, level: LogLevel) -> Result<(), Error> {
        let entry = self.services.read().get(&tag).cloned().ok_or(Error::ServiceNotRegistered)?;
        entry.log_level.store(level);
        Ok(())
    }

    #[must_use]
    pub fn log_level(&self, tag: InterfaceTag) -> Option<LogLevel> {
        self.services.read().get(&tag).map(|entry| entry.log_level())
    }

    /// Signals a service to stop and waits until it reaches a terminal
    /// state. A no-op on a service that is already terminal.
    pub async fn stop_service_by(&self, tag: InterfaceTag) -> Result<(), Error> {
        let entry = self.services.read().get(&tag).cloned().ok_or(Error::ServiceNotRegistered)?;
        let mut rx = entry.state_tx.subscribe();
        if !entry.state().is_terminal() {
            entry.set_state(ServiceState::Stopping);
            entry.dying.cancel();
        }
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        Ok(())
    }

    /// Stops a service and removes it from the registry entirely.
    pub async fn unregister(&self, tag: InterfaceTag) -> Result<(), Error> {
        self.stop_service_by(tag).await?;
        self.services.write().remove(&tag);
        Ok(())
    }

    /// Restarts the service registered under `tag`: stops it, then invokes
    /// its retained [`ServiceConstructor`] again to build a genuinely fresh
    /// service value, which is then spawned as a new supervised run.
    ///
    /// Concurrent restarts of the same tag coalesce: the first caller does
    /// the work while later callers block on the same lock and return once
    /// it completes, rather than racing each other's stop/respawn. A
    /// follower that wakes to find the service no longer alive (e.g. the
    /// leader's restart itself failed, or the service was unregistered
    /// meanwhile) reports that rather than silently succeeding.
    pub async fn restart(&self, tag: InterfaceTag) -> Result<(), Error> {
        let lock = Arc::clone(
            self.restart_locks
                .write()
                .entry(tag)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        );

        match Arc::clone(&lock).try_lock_owned() {
            Ok(_guard) => {
                let entry = self.services.read().get(&tag).cloned().ok_or(Error::ServiceNotRegistered)?;
                self.stop_service_by(tag).await?;
                let fresh = match (entry.constructor)(self) {
                    Ok(Some(service)) => service,
                    Ok(None) => return Err(Error::ServiceNil),
                    Err(reason) => return Err(Error::ServiceInitFailed(reason)),
                };
                self.spawn_entry(
                    entry.service_id,
                    entry.tag,
                    entry.key.clone(),
                    entry.version.clone(),
                    entry.dependencies.clone(),
                    fresh,
                    entry.log_level(),
                    Arc::clone(&entry.constructor),
                );
                Ok(())
            }
            Err(_would_block) => {
                let _guard = lock.lock_owned().await;
                let entry = self.services.read().get(&tag).cloned().ok_or(Error::ServiceNotRegistered)?;
                if !entry.state().is_alive() {
                    return Err(Error::ServiceNotAlive);
                }
                Ok(())
            }
        }
    }

    /// Restarts every service currently in [`ServiceState::Failed`].
    pub async fn restart_all_failed(&self) -> Vec<Result<(), Error>> {
        let tags: Vec<InterfaceTag> = self
            .services
            .read()
            .values()
            .filter(|entry| entry.state() == ServiceState::Failed)
            .map(|entry| entry.tag)
            .collect();
        self.restart_tags(tags).await
    }

    /// Restarts every registered service, regardless of its current state.
    pub async fn restart_all_services(&self) -> Vec<Result<(), Error>> {
        let tags: Vec<InterfaceTag> = self.services.read().keys().copied().collect();
        self.restart_tags(tags).await
    }

    async fn restart_tags(&self, tags: Vec<InterfaceTag>) -> Vec<Result<(), Error>> {
        join_all(tags.into_iter().map(|tag| {
            let this = self.arc();
            async move { this.restart(tag).await }
        }))
        .await
    }

    /// Blocks until `SIGTERM`, `SIGINT` or `SIGQUIT` is received, then
    /// drives [`Container::destroy`].
    pub async fn run(&self) -> Result<(), Error> {
        let mut sigterm =
            signal(SignalKind::terminate()).map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        let mut sigint =
            signal(SignalKind::interrupt()).map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        let mut sigquit =
            signal(SignalKind::quit()).map_err(|e| Error::ConfigInvalid(e.to_string()))?;

        tokio::select! {
            _ = sigterm.recv() => log::info!("received SIGTERM"),
            _ = sigint.recv() => log::info!("received SIGINT"),
            _ = sigquit.recv() => log::info!("received SIGQUIT"),
        }
        log::info!("shutting down container");
        self.destroy().await
    }

    /// Stops every registered service within [`DEFAULT_SHUTDOWN_TIMEOUT`].
    pub async fn destroy(&self) -> Result<(), Error> {
        self.destroy_within(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Stops every registered service, bounding the whole shutdown to
    /// `timeout` rather than waiting indefinitely on a stuck service.
    pub async fn destroy_within(&self, timeout: Duration) -> Result<(), Error> {
        self.alive.store(false, Ordering::Release);
        let tags: Vec<InterfaceTag> = self.services.read().keys().copied().collect();
        let stops = tags.into_iter().map(|tag| {
            let this = self.arc();
            async move { this.stop_service_by(tag).await }
        });

        match tokio::time::timeout(timeout, join_all(stops)).await {
            Ok(results) => {
                for result in results {
                    result?;
                }
            }
            Err(_elapsed) => return Err(Error::ShutdownTimedOut),
        }
        self.pending.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::CONTEXT_EXPIRED;
    use crate::service::ServiceHandle;

    struct Echo;
    impl ServiceInterface for Echo {
        const NAME: &'static str = "Echo";
    }

    #[async_trait]
    impl Service for Echo {
        async fn run(self: Arc<Self>, handle: ServiceHandle) -> Result<(), StructuredError> {
            handle.dying_signal().cancelled().await;
            Ok(())
        }
    }

    struct Flaky;
    impl ServiceInterface for Flaky {
        const NAME: &'static str = "Flaky";
    }

    #[async_trait]
    impl Service for Flaky {
        async fn run(self: Arc<Self>, handle: ServiceHandle) -> Result<(), StructuredError> {
            Err(StructuredError::new(CONTEXT_EXPIRED, handle.service_id(), "always fails"))
        }
    }

    fn echo_ctor() -> ServiceConstructor<Echo> {
        Arc::new(|_container: &Container| Ok(Some(Arc::new(Echo))))
    }

    fn flaky_ctor() -> ServiceConstructor<Flaky> {
        Arc::new(|_container: &Container| Ok(Some(Arc::new(Flaky))))
    }

    #[tokio::test]
    async fn register_then_lookup_sees_running_state() {
        let container = Container::new().unwrap();
        container.register::<_, Echo>(echo_ctor(), Version::new(1, 0, 0), HashMap::new()).unwrap();
        tokio::task::yield_now().await;
        let entry = container.lookup_by_tag(InterfaceTag::of::<Echo>()).unwrap();
        assert_eq!(entry.state(), ServiceState::Running);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let container = Container::new().unwrap();
        container.register::<_, Echo>(echo_ctor(), Version::new(1, 0, 0), HashMap::new()).unwrap();
        let second = container.register::<_, Echo>(echo_ctor(), Version::new(1, 0, 0), HashMap::new());
        assert!(matches!(second, Err(Error::ServiceAlreadyRegistered)));
    }

    #[tokio::test]
    async fn lookup_async_resolves_once_service_starts() {
        let container = Container::new().unwrap();
        let ticket = container.lookup_async::<Echo>();
        container.register::<_, Echo>(echo_ctor(), Version::new(1, 0, 0), HashMap::new()).unwrap();
        let entry = ticket.await.unwrap();
        assert_eq!(entry.tag(), InterfaceTag::of::<Echo>());
    }

    #[tokio::test]
    async fn failing_service_transitions_to_failed() {
        let container = Container::new().unwrap();
        container.register::<_, Flaky>(flaky_ctor(), Version::new(1, 0, 0), HashMap::new()).unwrap();
        let entry = container.lookup_by_tag(InterfaceTag::of::<Flaky>()).unwrap();
        let mut rx = entry.state_tx.subscribe();
        rx.wait_for(|state| state.is_terminal()).await.unwrap();
        assert_eq!(entry.state(), ServiceState::Failed);
        assert!(entry.last_error().is_some());
    }

    #[tokio::test]
    async fn missing_dependency_is_reported() {
        let container = Container::new().unwrap();
        let mut deps = HashMap::new();
        deps.insert(InterfaceTag::of::<Flaky>(), None);
        container.register::<_, Echo>(echo_ctor(), Version::new(1, 0, 0), deps).unwrap();
        let report = container.check_dependencies(InterfaceTag::of::<Echo>()).unwrap();
        assert_eq!(report.missing, vec![InterfaceTag::of::<Flaky>()]);
        assert!(!report.is_satisfied());
        assert!(matches!(
            container.ensure_dependencies(InterfaceTag::of::<Echo>()),
            Err(Error::DependencyMissing(_))
        ));
    }

    #[tokio::test]
    async fn not_running_dependency_is_reported_separately_from_missing() {
        let container = Container::new().unwrap();
        container.register::<_, Flaky>(flaky_ctor(), Version::new(1, 0, 0), HashMap::new()).unwrap();
        let flaky_entry = container.lookup_by_tag(InterfaceTag::of::<Flaky>()).unwrap();
        flaky_entry.state_tx.subscribe().wait_for(|state| state.is_terminal()).await.unwrap();

        let mut deps = HashMap::new();
        deps.insert(InterfaceTag::of::<Flaky>(), None);
        container.register::<_, Echo>(echo_ctor(), Version::new(1, 0, 0), deps).unwrap();
        let report = container.check_dependencies(InterfaceTag::of::<Echo>()).unwrap();
        assert!(report.missing.is_empty());
        assert_eq!(report.not_running, vec![InterfaceTag::of::<Flaky>()]);
    }

    #[tokio::test]
    async fn version_mismatch_is_reported_as_missing() {
        let container = Container::new().unwrap();
        container.register::<_, Echo>(echo_ctor(), Version::new(1, 0, 0), HashMap::new()).unwrap();
        tokio::task::yield_now().await;

        let mut deps = HashMap::new();
        deps.insert(InterfaceTag::of::<Echo>(), Some(VersionReq::parse(">=2.0.0").unwrap()));
        container.register::<_, Flaky>(flaky_ctor(), Version::new(1, 0, 0), deps).unwrap();
        let report = container.check_dependencies(InterfaceTag::of::<Flaky>()).unwrap();
        assert_eq!(report.missing, vec![InterfaceTag::of::<Echo>()]);
    }

    #[tokio::test]
    async fn graceful_shutdown_stops_all_services() {
        let container = Container::new().unwrap();
        container.register::<_, Echo>(echo_ctor(), Version::new(1, 0, 0), HashMap::new()).unwrap();
        tokio::task::yield_now().await;
        container.destroy().await.unwrap();
        let entry = container.lookup_by_tag(InterfaceTag::of::<Echo>()).unwrap();
        assert_eq!(entry.state(), ServiceState::Terminated);
    }

    #[tokio::test]
    async fn restart_respawns_a_failed_service_with_a_fresh_instance() {
        let container = Container::new().unwrap();
        let instances = Arc::new(AtomicU64::new(0));
        let counted = Arc::clone(&instances);
        let ctor: ServiceConstructor<Echo> = Arc::new(move |_container: &Container| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Arc::new(Echo)))
        });
        container.register::<_, Echo>(ctor, Version::new(1, 0, 0), HashMap::new()).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(instances.load(Ordering::SeqCst), 1);

        container.restart(InterfaceTag::of::<Echo>()).await.unwrap();
        let entry = container.lookup_by_tag(InterfaceTag::of::<Echo>()).unwrap();
        assert_eq!(entry.state(), ServiceState::Running);
        assert_eq!(instances.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn restart_surfaces_constructor_failure() {
        let container = Container::new().unwrap();
        let attempts = Arc::new(AtomicU64::new(0));
        let counted = Arc::clone(&attempts);
        let ctor: ServiceConstructor<Echo> = Arc::new(move |_container: &Container| {
            if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Some(Arc::new(Echo)))
            } else {
                Err("boom".to_string())
            }
        });
        container.register::<_, Echo>(ctor, Version::new(1, 0, 0), HashMap::new()).unwrap();
        tokio::task::yield_now().await;
        let result = container.restart(InterfaceTag::of::<Echo>()).await;
        assert!(matches!(result, Err(Error::ServiceInitFailed(_))));
    }

    #[tokio::test]
    async fn per_service_log_level_is_independently_settable() {
        let container = Container::new().unwrap();
        container.register::<_, Echo>(echo_ctor(), Version::new(1, 0, 0), HashMap::new()).unwrap();
        let tag = InterfaceTag::of::<Echo>();
        assert_eq!(container.log_level(tag), Some(crate::lifecycle::LogLevel::Info));
        container.set_log_level(tag, crate::lifecycle::LogLevel::Debug).unwrap();
        assert_eq!(container.log_level(tag), Some(crate::lifecycle::LogLevel::Debug));
    }

    #[tokio::test]
    async fn entries_snapshots_every_registered_service() {
        let container = Container::new().unwrap();
        container.register::<_, Echo>(echo_ctor(), Version::new(1, 0, 0), HashMap::new()).unwrap();
        container.register::<_, Flaky>(flaky_ctor(), Version::new(1, 0, 0), HashMap::new()).unwrap();
        assert_eq!(container.entries().len(), 2);
    }

    #[tokio::test]
    async fn ticket_counts_reflect_outstanding_lookups() {
        let container = Container::new().unwrap();
        let _first = container.lookup_async::<Echo>();
        let _second = container.lookup_async::<Echo>();
        let counts = container.ticket_counts();
        assert_eq!(counts.get(&InterfaceTag::of::<Echo>()), Some(&2));
    }
}
