//! The [`Service`] trait and the supervised task group every registered
//! service runs inside.

use std::future::Future;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{self, StructuredError};
use crate::ids::ServiceId;

/// Implemented by anything registerable with [`crate::container::Container`].
///
/// `run` receives a [`ServiceHandle`] and owns the service for as long as it
/// is alive: it should do setup, signal readiness however it sees fit (the
/// container only cares that `run` hasn't returned yet), then loop until its
/// handle's dying signal fires or it has no more work of its own. Returning
/// `Ok(())` is a normal exit to [`crate::lifecycle::ServiceState::Terminated`];
/// returning `Err` moves the service to
/// [`crate::lifecycle::ServiceState::Failed`] and cancels its siblings.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn run(self: std::sync::Arc<Self>, handle: ServiceHandle) -> Result<(), StructuredError>;
}

/// Given to a running service. Cloning it is cheap and intentional: a
/// service that spawns helper tasks via [`ServiceHandle::go`] hands each one
/// a clone so they all observe the same dying signal.
#[derive(Clone)]
pub struct ServiceHandle {
    service_id: ServiceId,
    dying: CancellationToken,
    spawner: mpsc::UnboundedSender<BoxFuture<'static, Result<(), StructuredError>>>,
}

impl ServiceHandle {
    #[must_use]
    pub const fn service_id(&self) -> ServiceId {
        self.service_id
    }

    /// The group's cancellation signal. Fires once when any task in the
    /// group (including this service's own `run`) returns `Err`, and stays
    /// fired afterwards.
    #[must_use]
    pub fn dying_signal(&self) -> CancellationToken {
        self.dying.clone()
    }

    #[must_use]
    pub fn is_dying(&self) -> bool {
        self.dying.is_cancelled()
    }

    /// Adds a task to this service's supervised group. If the task errors,
    /// the whole group is cancelled exactly as if `run` itself had errored.
    /// Rejected outright once the group's dying signal has fired - a stop
    /// already in progress must not pick up new work.
    pub fn go<F>(&self, fut: F)
    where
        F: Future<Output = Result<(), StructuredError>> + Send + 'static,
    {
        if self.dying.is_cancelled() {
            return;
        }
        let _ = self.spawner.send(Box::pin(fut));
    }
}

/// Owns the `JoinSet` backing one service's supervised task group. Created
/// by the container when a service is registered, consumed by
/// [`TaskGroup::run_until_dead`] on the container's supervisor task.
pub struct TaskGroup {
    service_id: ServiceId,
    dying: CancellationToken,
    tasks: JoinSet<Result<(), StructuredError>>,
    inbox: mpsc::UnboundedReceiver<BoxFuture<'static, Result<(), StructuredError>>>,
    spawner: mpsc::UnboundedSender<BoxFuture<'static, Result<(), StructuredError>>>,
}

impl TaskGroup {
    #[must_use]
    pub fn new(service_id: ServiceId) -> Self {
        let (spawner, inbox) = mpsc::unbounded_channel();
        Self {
            service_id,
            dying: CancellationToken::new(),
            tasks: JoinSet::new(),
            inbox,
            spawner,
        }
    }

    #[must_use]
    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            service_id: self.service_id,
            dying: self.dying.clone(),
            spawner: self.spawner.clone(),
        }
    }

    #[must_use]
    pub fn dying_signal(&self) -> CancellationToken {
        self.dying.clone()
    }

    /// Spawns `root` (typically the service's own `run` future) and then
    /// drives the group until every task has finished. Returns the first
    /// [`StructuredError`] surfaced by any task, or `None` if every task in
    /// the group returned `Ok(())`.
    pub async fn run_until_dead(
        mut self,
        root: BoxFuture<'static, Result<(), StructuredError>>,
    ) -> Option<StructuredError> {
        self.tasks.spawn(root);
        let mut inbox_open = true;
        let mut failure = None;

        loop {
            if self.tasks.is_empty() {
                return failure;
            }
            tokio::select! {
                biased;

                maybe_fut = self.inbox.recv(), if inbox_open && failure.is_none() && !self.dying.is_cancelled() => {
                    match maybe_fut {
                        Some(fut) => self.tasks.spawn(fut),
                        None => inbox_open = false,
                    }
                }
                joined = self.tasks.join_next() => {
                    match joined {
                        None => {}
                        Some(Ok(Ok(()))) => {}
                        Some(Ok(Err(err))) => {
                            self.dying.cancel();
                            failure.get_or_insert(err);
                        }
                        Some(Err(join_err)) => {
                            self.dying.cancel();
                            let structured = StructuredError::new(
                                error::TASK_PANICKED,
                                self.service_id,
                                join_err,
                            );
                            failure.get_or_insert(structured);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CONTEXT_EXPIRED;

    #[tokio::test]
    async fn clean_exit_yields_no_failure() {
        let group = TaskGroup::new(ServiceId::new(1));
        let root: BoxFuture<'static, Result<(), StructuredError>> = Box::pin(async { Ok(()) });
        assert!(group.run_until_dead(root).await.is_none());
    }

    #[tokio::test]
    async fn failing_root_cancels_and_surfaces_error() {
        let group = TaskGroup::new(ServiceId::new(1));
        let root: BoxFuture<'static, Result<(), StructuredError>> = Box::pin(async {
            Err(StructuredError::new(CONTEXT_EXPIRED, ServiceId::new(1), "boom"))
        });
        let failure = group.run_until_dead(root).await;
        assert!(failure.is_some());
    }

    #[tokio::test]
    async fn sibling_task_spawned_via_handle_is_awaited() {
        let group = TaskGroup::new(ServiceId::new(2));
        let handle = group.handle();
        let root: BoxFuture<'static, Result<(), StructuredError>> = Box::pin(async move {
            handle.go(async { Ok(()) });
            Ok(())
        });
        assert!(group.run_until_dead(root).await.is_none());
    }
}
