//! Stage commands: the pure, synchronous transforms a pipeline stage runs
//! its worker pool over.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::StructuredError;
use crate::ids::CommandId;

/// A pure transform from one payload to another (or a failure). Commands
/// never see the surrounding envelope - cancellation, deadlines and
/// short-circuited errors are the runtime's concern, not the command's.
pub trait Command<T>: Send + Sync + 'static {
    fn id(&self) -> CommandId;
    fn name(&self) -> &'static str;
    fn call(&self, payload: T) -> Result<T, StructuredError>;
}

struct FnCommand<T, F> {
    id: CommandId,
    name: &'static str,
    f: F,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T, F> Command<T> for FnCommand<T, F>
where
    T: Send + 'static,
    F: Fn(T) -> Result<T, StructuredError> + Send + Sync + 'static,
{
    fn id(&self) -> CommandId {
        self.id
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn call(&self, payload: T) -> Result<T, StructuredError> {
        (self.f)(payload)
    }
}

/// Wraps a plain closure as a [`Command`], the way most stages in practice
/// are built rather than through a hand-written `impl Command`.
pub fn command<T, F>(id: CommandId, name: &'static str, f: F) -> Arc<dyn Command<T>>
where
    T: Send + 'static,
    F: Fn(T) -> Result<T, StructuredError> + Send + Sync + 'static,
{
    Arc::new(FnCommand { id, name, f, _marker: PhantomData })
}

/// Describes one stage before the pipeline is built: its command, how many
/// workers run it concurrently, and an optional best-effort tap that
/// receives a copy of every item the stage finishes handling.
pub struct StageSpec<T> {
    pub command: Arc<dyn Command<T>>,
    pub workers: usize,
    pub tap: Option<async_channel::Sender<crate::pipeline::item::WorkItem<T>>>,
}

impl<T> StageSpec<T> {
    #[must_use]
    pub fn new(command: Arc<dyn Command<T>>, workers: usize) -> Self {
        Self { command, workers, tap: None }
    }

    #[must_use]
    pub fn with_tap(mut self, tap: async_channel::Sender<crate::pipeline::item::WorkItem<T>>) -> Self {
        self.tap = Some(tap);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::CommandId;

    #[test]
    fn closure_command_runs() {
        let cmd = command::<u32, _>(CommandId::new(1), "double", |n| Ok(n * 2));
        assert_eq!(cmd.call(21).unwrap(), 42);
        assert_eq!(cmd.name(), "double");
    }
}
