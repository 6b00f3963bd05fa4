//! Ticketed asynchronous service lookup.
//!
//! [`Container::lookup_async`](crate::container::Container::lookup_async)
//! hands back a [`ServiceTicket`] immediately, whether or not the requested
//! service is registered yet. The ticket resolves the first time a matching
//! service reaches [`crate::lifecycle::ServiceState::Running`], or fails if
//! the container shuts down first with the ticket still outstanding.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::Error;
use crate::interface::InterfaceTag;

/// One outstanding asynchronous lookup, as tracked by the container's
/// pending-ticket list. `tag` is kept alongside the sender so
/// [`crate::container::Container::ticket_counts`] can report, per tag, how
/// many callers are currently waiting.
pub(crate) struct PendingTicket<T> {
    pub tag: InterfaceTag,
    pub sender: oneshot::Sender<T>,
}

impl<T> PendingTicket<T> {
    pub(crate) fn new(tag: InterfaceTag) -> (Self, ServiceTicket<T>) {
        let (sender, receiver) = oneshot::channel();
        (Self { tag, sender }, ServiceTicket { receiver })
    }

    /// Delivers `value` to the waiting caller. Returns `false` if the
    /// caller has already dropped its ticket.
    pub(crate) fn fulfil(self, value: T) -> bool {
        self.sender.send(value).is_ok()
    }
}

/// A future resolving to the looked-up value once the container can supply
/// it. Dropping the ticket before it resolves simply cancels the wait - the
/// container notices on its next sweep and removes the stale entry.
pub struct ServiceTicket<T> {
    receiver: oneshot::Receiver<T>,
}

impl<T> Future for ServiceTicket<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(Ok(value)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::ContainerNotAlive)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::ServiceInterface;

    struct Thing;
    impl ServiceInterface for Thing {
        const NAME: &'static str = "Thing";
    }

    #[tokio::test]
    async fn fulfilled_ticket_resolves_to_value() {
        let (pending, ticket) = PendingTicket::<u32>::new(InterfaceTag::of::<Thing>());
        assert!(pending.fulfil(42));
        assert_eq!(ticket.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn dropped_sender_resolves_to_container_not_alive() {
        let (pending, ticket) = PendingTicket::<u32>::new(InterfaceTag::of::<Thing>());
        drop(pending);
        assert!(matches!(ticket.await, Err(Error::ContainerNotAlive)));
    }
}
