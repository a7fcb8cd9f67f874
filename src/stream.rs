//! Event Stream Controller: a thin `Open`/`Closed`/`Failed` state
//! machine layered over `tokio::sync::mpsc`, so producers pushing
//! `AgentEvent`s after the consumer cancels or the stream ends are
//! silently dropped instead of panicking or blocking.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

const STATE_OPEN: u8 = 0;
const STATE_CLOSED: u8 = 1;
const STATE_FAILED: u8 = 2;

struct Shared {
    state: AtomicU8,
}

/// Producer handle. Cloneable — multiple tasks may push onto the same
/// stream, but only one consumer ever drains it.
#[derive(Clone)]
pub struct EventSender<T> {
    shared: Arc<Shared>,
    sender: UnboundedSender<T>,
}

impl<T> EventSender<T> {
    /// Pushes an event. A no-op once the stream has been closed, failed,
    /// or cancelled.
    pub fn push(&self, event: T) {
        if self.shared.state.load(Ordering::SeqCst) == STATE_OPEN {
            let _ = self.sender.send(event);
        }
    }

    /// Closes the stream; the next `next()` drains whatever was queued,
    /// then returns `None` forever after.
    pub fn close(&self) {
        let _ = self
            .shared
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSED, Ordering::SeqCst, Ordering::SeqCst);
    }
}

/// Consumer half. Not `Clone` — single-consumer by construction.
pub struct EventStream<T> {
    shared: Arc<Shared>,
    receiver: UnboundedReceiver<T>,
    error: Option<String>,
}

impl<T> EventStream<T> {
    pub fn new() -> (EventSender<T>, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: AtomicU8::new(STATE_OPEN),
        });

        (
            EventSender {
                shared: shared.clone(),
                sender,
            },
            Self {
                shared,
                receiver,
                error: None,
            },
        )
    }

    /// Transitions the stream to `Failed`. The next `next()` call
    /// returns the error exactly once, then the stream behaves as
    /// closed.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self
            .shared
            .state
            .compare_exchange(STATE_OPEN, STATE_FAILED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.error = Some(message.into());
        }
    }

    /// Pulls the next event. Returns `Ok(None)` once the stream is
    /// drained and closed/cancelled, or `Err(message)` exactly once if
    /// `fail` was called, followed by `Ok(None)` forever after.
    pub async fn next(&mut self) -> Result<Option<T>, String> {
        if let Some(message) = self.error.take() {
            return Err(message);
        }

        if self.shared.state.load(Ordering::SeqCst) == STATE_FAILED {
            return Ok(None);
        }

        if self.shared.state.load(Ordering::SeqCst) != STATE_OPEN {
            // Closed (or cancelled): no more events will ever arrive, so
            // drain whatever is already queued without awaiting the
            // producer, which is still alive and would otherwise park us
            // forever.
            return Ok(self.receiver.try_recv().ok());
        }

        Ok(self.receiver.recv().await)
    }

    /// Consumer-side cancellation: equivalent to closing the producer
    /// side. Any in-flight `push` after this resolves is dropped.
    pub fn cancel(&mut self) {
        let _ = self.shared.state.compare_exchange(
            STATE_OPEN,
            STATE_CLOSED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.receiver.close();
    }

    pub fn is_open(&self) -> bool {
        self.shared.state.load(Ordering::SeqCst) == STATE_OPEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_then_close_drains_then_returns_none() {
        let (tx, mut rx) = EventStream::new();
        tx.push(1);
        tx.push(2);
        tx.close();

        assert_eq!(rx.next().await, Ok(Some(1)));
        assert_eq!(rx.next().await, Ok(Some(2)));
        assert_eq!(rx.next().await, Ok(None));
        assert_eq!(rx.next().await, Ok(None));
    }

    #[tokio::test]
    async fn push_after_close_is_dropped() {
        let (tx, mut rx) = EventStream::new();
        tx.close();
        tx.push(42);
        assert_eq!(rx.next().await, Ok(None));
    }

    #[tokio::test]
    async fn fail_surfaces_error_exactly_once() {
        let (tx, mut rx) = EventStream::new();
        tx.push(1);
        rx.fail("boom");

        assert_eq!(rx.next().await, Err("boom".to_string()));
        assert_eq!(rx.next().await, Ok(None));
        assert_eq!(rx.next().await, Ok(None));
    }

    #[tokio::test]
    async fn push_after_fail_is_dropped() {
        let (tx, mut rx) = EventStream::new();
        rx.fail("boom");
        tx.push(1);

        assert_eq!(rx.next().await, Err("boom".to_string()));
        assert_eq!(rx.next().await, Ok(None));
    }

    #[tokio::test]
    async fn cancel_from_consumer_stops_further_pushes() {
        let (tx, mut rx) = EventStream::new();
        rx.cancel();
        tx.push(1);
        assert!(!rx.is_open());
        assert_eq!(rx.next().await, Ok(None));
    }
}
