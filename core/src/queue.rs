// Subscriber queue protocol
//
// Bridges push-based publishes with a pull-based reader. Each subscriber owns a
// mailbox holding a FIFO queue and at most one pending one-shot receiver. The
// "pop the queue, else park a receiver" step and the "hand to the receiver, else
// append" step both run under the same lock, so no publish can slip between them.

use async_stream::stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use crate::emitter::Subscriber;
use crate::event::EventMessage;

#[derive(Default)]
struct MailboxState {
    queue: VecDeque<EventMessage>,
    waiter: Option<oneshot::Sender<EventMessage>>,
    closed: bool,
}

/// What the reader should do next.
pub(crate) enum Slot {
    Ready(EventMessage),
    Wait(oneshot::Receiver<EventMessage>),
    Done,
}

/// Per-subscriber FIFO plus single resolver slot.
#[derive(Default)]
pub(crate) struct Mailbox {
    state: Mutex<MailboxState>,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Hand `msg` to a parked reader, or append it. Returns false once closed.
    pub(crate) fn push(&self, msg: EventMessage) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        let msg = match state.waiter.take() {
            Some(waiter) => match waiter.send(msg) {
                Ok(()) => return true,
                // Reader gave up on this wait; keep the message for its next read.
                Err(msg) => msg,
            },
            None => msg,
        };
        state.queue.push_back(msg);
        true
    }

    /// Pop the front message or park a receiver for the next push.
    pub(crate) fn take_or_wait(&self) -> Slot {
        let mut state = self.state.lock();
        if let Some(msg) = state.queue.pop_front() {
            return Slot::Ready(msg);
        }
        if state.closed {
            return Slot::Done;
        }
        let (tx, rx) = oneshot::channel();
        state.waiter = Some(tx);
        Slot::Wait(rx)
    }

    /// Terminate: drops buffered messages and resolves any parked receiver as done.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.queue.clear();
        state.waiter = None;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().queue.len()
    }
}

/// Runs the removal callback exactly once, whichever way the reader exits.
struct RemoveGuard {
    on_remove: Option<Box<dyn FnOnce() + Send>>,
}

impl RemoveGuard {
    fn new<F>(on_remove: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            on_remove: Some(Box::new(on_remove)),
        }
    }
}

impl Drop for RemoveGuard {
    fn drop(&mut self) {
        if let Some(on_remove) = self.on_remove.take() {
            on_remove();
        }
    }
}

/// The consumer side of one `subscribe()` call.
///
/// Yields messages in publish order and ends when the subscription is cancelled
/// or the emitter closes. Dropping it removes the subscriber from its emitter.
pub struct Subscription {
    id: u64,
    inner: Pin<Box<dyn Stream<Item = EventMessage> + Send>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next message; `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<EventMessage> {
        self.next().await
    }
}

impl Stream for Subscription {
    type Item = EventMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Turn a registered subscriber into a lazily-drained message sequence.
///
/// `on_remove` runs exactly once when the sequence ends: cancellation, emitter
/// close, or the consumer dropping the [`Subscription`] early.
pub(crate) fn drive<F>(subscriber: Arc<Subscriber>, on_remove: F) -> Subscription
where
    F: FnOnce() + Send + 'static,
{
    let id = subscriber.id;
    let guard = RemoveGuard::new(on_remove);
    let inner = stream! {
        let _guard = guard;
        loop {
            if subscriber.cancel.is_cancelled() {
                break;
            }
            let waiting = match subscriber.mailbox.take_or_wait() {
                Slot::Ready(msg) => {
                    if subscriber.cancel.is_cancelled() {
                        break;
                    }
                    yield msg;
                    continue;
                }
                Slot::Done => break,
                Slot::Wait(rx) => rx,
            };
            let next = tokio::select! {
                biased;
                _ = subscriber.cancel.cancelled() => None,
                received = waiting => received.ok(),
            };
            match next {
                Some(msg) => yield msg,
                None => break,
            }
        }
        subscriber.mailbox.close();
        debug!(target: "emitter", subscriber_id = id, "Subscription ended");
    };

    Subscription {
        id,
        inner: Box::pin(inner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SubscribeOptions;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn msg(n: u64) -> EventMessage {
        EventMessage::new("tick", json!(n), None)
    }

    #[test]
    fn push_appends_when_no_reader() {
        let mailbox = Mailbox::new();
        assert!(mailbox.push(msg(1)));
        assert!(mailbox.push(msg(2)));
        assert_eq!(mailbox.len(), 2);
        match mailbox.take_or_wait() {
            Slot::Ready(m) => assert_eq!(m.data, json!(1)),
            _ => panic!("expected ready message"),
        }
    }

    #[test]
    fn push_resolves_parked_reader() {
        let mailbox = Mailbox::new();
        let mut rx = match mailbox.take_or_wait() {
            Slot::Wait(rx) => rx,
            _ => panic!("expected wait"),
        };
        assert!(mailbox.push(msg(7)));
        assert_eq!(mailbox.len(), 0);
        assert_eq!(rx.try_recv().unwrap().data, json!(7));
    }

    #[test]
    fn abandoned_wait_keeps_message() {
        let mailbox = Mailbox::new();
        match mailbox.take_or_wait() {
            Slot::Wait(rx) => drop(rx),
            _ => panic!("expected wait"),
        }
        assert!(mailbox.push(msg(3)));
        assert_eq!(mailbox.len(), 1);
    }

    #[test]
    fn close_resolves_waiter_as_done() {
        let mailbox = Mailbox::new();
        let mut rx = match mailbox.take_or_wait() {
            Slot::Wait(rx) => rx,
            _ => panic!("expected wait"),
        };
        mailbox.close();
        assert!(rx.try_recv().is_err());
        assert!(!mailbox.push(msg(1)));
        assert!(matches!(mailbox.take_or_wait(), Slot::Done));
    }

    #[tokio::test]
    async fn drive_yields_in_order_and_removes_once() {
        let removed = Arc::new(AtomicUsize::new(0));
        let subscriber = Arc::new(Subscriber::new(1, SubscribeOptions::default()));
        let counter = Arc::clone(&removed);
        let mut sub = drive(Arc::clone(&subscriber), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for n in 0..5 {
            subscriber.deliver(msg(n));
        }
        for n in 0..5 {
            assert_eq!(sub.recv().await.unwrap().data, json!(n));
        }

        subscriber.mailbox.close();
        assert!(sub.recv().await.is_none());
        assert!(sub.recv().await.is_none());
        drop(sub);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_unpolled_subscription_still_removes() {
        let removed = Arc::new(AtomicUsize::new(0));
        let subscriber = Arc::new(Subscriber::new(2, SubscribeOptions::default()));
        let counter = Arc::clone(&removed);
        let sub = drive(subscriber, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(sub);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_wakes_parked_reader() {
        let removed = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let subscriber = Arc::new(Subscriber::new(
            3,
            SubscribeOptions::default().with_cancel(cancel.clone()),
        ));
        let counter = Arc::clone(&removed);
        let mut sub = drive(Arc::clone(&subscriber), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let reader = tokio::spawn(async move {
            let next = sub.recv().await;
            (next, sub)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let (next, sub) = tokio::time::timeout(Duration::from_millis(500), reader)
            .await
            .expect("timeout")
            .unwrap();
        assert!(next.is_none());
        assert!(!subscriber.deliver(msg(9)));
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        drop(sub);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_during_delivery_removes_once() {
        for round in 0..20u64 {
            let removed = Arc::new(AtomicUsize::new(0));
            let cancel = CancellationToken::new();
            let subscriber = Arc::new(Subscriber::new(
                round,
                SubscribeOptions::default().with_cancel(cancel.clone()),
            ));
            let counter = Arc::clone(&removed);
            let mut sub = drive(Arc::clone(&subscriber), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

            let producer = {
                let subscriber = Arc::clone(&subscriber);
                tokio::spawn(async move {
                    let mut n = 0u64;
                    while subscriber.deliver(msg(n)) {
                        n += 1;
                        tokio::task::yield_now().await;
                    }
                })
            };
            let reader = tokio::spawn(async move {
                let mut seen = 0usize;
                while sub.recv().await.is_some() {
                    seen += 1;
                }
                (seen, sub)
            });

            tokio::time::sleep(Duration::from_millis(2)).await;
            cancel.cancel();

            let (_, sub) = tokio::time::timeout(Duration::from_secs(5), reader)
                .await
                .expect("reader did not finish")
                .unwrap();
            tokio::time::timeout(Duration::from_secs(5), producer)
                .await
                .expect("producer did not stop")
                .unwrap();
            assert_eq!(removed.load(Ordering::SeqCst), 1);
            drop(sub);
            assert_eq!(removed.load(Ordering::SeqCst), 1);
        }
    }
}
