//! Frame Correlation
//!
//! Single responsibility: Let callers wait for an inbound frame that matches
//! an event type and an optional predicate.
//!
//! Callers register *before* sending the request that provokes the reply, so
//! a fast reply can never be missed. Each entry resolves at most once.
//! Dropping the returned [`Pending`] cancels the wait; the entry is discarded
//! the next time a frame of its type arrives.

use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use super::protocol::frame_type;
use crate::error::ChannelError;

/// Decides whether a frame answers a waiter. An `Err` resolves the waiter with that error.
pub type Predicate = Box<dyn Fn(&Value) -> Result<bool, ChannelError> + Send + Sync>;

type Outcome<T> = Result<T, ChannelError>;

trait Completion: Send {
    fn is_cancelled(&self) -> bool;
    fn fulfil(self: Box<Self>, frame: &Value);
    fn fail(self: Box<Self>, error: ChannelError);
}

struct Slot<T> {
    tx: oneshot::Sender<Outcome<T>>,
    transform: Box<dyn FnOnce(&Value) -> T + Send>,
}

impl<T: Send> Completion for Slot<T> {
    fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }

    fn fulfil(self: Box<Self>, frame: &Value) {
        let value = (self.transform)(frame);
        let _ = self.tx.send(Ok(value));
    }

    fn fail(self: Box<Self>, error: ChannelError) {
        let _ = self.tx.send(Err(error));
    }
}

struct Entry {
    event: String,
    predicate: Option<Predicate>,
    completion: Box<dyn Completion>,
}

enum Decision {
    Keep,
    Discard,
    Fulfil,
    Fail(ChannelError),
}

impl Entry {
    fn decide(&self, kind: &str, frame: &Value) -> Decision {
        if self.completion.is_cancelled() {
            return Decision::Discard;
        }
        if self.event != kind {
            return Decision::Keep;
        }
        match &self.predicate {
            None => Decision::Fulfil,
            Some(predicate) => match predicate(frame) {
                Ok(true) => Decision::Fulfil,
                Ok(false) => Decision::Keep,
                Err(e) => Decision::Fail(e),
            },
        }
    }
}

/// Waiters keyed by event type, in registration order.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<Vec<Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next frame of type `event` accepted by `predicate`.
    pub async fn wait_for(&self, event: &str, predicate: Option<Predicate>) -> Pending<Value> {
        self.wait_for_map(event, predicate, Value::clone).await
    }

    /// Like [`Registry::wait_for`], mapping the matched frame through `transform`.
    pub async fn wait_for_map<T, F>(
        &self,
        event: &str,
        predicate: Option<Predicate>,
        transform: F,
    ) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&Value) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let entry = Entry {
            event: event.to_string(),
            predicate,
            completion: Box::new(Slot {
                tx,
                transform: Box::new(transform),
            }),
        };
        self.entries.lock().await.push(entry);
        Pending { rx }
    }

    /// Offer an inbound frame to every waiter. Returns how many were resolved.
    pub async fn on_frame(&self, frame: &Value) -> usize {
        let Some(kind) = frame_type(frame) else {
            return 0;
        };

        let mut entries = self.entries.lock().await;
        let decisions: Vec<Decision> = entries.iter().map(|e| e.decide(kind, frame)).collect();

        let mut resolved = 0;
        for (index, decision) in decisions.into_iter().enumerate().rev() {
            match decision {
                Decision::Keep => {}
                Decision::Discard => {
                    entries.remove(index);
                }
                Decision::Fulfil => {
                    entries.remove(index).completion.fulfil(frame);
                    resolved += 1;
                }
                Decision::Fail(error) => {
                    entries.remove(index).completion.fail(error);
                    resolved += 1;
                }
            }
        }

        if resolved > 0 {
            debug!(event = %kind, resolved, "Resolved waiters");
        }
        resolved
    }

    /// Resolve every outstanding waiter with `error`.
    pub async fn fail_all(&self, error: ChannelError) {
        let drained: Vec<Entry> = self.entries.lock().await.drain(..).collect();
        for entry in drained {
            entry.completion.fail(error.clone());
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Future side of a registered waiter.
///
/// Resolves with [`ChannelError::Closed`] if the registry is dropped first.
pub struct Pending<T> {
    rx: oneshot::Receiver<Outcome<T>>,
}

impl<T> Future for Pending<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(Pin::new(&mut self.rx).poll(cx)) {
            Ok(outcome) => Poll::Ready(outcome),
            Err(_) => Poll::Ready(Err(ChannelError::Closed)),
        }
    }
}
