//! Event dispatch
//!
//! Listeners register per event name. Dispatching spawns one task per
//! listener on a tracked [`JoinSet`]; a listener that fails or panics is
//! logged and never affects the dispatcher or other listeners. Finished
//! tasks are reaped on every dispatch. Dropping the dispatcher detaches
//! the tasks still running instead of aborting them.
//!
//! | Event             | Payload                                |
//! |-------------------|----------------------------------------|
//! | `connected`       | none                                   |
//! | `connection_lost` | the [`ChannelError`] that ended it     |
//! | `data`            | the `payload` of a graphql-ws data frame |

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::Value;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error};

use crate::error::ChannelError;

#[derive(Debug, Clone)]
pub enum Event {
    Connected,
    ConnectionLost(ChannelError),
    Data(Value),
    /// Any other named event, dispatched through [`crate::Session::dispatch`]
    Custom { name: String, data: Option<Value> },
}

impl Event {
    pub const CONNECTED: &'static str = "connected";
    pub const CONNECTION_LOST: &'static str = "connection_lost";
    pub const DATA: &'static str = "data";

    pub fn name(&self) -> &str {
        match self {
            Event::Connected => Self::CONNECTED,
            Event::ConnectionLost(_) => Self::CONNECTION_LOST,
            Event::Data(_) => Self::DATA,
            Event::Custom { name, .. } => name,
        }
    }

    /// JSON payload, if the event carries one.
    pub fn data(&self) -> Option<&Value> {
        match self {
            Event::Data(value) => Some(value),
            Event::Custom { data, .. } => data.as_ref(),
            _ => None,
        }
    }

    /// Device state carried by a feed `data` event.
    pub fn device_state(&self) -> Option<&Value> {
        self.data()?.pointer("/data/devicesStatesUpdateFeed/item")
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

type Handler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
    tasks: Mutex<JoinSet<()>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`.
    ///
    /// A leading `on_` is stripped, so `"on_data"` and `"data"` are the same event.
    pub fn on<F, Fut>(&self, event: &str, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = event.strip_prefix("on_").unwrap_or(event).to_string();
        let handler: Handler =
            Arc::new(move |event| -> HandlerFuture { Box::pin(handler(event)) });

        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name)
            .or_default()
            .push(handler);
    }

    /// Start every listener of `event` as its own task.
    ///
    /// # Panics
    /// If called outside a tokio runtime while `event` has listeners.
    pub fn dispatch(&self, event: Event) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event.name())
            .cloned()
            .unwrap_or_default();

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(result) = tasks.try_join_next() {
            log_outcome(result);
        }

        if handlers.is_empty() {
            debug!(event = %event.name(), "No listeners");
            return;
        }

        for handler in handlers {
            let event = event.clone();
            tasks.spawn(async move {
                let name = event.name().to_string();
                if let Err(e) = handler(event).await {
                    error!(event = %name, error = ?e, "Listener failed");
                }
            });
        }
    }

    /// Wait until every dispatched listener has finished.
    pub async fn wait_idle(&self) {
        loop {
            let mut tasks =
                std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
            if tasks.is_empty() {
                return;
            }
            while let Some(result) = tasks.join_next().await {
                log_outcome(result);
            }
        }
    }

    /// Number of listener tasks not yet reaped.
    pub fn pending(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for EventDispatcher {
    // Listeners still running finish on their own
    fn drop(&mut self) {
        self.tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .detach_all();
    }
}

fn log_outcome(result: Result<(), JoinError>) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!(error = %e, "Listener panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn broken(_: Event) -> anyhow::Result<()> {
        anyhow::bail!("listener broke")
    }

    async fn explode(_: Event) -> anyhow::Result<()> {
        panic!("listener panicked")
    }

    #[tokio::test]
    async fn test_every_listener_runs() {
        let dispatcher = EventDispatcher::new();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            dispatcher.on("connected", move |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            });
        }

        dispatcher.dispatch(Event::Connected);
        dispatcher.wait_idle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_on_prefix_is_optional() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        dispatcher.on("on_data", move |event| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(event.data().cloned());
                anyhow::Ok(())
            }
        });

        dispatcher.dispatch(Event::Data(json!({ "n": 1 })));
        dispatcher.wait_idle().await;

        assert_eq!(*seen.lock().unwrap(), vec![Some(json!({ "n": 1 }))]);
    }

    #[tokio::test]
    async fn test_failing_listener_is_isolated() {
        let dispatcher = EventDispatcher::new();
        let calls = Arc::new(AtomicU32::new(0));

        dispatcher.on("connected", broken);
        dispatcher.on("connected", explode);
        {
            let calls = Arc::clone(&calls);
            dispatcher.on("connected", move |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            });
        }

        dispatcher.dispatch(Event::Connected);
        dispatcher.wait_idle().await;
        dispatcher.dispatch(Event::Connected);
        dispatcher.wait_idle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_finished_tasks_reaped_on_dispatch() {
        let dispatcher = EventDispatcher::new();
        dispatcher.on("data", |_| async { anyhow::Ok(()) });

        dispatcher.dispatch(Event::Data(Value::Null));
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        dispatcher.dispatch(Event::Data(Value::Null));
        assert_eq!(dispatcher.pending(), 1);
        dispatcher.wait_idle().await;
    }

    #[tokio::test]
    async fn test_dispatch_without_listeners() {
        let dispatcher = EventDispatcher::new();
        dispatcher.dispatch(Event::Custom {
            name: "unheard".into(),
            data: None,
        });
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_listeners_outlive_dispatcher() {
        let dispatcher = EventDispatcher::new();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let done_tx = Arc::new(Mutex::new(Some(done_tx)));

        dispatcher.on("connection_lost", move |_| {
            let done_tx = Arc::clone(&done_tx);
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                if let Some(tx) = done_tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
                anyhow::Ok(())
            }
        });

        dispatcher.dispatch(Event::ConnectionLost(ChannelError::ConnectionClosed));
        drop(dispatcher);

        // an aborted listener drops its sender without sending
        let completed = tokio::time::timeout(std::time::Duration::from_secs(5), done_rx)
            .await
            .unwrap();
        assert!(completed.is_ok());
    }

    #[test]
    #[should_panic]
    fn test_dispatch_outside_runtime_panics() {
        let dispatcher = EventDispatcher::new();
        dispatcher.on("connected", |_| async { anyhow::Ok(()) });
        dispatcher.dispatch(Event::Connected);
    }

    #[test]
    fn test_dispatch_outside_runtime_without_listeners() {
        let dispatcher = EventDispatcher::new();
        dispatcher.dispatch(Event::Connected);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn test_device_state() {
        let event = Event::Data(json!({
            "data": { "devicesStatesUpdateFeed": { "item": { "deviceId": "d1" } } }
        }));
        assert_eq!(event.device_state(), Some(&json!({ "deviceId": "d1" })));
        assert_eq!(Event::Connected.device_state(), None);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(Event::Connected.name(), "connected");
        assert_eq!(
            Event::ConnectionLost(ChannelError::ConnectionClosed).name(),
            "connection_lost"
        );
        assert_eq!(
            Event::Custom {
                name: "barrier_moved".into(),
                data: None
            }
            .name(),
            "barrier_moved"
        );
    }
}
