// src/core/events.rs

//! Typed publish/subscribe backbone connecting the agents.
//!
//! The topic set is closed: every event is one variant of [`Event`], and a
//! handler is registered against the payload type of exactly one topic, so a
//! `TcpPort` handler can only ever receive a `(port, host)` pair.
//!
//! Dispatch never blocks the publisher. Each matched handler runs as its own
//! tokio task. The bus keeps a count of dispatched-but-unfinished handler
//! invocations; the count is raised inside `publish` before it returns, so a
//! handler that publishes downstream work keeps the bus busy without any gap.

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumIter};
use tokio::sync::watch;
use tracing::trace;

/// Names of the fixed topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumIter)]
pub enum Topic {
    #[strum(serialize = "session:start")]
    SessionStart,
    #[strum(serialize = "session:end")]
    SessionEnd,
    #[strum(serialize = "host")]
    Host,
    #[strum(serialize = "port:tcp")]
    TcpPort,
    #[strum(serialize = "url")]
    Url,
    #[strum(serialize = "url:responsive")]
    UrlResponsive,
}

/// Pipeline seeding has begun.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStart;

/// Pipeline has quiesced; teardown may run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnd;

/// Bare host submitted for port scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub host: String,
}

/// Open TCP port found on a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpPort {
    pub port: u16,
    pub host: String,
}

/// Candidate HTTP(S) endpoint to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub url: String,
}

/// Endpoint answered and a page exists for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlResponsive {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    SessionStart(SessionStart),
    SessionEnd(SessionEnd),
    Host(Host),
    TcpPort(TcpPort),
    Url(Url),
    UrlResponsive(UrlResponsive),
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::SessionStart(_) => Topic::SessionStart,
            Event::SessionEnd(_) => Topic::SessionEnd,
            Event::Host(_) => Topic::Host,
            Event::TcpPort(_) => Topic::TcpPort,
            Event::Url(_) => Topic::Url,
            Event::UrlResponsive(_) => Topic::UrlResponsive,
        }
    }
}

/// A payload type bound to exactly one topic.
pub trait Payload: Sized + Send + 'static {
    const TOPIC: Topic;

    fn into_event(self) -> Event;

    fn from_event(event: Event) -> Option<Self>;
}

macro_rules! payload {
    ($($ty:ident),* $(,)?) => {
        $(
            impl Payload for $ty {
                const TOPIC: Topic = Topic::$ty;

                fn into_event(self) -> Event {
                    Event::$ty(self)
                }

                fn from_event(event: Event) -> Option<Self> {
                    match event {
                        Event::$ty(payload) => Some(payload),
                        _ => None,
                    }
                }
            }

            impl From<$ty> for Event {
                fn from(payload: $ty) -> Self {
                    payload.into_event()
                }
            }
        )*
    };
}

payload!(SessionStart, SessionEnd, Host, TcpPort, Url, UrlResponsive);

type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Marks one dispatched handler invocation; dropping it (normally or during
/// a panic unwind) marks the invocation finished.
struct InFlight {
    counter: Arc<watch::Sender<usize>>,
}

impl InFlight {
    fn enter(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self {
            counter: counter.clone(),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.counter.send_modify(|n| *n = n.saturating_sub(1));
    }
}

pub struct EventBus {
    handlers: RwLock<HashMap<Topic, Vec<Handler>>>,
    in_flight: Arc<watch::Sender<usize>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (in_flight, _) = watch::channel(0usize);
        Self {
            handlers: RwLock::new(HashMap::new()),
            in_flight: Arc::new(in_flight),
        }
    }

    /// Registers `handler` for the topic of payload type `P`.
    pub fn subscribe<P, F, Fut>(&self, handler: F)
    where
        P: Payload,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| match P::from_event(event) {
            Some(payload) => handler(payload).boxed(),
            None => futures::future::ready(()).boxed(),
        });
        self.handlers
            .write()
            .entry(P::TOPIC)
            .or_default()
            .push(handler);
    }

    /// Publishes `payload` to every handler of its topic and returns at once.
    ///
    /// Must be called from within a tokio runtime.
    pub fn publish(&self, payload: impl Into<Event>) {
        let event = payload.into();
        let topic = event.topic();
        let handlers = self
            .handlers
            .read()
            .get(&topic)
            .cloned()
            .unwrap_or_default();

        trace!(%topic, handlers = handlers.len(), "Dispatching event.");
        for handler in handlers {
            let guard = InFlight::enter(&self.in_flight);
            let invocation = handler(event.clone());
            tokio::spawn(async move {
                let _guard = guard;
                invocation.await;
            });
        }
    }

    /// Number of dispatched handler invocations that have not returned yet.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Waits until every dispatched handler invocation has returned.
    pub async fn wait_idle(&self) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.handlers.read().get(&topic).map_or(0, Vec::len)
    }

    /// Drops every registration, releasing whatever the handlers captured.
    pub fn clear(&self) {
        self.handlers.write().clear();
    }
}
