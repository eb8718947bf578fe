//! Live traffic stream: fan-out of access-log events to SSE subscribers.
//!
//! Each open `GET /dashboard/stream` connection registers an unbounded
//! channel in a `DashMap`, which tolerates the broadcast iterating while
//! viewers connect and disconnect concurrently. The first SSE frame is a
//! comment — an `EventSource` ignores it, but it commits the response
//! headers so the browser reaches the "open" state instead of looping
//! through reconnects.

use axum::response::sse::{Event, KeepAlive, Sse};
use dashmap::DashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::access_log::AccessLogEvent;

/// Registry of all open live-stream subscriptions.
#[derive(Default)]
pub struct SseRegistry {
    subscribers: DashMap<Uuid, mpsc::UnboundedSender<AccessLogEvent>>,
}

impl SseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new subscription. The connection has no server-side
    /// timeout; it stays registered until the returned stream is dropped
    /// (peer disconnect) or a send fails.
    pub fn register(self: &Arc<Self>) -> EventStream {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(id, tx);
        debug!(subscriber = %id, subscribers = self.subscribers.len(), "live stream subscriber connected");
        EventStream {
            id,
            rx,
            registry: Arc::clone(self),
            opened: false,
        }
    }

    /// Send an event to every connected subscriber. Subscribers whose
    /// channel is gone are dropped silently; the rest still receive the
    /// event.
    pub fn broadcast(&self, event: &AccessLogEvent) {
        let mut disconnected = Vec::new();
        for entry in self.subscribers.iter() {
            if entry.value().send(event.clone()).is_err() {
                disconnected.push(*entry.key());
            }
        }
        for id in disconnected {
            self.subscribers.remove(&id);
            debug!(subscriber = %id, "removed disconnected live stream subscriber");
        }
    }

    /// Number of currently connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn unregister(&self, id: Uuid) {
        self.subscribers.remove(&id);
        debug!(subscriber = %id, subscribers = self.subscribers.len(), "live stream subscriber disconnected");
    }
}

/// One subscriber's SSE frame stream.
///
/// Yields the connection-established comment first, then every broadcast
/// event as a JSON `data:` frame. Dropping the stream (the transport
/// closed) unregisters the subscriber.
pub struct EventStream {
    id: Uuid,
    rx: mpsc::UnboundedReceiver<AccessLogEvent>,
    registry: Arc<SseRegistry>,
    opened: bool,
}

impl futures_util::Stream for EventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if !self.opened {
            self.opened = true;
            return Poll::Ready(Some(Ok(Event::default().comment("connected"))));
        }

        loop {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(event)) => match Event::default().json_data(&event) {
                    Ok(frame) => return Poll::Ready(Some(Ok(frame))),
                    Err(e) => {
                        warn!(error = %e, "skipping unserializable live stream event");
                        continue;
                    }
                },
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

/// `GET /dashboard/stream` — server-sent events for the live traffic view.
pub fn sse_response(registry: &Arc<SseRegistry>) -> Sse<EventStream> {
    Sse::new(registry.register()).keep_alive(KeepAlive::default())
}
