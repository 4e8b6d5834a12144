//! Server-sent event stream of cloud lifecycle events.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use nimbus_cloud::{CloudManager, EventBus};
use nimbus_core::CloudEvent;
use tokio::sync::mpsc;
use tokio_stream::Stream;

/// How many ring-buffered events are replayed to a new subscriber.
const REPLAY_LIMIT: usize = 20;

/// A bus subscription rendered as SSE frames. Unsubscribes when the client
/// goes away and the stream is dropped.
pub(super) struct EventStream {
    bus: Arc<EventBus>,
    subscription_id: String,
    replay: VecDeque<CloudEvent>,
    rx: mpsc::Receiver<CloudEvent>,
}

impl Stream for EventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(event) = this.replay.pop_front() {
            return Poll::Ready(Some(Ok(to_sse(&event))));
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(to_sse(&event)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.subscription_id);
    }
}

fn to_sse(event: &CloudEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default()
        .event(event.event_type.clone())
        .id(event.id.clone())
        .data(data)
}

/// GET /api/v1/cloud/events
pub(super) async fn stream_events(
    State(manager): State<Arc<CloudManager>>,
) -> Sse<EventStream> {
    let bus = manager.events();
    let replay: VecDeque<CloudEvent> = bus.recent(REPLAY_LIMIT).into();
    let (subscription_id, rx) = bus.subscribe();

    Sse::new(EventStream {
        bus,
        subscription_id,
        replay,
        rx,
    })
    .keep_alive(KeepAlive::new().interval(Duration::from_secs(30)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn stream_replays_then_follows_live_events() {
        let bus = Arc::new(EventBus::new(50));
        bus.emit("instance.requested", "i-1", None);
        bus.emit("instance.provisioning", "i-1", None);

        let replay: VecDeque<CloudEvent> = bus.recent(REPLAY_LIMIT).into();
        let (subscription_id, rx) = bus.subscribe();
        let mut stream = EventStream {
            bus: bus.clone(),
            subscription_id,
            replay,
            rx,
        };

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_some());

        bus.emit("instance.running", "i-1", None);
        assert!(stream.next().await.is_some());
    }

    #[tokio::test]
    async fn dropping_the_stream_unsubscribes() {
        let bus = Arc::new(EventBus::new(50));
        let (subscription_id, rx) = bus.subscribe();
        let stream = EventStream {
            bus: bus.clone(),
            subscription_id,
            replay: VecDeque::new(),
            rx,
        };
        drop(stream);

        // A fresh subscriber still works; the dropped one is gone from the
        // registry so publishing does not hang or error.
        let (_id, mut rx) = bus.subscribe();
        bus.emit("instance.running", "i-1", None);
        assert!(rx.recv().await.is_some());
    }
}
