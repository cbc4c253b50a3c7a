//! `GET /api/sse` — live counter over Server-Sent Events.
//!
//! Each connection starts a driver that bumps the counter on a fixed
//! interval and forwards every change seen by the counter's key store.
//! Both stop when the client disconnects. All connections share one watch
//! loop through the key store.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::watch;

use super::{DemoState, counter_key};
use crate::error::Result;
use crate::http::Response;
use crate::kv::KvStore;
use crate::realtime::{EventSender, event_stream};
use crate::router::Router;

const EVENT_BUFFER: usize = 16;

pub(super) fn register(router: &mut Router, state: &Arc<DemoState>) {
    let state = Arc::clone(state);
    router.get("/api/sse", move |_ctx| {
        let state = Arc::clone(&state);
        Box::pin(async move { open_stream(&state).await })
    });
}

async fn open_stream(state: &DemoState) -> Result<Response> {
    tracing::info!("sse connection requested");
    let backend = state.store.backend();
    let key = counter_key();

    if backend.get(&key).await?.value.is_none() {
        backend.set(&key, Value::from(0)).await?;
        tracing::info!("initialized counter to 0");
    }

    let (events, response) = event_stream(EVENT_BUFFER);
    forward_changes(&state.store, events.clone()).await?;
    spawn_driver(Arc::clone(&state.store), events, state.sse_interval);
    Ok(response)
}

// Subscribes to the counter and relays the latest value to `events` until
// the client goes away. Values that arrive faster than the client reads
// are coalesced. The subscription is taken before `initialize` so another
// client leaving in between cannot stop the shared watch loop.
async fn forward_changes(store: &KvStore, events: EventSender) -> Result<()> {
    let counter = store.get_store::<i64>(&counter_key())?;
    let (latest, mut changes) = watch::channel(0_i64);
    let subscription = counter.subscribe(move |value: Option<&i64>| {
        latest.send_replace(value.copied().unwrap_or(0));
    });
    counter.initialize().await?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = events.closed() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let counter = *changes.borrow_and_update();
                    if events.send_json(&json!({ "counter": counter })).await.is_err() {
                        break;
                    }
                    tracing::debug!(counter, "sent sse message");
                }
            }
        }
        subscription.unsubscribe();
        tracing::info!("sse stream closed");
    });
    Ok(())
}

fn spawn_driver(store: Arc<KvStore>, events: EventSender, period: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        ticks.tick().await;
        loop {
            tokio::select! {
                () = events.closed() => break,
                _ = ticks.tick() => {
                    match store.backend().sum(&counter_key(), 1).await {
                        Ok(counter) => tracing::debug!(counter, "incremented counter"),
                        Err(e) => tracing::warn!(error = %e, "failed to increment counter"),
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::http::Body;
    use crate::kv::{KvBackend, MemoryKv};

    fn state(backend: &MemoryKv, interval_ms: u64) -> DemoState {
        DemoState {
            store: Arc::new(KvStore::new(Arc::new(backend.clone()))),
            sse_interval: Duration::from_millis(interval_ms),
        }
    }

    async fn next_event(rx: &mut tokio::sync::mpsc::Receiver<bytes::Bytes>) -> String {
        let chunk = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        String::from_utf8(chunk.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn stream_starts_at_zero_and_follows_the_driver() {
        let backend = MemoryKv::new();
        let response = open_stream(&state(&backend, 20)).await.unwrap();
        assert_eq!(response.headers().get("content-type"), Some("text/event-stream"));

        let Body::Stream(mut rx) = response.into_body() else {
            panic!("expected a streamed body");
        };
        assert_eq!(next_event(&mut rx).await, "data: {\"counter\":0}\n\n");
        let next = next_event(&mut rx).await;
        assert!(next.starts_with("data: {\"counter\":"), "{next}");
        assert_ne!(next, "data: {\"counter\":0}\n\n");
    }

    #[tokio::test]
    async fn existing_counter_is_not_reset() {
        let backend = MemoryKv::new();
        backend.set(&counter_key(), json!(41)).await.unwrap();
        let response = open_stream(&state(&backend, 60_000)).await.unwrap();
        let Body::Stream(mut rx) = response.into_body() else {
            panic!("expected a streamed body");
        };
        assert_eq!(next_event(&mut rx).await, "data: {\"counter\":41}\n\n");
    }

    #[tokio::test]
    async fn disconnect_stops_driver_and_watch() {
        let backend = MemoryKv::new();
        let state = state(&backend, 10);
        let response = open_stream(&state).await.unwrap();
        drop(response);

        timeout(Duration::from_secs(2), async {
            while backend.watcher_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let settled = backend.get(&counter_key()).await.unwrap().value;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.get(&counter_key()).await.unwrap().value, settled);
    }

    #[tokio::test]
    async fn remaining_client_keeps_streaming_after_another_leaves() {
        let backend = MemoryKv::new();
        let state = state(&backend, 20);
        let first = open_stream(&state).await.unwrap();
        let second = open_stream(&state).await.unwrap();
        drop(first);

        let counter = state.store.get_store::<i64>(&counter_key()).unwrap();
        timeout(Duration::from_secs(2), async {
            while counter.listener_count() > 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(counter.is_initialized());

        let Body::Stream(mut rx) = second.into_body() else {
            panic!("expected a streamed body");
        };
        let before = next_event(&mut rx).await;
        let mut later = next_event(&mut rx).await;
        for _ in 0..16 {
            if later != before {
                break;
            }
            later = next_event(&mut rx).await;
        }
        assert_ne!(later, before);
    }

    #[tokio::test]
    async fn closed_backend_fails_the_request() {
        let backend = MemoryKv::new();
        backend.close().await;
        assert!(open_stream(&state(&backend, 20)).await.is_err());
    }
}
