// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fan-out of store changes to live viewers.
//!
//! Each subscriber is an unbounded channel drained by its own connection task, so publishing
//! never waits on a slow viewer. The registry is guarded by one mutex; a publish holds it for
//! the whole pass, so a concurrent unsubscribe either happens before or after the pass and never
//! invalidates the iteration.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::trace_store::TraceRecord;

pub const WELCOME_MESSAGE: &str = "Connected to TraceKit Local UI";

/// Notifications sent over the live channel, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    Connected { message: String },
    NewTrace { trace: TraceRecord },
    TracesCleared,
}

impl LiveEvent {
    pub fn connected() -> Self {
        LiveEvent::Connected {
            message: WELCOME_MESSAGE.to_string(),
        }
    }
}

/// What a subscriber's connection task receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A serialized [`LiveEvent`].
    Text(Arc<str>),
    /// The broadcaster is shutting down; the connection should close.
    Close,
}

pub type SubscriberId = u64;

/// A registered subscriber's receiving end.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub frames: UnboundedReceiver<Frame>,
}

#[derive(Debug, Default)]
struct Registry {
    subscribers: HashMap<SubscriberId, UnboundedSender<Frame>>,
    next_id: SubscriberId,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct Broadcaster {
    registry: Mutex<Registry>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber and queues the `connected` welcome for it alone. Returns `None`
    /// once the broadcaster has been closed.
    pub async fn subscribe(&self) -> Option<Subscription> {
        let welcome = match serialize(&LiveEvent::connected()) {
            Some(welcome) => welcome,
            None => return None,
        };

        let mut registry = self.registry.lock().await;
        if registry.closed {
            return None;
        }
        let (tx, frames) = mpsc::unbounded_channel();
        // the receiver is still in hand, so this cannot fail
        let _ = tx.send(Frame::Text(welcome));

        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.insert(id, tx);
        debug!("Live subscriber {id} connected");
        Some(Subscription { id, frames })
    }

    /// Removes a subscriber. Returns whether it was still registered; repeated calls are
    /// harmless.
    pub async fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.registry.lock().await.subscribers.remove(&id).is_some();
        if removed {
            debug!("Live subscriber {id} disconnected");
        }
        removed
    }

    /// Serializes `event` once and queues it for every registered subscriber. Subscribers whose
    /// receiving end is gone are dropped from the registry. Returns the number of subscribers the
    /// event was delivered to; after [`Broadcaster::close`] this is always 0.
    pub async fn publish(&self, event: &LiveEvent) -> usize {
        let Some(payload) = serialize(event) else {
            return 0;
        };

        let mut registry = self.registry.lock().await;
        if registry.closed {
            return 0;
        }

        let mut delivered = 0;
        registry.subscribers.retain(|id, tx| {
            if tx.send(Frame::Text(Arc::clone(&payload))).is_ok() {
                delivered += 1;
                true
            } else {
                warn!("Dropping live subscriber {id}: connection is gone");
                false
            }
        });
        delivered
    }

    /// Tells every subscriber to close, forgets them, and refuses new subscriptions. Publishing
    /// afterwards is a no-op.
    pub async fn close(&self) {
        let mut registry = self.registry.lock().await;
        registry.closed = true;
        for (_, tx) in registry.subscribers.drain() {
            let _ = tx.send(Frame::Close);
        }
        debug!("Live broadcaster closed");
    }

    pub async fn is_closed(&self) -> bool {
        self.registry.lock().await.closed
    }

    pub async fn subscriber_count(&self) -> usize {
        self.registry.lock().await.subscribers.len()
    }
}

fn serialize(event: &LiveEvent) -> Option<Arc<str>> {
    match serde_json::to_string(event) {
        Ok(payload) => Some(payload.into()),
        Err(err) => {
            error!("Failed to serialize live event: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    fn parse(frame: Frame) -> Value {
        match frame {
            Frame::Text(text) => serde_json::from_str(&text).unwrap(),
            Frame::Close => panic!("expected a text frame"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_sends_welcome_only_to_new_subscriber() {
        let broadcaster = Broadcaster::new();
        let mut first = broadcaster.subscribe().await.unwrap();
        assert_eq!(
            parse(first.frames.try_recv().unwrap()),
            json!({ "type": "connected", "message": "Connected to TraceKit Local UI" })
        );

        let mut second = broadcaster.subscribe().await.unwrap();
        assert_ne!(first.id, second.id);
        assert!(first.frames.try_recv().is_err());
        assert_eq!(parse(second.frames.try_recv().unwrap())["type"], json!("connected"));
        assert_eq!(broadcaster.subscriber_count().await, 2);
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber_once() {
        let broadcaster = Broadcaster::new();
        let mut a = broadcaster.subscribe().await.unwrap();
        let mut b = broadcaster.subscribe().await.unwrap();
        a.frames.try_recv().unwrap();
        b.frames.try_recv().unwrap();

        assert_eq!(broadcaster.publish(&LiveEvent::TracesCleared).await, 2);

        for sub in [&mut a, &mut b] {
            assert_eq!(
                parse(sub.frames.try_recv().unwrap()),
                json!({ "type": "traces_cleared" })
            );
            assert!(sub.frames.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_unsubscribed_viewer_receives_nothing() {
        let broadcaster = Broadcaster::new();
        let mut gone = broadcaster.subscribe().await.unwrap();
        let mut staying = broadcaster.subscribe().await.unwrap();
        gone.frames.try_recv().unwrap();
        staying.frames.try_recv().unwrap();

        assert!(broadcaster.unsubscribe(gone.id).await);
        assert!(!broadcaster.unsubscribe(gone.id).await);

        assert_eq!(broadcaster.publish(&LiveEvent::TracesCleared).await, 1);
        assert!(gone.frames.try_recv().is_err());
        assert!(staying.frames.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned_without_failing_publish() {
        let broadcaster = Broadcaster::new();
        let dropped = broadcaster.subscribe().await.unwrap();
        let dropped_id = dropped.id;
        drop(dropped);
        let mut alive = broadcaster.subscribe().await.unwrap();
        alive.frames.try_recv().unwrap();

        assert_eq!(broadcaster.publish(&LiveEvent::TracesCleared).await, 1);
        assert_eq!(broadcaster.subscriber_count().await, 1);
        assert!(alive.frames.try_recv().is_ok());
        // erroring after the registry already forgot the subscriber is fine
        assert!(!broadcaster.unsubscribe(dropped_id).await);
    }

    #[tokio::test]
    async fn test_close_notifies_and_disables() {
        let broadcaster = Broadcaster::new();
        let mut sub = broadcaster.subscribe().await.unwrap();
        sub.frames.try_recv().unwrap();

        broadcaster.close().await;
        assert!(broadcaster.is_closed().await);
        assert_eq!(sub.frames.try_recv().unwrap(), Frame::Close);
        // sender was dropped with the registry entry
        assert!(sub.frames.recv().await.is_none());

        assert_eq!(broadcaster.publish(&LiveEvent::TracesCleared).await, 0);
        assert!(broadcaster.subscribe().await.is_none());
        assert_eq!(broadcaster.subscriber_count().await, 0);

        // closing twice is harmless
        broadcaster.close().await;
    }
}
