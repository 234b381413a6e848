// =============================================================================
// Event Bus - typed topic pub/sub with synchronous dispatch
// =============================================================================
//
// The bus is the only inter-component coupling in the pipeline. Topics are
// typed at compile time via `Topic<P>` constants (see `topics.rs`), so a
// publish/subscribe pair on the same topic always agrees on the payload type.
//
// Dispatch contract:
//   - Handlers run synchronously inside `publish`, in registration order.
//   - A handler returning Err is logged and the remaining handlers still run.
//   - Dispatch is re-entrant: a handler may publish, and the nested publish
//     completes before the outer one resumes. The subscriber list is
//     snapshotted before dispatch, so handlers may also (un)subscribe.
//
// No persistence, no cross-process fan-out.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, warn};

// =============================================================================
// Topic
// =============================================================================

/// A typed topic key. The payload type is part of the key, so a topic name can
/// only ever be used with one payload type (enforced by the constants in
/// `topics.rs`).
pub struct Topic<P> {
    name: &'static str,
    _payload: PhantomData<fn(P)>,
}

impl<P> Topic<P> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<P> Clone for Topic<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for Topic<P> {}

impl<P> std::fmt::Debug for Topic<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Topic({})", self.name)
    }
}

// =============================================================================
// EventBus
// =============================================================================

/// Boxed handler for payload type `P`. Errors are contained by the bus.
type Handler<P> = Arc<dyn Fn(&P) -> anyhow::Result<()> + Send + Sync>;

/// Type-erased handler slot; downcast back to `HandlerSlot<P>` at dispatch.
struct HandlerSlot<P: 'static>(Handler<P>);

struct Subscriber {
    id: u64,
    slot: Arc<dyn Any + Send + Sync>,
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId {
    topic: &'static str,
    id: u64,
}

/// In-process typed topic broker.
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<&'static str, Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` for `topic`. Handlers run in registration order.
    pub fn subscribe<P: 'static>(
        &self,
        topic: Topic<P>,
        handler: impl Fn(&P) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler<P> = Arc::new(handler);
        let subscriber = Subscriber {
            id,
            slot: Arc::new(HandlerSlot(handler)),
        };

        self.subscribers
            .write()
            .entry(topic.name())
            .or_default()
            .push(subscriber);

        SubscriptionId {
            topic: topic.name(),
            id,
        }
    }

    /// Remove a previously registered handler. Unknown ids are ignored.
    pub fn unsubscribe(&self, subscription: SubscriptionId) {
        let mut map = self.subscribers.write();
        if let Some(list) = map.get_mut(subscription.topic) {
            list.retain(|s| s.id != subscription.id);
            if list.is_empty() {
                map.remove(subscription.topic);
            }
        }
    }

    /// Invoke all current handlers for `topic` with `payload`.
    ///
    /// The subscriber list is snapshotted before dispatch and the registry
    /// lock is released, so handlers may publish or (un)subscribe freely.
    pub fn publish<P: 'static>(&self, topic: Topic<P>, payload: &P) {
        let handlers: Vec<Handler<P>> = {
            let map = self.subscribers.read();
            match map.get(topic.name()) {
                Some(list) => list
                    .iter()
                    .filter_map(|s| {
                        let slot = s.slot.downcast_ref::<HandlerSlot<P>>();
                        if slot.is_none() {
                            // Only reachable if two Topic constants share a
                            // name with different payload types.
                            warn!(topic = topic.name(), "subscriber payload type mismatch");
                        }
                        slot.map(|h| Arc::clone(&h.0))
                    })
                    .collect(),
                None => return,
            }
        };

        for handler in handlers {
            if let Err(e) = handler(payload) {
                error!(topic = topic.name(), error = %e, "bus handler failed");
            }
        }
    }

    /// Number of handlers currently registered for `topic`.
    pub fn subscriber_count<P>(&self, topic: Topic<P>) -> usize {
        self.subscribers
            .read()
            .get(topic.name())
            .map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self.subscribers.read().len();
        write!(f, "EventBus({topics} topics)")
    }
}
