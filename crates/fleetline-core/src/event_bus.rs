use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use fleetline_types::Event;
use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Subscribers implement this to receive dispatched events. A handler
/// returning an error is isolated: it is logged and counted, and never
/// affects other handlers or the publisher (§4.A, invariant 2).
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

const WILDCARD: &str = "*";

#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub total_events_published: u64,
    pub total_handler_errors: u64,
    pub error_rate: f64,
    pub subscriber_counts: HashMap<String, usize>,
}

struct Subscription {
    id: Uuid,
    handler: Arc<dyn EventHandler>,
}

/// A strict FIFO ticket lock for one session's dispatches. `take_ticket`
/// is synchronous so a publisher reserves its place in line before it
/// returns (or before its spawned dispatch task is ever polled) — the
/// ordering is fixed at call time, not at schedule time.
struct SessionQueue {
    next_ticket: AtomicU64,
    now_serving: AtomicU64,
    notify: Notify,
}

impl SessionQueue {
    fn new() -> Self {
        Self {
            next_ticket: AtomicU64::new(0),
            now_serving: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    fn take_ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::SeqCst)
    }

    async fn wait_for_turn(&self, ticket: u64) {
        while self.now_serving.load(Ordering::SeqCst) != ticket {
            self.notify.notified().await;
        }
    }

    fn advance(&self) {
        self.now_serving.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// In-process publish/subscribe spine every other subsystem attaches to.
/// Every handler registered for `event.event_type` (plus every wildcard
/// handler) is delivered exactly once per publish. Within one `session_id`,
/// dispatches are strictly FIFO regardless of call mix: both `publish` and
/// `publish_and_wait` take a ticket from the session's `SessionQueue`
/// *synchronously*, before the dispatch itself ever runs, so a
/// fire-and-forget `publish` issued before a later `publish_and_wait` is
/// guaranteed to dispatch first even though `publish`'s own work happens on
/// a spawned task that may not be polled yet (Open Question 1).
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<Subscription>>>,
    session_queues: StdMutex<HashMap<String, Arc<SessionQueue>>>,
    event_count: AtomicU64,
    error_count: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            session_queues: StdMutex::new(HashMap::new()),
            event_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    pub async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> Uuid {
        let id = Uuid::new_v4();
        let mut subs = self.subscribers.write().await;
        subs.entry(event_type.to_string())
            .or_default()
            .push(Subscription { id, handler: handler.clone() });
        debug!(event_type, handler = handler.name(), "subscribed");
        id
    }

    pub async fn unsubscribe(&self, event_type: &str, id: Uuid) -> bool {
        let mut subs = self.subscribers.write().await;
        if let Some(list) = subs.get_mut(event_type) {
            let before = list.len();
            list.retain(|s| s.id != id);
            return list.len() != before;
        }
        false
    }

    fn session_queue_for(&self, session_id: &str) -> Arc<SessionQueue> {
        let mut queues = self.session_queues.lock().unwrap();
        queues
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionQueue::new()))
            .clone()
    }

    /// Fire-and-forget: reserves this event's FIFO ticket synchronously,
    /// then spawns the actual dispatch so the publisher is never suspended
    /// by publishing.
    pub fn publish(self: &Arc<Self>, event: Event) {
        let bus = Arc::clone(self);
        let queue = bus.session_queue_for(&event.session_id);
        let ticket = queue.take_ticket();
        tokio::spawn(async move {
            queue.wait_for_turn(ticket).await;
            bus.dispatch(event).await;
            queue.advance();
        });
    }

    /// Reserves this event's FIFO ticket synchronously, then awaits its
    /// turn and delivery to every handler before returning.
    pub async fn publish_and_wait(&self, event: Event) {
        let queue = self.session_queue_for(&event.session_id);
        let ticket = queue.take_ticket();
        queue.wait_for_turn(ticket).await;
        self.dispatch(event).await;
        queue.advance();
    }

    async fn dispatch(&self, event: Event) {
        self.event_count.fetch_add(1, Ordering::Relaxed);

        let handlers = {
            let subs = self.subscribers.read().await;
            let mut handlers: Vec<Arc<dyn EventHandler>> = Vec::new();
            if let Some(specific) = subs.get(&event.event_type) {
                handlers.extend(specific.iter().map(|s| s.handler.clone()));
            }
            if let Some(wildcard) = subs.get(WILDCARD) {
                handlers.extend(wildcard.iter().map(|s| s.handler.clone()));
            }
            handlers
        };

        if handlers.is_empty() {
            debug!(event_type = %event.event_type, "no subscribers");
            return;
        }

        let start = std::time::Instant::now();
        let results = futures::future::join_all(
            handlers.into_iter().map(|h| {
                let event = event.clone();
                async move { (h.name().to_string(), h.handle(&event).await) }
            }),
        )
        .await;

        for (name, result) in results {
            if let Err(err) = result {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                warn!(handler = %name, event_type = %event.event_type, error = %err, "handler failed");
            }
        }

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        if elapsed_ms > 5.0 {
            warn!(event_type = %event.event_type, elapsed_ms, "dispatch exceeded 5ms budget");
        }
    }

    pub async fn stats(&self) -> BusStats {
        let subs = self.subscribers.read().await;
        let subscriber_counts = subs.iter().map(|(k, v)| (k.clone(), v.len())).collect();
        let events = self.event_count.load(Ordering::Relaxed);
        let errors = self.error_count.load(Ordering::Relaxed);
        BusStats {
            total_events_published: events,
            total_handler_errors: errors,
            error_rate: errors as f64 / events.max(1) as f64,
            subscriber_counts,
        }
    }

    pub async fn clear(&self) {
        self.subscribers.write().await.clear();
        self.session_queues.lock().unwrap().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        name: String,
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        fn name(&self) -> &str {
            &self.name
        }
        async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl EventHandler for FailingHandler {
        fn name(&self) -> &str {
            "failing"
        }
        async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    struct OrderHandler {
        order: Arc<StdMutex<Vec<String>>>,
        delay_first: bool,
    }

    #[async_trait]
    impl EventHandler for OrderHandler {
        fn name(&self) -> &str {
            "order"
        }
        async fn handle(&self, event: &Event) -> anyhow::Result<()> {
            if self.delay_first && event.event_type == "agent.invoked" {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
            self.order.lock().unwrap().push(event.event_type.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn two_subscriber_fan_out() {
        let bus = EventBus::new();
        let c1 = Arc::new(AtomicUsize::new(0));
        let c2 = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "agent.invoked",
            Arc::new(CountingHandler { name: "h1".into(), count: c1.clone() }),
        )
        .await;
        bus.subscribe(
            "agent.invoked",
            Arc::new(CountingHandler { name: "h2".into(), count: c2.clone() }),
        )
        .await;

        let event = Event::new("agent.invoked", "s1", Map::new()).unwrap();
        bus.publish_and_wait(event).await;

        assert_eq!(c1.load(Ordering::SeqCst), 1);
        assert_eq!(c2.load(Ordering::SeqCst), 1);
        let stats = bus.stats().await;
        assert_eq!(stats.total_events_published, 1);
        assert_eq!(stats.total_handler_errors, 0);
    }

    #[tokio::test]
    async fn handler_error_is_isolated() {
        let bus = EventBus::new();
        let c1 = Arc::new(AtomicUsize::new(0));
        bus.subscribe("agent.invoked", Arc::new(FailingHandler)).await;
        bus.subscribe(
            "agent.invoked",
            Arc::new(CountingHandler { name: "h1".into(), count: c1.clone() }),
        )
        .await;

        let event = Event::new("agent.invoked", "s1", Map::new()).unwrap();
        bus.publish_and_wait(event).await;

        assert_eq!(c1.load(Ordering::SeqCst), 1);
        let stats = bus.stats().await;
        assert_eq!(stats.total_handler_errors, 1);
    }

    #[tokio::test]
    async fn no_subscribers_is_not_an_error() {
        let bus = EventBus::new();
        let event = Event::new("agent.invoked", "s1", Map::new()).unwrap();
        bus.publish_and_wait(event).await;
        let stats = bus.stats().await;
        assert_eq!(stats.total_events_published, 1);
    }

    #[tokio::test]
    async fn wildcard_subscriber_receives_every_event() {
        let bus = EventBus::new();
        let c1 = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            WILDCARD,
            Arc::new(CountingHandler { name: "logger".into(), count: c1.clone() }),
        )
        .await;

        bus.publish_and_wait(Event::new("agent.invoked", "s1", Map::new()).unwrap())
            .await;
        bus.publish_and_wait(Event::new("tool.used", "s1", Map::new()).unwrap())
            .await;

        assert_eq!(c1.load(Ordering::SeqCst), 2);
    }

    /// A fire-and-forget `publish` issued before a `publish_and_wait` call
    /// on the same session must still be fully delivered first, even when
    /// its own handler is slower than the waiter's dispatch.
    #[tokio::test]
    async fn publish_before_publish_and_wait_preserves_fifo_order() {
        let bus = Arc::new(EventBus::new());
        let order = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe(
            WILDCARD,
            Arc::new(OrderHandler { order: order.clone(), delay_first: true }),
        )
        .await;

        bus.publish(Event::new("agent.invoked", "s1", Map::new()).unwrap());
        bus.publish_and_wait(Event::new("agent.completed", "s1", Map::new()).unwrap())
            .await;

        assert_eq!(
            *order.lock().unwrap(),
            vec!["agent.invoked".to_string(), "agent.completed".to_string()]
        );
    }

    #[tokio::test]
    async fn different_sessions_do_not_block_each_other() {
        let bus = Arc::new(EventBus::new());
        let order = Arc::new(StdMutex::new(Vec::new()));
        bus.subscribe(
            WILDCARD,
            Arc::new(OrderHandler { order: order.clone(), delay_first: false }),
        )
        .await;

        bus.publish_and_wait(Event::new("agent.invoked", "s1", Map::new()).unwrap())
            .await;
        bus.publish_and_wait(Event::new("agent.invoked", "s2", Map::new()).unwrap())
            .await;

        assert_eq!(order.lock().unwrap().len(), 2);
    }
}
