use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::notification_registry::NotificationRegistry;
use crate::application::ports::{EventSourcePort, SourceCallback, Subscription};
use crate::domain::{
    errors::DomainResult,
    notification::{Notification, SourceEvent},
};

const DEDUP_WINDOW: usize = 256;

/// Bounded memory of recently broadcast ids.
struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// False if `id` is already remembered.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

/// Carries pushes from the event source's own thread onto the runtime.
///
/// The source callback does nothing but enqueue; a single drain task turns
/// events into notifications and broadcasts them in arrival order.
pub struct NotificationBridge {
    subscription: Box<dyn Subscription>,
    drain: JoinHandle<()>,
}

impl NotificationBridge {
    pub fn start(
        source: &dyn EventSourcePort,
        path: &str,
        registry: Arc<NotificationRegistry>,
    ) -> DomainResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<SourceEvent>();
        let callback: SourceCallback = Box::new(move |event| {
            if tx.send(event).is_err() {
                warn!("notification bridge stopped; dropping pushed event");
            }
        });
        let subscription = source.subscribe(path, callback)?;
        let drain = tokio::spawn(drain(rx, registry));
        info!(path, "notification bridge started");
        Ok(Self { subscription, drain })
    }

    pub async fn stop(mut self) {
        self.subscription.unsubscribe();
        self.drain.abort();
        let _ = self.drain.await;
        info!("notification bridge stopped");
    }
}

async fn drain(mut events: mpsc::UnboundedReceiver<SourceEvent>, registry: Arc<NotificationRegistry>) {
    let mut recent = RecentIds::new(DEDUP_WINDOW);
    while let Some(event) = events.recv().await {
        let Some(notification) = Notification::from_source(&event, Utc::now()) else {
            debug!(path = %event.path, event_type = %event.event_type, "source event ignored");
            continue;
        };
        if !recent.insert(&notification.id) {
            debug!(id = %notification.id, "duplicate notification dropped");
            continue;
        }
        registry.broadcast(&notification).await;
    }
    debug!("event source channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::lock_unpoisoned;
    use crate::application::notification_registry::testing::{RecordingSink, SinkMode};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct ManualSource {
        callback: Mutex<Option<SourceCallback>>,
        unsubscribed: Arc<AtomicBool>,
    }

    struct ManualSubscription(Arc<AtomicBool>);

    impl Subscription for ManualSubscription {
        fn unsubscribe(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl EventSourcePort for ManualSource {
        fn subscribe(&self, _path: &str, callback: SourceCallback) -> DomainResult<Box<dyn Subscription>> {
            *lock_unpoisoned(&self.callback) = Some(callback);
            Ok(Box::new(ManualSubscription(self.unsubscribed.clone())))
        }
    }

    fn put(path: &str, data: serde_json::Value) -> SourceEvent {
        SourceEvent { path: path.into(), data, event_type: "put".into() }
    }

    /// Fires events from a plain OS thread, the way the real source does.
    fn push_from_foreign_thread(source: Arc<ManualSource>, events: Vec<SourceEvent>) {
        std::thread::spawn(move || {
            let callback = lock_unpoisoned(&source.callback);
            let callback = callback.as_ref().expect("subscribed");
            for event in events {
                callback(event);
            }
        })
        .join()
        .expect("foreign thread");
    }

    async fn wait_for_texts(texts: &Arc<Mutex<Vec<String>>>, n: usize) -> Vec<String> {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if lock_unpoisoned(texts).len() >= n {
                    return lock_unpoisoned(texts).clone();
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("notifications arrived")
    }

    #[tokio::test]
    async fn foreign_pushes_arrive_in_order_without_duplicates() {
        let registry = NotificationRegistry::new(Duration::from_secs(1));
        let sink = RecordingSink::new(SinkMode::Healthy);
        let texts = sink.texts.clone();
        registry.register(Box::new(sink)).await.ok().expect("register");

        let source = Arc::new(ManualSource::default());
        let bridge = NotificationBridge::start(source.as_ref(), "notifications", registry.clone()).expect("start");

        push_from_foreign_thread(
            source.clone(),
            vec![
                put("/", json!({"-N0": {"class": "fall"}})),
                put("/-N1", json!({"seq": 1})),
                SourceEvent { path: "/-N1".into(), data: json!({"seq": 9}), event_type: "patch".into() },
                put("/-N2", serde_json::Value::Null),
                put("/-N3", json!({"seq": 3})),
                put("/-N1", json!({"seq": 1})),
                put("/-N4", json!({"seq": 4})),
            ],
        );

        let sent = wait_for_texts(&texts, 3).await;
        let ids: Vec<String> = sent
            .iter()
            .map(|t| serde_json::from_str::<serde_json::Value>(t).expect("json")["id"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(ids, vec!["-N1", "-N3", "-N4"]);

        bridge.stop().await;
        assert!(source.unsubscribed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn pushes_after_stop_are_dropped_quietly() {
        let registry = NotificationRegistry::new(Duration::from_secs(1));
        let source = Arc::new(ManualSource::default());
        let bridge = NotificationBridge::start(source.as_ref(), "notifications", registry).expect("start");
        bridge.stop().await;
        push_from_foreign_thread(source, vec![put("/-N9", json!({}))]);
    }

    #[test]
    fn recent_ids_forget_the_oldest() {
        let mut recent = RecentIds::new(2);
        assert!(recent.insert("a"));
        assert!(recent.insert("b"));
        assert!(!recent.insert("a"));
        assert!(recent.insert("c"));
        assert!(recent.insert("a"), "a aged out");
    }
}
