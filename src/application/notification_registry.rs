use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::application::ports::{Inbound, SessionSink, SessionStream};
use crate::domain::{
    notification::Notification,
    session::{CloseReason, SessionExit, SessionId},
};

struct Subscriber {
    sink: Box<dyn SessionSink>,
    // Dropped together with the entry; wakes the session's keep-alive loop.
    _evict: oneshot::Sender<()>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub removed: usize,
}

/// Live notification subscribers. The registry owns every outbound half, so
/// broadcast and removal never race with the session loops.
pub struct NotificationRegistry {
    sessions: Mutex<HashMap<SessionId, Subscriber>>,
    send_timeout: Duration,
    shutdown: watch::Sender<bool>,
}

impl NotificationRegistry {
    pub fn new(send_timeout: Duration) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            send_timeout,
            shutdown,
        })
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Adds a subscriber. Hands the sink back if the registry is shutting down.
    /// The receiver resolves once the subscriber has been removed.
    pub async fn register(
        &self,
        sink: Box<dyn SessionSink>,
    ) -> Result<(SessionId, oneshot::Receiver<()>), Box<dyn SessionSink>> {
        let mut sessions = self.sessions.lock().await;
        if *self.shutdown.borrow() {
            return Err(sink);
        }
        let id = SessionId::new();
        let (evict, evicted) = oneshot::channel();
        sessions.insert(id, Subscriber { sink, _evict: evict });
        Ok((id, evicted))
    }

    /// Removes and closes a subscriber. Returns false if it was already gone.
    pub async fn remove(&self, id: SessionId, reason: CloseReason) -> bool {
        let removed = self.sessions.lock().await.remove(&id);
        match removed {
            Some(mut subscriber) => {
                self.close_sink(id, subscriber.sink.as_mut(), reason).await;
                true
            }
            None => false,
        }
    }

    /// Holds a subscriber open until the peer leaves, a broadcast evicts it,
    /// or the registry shuts down. Inbound messages only serve as keep-alive.
    pub async fn admit(&self, sink: Box<dyn SessionSink>, mut stream: Box<dyn SessionStream>) -> SessionExit {
        let (id, mut evicted) = match self.register(sink).await {
            Ok(registered) => registered,
            Err(mut rejected) => {
                debug!("notification registry shutting down; subscriber rejected");
                if tokio::time::timeout(self.send_timeout, rejected.close(CloseReason::Normal)).await.is_err() {
                    debug!("rejected subscriber did not take its close frame");
                }
                return SessionExit::Closed;
            }
        };
        info!(session = %id, "notification subscriber admitted");

        let exit = loop {
            tokio::select! {
                biased;
                _ = &mut evicted => break SessionExit::Closed,
                inbound = stream.recv() => match inbound {
                    Inbound::Message => continue,
                    Inbound::Closed => break SessionExit::Closed,
                    Inbound::Error(err) => break SessionExit::TransportError(err),
                },
            }
        };
        self.remove(id, exit.close_reason()).await;
        info!(session = %id, exit = ?exit, "notification subscriber removed");
        exit
    }

    /// Sends to every subscriber concurrently, each bounded by the send timeout.
    /// Subscribers that fail are dropped; the rest are unaffected.
    pub async fn broadcast(&self, notification: &Notification) -> BroadcastReport {
        let payload = match serde_json::to_string(notification) {
            Ok(payload) => payload,
            Err(err) => {
                error!(id = %notification.id, error = %err, "notification not serializable");
                return BroadcastReport::default();
            }
        };

        let mut sessions = self.sessions.lock().await;
        let timeout = self.send_timeout;
        let outcomes = join_all(sessions.iter_mut().map(|(id, subscriber)| {
            let payload = payload.clone();
            async move {
                match tokio::time::timeout(timeout, subscriber.sink.send_text(payload)).await {
                    Ok(Ok(())) => (*id, true),
                    Ok(Err(err)) => {
                        warn!(session = %id, error = %err, "notification send failed; dropping subscriber");
                        (*id, false)
                    }
                    Err(_) => {
                        warn!(
                            session = %id,
                            timeout_ms = timeout.as_millis() as u64,
                            "notification send timed out; dropping subscriber"
                        );
                        (*id, false)
                    }
                }
            }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (id, ok) in outcomes {
            if ok {
                report.delivered += 1;
            } else if sessions.remove(&id).is_some() {
                report.removed += 1;
            }
        }
        debug!(id = %notification.id, delivered = report.delivered, removed = report.removed, "notification broadcast");
        report
    }

    /// Stops admitting and closes every subscriber.
    pub async fn shutdown(&self) {
        let drained: Vec<(SessionId, Subscriber)> = {
            let mut sessions = self.sessions.lock().await;
            self.shutdown.send_replace(true);
            sessions.drain().collect()
        };
        let count = drained.len();
        join_all(
            drained
                .into_iter()
                .map(|(id, mut subscriber)| async move {
                    self.close_sink(id, subscriber.sink.as_mut(), CloseReason::Normal).await;
                }),
        )
        .await;
        info!(closed = count, "notification registry drained");
    }

    async fn close_sink(&self, id: SessionId, sink: &mut dyn SessionSink, reason: CloseReason) {
        if tokio::time::timeout(self.send_timeout, sink.close(reason)).await.is_err() {
            debug!(session = %id, "close frame not written in time; dropping transport");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::application::lock_unpoisoned;
    use crate::domain::errors::{DomainError, DomainResult};
    use async_trait::async_trait;
    use bytes::Bytes;

    pub enum SinkMode {
        Healthy,
        Failing,
        Stalled,
    }

    /// Records text payloads; can be told to fail or hang.
    pub struct RecordingSink {
        pub texts: Arc<std::sync::Mutex<Vec<String>>>,
        pub closed: Arc<std::sync::Mutex<Option<CloseReason>>>,
        pub mode: SinkMode,
    }

    impl RecordingSink {
        pub fn new(mode: SinkMode) -> Self {
            Self {
                texts: Arc::default(),
                closed: Arc::default(),
                mode,
            }
        }
    }

    #[async_trait]
    impl SessionSink for RecordingSink {
        async fn send_binary(&mut self, _payload: Bytes) -> DomainResult<()> {
            Ok(())
        }

        async fn send_text(&mut self, payload: String) -> DomainResult<()> {
            match self.mode {
                SinkMode::Healthy => {
                    lock_unpoisoned(&self.texts).push(payload);
                    Ok(())
                }
                SinkMode::Failing => Err(DomainError::Transmit("connection reset".into())),
                SinkMode::Stalled => std::future::pending().await,
            }
        }

        async fn close(&mut self, reason: CloseReason) {
            if let SinkMode::Stalled = self.mode {
                std::future::pending::<()>().await;
            }
            *lock_unpoisoned(&self.closed) = Some(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::application::lock_unpoisoned;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn notification(id: &str) -> Notification {
        Notification { id: id.into(), data: json!({"class": "fall", "confidence": 0.97}), timestamp: Utc::now() }
    }

    #[tokio::test]
    async fn one_failing_subscriber_does_not_stop_the_others() {
        let registry = NotificationRegistry::new(Duration::from_secs(2));
        let first = RecordingSink::new(SinkMode::Healthy);
        let second = RecordingSink::new(SinkMode::Failing);
        let third = RecordingSink::new(SinkMode::Healthy);
        let (first_texts, third_texts) = (first.texts.clone(), third.texts.clone());

        registry.register(Box::new(first)).await.ok().expect("first");
        let (_, mut second_evicted) = registry.register(Box::new(second)).await.ok().expect("second");
        registry.register(Box::new(third)).await.ok().expect("third");

        let report = registry.broadcast(&notification("-N1")).await;

        assert_eq!(report, BroadcastReport { delivered: 2, removed: 1 });
        assert_eq!(lock_unpoisoned(&first_texts).len(), 1);
        assert_eq!(lock_unpoisoned(&third_texts).len(), 1);
        assert_eq!(registry.len().await, 2);
        assert!(matches!(second_evicted.try_recv(), Err(oneshot::error::TryRecvError::Closed)));
    }

    #[tokio::test]
    async fn payload_is_the_notification_json() {
        let registry = NotificationRegistry::new(Duration::from_secs(2));
        let sink = RecordingSink::new(SinkMode::Healthy);
        let texts = sink.texts.clone();
        registry.register(Box::new(sink)).await.ok().expect("register");

        registry.broadcast(&notification("-Nabc")).await;

        let sent: serde_json::Value = serde_json::from_str(&lock_unpoisoned(&texts)[0]).expect("json");
        assert_eq!(sent["id"], "-Nabc");
        assert_eq!(sent["data"]["class"], "fall");
        assert!(sent["timestamp"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_subscriber_is_dropped_after_the_timeout() {
        let registry = NotificationRegistry::new(Duration::from_millis(500));
        let healthy = RecordingSink::new(SinkMode::Healthy);
        let texts = healthy.texts.clone();
        registry.register(Box::new(healthy)).await.ok().expect("healthy");
        registry.register(Box::new(RecordingSink::new(SinkMode::Stalled))).await.ok().expect("stalled");

        let report = registry.broadcast(&notification("-N2")).await;

        assert_eq!(report, BroadcastReport { delivered: 1, removed: 1 });
        assert_eq!(lock_unpoisoned(&texts).len(), 1);
    }

    struct ChannelStream(mpsc::UnboundedReceiver<Inbound>);

    #[async_trait]
    impl SessionStream for ChannelStream {
        async fn recv(&mut self) -> Inbound {
            self.0.recv().await.unwrap_or(Inbound::Closed)
        }
    }

    #[tokio::test]
    async fn admitted_subscriber_leaves_when_evicted() {
        let registry = NotificationRegistry::new(Duration::from_secs(2));
        let (_tx, rx) = mpsc::unbounded_channel();
        let session = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .admit(Box::new(RecordingSink::new(SinkMode::Failing)), Box::new(ChannelStream(rx)))
                    .await
            })
        };
        while registry.len().await == 0 {
            tokio::task::yield_now().await;
        }

        registry.broadcast(&notification("-N3")).await;

        assert_eq!(session.await.expect("session task"), SessionExit::Closed);
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn keep_alive_messages_do_not_end_the_session() {
        let registry = NotificationRegistry::new(Duration::from_secs(2));
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = RecordingSink::new(SinkMode::Healthy);
        let closed = sink.closed.clone();
        let session = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.admit(Box::new(sink), Box::new(ChannelStream(rx))).await })
        };

        tx.send(Inbound::Message).expect("ping");
        tx.send(Inbound::Message).expect("ping");
        tx.send(Inbound::Closed).expect("close");

        assert_eq!(session.await.expect("session task"), SessionExit::Closed);
        assert_eq!(*lock_unpoisoned(&closed), Some(CloseReason::Normal));
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn shutdown_closes_everyone_and_rejects_newcomers() {
        let registry = NotificationRegistry::new(Duration::from_secs(2));
        let sink = RecordingSink::new(SinkMode::Healthy);
        let closed = sink.closed.clone();
        registry.register(Box::new(sink)).await.ok().expect("register");

        registry.shutdown().await;

        assert_eq!(*lock_unpoisoned(&closed), Some(CloseReason::Normal));
        assert_eq!(registry.len().await, 0);
        assert!(registry.register(Box::new(RecordingSink::new(SinkMode::Healthy))).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_does_not_wait_on_a_stalled_subscriber() {
        let registry = NotificationRegistry::new(Duration::from_millis(500));
        let healthy = RecordingSink::new(SinkMode::Healthy);
        let closed = healthy.closed.clone();
        registry.register(Box::new(healthy)).await.ok().expect("healthy");
        registry.register(Box::new(RecordingSink::new(SinkMode::Stalled))).await.ok().expect("stalled");

        tokio::time::timeout(Duration::from_secs(2), registry.shutdown())
            .await
            .expect("shutdown bounded by the send timeout");
        assert_eq!(*lock_unpoisoned(&closed), Some(CloseReason::Normal));
        assert_eq!(registry.len().await, 0);
    }
}
