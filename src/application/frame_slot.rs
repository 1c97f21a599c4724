//! Latest-frame-only buffering.
//!
//! Every viewer owns one [`FrameSlot`]. The acquisition thread publishes into
//! all of them through the [`FrameHub`]; a slow viewer simply finds its slot
//! overwritten and picks up whatever is newest when it gets around to it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;

use crate::application::lock_unpoisoned;
use crate::domain::frame::Frame;

pub struct FrameSlot {
    held: Mutex<Option<Frame>>,
    ready: Notify,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(None),
            ready: Notify::new(),
        }
    }

    /// Replaces any unread frame. Returns true if one was overwritten.
    pub fn publish(&self, frame: Frame) -> bool {
        let overwritten = lock_unpoisoned(&self.held).replace(frame).is_some();
        self.ready.notify_one();
        overwritten
    }

    /// Waits for a frame and removes it from the slot. Cancel safe.
    pub async fn take(&self) -> Frame {
        loop {
            let ready = self.ready.notified();
            if let Some(frame) = lock_unpoisoned(&self.held).take() {
                return frame;
            }
            ready.await;
        }
    }

    #[cfg(test)]
    pub fn try_take(&self) -> Option<Frame> {
        lock_unpoisoned(&self.held).take()
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Fan-out point between the acquisition thread and the per-viewer slots.
pub struct FrameHub {
    slots: Mutex<HashMap<u64, Arc<FrameSlot>>>,
    next_id: AtomicU64,
}

impl FrameHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn subscribe(self: &Arc<Self>) -> FrameSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(FrameSlot::new());
        lock_unpoisoned(&self.slots).insert(id, slot.clone());
        FrameSubscription {
            id,
            slot,
            hub: Arc::downgrade(self),
        }
    }

    /// Publishes to every live slot. Returns how many unread frames were dropped.
    pub fn publish(&self, frame: Frame) -> usize {
        let slots: Vec<Arc<FrameSlot>> = lock_unpoisoned(&self.slots).values().cloned().collect();
        slots
            .iter()
            .filter(|slot| slot.publish(frame.clone()))
            .count()
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        lock_unpoisoned(&self.slots).len()
    }
}

/// A registered slot. Unregisters itself on drop.
pub struct FrameSubscription {
    id: u64,
    slot: Arc<FrameSlot>,
    hub: Weak<FrameHub>,
}

impl FrameSubscription {
    pub async fn next_frame(&self) -> Frame {
        self.slot.take().await
    }

    #[cfg(test)]
    pub fn slot(&self) -> &FrameSlot {
        &self.slot
    }
}

impl Drop for FrameSubscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            lock_unpoisoned(&hub.slots).remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(seq: u64) -> Frame {
        Frame::new(vec![0xFF, 0xD8, seq as u8, 0xFF, 0xD9], seq)
    }

    #[tokio::test]
    async fn only_the_last_publish_survives() {
        let slot = FrameSlot::new();
        for seq in 1..=5 {
            slot.publish(frame(seq));
        }
        assert_eq!(slot.take().await.sequence, 5);
        assert!(slot.try_take().is_none());
    }

    #[tokio::test]
    async fn taken_frame_is_byte_identical() {
        let slot = FrameSlot::new();
        let published = frame(7);
        slot.publish(published.clone());
        let taken = slot.take().await;
        assert_eq!(taken.jpeg, published.jpeg);
        assert_eq!(taken, published);
    }

    #[tokio::test]
    async fn waiting_reader_wakes_with_newest_frame() {
        let slot = Arc::new(FrameSlot::new());
        let reader = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.take().await })
        };
        tokio::task::yield_now().await;
        slot.publish(frame(1));
        slot.publish(frame(2));
        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader woke")
            .expect("reader task");
        // Either the reader ran between the two publishes or after both; never a stale frame after 2.
        assert!(got.sequence == 1 || got.sequence == 2);
        if got.sequence == 1 {
            assert_eq!(slot.take().await.sequence, 2);
        } else {
            assert!(slot.try_take().is_none());
        }
    }

    #[tokio::test]
    async fn frame_is_never_delivered_twice() {
        let slot = FrameSlot::new();
        slot.publish(frame(1));
        assert_eq!(slot.take().await.sequence, 1);
        let second = tokio::time::timeout(Duration::from_millis(50), slot.take()).await;
        assert!(second.is_err(), "empty slot must block");
    }

    #[tokio::test]
    async fn hub_fans_out_and_forgets_dropped_subscribers() {
        let hub = FrameHub::new();
        let a = hub.subscribe();
        let b = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        assert_eq!(hub.publish(frame(1)), 0);
        assert_eq!(hub.publish(frame(2)), 2, "both slots had an unread frame");
        assert_eq!(a.next_frame().await.sequence, 2);
        assert_eq!(b.next_frame().await.sequence, 2);

        drop(b);
        assert_eq!(hub.subscriber_count(), 1);
        hub.publish(frame(3));
        assert_eq!(a.next_frame().await.sequence, 3);
    }
}
