pub mod alerts;
pub mod annotator;
pub mod camera_lifecycle;
pub mod camera_source;
pub mod connection_registry;
pub mod cooldown;
pub mod frame_slot;
pub mod notification_bridge;
pub mod notification_registry;
pub mod overlay;
pub mod ports;
pub mod reconnect;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// A panicking holder must not take the frame path down with it.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
