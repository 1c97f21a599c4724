use std::sync::Arc;

use crate::application::connection_registry::ConnectionRegistry;
use crate::application::notification_registry::NotificationRegistry;

/// Shared state for the axum handlers: the two session registries.
#[derive(Clone)]
pub struct HttpState {
    pub viewers: Arc<ConnectionRegistry>,
    pub notifications: Arc<NotificationRegistry>,
    pub app_name: Arc<str>,
}
