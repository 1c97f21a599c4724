pub mod routes;
pub mod state;
pub mod ws;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::adapters::http::state::HttpState;
use crate::adapters::http::ws::{notifications_ws, stream_ws};

pub fn router(state: HttpState, api_prefix: &str) -> Router {
    let sockets = Router::new()
        .route("/ws/stream", get(stream_ws))
        .route("/ws/notifications", get(notifications_ws));

    let prefix = api_prefix.trim_end_matches('/');
    let app = Router::new()
        .route("/", get(routes::root))
        .route("/health", get(routes::health));
    let app = if prefix.is_empty() {
        app.merge(sockets)
    } else {
        app.nest(prefix, sockets)
    };

    app.layer(TraceLayer::new_for_http()).with_state(state)
}
