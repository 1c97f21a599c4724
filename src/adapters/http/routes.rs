use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::adapters::http::state::HttpState;

pub async fn root(State(st): State<HttpState>) -> impl IntoResponse {
    Json(json!({ "message": format!("{} running", st.app_name) }))
}

pub async fn health(State(st): State<HttpState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "camera": st.viewers.camera_state(),
        "viewers": st.viewers.len().await,
        "notification_subscribers": st.notifications.len().await,
    }))
}
