use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};

use crate::adapters::http::state::HttpState;
use crate::application::ports::{Inbound, SessionSink, SessionStream};
use crate::domain::{
    errors::{DomainError, DomainResult},
    session::CloseReason,
};

/// Outbound half of an upgraded socket.
pub struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl SessionSink for WsSink {
    async fn send_binary(&mut self, payload: Bytes) -> DomainResult<()> {
        self.0
            .send(Message::Binary(payload))
            .await
            .map_err(|e| DomainError::Transmit(e.to_string()))
    }

    async fn send_text(&mut self, payload: String) -> DomainResult<()> {
        self.0
            .send(Message::Text(payload.into()))
            .await
            .map_err(|e| DomainError::Transmit(e.to_string()))
    }

    async fn close(&mut self, reason: CloseReason) {
        let frame = CloseFrame {
            code: reason.code(),
            reason: Utf8Bytes::from_static(reason.text()),
        };
        // The peer may already be gone.
        let _ = self.0.send(Message::Close(Some(frame))).await;
        let _ = self.0.close().await;
    }
}

/// Inbound half. Anything but a close or an error counts as keep-alive.
pub struct WsStream(SplitStream<WebSocket>);

#[async_trait]
impl SessionStream for WsStream {
    async fn recv(&mut self) -> Inbound {
        match self.0.next().await {
            None | Some(Ok(Message::Close(_))) => Inbound::Closed,
            Some(Ok(_)) => Inbound::Message,
            Some(Err(e)) => Inbound::Error(e.to_string()),
        }
    }
}

fn split(socket: WebSocket) -> (Box<WsSink>, Box<WsStream>) {
    let (sink, stream) = socket.split();
    (Box::new(WsSink(sink)), Box::new(WsStream(stream)))
}

/// Live annotated video: one binary JPEG message per frame.
pub async fn stream_ws(ws: WebSocketUpgrade, State(st): State<HttpState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = split(socket);
        st.viewers.admit(sink, stream).await;
    })
}

/// Notification feed: one JSON text message per notification.
pub async fn notifications_ws(ws: WebSocketUpgrade, State(st): State<HttpState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = split(socket);
        st.notifications.admit(sink, stream).await;
    })
}
