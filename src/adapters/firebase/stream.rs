use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::adapters::firebase::FirebaseConfig;
use crate::application::ports::{EventSourcePort, SourceCallback, Subscription};
use crate::domain::{
    errors::{DomainError, DomainResult},
    notification::SourceEvent,
};

const RECONNECT_PAUSE: Duration = Duration::from_secs(2);
const STOP_POLL: Duration = Duration::from_millis(100);

/// Streaming listener on a database path. Each subscription runs on its own
/// thread and calls back from there.
pub struct FirebaseEventStream {
    config: FirebaseConfig,
}

impl FirebaseEventStream {
    pub fn new(config: FirebaseConfig) -> Self {
        Self { config }
    }
}

impl EventSourcePort for FirebaseEventStream {
    fn subscribe(&self, path: &str, callback: SourceCallback) -> DomainResult<Box<dyn Subscription>> {
        let url = self.config.url_for(path);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let path = path.to_string();
        thread::Builder::new()
            .name("firebase-stream".into())
            .spawn(move || listen(&url, &path, &callback, &thread_stop))
            .map_err(|e| DomainError::OperationFailed(format!("failed to spawn stream thread: {e}")))?;
        Ok(Box::new(FirebaseSubscription { stop }))
    }
}

struct FirebaseSubscription {
    stop: Arc<AtomicBool>,
}

impl Subscription for FirebaseSubscription {
    /// Takes effect at the next event, keep-alive or reconnect pause.
    fn unsubscribe(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for FirebaseSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

enum StreamEnd {
    Disconnected,
    Stopped,
    Revoked,
}

fn listen(url: &str, path: &str, callback: &SourceCallback, stop: &AtomicBool) {
    let client = match Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(None)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!(path, error = %e, "could not build stream client");
            return;
        }
    };

    while !stop.load(Ordering::SeqCst) {
        match client.get(url).header(ACCEPT, "text/event-stream").send() {
            Ok(response) if response.status().is_success() => {
                info!(path, "event stream connected");
                match pump(response, callback, stop) {
                    StreamEnd::Stopped | StreamEnd::Revoked => break,
                    StreamEnd::Disconnected => warn!(path, "event stream disconnected"),
                }
            }
            Ok(response) => warn!(path, status = %response.status(), "event stream refused"),
            Err(e) => warn!(path, error = %e, "event stream connect failed"),
        }
        if !pause(stop, RECONNECT_PAUSE) {
            break;
        }
    }
    info!(path, "event stream closed");
}

fn pump(response: Response, callback: &SourceCallback, stop: &AtomicBool) -> StreamEnd {
    let mut parser = SseParser::default();
    for line in BufReader::new(response).lines() {
        if stop.load(Ordering::SeqCst) {
            return StreamEnd::Stopped;
        }
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!(error = %e, "event stream read failed");
                return StreamEnd::Disconnected;
            }
        };
        let Some(message) = parser.feed(&line) else {
            continue;
        };
        match message.event.as_str() {
            "put" | "patch" => match serde_json::from_str::<StreamPayload>(&message.data) {
                Ok(payload) => callback(SourceEvent {
                    path: payload.path,
                    data: payload.data,
                    event_type: message.event,
                }),
                Err(e) => warn!(event = %message.event, error = %e, "malformed stream payload"),
            },
            "keep-alive" => {}
            "cancel" | "auth_revoked" => {
                error!(event = %message.event, "event stream ended by server");
                return StreamEnd::Revoked;
            }
            other => debug!(event = other, "unhandled stream event"),
        }
    }
    StreamEnd::Disconnected
}

/// Sleeps in short steps so a stop request is seen promptly. False if stopped.
fn pause(stop: &AtomicBool, total: Duration) -> bool {
    let mut waited = Duration::ZERO;
    while waited < total {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        thread::sleep(STOP_POLL);
        waited += STOP_POLL;
    }
    !stop.load(Ordering::SeqCst)
}

#[derive(Debug, Deserialize)]
struct StreamPayload {
    path: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, PartialEq)]
struct SseMessage {
    event: String,
    data: String,
}

/// Line-oriented `text/event-stream` parser; a blank line ends a message.
#[derive(Default)]
struct SseParser {
    event: Option<String>,
    data: String,
}

impl SseParser {
    fn feed(&mut self, line: &str) -> Option<SseMessage> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            let event = self.event.take();
            let data = std::mem::take(&mut self.data);
            if event.is_none() && data.is_empty() {
                return None;
            }
            return Some(SseMessage {
                event: event.unwrap_or_else(|| "message".into()),
                data,
            });
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(value);
            }
            _ => {}
        }
        None
    }
}
