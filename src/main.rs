mod adapters;
mod application;
mod config;
mod domain;

use std::sync::Arc;
use std::time::Duration;

use tower_http::services::ServeDir;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::adapters::{
    capture::CaptureRouter,
    codec::jpeg::JpegCodec,
    firebase::{sink::FirebaseEventSink, stream::FirebaseEventStream},
    http::{router, state::HttpState},
    mjpeg::http_stream::MjpegHttpBackend,
    onnx::{model_catalog::OnnxModelCatalog, yolo_engine::OnnxYoloEngine},
    v4l2::capture::V4l2Backend,
};
use crate::application::{
    alerts::AlertService,
    annotator::DetectionAnnotator,
    camera_lifecycle::CameraLifecycleManager,
    connection_registry::ConnectionRegistry,
    notification_bridge::NotificationBridge,
    notification_registry::NotificationRegistry,
    ports::{EventSink, FrameCodec, ObjectDetector},
};
use crate::config::AppConfig;

const MJPEG_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // 1. Logging (RUST_LOG overrides the default filter)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "fallwatch=info,tower_http=info".into()))
        .with(fmt::layer())
        .init();

    // 2. Configuration
    let cfg = AppConfig::from_env()?;
    info!(camera = %cfg.camera, prefix = %cfg.api_prefix, "starting {}", cfg.app_name);

    // 3. Capture adapters, shared through Arc by the camera manager
    let codec: Arc<dyn FrameCodec> = Arc::new(JpegCodec::new(cfg.jpeg_quality));
    let capture = CaptureRouter::new(
        Arc::new(V4l2Backend::new(cfg.capture.clone(), cfg.camera_read_timeout)),
        Arc::new(MjpegHttpBackend::new(MJPEG_CONNECT_TIMEOUT, cfg.camera_read_timeout)),
    );
    let camera = Arc::new(
        CameraLifecycleManager::new(Arc::new(capture), codec.clone(), cfg.camera.clone(), cfg.reconnect)
            .with_read_timeout(cfg.camera_read_timeout),
    );

    // 4. Detector; the stream still runs without one
    let annotator = match load_detector(&cfg) {
        Ok(detector) => DetectionAnnotator::new(detector, codec.clone(), cfg.alerts.classes.clone()),
        Err(e) => {
            warn!(error = %e, "detector unavailable; streaming frames without annotations");
            DetectionAnnotator::passthrough(codec.clone())
        }
    };

    // 5. Firebase sink and the services built on it
    let sink: Option<Arc<dyn EventSink>> = match &cfg.firebase {
        Some(firebase) => Some(Arc::new(FirebaseEventSink::new(firebase, &cfg.detections_path)?)),
        None => {
            warn!("FIREBASE_DATABASE_URL not set; detections are not persisted and notifications are disabled");
            None
        }
    };
    let alerts = Arc::new(AlertService::new(cfg.alerts.clone(), sink));

    let viewers = ConnectionRegistry::new(camera, Arc::new(annotator), alerts, cfg.stream_send_timeout);
    let notifications = NotificationRegistry::new(cfg.notify_send_timeout);

    let bridge = match &cfg.firebase {
        Some(firebase) => {
            let source = FirebaseEventStream::new(firebase.clone());
            match NotificationBridge::start(&source, &cfg.notifications_path, notifications.clone()) {
                Ok(bridge) => Some(bridge),
                Err(e) => {
                    warn!(error = %e, "notification bridge failed to start");
                    None
                }
            }
        }
        None => None,
    };

    // 6. HTTP state, router and static files
    let state = HttpState {
        viewers: viewers.clone(),
        notifications: notifications.clone(),
        app_name: Arc::from(cfg.app_name.as_str()),
    };
    let app = router(state, &cfg.api_prefix).fallback_service(ServeDir::new(&cfg.static_dir));

    // 7. Serve until ctrl-c
    let addr = cfg.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on http://{addr}");

    // Upgraded sockets outlive their HTTP connection, so the registries are
    // drained before axum waits on the remaining connections.
    let drain = {
        let viewers = viewers.clone();
        let notifications = notifications.clone();
        async move {
            shutdown_signal().await;
            info!("closing sessions");
            viewers.shutdown().await;
            notifications.shutdown().await;
        }
    };
    axum::serve(listener, app).with_graceful_shutdown(drain).await?;

    if let Some(bridge) = bridge {
        bridge.stop().await;
    }
    info!("stopped");
    Ok(())
}

fn load_detector(cfg: &AppConfig) -> domain::errors::DomainResult<Arc<dyn ObjectDetector>> {
    OnnxModelCatalog::new().validate_model(&cfg.inference.model)?;
    let engine = OnnxYoloEngine::load(cfg.inference.clone())?;
    Ok(Arc::new(engine))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    info!("ctrl-c received");
}
