use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use console_broker::{
    routes::{build_router, metrics_router, AppState},
    telemetry::Telemetry,
    BackendError, ConnectionDescriptor, ConsoleBackend, ConsoleBroker, ConsoleKeeperConfig,
    ConsoleProtocol, Instance, MemorySessionStore,
};
use serde_json::json;
use tower::util::ServiceExt;

/// Hands out a tokenised VNC url, except for `tokenless` which breaks the
/// backend contract.
struct VncOnly;

#[async_trait]
impl ConsoleBackend for VncOnly {
    async fn get_instance(&self, instance_id: &str) -> Result<Instance, BackendError> {
        Ok(Instance::new(instance_id))
    }

    async fn get_vnc_console(
        &self,
        instance: &Instance,
        _console_type: Option<&str>,
    ) -> Result<ConnectionDescriptor, BackendError> {
        let url = if instance.id == "tokenless" {
            "vnc://10.0.0.5:5900/".to_string()
        } else {
            "vnc://10.0.0.5:5900/?token=abc123".to_string()
        };
        Ok(ConnectionDescriptor {
            protocol: ConsoleProtocol::Vnc,
            url,
            host: None,
            port: None,
            token: None,
        })
    }
}

async fn request(app: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

fn action(id: &str, action: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/servers/{id}/action"))
        .header("content-type", "application/json")
        .body(Body::from(json!({ action: { "type": "novnc" } }).to_string()))
        .unwrap()
}

/// Value of the first sample of `name` whose labels contain `labels`.
fn sample(exposition: &str, name: &str, labels: &str) -> Option<f64> {
    exposition
        .lines()
        .filter(|line| line.starts_with(&format!("{name}{{")))
        .find(|line| line.contains(labels))
        .and_then(|line| line.rsplit(' ').next())
        .and_then(|value| value.parse().ok())
}

// One test per binary: the Prometheus recorder is process-global.
#[tokio::test]
async fn console_counters_are_exported() {
    let telemetry = Telemetry::init().unwrap();
    let backend: Arc<dyn ConsoleBackend> = Arc::new(VncOnly);
    let broker = Arc::new(ConsoleBroker::new(
        backend.clone(),
        Arc::new(MemorySessionStore::new(None)),
        Arc::new(ConsoleKeeperConfig::default()),
    ));
    let app = build_router(AppState::new(broker, backend))
        .merge(metrics_router(telemetry.metrics_handle()));

    let (status, _) = request(&app, action("inst-1", "os-getVNCConsole")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = request(&app, action("tokenless", "os-getVNCConsole-new")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (status, exposition) = request(
        &app,
        Request::builder().uri("/metrics").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        exposition.contains("console_broker_consoles_issued_total"),
        "missing issued counter in:\n{exposition}"
    );
    assert_eq!(
        sample(
            &exposition,
            "console_broker_consoles_issued_total",
            "protocol=\"vnc\""
        ),
        Some(1.0)
    );
    assert_eq!(
        sample(
            &exposition,
            "console_broker_console_failures_total",
            "reason=\"invariant_violation\""
        ),
        Some(1.0)
    );
}
