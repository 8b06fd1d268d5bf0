use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::{
    backend::{BackendError, ConsoleBackend, Instance},
    console::{ConnectionDescriptor, ConsoleProtocol},
};

/// [`ConsoleBackend`] backed by a compute service's HTTP API.
#[derive(Clone)]
pub struct HttpComputeBackend {
    base_url: Url,
    client: Client,
}

#[derive(Debug, Serialize)]
struct ConsoleRequestBody<'a> {
    protocol: ConsoleProtocol,
    #[serde(rename = "type")]
    console_type: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ComputeErrorBody {
    #[serde(default)]
    message: Option<String>,
}

impl HttpComputeBackend {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| BackendError::Unavailable(err.to_string()))?;
        Ok(Self { base_url, client })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                BackendError::Unavailable(format!("invalid compute url {}", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn request_console(
        &self,
        protocol: ConsoleProtocol,
        instance: &Instance,
        console_type: Option<&str>,
    ) -> Result<ConnectionDescriptor, BackendError> {
        let url = self.endpoint(&["instances", instance.id.as_str(), "consoles"])?;
        debug!(instance_id = %instance.id, %protocol, "requesting console from compute");
        let response = self
            .client
            .post(url)
            .json(&ConsoleRequestBody {
                protocol,
                console_type,
            })
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(status_error(&instance.id, response, console_type).await);
        }

        response
            .json::<ConnectionDescriptor>()
            .await
            .map_err(transport_error)
    }
}

#[async_trait]
impl ConsoleBackend for HttpComputeBackend {
    async fn get_instance(&self, instance_id: &str) -> Result<Instance, BackendError> {
        let url = self.endpoint(&["instances", instance_id])?;
        let response = self.client.get(url).send().await.map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(instance_id, response, None).await);
        }
        response.json::<Instance>().await.map_err(transport_error)
    }

    async fn get_vnc_console(
        &self,
        instance: &Instance,
        console_type: Option<&str>,
    ) -> Result<ConnectionDescriptor, BackendError> {
        self.request_console(ConsoleProtocol::Vnc, instance, console_type)
            .await
    }

    async fn get_spice_console(
        &self,
        instance: &Instance,
        console_type: Option<&str>,
    ) -> Result<ConnectionDescriptor, BackendError> {
        self.request_console(ConsoleProtocol::Spice, instance, console_type)
            .await
    }

    async fn get_rdp_console(
        &self,
        instance: &Instance,
        console_type: Option<&str>,
    ) -> Result<ConnectionDescriptor, BackendError> {
        self.request_console(ConsoleProtocol::Rdp, instance, console_type)
            .await
    }

    async fn get_serial_console(
        &self,
        instance: &Instance,
        console_type: Option<&str>,
    ) -> Result<ConnectionDescriptor, BackendError> {
        self.request_console(ConsoleProtocol::Serial, instance, console_type)
            .await
    }
}

fn transport_error(err: reqwest::Error) -> BackendError {
    BackendError::Unavailable(err.to_string())
}

async fn status_error(
    instance_id: &str,
    response: Response,
    console_type: Option<&str>,
) -> BackendError {
    let status = response.status();
    let message = response
        .json::<ComputeErrorBody>()
        .await
        .ok()
        .and_then(|body| body.message)
        .filter(|message| !message.trim().is_empty());

    match status {
        StatusCode::NOT_FOUND => BackendError::InstanceNotFound(instance_id.to_string()),
        StatusCode::CONFLICT => BackendError::InstanceNotReady(
            message.unwrap_or_else(|| format!("Instance {instance_id} is not ready.")),
        ),
        StatusCode::BAD_REQUEST => match message {
            Some(message) => BackendError::ConsoleTypeUnavailable(message),
            None => BackendError::console_type_unavailable(console_type),
        },
        StatusCode::NOT_IMPLEMENTED => BackendError::NotImplemented,
        other => BackendError::Unavailable(
            message.unwrap_or_else(|| format!("compute returned status {other}")),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, State},
        http::StatusCode as AxumStatus,
        routing::{get, post},
        Json, Router,
    };
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct StubState {
        last_body: Arc<Mutex<Option<Value>>>,
    }

    async fn stub_instance(Path(id): Path<String>) -> Result<Json<Value>, AxumStatus> {
        if id == "inst-1" || id.starts_with("state-") {
            Ok(Json(json!({ "id": id, "vm_state": "active" })))
        } else {
            Err(AxumStatus::NOT_FOUND)
        }
    }

    async fn stub_console(
        State(state): State<StubState>,
        Path(id): Path<String>,
        Json(body): Json<Value>,
    ) -> (AxumStatus, Json<Value>) {
        *state.last_body.lock().unwrap() = Some(body.clone());
        match id.as_str() {
            "state-building" => (
                AxumStatus::CONFLICT,
                Json(json!({ "message": "Instance state-building is still building" })),
            ),
            "state-badtype" => (
                AxumStatus::BAD_REQUEST,
                Json(json!({ "message": "Unavailable console type bogus." })),
            ),
            "state-noimpl" => (AxumStatus::NOT_IMPLEMENTED, Json(json!({}))),
            "state-broken" => (AxumStatus::BAD_GATEWAY, Json(json!({}))),
            _ => (
                AxumStatus::OK,
                Json(json!({
                    "protocol": body["protocol"],
                    "url": "vnc://10.0.0.5:5900/?token=abc123",
                    "host": "10.0.0.5",
                    "port": 5900,
                    "token": "abc123"
                })),
            ),
        }
    }

    async fn spawn_stub() -> (Url, StubState) {
        let state = StubState::default();
        let router = Router::new()
            .route("/v2/instances/:id", get(stub_instance))
            .route("/v2/instances/:id/consoles", post(stub_console))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (Url::parse(&format!("http://{addr}/v2/")).unwrap(), state)
    }

    fn backend(base: Url) -> HttpComputeBackend {
        HttpComputeBackend::new(base, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn fetches_instance_and_console() {
        let (base, state) = spawn_stub().await;
        let backend = backend(base);

        let instance = backend.get_instance("inst-1").await.unwrap();
        assert_eq!(instance.id, "inst-1");
        assert_eq!(instance.vm_state.as_deref(), Some("active"));

        let descriptor = backend
            .get_spice_console(&instance, Some("spice-html5"))
            .await
            .unwrap();
        assert_eq!(descriptor.protocol, ConsoleProtocol::Spice);
        assert_eq!(descriptor.url, "vnc://10.0.0.5:5900/?token=abc123");
        assert_eq!(descriptor.token.as_deref(), Some("abc123"));

        let body = state.last_body.lock().unwrap().clone().unwrap();
        assert_eq!(body, json!({ "protocol": "spice", "type": "spice-html5" }));
    }

    #[tokio::test]
    async fn unknown_instance_is_not_found() {
        let (base, _) = spawn_stub().await;
        let err = backend(base).get_instance("ghost").await.unwrap_err();
        assert_eq!(err, BackendError::InstanceNotFound("ghost".into()));
    }

    #[tokio::test]
    async fn maps_compute_statuses() {
        let (base, _) = spawn_stub().await;
        let backend = backend(base);

        let err = backend
            .get_vnc_console(&Instance::new("state-building"), None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BackendError::InstanceNotReady("Instance state-building is still building".into())
        );

        let err = backend
            .get_vnc_console(&Instance::new("state-badtype"), Some("bogus"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BackendError::ConsoleTypeUnavailable("Unavailable console type bogus.".into())
        );

        let err = backend
            .get_rdp_console(&Instance::new("state-noimpl"), None)
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::NotImplemented);

        let err = backend
            .get_serial_console(&Instance::new("state-broken"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }

    #[tokio::test]
    async fn unreachable_compute_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let base = Url::parse(&format!("http://{addr}/")).unwrap();
        let err = backend(base).get_instance("inst-1").await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }
}
