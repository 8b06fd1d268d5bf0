use std::sync::Arc;

use metrics::counter;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::{
    backend::{BackendError, ConsoleBackend, Instance},
    config::ConsoleKeeperConfig,
    console::{
        parse_endpoint, ConnectionDescriptor, ConsoleProtocol, ConsoleResponse, SessionRecord,
    },
    store::SessionStore,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("{0}")]
    NotReady(String),
    #[error("{0}")]
    UnsupportedConsoleType(String),
    #[error("{0}")]
    NotImplemented(String),
    #[error("{0}")]
    NotFound(String),
    #[error("console backend contract violated: {0}")]
    InvariantViolation(String),
    #[error("console backend failure: {0}")]
    Backend(String),
}

impl BrokerError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            BrokerError::NotReady(_) => "not_ready",
            BrokerError::UnsupportedConsoleType(_) => "unsupported_type",
            BrokerError::NotImplemented(_) => "not_implemented",
            BrokerError::NotFound(_) => "not_found",
            BrokerError::InvariantViolation(_) => "invariant_violation",
            BrokerError::Backend(_) => "backend",
        }
    }
}

/// Negotiates console sessions with the backend and records persisted VNC
/// sessions for the console keeper.
///
/// Holds no per-request state, so a single instance is shared by every handler.
pub struct ConsoleBroker {
    backend: Arc<dyn ConsoleBackend>,
    store: Arc<dyn SessionStore>,
    keeper: Arc<ConsoleKeeperConfig>,
}

impl ConsoleBroker {
    pub fn new(
        backend: Arc<dyn ConsoleBackend>,
        store: Arc<dyn SessionStore>,
        keeper: Arc<ConsoleKeeperConfig>,
    ) -> Self {
        Self {
            backend,
            store,
            keeper,
        }
    }

    pub async fn vnc_console(
        &self,
        instance: &Instance,
        console_type: Option<&str>,
    ) -> Result<ConsoleResponse, BrokerError> {
        let result = self.negotiate_vnc(instance, console_type).await;
        finish(ConsoleProtocol::Vnc, &instance.id, console_type, result)
    }

    pub async fn spice_console(
        &self,
        instance: &Instance,
        console_type: Option<&str>,
    ) -> Result<ConsoleResponse, BrokerError> {
        let result = self
            .backend
            .get_spice_console(instance, console_type)
            .await
            .map_err(|err| map_backend_error(ConsoleProtocol::Spice, err));
        finish(ConsoleProtocol::Spice, &instance.id, console_type, result)
    }

    pub async fn rdp_console(
        &self,
        instance: &Instance,
        console_type: Option<&str>,
    ) -> Result<ConsoleResponse, BrokerError> {
        let result = self
            .backend
            .get_rdp_console(instance, console_type)
            .await
            .map_err(|err| map_backend_error(ConsoleProtocol::Rdp, err));
        finish(ConsoleProtocol::Rdp, &instance.id, console_type, result)
    }

    /// Serial consoles take a raw instance id: the lookup happens here, which is
    /// why this is the only path that reports [`BrokerError::NotFound`].
    pub async fn serial_console(
        &self,
        instance_id: &str,
        console_type: Option<&str>,
    ) -> Result<ConsoleResponse, BrokerError> {
        let result = match self.backend.get_instance(instance_id).await {
            Ok(instance) => self
                .backend
                .get_serial_console(&instance, console_type)
                .await
                .map_err(map_serial_error),
            Err(err) => Err(map_serial_error(err)),
        };
        finish(ConsoleProtocol::Serial, instance_id, console_type, result)
    }

    /// VNC console whose token is also registered with the console keeper.
    ///
    /// A failed store write is logged and swallowed: console access must not
    /// depend on keeper bookkeeping.
    pub async fn persisted_vnc_console(
        &self,
        instance: &Instance,
        console_type: Option<&str>,
    ) -> Result<ConsoleResponse, BrokerError> {
        let result = match self.negotiate_vnc(instance, console_type).await {
            Ok(descriptor) => self.record_session(instance, descriptor).await,
            Err(err) => Err(err),
        };
        finish(ConsoleProtocol::Vnc, &instance.id, console_type, result)
    }

    async fn negotiate_vnc(
        &self,
        instance: &Instance,
        console_type: Option<&str>,
    ) -> Result<ConnectionDescriptor, BrokerError> {
        self.backend
            .get_vnc_console(instance, console_type)
            .await
            .map_err(|err| match err {
                BackendError::InstanceNotReady(_) => {
                    BrokerError::NotReady("Instance not yet ready".to_string())
                }
                other => map_backend_error(ConsoleProtocol::Vnc, other),
            })
    }

    async fn record_session(
        &self,
        instance: &Instance,
        descriptor: ConnectionDescriptor,
    ) -> Result<ConnectionDescriptor, BrokerError> {
        let endpoint = parse_endpoint(&descriptor.url).map_err(|err| {
            error!(
                instance_id = %instance.id,
                error = %err,
                "vnc backend returned a console url without a usable token"
            );
            BrokerError::InvariantViolation(err.to_string())
        })?;

        let record = SessionRecord::new(&instance.id, &self.keeper, &endpoint);
        let data = serde_json::to_string(&record)
            .map_err(|err| BrokerError::InvariantViolation(err.to_string()))?;

        if !self.store.set(endpoint.token.as_bytes(), &data).await {
            counter!("console_broker_session_store_failures_total", 1);
            warn!(
                token = %endpoint.token,
                instance_id = %instance.id,
                "console token failed to save into session store"
            );
        } else {
            debug!(instance_id = %instance.id, "stored console keeper session record");
        }

        Ok(descriptor)
    }
}

fn finish(
    protocol: ConsoleProtocol,
    instance_id: &str,
    console_type: Option<&str>,
    result: Result<ConnectionDescriptor, BrokerError>,
) -> Result<ConsoleResponse, BrokerError> {
    match result {
        Ok(descriptor) => {
            counter!(
                "console_broker_consoles_issued_total",
                1,
                "protocol" => protocol.as_str()
            );
            debug!(
                %instance_id,
                %protocol,
                console_type = console_type.unwrap_or("-"),
                "issued console"
            );
            Ok(ConsoleResponse::new(console_type, descriptor))
        }
        Err(err) => {
            counter!(
                "console_broker_console_failures_total",
                1,
                "protocol" => protocol.as_str(),
                "reason" => err.metric_label()
            );
            debug!(%instance_id, %protocol, error = %err, "console negotiation failed");
            Err(err)
        }
    }
}

fn map_backend_error(protocol: ConsoleProtocol, err: BackendError) -> BrokerError {
    match err {
        BackendError::InstanceNotReady(msg) => BrokerError::NotReady(msg),
        BackendError::ConsoleTypeUnavailable(msg) => BrokerError::UnsupportedConsoleType(msg),
        BackendError::NotImplemented => BrokerError::NotImplemented(format!(
            "Unable to get {protocol} console, functionality not implemented"
        )),
        // The dispatcher resolved the instance already; losing it mid-call is
        // a backend fault rather than a caller error.
        other @ (BackendError::InstanceNotFound(_) | BackendError::Unavailable(_)) => {
            BrokerError::Backend(other.to_string())
        }
    }
}

fn map_serial_error(err: BackendError) -> BrokerError {
    match err {
        BackendError::InstanceNotFound(_) => BrokerError::NotFound(err.to_string()),
        other => map_backend_error(ConsoleProtocol::Serial, other),
    }
}
