use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::console::ConnectionDescriptor;

/// Compute instance as resolved by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_state: Option<String>,
}

impl Instance {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            vm_state: None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("instance {0} could not be found")]
    InstanceNotFound(String),
    #[error("{0}")]
    InstanceNotReady(String),
    #[error("{0}")]
    ConsoleTypeUnavailable(String),
    #[error("console capability not implemented by backend")]
    NotImplemented,
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    pub fn console_type_unavailable(console_type: Option<&str>) -> Self {
        BackendError::ConsoleTypeUnavailable(format!(
            "Unavailable console type {}.",
            console_type.unwrap_or("None")
        ))
    }
}

/// Virtualization backend able to negotiate console sessions.
///
/// Every console method defaults to [`BackendError::NotImplemented`]; drivers
/// override the protocols they actually support.
#[async_trait]
pub trait ConsoleBackend: Send + Sync {
    async fn get_instance(&self, instance_id: &str) -> Result<Instance, BackendError>;

    async fn get_vnc_console(
        &self,
        _instance: &Instance,
        _console_type: Option<&str>,
    ) -> Result<ConnectionDescriptor, BackendError> {
        Err(BackendError::NotImplemented)
    }

    async fn get_spice_console(
        &self,
        _instance: &Instance,
        _console_type: Option<&str>,
    ) -> Result<ConnectionDescriptor, BackendError> {
        Err(BackendError::NotImplemented)
    }

    async fn get_rdp_console(
        &self,
        _instance: &Instance,
        _console_type: Option<&str>,
    ) -> Result<ConnectionDescriptor, BackendError> {
        Err(BackendError::NotImplemented)
    }

    async fn get_serial_console(
        &self,
        _instance: &Instance,
        _console_type: Option<&str>,
    ) -> Result<ConnectionDescriptor, BackendError> {
        Err(BackendError::NotImplemented)
    }
}
