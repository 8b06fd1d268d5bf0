use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::{Host, Url};

use crate::config::ConsoleKeeperConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleProtocol {
    Vnc,
    Spice,
    Rdp,
    Serial,
    #[serde(other)]
    Unspecified,
}

impl ConsoleProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsoleProtocol::Vnc => "vnc",
            ConsoleProtocol::Spice => "spice",
            ConsoleProtocol::Rdp => "rdp",
            ConsoleProtocol::Serial => "serial",
            ConsoleProtocol::Unspecified => "unspecified",
        }
    }
}

impl std::fmt::Display for ConsoleProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection coordinates handed out by the backend for a single negotiation.
///
/// A fresh descriptor (and token) is minted on every call. `host`, `port` and
/// `token` are informational; anything that needs them authoritatively parses
/// `url` with [`parse_endpoint`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    #[serde(default = "unspecified_protocol")]
    pub protocol: ConsoleProtocol,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

fn unspecified_protocol() -> ConsoleProtocol {
    ConsoleProtocol::Unspecified
}

/// What the caller sees: the requested type echoed back next to the backend url.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleConnection {
    #[serde(rename = "type")]
    pub console_type: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleResponse {
    pub console: ConsoleConnection,
}

impl ConsoleResponse {
    pub fn new(console_type: Option<&str>, descriptor: ConnectionDescriptor) -> Self {
        Self {
            console: ConsoleConnection {
                console_type: console_type.map(str::to_owned),
                url: descriptor.url,
            },
        }
    }

    pub fn url(&self) -> &str {
        &self.console.url
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleEndpoint {
    pub host: String,
    pub port: Option<u16>,
    pub token: String,
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("console url is not parseable: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("console url has no host")]
    MissingHost,
    #[error("console url carries no token parameter")]
    MissingToken,
}

/// Split a console url into the backend address and the bearer token.
///
/// The port falls back to the scheme default (`http` -> 80) and is `None` only
/// for schemes without one.
pub fn parse_endpoint(raw: &str) -> Result<ConsoleEndpoint, EndpointError> {
    let url = Url::parse(raw)?;

    let host = match url.host() {
        Some(Host::Ipv6(addr)) => addr.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
        _ => return Err(EndpointError::MissingHost),
    };

    let token = url
        .query_pairs()
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
        .ok_or(EndpointError::MissingToken)?;

    Ok(ConsoleEndpoint {
        host,
        port: url.port_or_known_default(),
        token,
    })
}

/// Record handed to the console keeper, stored under the session token.
///
/// Field names are the keeper's wire format and must not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub consid: String,
    pub consolekeeper_host: String,
    pub consolekeeper_port: String,
    pub consolekeeper_expiry_sec: u64,
    pub consolekeeper_interval_sec: u64,
    pub vnc_host: String,
    pub vnc_port: Option<u16>,
    pub suicide_sec: u64,
}

impl SessionRecord {
    pub fn new(console_id: &str, keeper: &ConsoleKeeperConfig, endpoint: &ConsoleEndpoint) -> Self {
        Self {
            consid: console_id.to_string(),
            consolekeeper_host: keeper.host.clone(),
            consolekeeper_port: keeper.port.clone(),
            consolekeeper_expiry_sec: keeper.expiry_secs,
            consolekeeper_interval_sec: keeper.interval_secs,
            vnc_host: endpoint.host.clone(),
            vnc_port: endpoint.port,
            suicide_sec: keeper.suicide_secs,
        }
    }
}
