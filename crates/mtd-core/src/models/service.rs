use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MtdError;

/// Stable identity of a tracked service. Never changes across migrations.
///
/// The textual form is only produced and parsed at the serialization
/// boundary (registry document, proxy commands, CLI arguments).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceId(Uuid);

impl ServiceId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(input: &str) -> Result<Self, MtdError> {
        Uuid::parse_str(input.trim())
            .map(Self)
            .map_err(|e| MtdError::InvalidConfig(format!("invalid service id '{input}': {e}")))
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for ServiceId {
    type Err = MtdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ServiceId {
    type Error = MtdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ServiceId> for String {
    fn from(id: ServiceId) -> Self {
        id.to_string()
    }
}

fn default_true() -> bool {
    true
}

/// A tracked service: where the proxy listens for it and where its backend
/// currently runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub cloud_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_ip: Option<IpAddr>,
    #[serde(default)]
    pub entry_port: u16,
    pub service_ip: IpAddr,
    #[serde(default)]
    pub service_port: u16,
    #[serde(default)]
    pub active: bool,
    #[serde(default = "default_true")]
    pub admin_enabled: bool,
}

impl Service {
    /// A service synthesized from a newly discovered cloud instance.
    pub fn discovered(cloud_id: String, service_ip: IpAddr, admin_enabled: bool) -> Self {
        Self {
            id: ServiceId::new_random(),
            cloud_id,
            entry_ip: None,
            entry_port: 0,
            service_ip,
            service_port: 0,
            active: true,
            admin_enabled,
        }
    }

    pub fn is_eligible(&self) -> bool {
        self.admin_enabled && self.active
    }

    /// Address of the proxy command channel for this service, if the entry
    /// side has been configured.
    pub fn control_endpoint(&self, management_port: u16) -> Option<SocketAddr> {
        self.entry_ip.map(|ip| SocketAddr::new(ip, management_port))
    }

    pub fn backend(&self) -> SocketAddr {
        SocketAddr::new(self.service_ip, self.service_port)
    }
}
