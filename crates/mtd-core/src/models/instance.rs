use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::config::AddressKind;
use super::locator::CloudLocator;
use crate::error::Result;

/// Canonical discovery descriptor for one live instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudInstance {
    pub locator: CloudLocator,
    pub region: String,
    pub public_address: Option<String>,
    pub private_address: Option<String>,
}

impl CloudInstance {
    /// The address of the requested kind, if present and parsable.
    pub fn address(&self, kind: AddressKind) -> Option<IpAddr> {
        parse_address(&self.public_address, &self.private_address, kind)
    }
}

fn parse_address(
    public: &Option<String>,
    private: &Option<String>,
    kind: AddressKind,
) -> Option<IpAddr> {
    let raw = match kind {
        AddressKind::Public => public.as_deref(),
        AddressKind::Private => private.as_deref(),
    }?;
    raw.trim().parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceState {
    /// States from which the instance will never reach `Running` on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceState::ShuttingDown | InstanceState::Terminated
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Everything the engine needs to know about one instance to validate,
/// snapshot and replicate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDetails {
    pub instance_id: String,
    pub region: String,
    pub zone: String,
    pub state: InstanceState,
    pub instance_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_address: Option<String>,
}

impl InstanceDetails {
    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }

    pub fn address(&self, kind: AddressKind) -> Option<IpAddr> {
        parse_address(&self.public_address, &self.private_address, kind)
    }

    pub fn to_cloud_instance(&self, provider: &str) -> Result<CloudInstance> {
        Ok(CloudInstance {
            locator: CloudLocator::new(provider, &self.region, &self.instance_id)?,
            region: self.region.clone(),
            public_address: self.public_address.clone(),
            private_address: self.private_address.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageState {
    Pending,
    Available,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDetails {
    pub image_id: String,
    pub state: ImageState,
    pub snapshot_ids: Vec<String>,
}

/// Point-in-time image of a running instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub instance_id: String,
    pub name: String,
    pub description: String,
    pub no_reboot: bool,
}

impl ImageRequest {
    pub fn migration_backup(instance_id: &str, unix_seconds: i64) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            name: format!("backup-{instance_id}-{unix_seconds}"),
            description: "Migration backup".to_string(),
            no_reboot: true,
        }
    }
}

/// Launch parameters replicated from the source instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub image_id: String,
    pub instance_type: String,
    pub key_name: Option<String>,
    pub security_groups: Vec<String>,
    pub zone: String,
    pub name_tag: Option<String>,
}

impl LaunchSpec {
    pub fn replicate(source: &InstanceDetails, image_id: &str, zone: &str) -> Self {
        Self {
            image_id: image_id.to_string(),
            instance_type: source.instance_type.clone(),
            key_name: source.key_name.clone(),
            security_groups: source.security_groups.clone(),
            zone: zone.to_string(),
            name_tag: source.name_tag.clone(),
        }
    }
}
