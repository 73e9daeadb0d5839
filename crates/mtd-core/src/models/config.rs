use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::service::Service;

/// Which instance address becomes a service's `service_ip`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    #[default]
    Public,
    Private,
}

/// Tie-break among several eligible services.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionKind {
    #[default]
    RoundRobin,
    First,
    Random,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MtdSettings {
    /// Port of the proxy command channel on every service's `entry_ip`.
    pub management_port: u16,
    pub cycle_interval_secs: u64,
    pub poll_interval_ms: u64,
    pub wait_timeout_secs: u64,
    pub proxy_timeout_secs: u64,
    /// `admin_enabled` for services created by reconciliation.
    pub new_services_admin_enabled: bool,
    pub service_address: AddressKind,
    pub selection: SelectionKind,
}

impl Default for MtdSettings {
    fn default() -> Self {
        Self {
            management_port: 14000,
            cycle_interval_secs: 60,
            poll_interval_ms: 1000,
            wait_timeout_secs: 300,
            proxy_timeout_secs: 10,
            new_services_admin_enabled: true,
            service_address: AddressKind::Public,
            selection: SelectionKind::RoundRobin,
        }
    }
}

impl MtdSettings {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_timeout_secs)
    }
}

fn default_provider() -> String {
    "aws".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudSettings {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub regions: Vec<String>,
    pub credentials_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MtdSection {
    #[serde(flatten)]
    pub settings: MtdSettings,
    #[serde(default)]
    pub services: Vec<Service>,
}

/// The persisted document: controller settings, tracked services and the
/// cloud section, in one YAML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub mtd: MtdSection,
    pub cloud: CloudSettings,
}
