// Each test binary compiles this module independently and uses a different
// subset of helpers, so unused-function warnings are expected.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use mtd_core::models::{AddressKind, InstanceDetails, InstanceState, Service, ServiceId};
use mtd_core::services::memory_cloud::InMemoryCloud;
use mtd_core::services::migration::{MigrationConfig, MigrationEngine};
use mtd_core::services::proxy::{CommandTransport, ProxyCommand, ProxyResponse};
use mtd_core::services::registry::ServiceRegistry;
use mtd_core::services::state::Checkpoint;
use mtd_core::{MtdError, Result};

pub const REGION: &str = "us-east-1";
pub const MANAGEMENT_PORT: u16 = 14000;

/// Records every proxy command and answers with the expected success code
/// unless a command kind has been given a different status.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(SocketAddr, ProxyCommand)>>,
    statuses: Mutex<HashMap<&'static str, u16>>,
    unreachable: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer every command of `kind` with `status`.
    pub fn respond(&self, kind: &'static str, status: u16) {
        self.statuses.lock().unwrap().insert(kind, status);
    }

    /// Fail every command at the transport level.
    pub fn set_unreachable(&self) {
        self.unreachable.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(SocketAddr, ProxyCommand)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.sent().iter().map(|(_, c)| c.kind()).collect()
    }
}

#[async_trait]
impl CommandTransport for RecordingTransport {
    async fn send(&self, control: SocketAddr, command: &ProxyCommand) -> Result<ProxyResponse> {
        self.sent.lock().unwrap().push((control, command.clone()));
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(MtdError::ProxyTransport(format!("{control} unreachable")));
        }
        let status = self
            .statuses
            .lock()
            .unwrap()
            .get(command.kind())
            .copied()
            .unwrap_or_else(|| command.success_status());
        Ok(ProxyResponse {
            status,
            body: "{}".into(),
        })
    }
}

/// Keeps a copy of every checkpointed registry; can be told to fail.
#[derive(Default)]
pub struct RecordingCheckpoint {
    snapshots: Mutex<Vec<Vec<Service>>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl RecordingCheckpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let checkpoint = Self::default();
        checkpoint.failing.store(true, Ordering::SeqCst);
        Arc::new(checkpoint)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Option<Vec<Service>> {
        self.snapshots.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Checkpoint for RecordingCheckpoint {
    async fn checkpoint(&self, registry: &ServiceRegistry) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(MtdError::State("disk full".into()));
        }
        self.snapshots.lock().unwrap().push(registry.to_services());
        Ok(())
    }
}

pub fn instance(id: &str, zone: &str, public: &str) -> InstanceDetails {
    InstanceDetails {
        instance_id: id.into(),
        region: REGION.into(),
        zone: zone.into(),
        state: InstanceState::Running,
        instance_type: "t3.small".into(),
        key_name: Some("ops".into()),
        security_groups: vec!["sg-web".into()],
        name_tag: Some("web".into()),
        public_address: Some(public.into()),
        private_address: Some("172.31.5.5".into()),
    }
}

/// A two-zone region holding `i-old` in `us-east-1a` at 10.0.0.5.
pub fn two_zone_cloud() -> Arc<InMemoryCloud> {
    Arc::new(
        InMemoryCloud::new("aws")
            .with_zones(REGION, &["us-east-1a", "us-east-1b"])
            .with_instance(instance("i-old", "us-east-1a", "10.0.0.5")),
    )
}

/// An eligible service fronted by a proxy at 198.51.100.1:443, backed by
/// `i-old` on port 8080.
pub fn tracked_service() -> Service {
    Service {
        id: ServiceId::parse("87e79cbc-6df6-4462-8412-85d6c473e3b1").unwrap(),
        cloud_id: format!("aws_{REGION}_i-old"),
        entry_ip: Some("198.51.100.1".parse().unwrap()),
        entry_port: 443,
        service_ip: "10.0.0.5".parse().unwrap(),
        service_port: 8080,
        active: true,
        admin_enabled: true,
    }
}

pub fn control_address() -> SocketAddr {
    SocketAddr::new("198.51.100.1".parse().unwrap(), MANAGEMENT_PORT)
}

pub fn config() -> MigrationConfig {
    MigrationConfig {
        management_port: MANAGEMENT_PORT,
        poll_interval: Duration::from_secs(1),
        wait_timeout: Duration::from_secs(30),
        address: AddressKind::Public,
    }
}

pub fn engine(cloud: Arc<InMemoryCloud>, transport: Arc<RecordingTransport>) -> MigrationEngine {
    MigrationEngine::new(cloud, transport, config())
}
