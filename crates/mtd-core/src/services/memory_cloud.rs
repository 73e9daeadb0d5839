use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{MtdError, Result};
use crate::models::{
    ImageDetails, ImageRequest, ImageState, InstanceDetails, InstanceState, LaunchSpec,
};

use super::cloud::CloudProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudOperation {
    ListInstances,
    DescribeInstance,
    ListZones,
    CreateImage,
    DescribeImage,
    LaunchInstance,
    TerminateInstance,
    DeregisterImage,
    DeleteSnapshot,
}

/// How a freshly created image or launched instance progresses as it is
/// polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Ready once it has been described this many times.
    AfterPolls(u32),
    /// Stays pending forever.
    Never,
    /// Fails (image `failed`, instance `terminated`) after this many polls.
    FailAfter(u32),
}

fn default_provider() -> String {
    "aws".to_string()
}

/// Seed data for an [`InMemoryCloud`], usually read from a YAML file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InventoryFixture {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub zones: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub instances: Vec<InstanceDetails>,
}

struct InstanceRecord {
    details: InstanceDetails,
    polls: u32,
}

struct ImageRecord {
    region: String,
    details: ImageDetails,
    polls: u32,
}

#[derive(Default)]
struct CloudState {
    instances: BTreeMap<(String, String), InstanceRecord>,
    zones: BTreeMap<String, Vec<String>>,
    images: BTreeMap<String, ImageRecord>,
    snapshots: BTreeSet<String>,
    image_readiness: Option<Readiness>,
    instance_readiness: Option<Readiness>,
    failing_regions: HashSet<String>,
    failing_operations: HashSet<CloudOperation>,
    queued_launches: VecDeque<(String, Option<String>)>,
    launches: Vec<LaunchSpec>,
    calls: Vec<CloudOperation>,
    next_id: u64,
}

impl CloudState {
    fn record(&mut self, operation: CloudOperation, region: &str) -> Result<()> {
        self.calls.push(operation);
        if self.failing_operations.contains(&operation) {
            return Err(MtdError::Cloud(format!("injected failure for {operation:?}")));
        }
        if self.failing_regions.contains(region) {
            return Err(MtdError::Cloud(format!("region {region} unavailable")));
        }
        Ok(())
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// A cloud that lives entirely in memory. Backs the daemon's simulation mode
/// and the test suites.
pub struct InMemoryCloud {
    provider: String,
    state: Mutex<CloudState>,
}

impl InMemoryCloud {
    pub fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            state: Mutex::new(CloudState::default()),
        }
    }

    pub fn from_fixture(fixture: InventoryFixture) -> Self {
        let cloud = Self::new(&fixture.provider);
        {
            let mut state = cloud.lock();
            state.zones = fixture.zones;
            for details in fixture.instances {
                state.instances.insert(
                    (details.region.clone(), details.instance_id.clone()),
                    InstanceRecord { details, polls: 0 },
                );
            }
        }
        cloud
    }

    pub async fn load_fixture(path: &Path) -> Result<Self> {
        let yaml = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| MtdError::InvalidConfig(format!("reading inventory {}: {e}", path.display())))?;
        let fixture: InventoryFixture = serde_yaml::from_str(&yaml)?;
        Ok(Self::from_fixture(fixture))
    }

    pub fn with_zones(self, region: &str, zones: &[&str]) -> Self {
        self.lock().zones.insert(
            region.to_string(),
            zones.iter().map(|z| z.to_string()).collect(),
        );
        self
    }

    pub fn with_instance(self, details: InstanceDetails) -> Self {
        self.lock().instances.insert(
            (details.region.clone(), details.instance_id.clone()),
            InstanceRecord { details, polls: 0 },
        );
        self
    }

    pub fn set_image_readiness(&self, readiness: Readiness) {
        self.lock().image_readiness = Some(readiness);
    }

    pub fn set_instance_readiness(&self, readiness: Readiness) {
        self.lock().instance_readiness = Some(readiness);
    }

    pub fn set_instance_state(&self, region: &str, instance_id: &str, state: InstanceState) {
        if let Some(record) = self
            .lock()
            .instances
            .get_mut(&(region.to_string(), instance_id.to_string()))
        {
            record.details.state = state;
        }
    }

    pub fn fail_region(&self, region: &str) {
        self.lock().failing_regions.insert(region.to_string());
    }

    pub fn fail_operation(&self, operation: CloudOperation) {
        self.lock().failing_operations.insert(operation);
    }

    /// Id and public address handed to the next launched instance.
    pub fn queue_launch(&self, instance_id: &str, public_address: Option<&str>) {
        self.lock()
            .queued_launches
            .push_back((instance_id.to_string(), public_address.map(str::to_string)));
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn calls_of(&self, operation: CloudOperation) -> usize {
        self.lock().calls.iter().filter(|c| **c == operation).count()
    }

    pub fn instance(&self, region: &str, instance_id: &str) -> Option<InstanceDetails> {
        self.lock()
            .instances
            .get(&(region.to_string(), instance_id.to_string()))
            .map(|r| r.details.clone())
    }

    pub fn image(&self, image_id: &str) -> Option<ImageDetails> {
        self.lock().images.get(image_id).map(|r| r.details.clone())
    }

    pub fn image_ids(&self) -> Vec<String> {
        self.lock().images.keys().cloned().collect()
    }

    pub fn snapshot_exists(&self, snapshot_id: &str) -> bool {
        self.lock().snapshots.contains(snapshot_id)
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.lock().launches.clone()
    }

    fn lock(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn advance(readiness: Readiness, polls: u32) -> Option<bool> {
    match readiness {
        Readiness::AfterPolls(n) if polls >= n => Some(true),
        Readiness::FailAfter(n) if polls >= n => Some(false),
        _ => None,
    }
}

#[async_trait]
impl CloudProvider for InMemoryCloud {
    fn provider_tag(&self) -> &str {
        &self.provider
    }

    async fn list_instances(&self, region: &str) -> Result<Vec<InstanceDetails>> {
        let mut state = self.lock();
        state.record(CloudOperation::ListInstances, region)?;
        Ok(state
            .instances
            .values()
            .filter(|r| r.details.region == region)
            .map(|r| r.details.clone())
            .collect())
    }

    async fn describe_instance(
        &self,
        region: &str,
        instance_id: &str,
    ) -> Result<Option<InstanceDetails>> {
        let mut state = self.lock();
        state.record(CloudOperation::DescribeInstance, region)?;
        let readiness = state.instance_readiness.unwrap_or(Readiness::AfterPolls(1));
        let Some(record) = state
            .instances
            .get_mut(&(region.to_string(), instance_id.to_string()))
        else {
            return Ok(None);
        };
        if record.details.state == InstanceState::Pending {
            record.polls += 1;
            match advance(readiness, record.polls) {
                Some(true) => record.details.state = InstanceState::Running,
                Some(false) => record.details.state = InstanceState::Terminated,
                None => {}
            }
        }
        Ok(Some(record.details.clone()))
    }

    async fn list_zones(&self, region: &str) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.record(CloudOperation::ListZones, region)?;
        Ok(state.zones.get(region).cloned().unwrap_or_default())
    }

    async fn create_image(&self, region: &str, request: &ImageRequest) -> Result<String> {
        let mut state = self.lock();
        state.record(CloudOperation::CreateImage, region)?;
        let key = (region.to_string(), request.instance_id.clone());
        if !state.instances.contains_key(&key) {
            return Err(MtdError::InstanceNotFound(request.instance_id.clone()));
        }
        let n = state.next_id();
        let image_id = format!("ami-{n:08x}");
        let snapshot_id = format!("snap-{n:08x}");
        state.snapshots.insert(snapshot_id.clone());
        state.images.insert(
            image_id.clone(),
            ImageRecord {
                region: region.to_string(),
                details: ImageDetails {
                    image_id: image_id.clone(),
                    state: ImageState::Pending,
                    snapshot_ids: vec![snapshot_id],
                },
                polls: 0,
            },
        );
        Ok(image_id)
    }

    async fn describe_image(&self, region: &str, image_id: &str) -> Result<Option<ImageDetails>> {
        let mut state = self.lock();
        state.record(CloudOperation::DescribeImage, region)?;
        let readiness = state.image_readiness.unwrap_or(Readiness::AfterPolls(1));
        let Some(record) = state.images.get_mut(image_id) else {
            return Ok(None);
        };
        if record.region != region {
            return Ok(None);
        }
        if record.details.state == ImageState::Pending {
            record.polls += 1;
            match advance(readiness, record.polls) {
                Some(true) => record.details.state = ImageState::Available,
                Some(false) => record.details.state = ImageState::Failed,
                None => {}
            }
        }
        Ok(Some(record.details.clone()))
    }

    async fn launch_instance(&self, region: &str, spec: &LaunchSpec) -> Result<String> {
        let mut state = self.lock();
        state.record(CloudOperation::LaunchInstance, region)?;
        match state.images.get(&spec.image_id) {
            Some(image) if image.details.state == ImageState::Available => {}
            _ => {
                return Err(MtdError::Cloud(format!(
                    "image {} is not available",
                    spec.image_id
                )))
            }
        }
        let n = state.next_id();
        let (instance_id, public_address) = state
            .queued_launches
            .pop_front()
            .unwrap_or_else(|| (format!("i-{n:08x}"), Some(format!("203.0.113.{}", n % 250 + 1))));
        let details = InstanceDetails {
            instance_id: instance_id.clone(),
            region: region.to_string(),
            zone: spec.zone.clone(),
            state: InstanceState::Pending,
            instance_type: spec.instance_type.clone(),
            key_name: spec.key_name.clone(),
            security_groups: spec.security_groups.clone(),
            name_tag: spec.name_tag.clone(),
            public_address,
            private_address: Some(format!("10.0.{}.{}", n / 250 % 250, n % 250 + 1)),
        };
        state.launches.push(spec.clone());
        state.instances.insert(
            (region.to_string(), instance_id.clone()),
            InstanceRecord { details, polls: 0 },
        );
        Ok(instance_id)
    }

    async fn terminate_instance(&self, region: &str, instance_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.record(CloudOperation::TerminateInstance, region)?;
        match state
            .instances
            .get_mut(&(region.to_string(), instance_id.to_string()))
        {
            Some(record) => {
                record.details.state = InstanceState::Terminated;
                Ok(())
            }
            None => Err(MtdError::InstanceNotFound(instance_id.to_string())),
        }
    }

    async fn deregister_image(&self, region: &str, image_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.record(CloudOperation::DeregisterImage, region)?;
        state
            .images
            .remove(image_id)
            .map(|_| ())
            .ok_or_else(|| MtdError::Cloud(format!("image {image_id} not found")))
    }

    async fn delete_snapshot(&self, region: &str, snapshot_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.record(CloudOperation::DeleteSnapshot, region)?;
        if state.snapshots.remove(snapshot_id) {
            Ok(())
        } else {
            Err(MtdError::Cloud(format!("snapshot {snapshot_id} not found")))
        }
    }
}
