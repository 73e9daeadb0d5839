use std::time::Instant;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{CloudInstance, ImageDetails, ImageRequest, InstanceDetails, LaunchSpec};

/// Region-scoped compute operations the controller needs from a cloud
/// provider. Bindings for a concrete provider live outside this crate.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// First segment of every locator this provider produces.
    fn provider_tag(&self) -> &str;

    async fn list_instances(&self, region: &str) -> Result<Vec<InstanceDetails>>;

    async fn describe_instance(
        &self,
        region: &str,
        instance_id: &str,
    ) -> Result<Option<InstanceDetails>>;

    async fn list_zones(&self, region: &str) -> Result<Vec<String>>;

    /// Request an image; returns its id immediately while the provider
    /// builds it asynchronously.
    async fn create_image(&self, region: &str, request: &ImageRequest) -> Result<String>;

    async fn describe_image(&self, region: &str, image_id: &str) -> Result<Option<ImageDetails>>;

    async fn launch_instance(&self, region: &str, spec: &LaunchSpec) -> Result<String>;

    async fn terminate_instance(&self, region: &str, instance_id: &str) -> Result<()>;

    async fn deregister_image(&self, region: &str, image_id: &str) -> Result<()>;

    async fn delete_snapshot(&self, region: &str, snapshot_id: &str) -> Result<()>;
}

/// Result of listing every configured region.
#[derive(Debug, Clone, Default)]
pub struct InventoryScan {
    pub instances: Vec<CloudInstance>,
    pub failed_regions: Vec<String>,
    /// Instances whose ids could not be turned into a locator.
    pub skipped: usize,
}

/// List live instances in all `regions`. A region whose listing fails is
/// logged and skipped; the remaining regions are still scanned. Instances
/// that are shutting down or terminated are not reported.
pub async fn scan_regions(provider: &dyn CloudProvider, regions: &[String]) -> InventoryScan {
    let mut scan = InventoryScan::default();
    for region in regions {
        let started = Instant::now();
        let listed = match provider.list_instances(region).await {
            Ok(listed) => listed,
            Err(e) => {
                tracing::warn!(%region, error = %e, "listing instances failed, skipping region");
                scan.failed_regions.push(region.clone());
                continue;
            }
        };
        tracing::debug!(
            %region,
            count = listed.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "listed instances"
        );
        for details in listed {
            if details.state.is_terminal() {
                continue;
            }
            match details.to_cloud_instance(provider.provider_tag()) {
                Ok(instance) => scan.instances.push(instance),
                Err(e) => {
                    tracing::warn!(%region, instance = %details.instance_id, error = %e, "skipping instance");
                    scan.skipped += 1;
                }
            }
        }
    }
    scan
}
