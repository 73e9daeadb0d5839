use crate::error::Result;
use crate::models::{AddressKind, CloudInstance, Service};

use super::registry::ServiceRegistry;
use super::state::Checkpoint;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Live instances folded into the registry.
    pub scanned: usize,
    pub newly_added: usize,
    pub left_inactive: usize,
    /// Instances skipped because their address was missing or unparsable.
    pub skipped: usize,
    pub failed_regions: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    pub admin_enabled_default: bool,
    pub address: AddressKind,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            admin_enabled_default: true,
            address: AddressKind::Public,
        }
    }
}

/// Align the registry with the live instances.
///
/// Every entry starts out inactive; entries whose `cloud_id` matches a live
/// instance are reactivated and unknown instances become new services.
/// Nothing is ever removed. Each new entry is checkpointed as soon as it is
/// created, and the final active flags are checkpointed at the end, so a
/// rerun after a crash converges on the same registry.
pub async fn reconcile(
    registry: &mut ServiceRegistry,
    live: &[CloudInstance],
    options: &ReconcileOptions,
    checkpoint: &dyn Checkpoint,
) -> Result<ReconcileStats> {
    let mut stats = ReconcileStats::default();
    registry.mark_all_inactive();

    for instance in live {
        let cloud_id = instance.locator.encode();
        let Some(address) = instance.address(options.address) else {
            tracing::warn!(%cloud_id, "instance has no usable address, skipping");
            stats.skipped += 1;
            continue;
        };
        stats.scanned += 1;

        let matches: Vec<_> = registry
            .find_by_cloud_id(&cloud_id)
            .into_iter()
            .map(|s| s.id)
            .collect();
        if let Some(first) = matches.first() {
            if matches.len() > 1 {
                tracing::warn!(
                    %cloud_id,
                    duplicates = matches.len() - 1,
                    "several services share a cloud id, activating {first} only"
                );
            }
            registry.set_active(first, true);
            continue;
        }

        let service = Service::discovered(cloud_id.clone(), address, options.admin_enabled_default);
        tracing::info!(service = %service.id, %cloud_id, %address, "new instance found");
        registry.upsert(service);
        checkpoint.checkpoint(registry).await?;
        stats.newly_added += 1;
    }

    stats.left_inactive = registry.list().iter().filter(|s| !s.active).count();
    checkpoint.checkpoint(registry).await?;
    Ok(stats)
}
