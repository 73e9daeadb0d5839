//! The migration state machine.
//!
//! One migration moves one service to a fresh instance in another zone of
//! the same region:
//!
//! `Selected → ProxyVerified → SourceValidated → ImageRequested → ImageReady
//! → InstanceLaunched → InstanceReady → ProxyRedirected → RegistryCommitted
//! → SourceReclaimed → Done`
//!
//! A failing step moves the job to `Aborted`. Completed steps are never
//! undone: an image or instance created before the abort is reported as a
//! leaked resource for the operator. The registry keeps pointing at the old
//! instance until `RegistryCommitted` succeeds.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::MtdError;
use crate::models::{
    AddressKind, CloudLocator, ImageDetails, ImageRequest, ImageState, InstanceDetails,
    LaunchSpec, MtdSettings, Service, ServiceId,
};

use super::cloud::CloudProvider;
use super::proxy::{CommandTransport, ProxyClient};
use super::registry::ServiceRegistry;
use super::selection::SelectionStrategy;
use super::state::Checkpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MigrationPhase {
    Selected,
    ProxyVerified,
    SourceValidated,
    ImageRequested,
    ImageReady,
    InstanceLaunched,
    InstanceReady,
    ProxyRedirected,
    RegistryCommitted,
    SourceReclaimed,
    Done,
    Aborted,
}

impl MigrationPhase {
    /// The step attempted after this one.
    pub fn next(self) -> MigrationPhase {
        use MigrationPhase::*;
        match self {
            Selected => ProxyVerified,
            ProxyVerified => SourceValidated,
            SourceValidated => ImageRequested,
            ImageRequested => ImageReady,
            ImageReady => InstanceLaunched,
            InstanceLaunched => InstanceReady,
            InstanceReady => ProxyRedirected,
            ProxyRedirected => RegistryCommitted,
            RegistryCommitted => SourceReclaimed,
            SourceReclaimed => Done,
            Done => Done,
            Aborted => Aborted,
        }
    }

    pub fn as_str(self) -> &'static str {
        use MigrationPhase::*;
        match self {
            Selected => "selected",
            ProxyVerified => "proxy-verified",
            SourceValidated => "source-validated",
            ImageRequested => "image-requested",
            ImageReady => "image-ready",
            InstanceLaunched => "instance-launched",
            InstanceReady => "instance-ready",
            ProxyRedirected => "proxy-redirected",
            RegistryCommitted => "registry-committed",
            SourceReclaimed => "source-reclaimed",
            Done => "done",
            Aborted => "aborted",
        }
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How bad an abort is for the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Nothing was created; the service is exactly as before.
    Clean,
    /// An image and possibly a new instance exist that nothing tracks.
    Leaked,
    /// The new instance is running but redirect or commit failed.
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Clean => "clean",
            Severity::Leaked => "leaked",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cloud resources created by an aborted migration that nothing tracks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeakedResources {
    pub region: Option<String>,
    pub image_id: Option<String>,
    pub instance_id: Option<String>,
}

impl LeakedResources {
    pub fn is_empty(&self) -> bool {
        self.image_id.is_none() && self.instance_id.is_none()
    }
}

impl fmt::Display for LeakedResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let region = self.region.as_deref().unwrap_or("?");
        let mut parts = Vec::new();
        if let Some(image) = &self.image_id {
            parts.push(format!("image {image}"));
        }
        if let Some(instance) = &self.instance_id {
            parts.push(format!("instance {instance}"));
        }
        write!(f, "{} in {region}", parts.join(", "))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("migration of {service} aborted at {failed_at}: {error}")]
pub struct MigrationFailure {
    pub service: ServiceId,
    /// The step that was being attempted.
    pub failed_at: MigrationPhase,
    pub leaked: LeakedResources,
    #[source]
    pub error: MtdError,
}

impl MigrationFailure {
    pub fn severity(&self) -> Severity {
        match self.failed_at {
            MigrationPhase::ProxyRedirected | MigrationPhase::RegistryCommitted => {
                Severity::Critical
            }
            _ if !self.leaked.is_empty() => Severity::Leaked,
            _ => Severity::Clean,
        }
    }
}

/// Result of the best-effort cleanup after commit. Failures here never undo
/// the commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub instance_terminated: bool,
    pub image_deregistered: bool,
    pub snapshots_deleted: Vec<String>,
    pub failures: Vec<String>,
}

impl CleanupReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub service: ServiceId,
    pub old_cloud_id: String,
    pub new_cloud_id: String,
    pub old_service_ip: IpAddr,
    pub new_service_ip: IpAddr,
    pub target_zone: String,
    pub image_id: String,
    pub cleanup: CleanupReport,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationConfig {
    pub management_port: u16,
    pub poll_interval: Duration,
    pub wait_timeout: Duration,
    pub address: AddressKind,
}

impl From<&MtdSettings> for MigrationConfig {
    fn from(settings: &MtdSettings) -> Self {
        Self {
            management_port: settings.management_port,
            poll_interval: settings.poll_interval(),
            wait_timeout: settings.wait_timeout(),
            address: settings.service_address,
        }
    }
}

/// Pick a zone uniformly at random among `zones`, never `current`.
pub fn pick_target_zone<R: Rng + ?Sized>(
    zones: &[String],
    current: &str,
    rng: &mut R,
) -> Result<String, MtdError> {
    let candidates: Vec<&String> = zones.iter().filter(|z| z.as_str() != current).collect();
    candidates
        .choose(rng)
        .map(|z| z.to_string())
        .ok_or_else(|| MtdError::NoAlternateZone(current.to_string()))
}

/// Working state of the one in-flight migration.
struct MigrationJob {
    source: Service,
    region: Option<String>,
    image_id: Option<String>,
    new_instance_id: Option<String>,
    phase: MigrationPhase,
    started: Instant,
}

impl MigrationJob {
    fn new(source: Service) -> Self {
        tracing::info!(service = %source.id, cloud_id = %source.cloud_id, "migration selected");
        Self {
            source,
            region: None,
            image_id: None,
            new_instance_id: None,
            phase: MigrationPhase::Selected,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, phase: MigrationPhase) {
        self.phase = phase;
        tracing::info!(
            service = %self.source.id,
            phase = %phase,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "migration advanced"
        );
    }

    fn leaked(&self) -> LeakedResources {
        LeakedResources {
            region: self.region.clone(),
            image_id: self.image_id.clone(),
            instance_id: self.new_instance_id.clone(),
        }
    }

    fn abort(&self, error: MtdError) -> MigrationFailure {
        let failure = MigrationFailure {
            service: self.source.id,
            failed_at: self.phase.next(),
            leaked: self.leaked(),
            error,
        };
        let severity = failure.severity();
        match severity {
            Severity::Clean => tracing::warn!(
                service = %failure.service,
                failed_at = %failure.failed_at,
                severity = %severity,
                error = %failure.error,
                "migration aborted, service unchanged"
            ),
            Severity::Leaked => tracing::error!(
                service = %failure.service,
                failed_at = %failure.failed_at,
                severity = %severity,
                leaked = %failure.leaked,
                error = %failure.error,
                "migration aborted, cloud resources left behind"
            ),
            Severity::Critical => tracing::error!(
                service = %failure.service,
                failed_at = %failure.failed_at,
                severity = %severity,
                leaked = %failure.leaked,
                error = %failure.error,
                "migration aborted after new instance started, duplicate live instance needs operator action"
            ),
        }
        failure
    }
}

/// Drives one service through the migration state machine.
pub struct MigrationEngine {
    cloud: Arc<dyn CloudProvider>,
    transport: Arc<dyn CommandTransport>,
    config: MigrationConfig,
    shutdown: Option<watch::Receiver<bool>>,
}

impl MigrationEngine {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        transport: Arc<dyn CommandTransport>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            cloud,
            transport,
            config,
            shutdown: None,
        }
    }

    /// Polling loops stop at their next tick once this flips to `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Select one eligible service and migrate it. `None` when nothing is
    /// eligible.
    pub async fn migrate_selected(
        &self,
        registry: &mut ServiceRegistry,
        checkpoint: &dyn Checkpoint,
        strategy: &dyn SelectionStrategy,
    ) -> Option<Result<MigrationOutcome, MigrationFailure>> {
        let id = strategy.select(registry)?;
        Some(self.migrate(registry, checkpoint, id).await)
    }

    pub async fn migrate(
        &self,
        registry: &mut ServiceRegistry,
        checkpoint: &dyn Checkpoint,
        id: ServiceId,
    ) -> Result<MigrationOutcome, MigrationFailure> {
        let Some(source) = registry.get(&id).cloned() else {
            return Err(MigrationFailure {
                service: id,
                failed_at: MigrationPhase::Selected,
                leaked: LeakedResources::default(),
                error: MtdError::ServiceNotFound(id.to_string()),
            });
        };
        let mut job = MigrationJob::new(source);
        if !job.source.is_eligible() {
            return Err(job.abort(MtdError::ServiceNotEligible(id.to_string())));
        }

        // Without a verified command channel the service would be orphaned
        // behind a proxy that cannot be repointed.
        let control = job
            .source
            .control_endpoint(self.config.management_port)
            .ok_or_else(|| job.abort(MtdError::NoControlEndpoint(id.to_string())))?;
        let proxy = ProxyClient::new(control, self.transport.clone());
        proxy.status().await.map_err(|e| job.abort(e))?;
        job.advance(MigrationPhase::ProxyVerified);

        let locator = CloudLocator::parse(&job.source.cloud_id).map_err(|e| job.abort(e))?;
        if locator.provider() != self.cloud.provider_tag() {
            return Err(job.abort(MtdError::ProviderMismatch {
                locator: job.source.cloud_id.clone(),
                expected: self.cloud.provider_tag().to_string(),
                found: locator.provider().to_string(),
            }));
        }
        let region = locator.region().to_string();
        job.region = Some(region.clone());
        let source_instance = self
            .cloud
            .describe_instance(&region, locator.instance_id())
            .await
            .map_err(|e| job.abort(e))?
            .ok_or_else(|| job.abort(MtdError::InstanceNotFound(locator.instance_id().to_string())))?;
        if !source_instance.is_running() {
            return Err(job.abort(MtdError::InstanceNotRunning {
                instance: source_instance.instance_id.clone(),
                state: source_instance.state.to_string(),
            }));
        }
        job.advance(MigrationPhase::SourceValidated);

        let request =
            ImageRequest::migration_backup(&source_instance.instance_id, Utc::now().timestamp());
        let image_id = self
            .cloud
            .create_image(&region, &request)
            .await
            .map_err(|e| job.abort(e))?;
        job.image_id = Some(image_id.clone());
        job.advance(MigrationPhase::ImageRequested);

        self.wait_for_image(&region, &image_id)
            .await
            .map_err(|e| job.abort(e))?;
        job.advance(MigrationPhase::ImageReady);

        let zones = self
            .cloud
            .list_zones(&region)
            .await
            .map_err(|e| job.abort(e))?;
        let target_zone = pick_target_zone(&zones, &source_instance.zone, &mut rand::thread_rng())
            .map_err(|e| job.abort(e))?;
        let spec = LaunchSpec::replicate(&source_instance, &image_id, &target_zone);
        let new_instance_id = self
            .cloud
            .launch_instance(&region, &spec)
            .await
            .map_err(|e| job.abort(e))?;
        job.new_instance_id = Some(new_instance_id.clone());
        tracing::info!(service = %id, instance = %new_instance_id, zone = %target_zone, "launched replacement instance");
        job.advance(MigrationPhase::InstanceLaunched);

        let launched = self
            .wait_for_instance(&region, &new_instance_id)
            .await
            .map_err(|e| job.abort(e))?;
        let new_address = launched
            .address(self.config.address)
            .ok_or_else(|| job.abort(MtdError::NoInstanceAddress(new_instance_id.clone())))?;
        let new_locator = CloudLocator::new(self.cloud.provider_tag(), &region, &new_instance_id)
            .map_err(|e| job.abort(e))?;
        job.advance(MigrationPhase::InstanceReady);

        proxy
            .modify(SocketAddr::new(new_address, job.source.service_port), id)
            .await
            .map_err(|e| job.abort(e))?;
        job.advance(MigrationPhase::ProxyRedirected);

        self.commit(registry, checkpoint, id, &new_locator, new_address)
            .await
            .map_err(|e| job.abort(e))?;
        job.advance(MigrationPhase::RegistryCommitted);

        let cleanup = self
            .reclaim(&region, &source_instance.instance_id, &image_id)
            .await;
        job.advance(MigrationPhase::SourceReclaimed);
        job.advance(MigrationPhase::Done);

        Ok(MigrationOutcome {
            service: id,
            old_cloud_id: job.source.cloud_id.clone(),
            new_cloud_id: new_locator.encode(),
            old_service_ip: job.source.service_ip,
            new_service_ip: new_address,
            target_zone,
            image_id,
            cleanup,
            elapsed: job.started.elapsed(),
        })
    }

    /// Point the registry entry at the new instance and persist it. On a
    /// failed checkpoint the in-memory entry is restored so it keeps
    /// matching the document on disk.
    async fn commit(
        &self,
        registry: &mut ServiceRegistry,
        checkpoint: &dyn Checkpoint,
        id: ServiceId,
        new_locator: &CloudLocator,
        new_address: IpAddr,
    ) -> Result<(), MtdError> {
        let previous = registry
            .get(&id)
            .cloned()
            .ok_or_else(|| MtdError::ServiceNotFound(id.to_string()))?;
        let mut updated = previous.clone();
        updated.cloud_id = new_locator.encode();
        updated.service_ip = new_address;
        registry.upsert(updated);
        if let Err(e) = checkpoint.checkpoint(registry).await {
            registry.upsert(previous);
            return Err(e);
        }
        Ok(())
    }

    /// Terminate the old instance, deregister the image and delete its
    /// snapshots. Every action is attempted regardless of the others.
    async fn reclaim(&self, region: &str, old_instance_id: &str, image_id: &str) -> CleanupReport {
        let mut report = CleanupReport::default();

        match self.cloud.terminate_instance(region, old_instance_id).await {
            Ok(()) => {
                report.instance_terminated = true;
                tracing::info!(%region, instance = %old_instance_id, "terminated old instance");
            }
            Err(e) => report.failures.push(format!("terminate {old_instance_id}: {e}")),
        }

        let snapshot_ids = match self.cloud.describe_image(region, image_id).await {
            Ok(Some(image)) => image.snapshot_ids,
            Ok(None) => Vec::new(),
            Err(e) => {
                report.failures.push(format!("describe image {image_id}: {e}"));
                Vec::new()
            }
        };

        match self.cloud.deregister_image(region, image_id).await {
            Ok(()) => {
                report.image_deregistered = true;
                tracing::info!(%region, image = %image_id, "deregistered image");
            }
            Err(e) => report.failures.push(format!("deregister {image_id}: {e}")),
        }

        for snapshot_id in snapshot_ids {
            match self.cloud.delete_snapshot(region, &snapshot_id).await {
                Ok(()) => {
                    tracing::info!(%region, snapshot = %snapshot_id, "deleted snapshot");
                    report.snapshots_deleted.push(snapshot_id);
                }
                Err(e) => report.failures.push(format!("delete {snapshot_id}: {e}")),
            }
        }

        for failure in &report.failures {
            tracing::warn!(%region, %failure, "cleanup step failed, registry stays committed");
        }
        report
    }

    async fn wait_for_image(&self, region: &str, image_id: &str) -> Result<ImageDetails, MtdError> {
        let what = format!("image {image_id}");
        let deadline = Instant::now() + self.config.wait_timeout;
        loop {
            self.next_tick(deadline, &what).await?;
            match self.cloud.describe_image(region, image_id).await? {
                Some(image) if image.state == ImageState::Available => return Ok(image),
                Some(image) if image.state == ImageState::Failed => {
                    return Err(MtdError::ImageBuildFailed(image_id.to_string()))
                }
                _ => {}
            }
        }
    }

    async fn wait_for_instance(
        &self,
        region: &str,
        instance_id: &str,
    ) -> Result<InstanceDetails, MtdError> {
        let what = format!("instance {instance_id}");
        let deadline = Instant::now() + self.config.wait_timeout;
        loop {
            self.next_tick(deadline, &what).await?;
            match self.cloud.describe_instance(region, instance_id).await? {
                Some(instance) if instance.is_running() => return Ok(instance),
                Some(instance) if instance.state.is_terminal() => {
                    return Err(MtdError::InstanceNotRunning {
                        instance: instance_id.to_string(),
                        state: instance.state.to_string(),
                    })
                }
                _ => {}
            }
        }
    }

    /// Sleep one poll interval. Fails once the deadline has passed or a
    /// shutdown was requested.
    async fn next_tick(&self, deadline: Instant, what: &str) -> Result<(), MtdError> {
        if Instant::now() >= deadline {
            return Err(MtdError::WaitTimeout {
                what: what.to_string(),
                after: self.config.wait_timeout,
            });
        }
        tokio::time::sleep(self.config.poll_interval).await;
        if self.shutdown_requested() {
            return Err(MtdError::Cancelled);
        }
        Ok(())
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }
}
