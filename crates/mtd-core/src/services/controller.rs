use std::sync::Arc;

use tokio::sync::{watch, RwLock};

use crate::error::{MtdError, Result};
use crate::models::{Document, MtdSettings, Service, ServiceId};

use super::cloud::{scan_regions, CloudProvider};
use super::migration::{MigrationConfig, MigrationEngine, MigrationFailure, MigrationOutcome};
use super::proxy::{CommandTransport, ProxyClient};
use super::reconciler::{reconcile, ReconcileOptions, ReconcileStats};
use super::registry::ServiceRegistry;
use super::selection::{strategy_for, SelectionStrategy};
use super::state::{Checkpoint, DocumentCheckpoint, DocumentStore};

/// Tunnels opened at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelReport {
    pub opened: usize,
    pub failed: usize,
    /// Eligible services without an `entry_ip`.
    pub skipped: usize,
}

#[derive(Debug)]
pub struct CycleReport {
    pub reconcile: ReconcileStats,
    /// `None` when no service was eligible.
    pub migration: Option<std::result::Result<MigrationOutcome, MigrationFailure>>,
}

/// Owns the registry and drives reconciliation and migration cycles.
pub struct Controller {
    registry: Arc<RwLock<ServiceRegistry>>,
    checkpoint: Arc<dyn Checkpoint>,
    cloud: Arc<dyn CloudProvider>,
    transport: Arc<dyn CommandTransport>,
    settings: MtdSettings,
    regions: Vec<String>,
    selector: Box<dyn SelectionStrategy>,
    engine: MigrationEngine,
    shutdown: watch::Receiver<bool>,
}

impl Controller {
    pub fn new(
        settings: MtdSettings,
        regions: Vec<String>,
        registry: ServiceRegistry,
        checkpoint: Arc<dyn Checkpoint>,
        cloud: Arc<dyn CloudProvider>,
        transport: Arc<dyn CommandTransport>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let engine = MigrationEngine::new(
            cloud.clone(),
            transport.clone(),
            MigrationConfig::from(&settings),
        )
        .with_shutdown(shutdown.clone());
        Self {
            registry: Arc::new(RwLock::new(registry)),
            checkpoint,
            cloud,
            transport,
            selector: strategy_for(settings.selection),
            settings,
            regions,
            engine,
            shutdown,
        }
    }

    /// Build a controller whose checkpoints rewrite the document at `store`.
    pub fn from_document(
        document: Document,
        store: DocumentStore,
        cloud: Arc<dyn CloudProvider>,
        transport: Arc<dyn CommandTransport>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let Document { mtd, cloud: cloud_settings } = document;
        let registry = ServiceRegistry::from_services(mtd.services);
        let regions = cloud_settings.regions.clone();
        let checkpoint = Arc::new(DocumentCheckpoint::new(
            store,
            mtd.settings.clone(),
            cloud_settings,
        ));
        Self::new(
            mtd.settings,
            regions,
            registry,
            checkpoint,
            cloud,
            transport,
            shutdown,
        )
    }

    /// Replace the selection strategy chosen from settings.
    pub fn with_selector(mut self, selector: Box<dyn SelectionStrategy>) -> Self {
        self.selector = selector;
        self
    }

    pub fn settings(&self) -> &MtdSettings {
        &self.settings
    }

    /// Snapshot of all tracked services, ordered by id.
    pub async fn services(&self) -> Vec<Service> {
        self.registry.read().await.to_services()
    }

    /// Scan every region and fold the live instances into the registry.
    pub async fn reconcile(&self) -> Result<ReconcileStats> {
        let scan = scan_regions(self.cloud.as_ref(), &self.regions).await;
        let options = ReconcileOptions {
            admin_enabled_default: self.settings.new_services_admin_enabled,
            address: self.settings.service_address,
        };
        let mut registry = self.registry.write().await;
        let mut stats =
            reconcile(&mut registry, &scan.instances, &options, self.checkpoint.as_ref()).await?;
        stats.failed_regions = scan.failed_regions.len();
        stats.skipped += scan.skipped;
        tracing::info!(
            scanned = stats.scanned,
            new = stats.newly_added,
            inactive = stats.left_inactive,
            skipped = stats.skipped,
            failed_regions = stats.failed_regions,
            "reconciled registry"
        );
        Ok(stats)
    }

    /// Open the tunnel of every eligible service on its proxy. A proxy that
    /// does not answer `status` is not sent `create`.
    pub async fn open_tunnels(&self) -> TunnelReport {
        let services: Vec<Service> = {
            let registry = self.registry.read().await;
            registry.eligible().into_iter().cloned().collect()
        };
        let mut report = TunnelReport::default();
        for service in services {
            let Some(control) = service.control_endpoint(self.settings.management_port) else {
                tracing::debug!(service = %service.id, "no entry ip, not opening tunnel");
                report.skipped += 1;
                continue;
            };
            let proxy = ProxyClient::new(control, self.transport.clone());
            let opened = match proxy.status().await {
                Ok(_) => {
                    proxy
                        .create(service.entry_port, service.backend(), service.id)
                        .await
                }
                Err(e) => Err(e),
            };
            match opened {
                Ok(()) => {
                    tracing::info!(service = %service.id, %control, backend = %service.backend(), "tunnel opened");
                    report.opened += 1;
                }
                Err(e) => {
                    tracing::warn!(service = %service.id, %control, error = %e, "failed to open tunnel");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Migrate `id`, or the service picked by the selection strategy.
    pub async fn migrate(
        &self,
        id: Option<ServiceId>,
    ) -> Option<std::result::Result<MigrationOutcome, MigrationFailure>> {
        let mut registry = self.registry.write().await;
        match id {
            Some(id) => Some(
                self.engine
                    .migrate(&mut registry, self.checkpoint.as_ref(), id)
                    .await,
            ),
            None => {
                self.engine
                    .migrate_selected(&mut registry, self.checkpoint.as_ref(), self.selector.as_ref())
                    .await
            }
        }
    }

    /// One tick: reconcile, then migrate at most one service.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let reconcile = self.reconcile().await?;
        let migration = self.migrate(None).await;
        match &migration {
            Some(Ok(outcome)) => tracing::info!(
                service = %outcome.service,
                from = %outcome.old_cloud_id,
                to = %outcome.new_cloud_id,
                zone = %outcome.target_zone,
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                "migration complete"
            ),
            Some(Err(_)) => {}
            None => tracing::info!("no eligible service this cycle"),
        }
        Ok(CycleReport {
            reconcile,
            migration,
        })
    }

    /// Run cycles every `cycle_interval` until shutdown is signalled. A
    /// failed cycle is logged and the next one still runs.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown = self.shutdown.clone();
        let interval = self.settings.cycle_interval();
        tracing::info!(interval_secs = interval.as_secs(), "controller started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_cycle().await {
                tracing::error!(error = %e, "cycle failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Err(MtdError::Cancelled);
                    }
                }
            }
        }
        tracing::info!("controller stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory_cloud::InMemoryCloud;
    use crate::services::proxy::{ProxyCommand, ProxyResponse};
    use async_trait::async_trait;
    use std::net::SocketAddr;

    struct NullCheckpoint;

    #[async_trait]
    impl Checkpoint for NullCheckpoint {
        async fn checkpoint(&self, _registry: &ServiceRegistry) -> Result<()> {
            Ok(())
        }
    }

    struct AcceptAll;

    #[async_trait]
    impl CommandTransport for AcceptAll {
        async fn send(&self, _control: SocketAddr, command: &ProxyCommand) -> Result<ProxyResponse> {
            Ok(ProxyResponse {
                status: command.success_status(),
                body: String::new(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let controller = Controller::new(
            MtdSettings::default(),
            vec!["us-east-1".into()],
            ServiceRegistry::new(),
            Arc::new(NullCheckpoint),
            Arc::new(InMemoryCloud::new("aws")),
            Arc::new(AcceptAll),
            rx,
        );
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(150)).await;
            tx.send(true).unwrap();
            tx
        });
        controller.run().await.unwrap();
        drop(stopper.await.unwrap());
    }
}
