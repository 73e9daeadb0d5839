mod cli;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{bail, eyre, WrapErr};
use tokio::sync::watch;

use mtd_core::models::{Document, MtdSettings, ServiceId};
use mtd_core::services::cloud::CloudProvider;
use mtd_core::services::config_loader;
use mtd_core::services::controller::Controller;
use mtd_core::services::memory_cloud::InMemoryCloud;
use mtd_core::services::proxy::{HttpTransport, ProxyClient};
use mtd_core::services::state::DocumentStore;

use crate::cli::{Cli, Command, ProxyAction};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.as_deref(), cli.debug);

    match &cli.command {
        Command::Run => run(&cli).await,
        Command::Reconcile => reconcile(&cli).await,
        Command::Migrate { service } => migrate(&cli, service.as_deref()).await,
        Command::Services => services(&cli).await,
        Command::Proxy { control, action } => proxy(*control, action).await,
    }
}

/// Log to `log_file` when given, stderr otherwise. The returned guard must
/// be held until exit so buffered lines are flushed.
fn setup_logging(
    log_file: Option<&Path>,
    debug: bool,
) -> tracing_appender::non_blocking::WorkerGuard {
    let default_level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "mtdd.log".into());
            let appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_writer(non_blocking)
                .with_env_filter(filter)
                .with_ansi(false)
                .init();
            guard
        }
        None => {
            let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
            tracing_subscriber::fmt()
                .with_writer(non_blocking)
                .with_env_filter(filter)
                .init();
            guard
        }
    }
}

/// Flips to `true` on Ctrl-C.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested, finishing current step");
            let _ = tx.send(true);
        }
        // keep the sender alive so receivers do not see a closed channel
        tx.closed().await;
    });
    rx
}

async fn load_document(cli: &Cli) -> color_eyre::Result<(Document, DocumentStore)> {
    let store = DocumentStore::new(&cli.config);
    let document = store
        .load()
        .await
        .wrap_err_with(|| format!("failed to load {}", cli.config.display()))?;
    Ok((document, store))
}

async fn load_cloud(cli: &Cli, provider: &str) -> color_eyre::Result<Arc<InMemoryCloud>> {
    let path = cli.inventory.as_deref().ok_or_else(|| {
        eyre!("--inventory is required: no other cloud backend is built into mtdd")
    })?;
    let cloud = InMemoryCloud::load_fixture(path)
        .await
        .wrap_err_with(|| format!("failed to load inventory {}", path.display()))?;
    let tag = cloud.provider_tag();
    if tag != provider {
        bail!("inventory is for provider '{tag}' but the document configures '{provider}'");
    }
    Ok(Arc::new(cloud))
}

async fn build_controller(cli: &Cli) -> color_eyre::Result<Controller> {
    let (document, store) = load_document(cli).await?;
    config_loader::validate_inputs(&cli.config, &document.cloud)?;
    let cloud = load_cloud(cli, &document.cloud.provider).await?;
    let transport = Arc::new(HttpTransport::new(document.mtd.settings.proxy_timeout())?);
    Ok(Controller::from_document(
        document,
        store,
        cloud,
        transport,
        shutdown_signal(),
    ))
}

async fn run(cli: &Cli) -> color_eyre::Result<()> {
    let controller = build_controller(cli).await?;
    controller.reconcile().await?;
    let tunnels = controller.open_tunnels().await;
    tracing::info!(
        opened = tunnels.opened,
        failed = tunnels.failed,
        skipped = tunnels.skipped,
        "startup tunnels"
    );
    controller.run().await?;
    Ok(())
}

async fn reconcile(cli: &Cli) -> color_eyre::Result<()> {
    let controller = build_controller(cli).await?;
    let stats = controller.reconcile().await?;
    println!(
        "scanned {} instances: {} new, {} inactive, {} skipped, {} regions failed",
        stats.scanned, stats.newly_added, stats.left_inactive, stats.skipped, stats.failed_regions
    );
    Ok(())
}

async fn migrate(cli: &Cli, service: Option<&str>) -> color_eyre::Result<()> {
    let id = service.map(ServiceId::parse).transpose()?;
    let controller = build_controller(cli).await?;
    controller.reconcile().await?;
    match controller.migrate(id).await {
        None => println!("no eligible service"),
        Some(Ok(outcome)) => {
            println!(
                "migrated {} from {} to {} ({}) in {:.1}s",
                outcome.service,
                outcome.old_cloud_id,
                outcome.new_cloud_id,
                outcome.target_zone,
                outcome.elapsed.as_secs_f64()
            );
            for failure in &outcome.cleanup.failures {
                println!("  cleanup failed: {failure}");
            }
        }
        Some(Err(failure)) => {
            let severity = failure.severity();
            let leaked = failure.leaked.clone();
            return Err(color_eyre::Report::new(failure)
                .wrap_err(format!("severity {severity}, leaked resources: {leaked}")));
        }
    }
    Ok(())
}

async fn services(cli: &Cli) -> color_eyre::Result<()> {
    let (document, _) = load_document(cli).await?;
    if document.mtd.services.is_empty() {
        println!("no tracked services");
        return Ok(());
    }
    print!("{}", serde_yaml::to_string(&document.mtd.services)?);
    Ok(())
}

async fn proxy(control: std::net::SocketAddr, action: &ProxyAction) -> color_eyre::Result<()> {
    let transport = Arc::new(HttpTransport::new(MtdSettings::default().proxy_timeout())?);
    let client = ProxyClient::new(control, transport);
    match action {
        ProxyAction::Status => println!("{}", client.status().await?),
        ProxyAction::Create {
            incoming_port,
            destination,
            id,
        } => {
            client
                .create(*incoming_port, *destination, ServiceId::parse(id)?)
                .await?;
            println!("tunnel {id} created");
        }
        ProxyAction::Modify { destination, id } => {
            client.modify(*destination, ServiceId::parse(id)?).await?;
            println!("tunnel {id} now points at {destination}");
        }
        ProxyAction::Delete { id } => {
            client.delete(ServiceId::parse(id)?).await?;
            println!("tunnel {id} deleted");
        }
    }
    Ok(())
}
