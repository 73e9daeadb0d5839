mod common;

use std::net::{IpAddr, SocketAddr};

use tokio::sync::watch;

use mtd_core::models::InstanceState;
use mtd_core::services::memory_cloud::{CloudOperation, Readiness};
use mtd_core::services::migration::{MigrationEngine, MigrationPhase, Severity};
use mtd_core::services::registry::ServiceRegistry;
use mtd_core::services::selection::FirstEligible;
use mtd_core::MtdError;

use common::{
    config, control_address, engine, tracked_service, two_zone_cloud, RecordingCheckpoint,
    RecordingTransport, REGION,
};

fn registry() -> ServiceRegistry {
    ServiceRegistry::from_services(vec![tracked_service()])
}

#[tokio::test(start_paused = true)]
async fn migrates_service_to_other_zone() {
    let cloud = two_zone_cloud();
    cloud.queue_launch("i-new", Some("10.0.1.7"));
    let transport = RecordingTransport::new();
    let checkpoint = RecordingCheckpoint::new();
    let mut registry = registry();
    let id = tracked_service().id;

    let outcome = engine(cloud.clone(), transport.clone())
        .migrate(&mut registry, checkpoint.as_ref(), id)
        .await
        .unwrap();

    assert_eq!(outcome.old_cloud_id, "aws_us-east-1_i-old");
    assert_eq!(outcome.new_cloud_id, "aws_us-east-1_i-new");
    assert_eq!(outcome.target_zone, "us-east-1b");
    assert!(outcome.cleanup.is_complete());

    let service = registry.get(&id).unwrap();
    assert_eq!(service.cloud_id, "aws_us-east-1_i-new");
    assert_eq!(service.service_ip, "10.0.1.7".parse::<IpAddr>().unwrap());
    assert_eq!(service.entry_port, 443);
    assert_eq!(service.service_port, 8080);
    assert!(service.active);

    // status first, then one modify pointing at the new backend
    let sent = transport.sent();
    assert_eq!(transport.kinds(), vec!["status", "modify"]);
    assert!(sent.iter().all(|(control, _)| *control == control_address()));
    let modify = sent[1].1.modify.as_ref().unwrap();
    assert_eq!(modify.id, id);
    assert_eq!(
        SocketAddr::new(modify.destination_ip, modify.destination_port),
        "10.0.1.7:8080".parse::<SocketAddr>().unwrap()
    );

    let launch = &cloud.launches()[0];
    assert_eq!(launch.zone, "us-east-1b");
    assert_eq!(launch.instance_type, "t3.small");
    assert_eq!(launch.security_groups, vec!["sg-web".to_string()]);
    assert_eq!(launch.image_id, outcome.image_id);

    assert_eq!(
        cloud.instance(REGION, "i-old").unwrap().state,
        InstanceState::Terminated
    );
    assert!(cloud.image(&outcome.image_id).is_none());
    assert_eq!(outcome.cleanup.snapshots_deleted.len(), 1);
    assert!(!cloud.snapshot_exists(&outcome.cleanup.snapshots_deleted[0]));

    let persisted = checkpoint.last().unwrap();
    assert_eq!(persisted[0].cloud_id, "aws_us-east-1_i-new");
}

#[tokio::test(start_paused = true)]
async fn image_timeout_leaves_registry_untouched() {
    let cloud = two_zone_cloud();
    cloud.set_image_readiness(Readiness::Never);
    let transport = RecordingTransport::new();
    let checkpoint = RecordingCheckpoint::new();
    let mut registry = registry();
    let before = registry.to_services();

    let failure = engine(cloud.clone(), transport.clone())
        .migrate(&mut registry, checkpoint.as_ref(), tracked_service().id)
        .await
        .unwrap_err();

    assert_eq!(failure.failed_at, MigrationPhase::ImageReady);
    assert!(matches!(failure.error, MtdError::WaitTimeout { .. }));
    assert_eq!(failure.severity(), Severity::Leaked);
    assert!(failure.leaked.image_id.is_some());
    assert!(failure.leaked.instance_id.is_none());
    assert_eq!(registry.to_services(), before);
    assert_eq!(cloud.calls_of(CloudOperation::LaunchInstance), 0);
    assert_eq!(checkpoint.attempts(), 0);
    assert_eq!(transport.kinds(), vec!["status"]);
}

#[tokio::test(start_paused = true)]
async fn instance_timeout_is_reported_leaked() {
    let cloud = two_zone_cloud();
    cloud.set_instance_readiness(Readiness::Never);
    let transport = RecordingTransport::new();
    let checkpoint = RecordingCheckpoint::new();
    let mut registry = registry();
    let before = registry.to_services();

    let failure = engine(cloud.clone(), transport.clone())
        .migrate(&mut registry, checkpoint.as_ref(), tracked_service().id)
        .await
        .unwrap_err();

    assert_eq!(failure.failed_at, MigrationPhase::InstanceReady);
    assert!(matches!(failure.error, MtdError::WaitTimeout { .. }));
    assert_eq!(failure.severity(), Severity::Leaked);
    assert!(failure.leaked.image_id.is_some());
    assert!(failure.leaked.instance_id.is_some());
    assert_eq!(registry.to_services(), before);
    assert_eq!(checkpoint.attempts(), 0);
    assert_eq!(transport.kinds(), vec!["status"]);
}

#[tokio::test(start_paused = true)]
async fn failed_image_aborts() {
    let cloud = two_zone_cloud();
    cloud.set_image_readiness(Readiness::FailAfter(2));
    let mut registry = registry();

    let failure = engine(cloud.clone(), RecordingTransport::new())
        .migrate(&mut registry, RecordingCheckpoint::new().as_ref(), tracked_service().id)
        .await
        .unwrap_err();

    assert!(matches!(failure.error, MtdError::ImageBuildFailed(_)));
    assert_eq!(cloud.calls_of(CloudOperation::LaunchInstance), 0);
}

#[tokio::test(start_paused = true)]
async fn unreachable_proxy_touches_no_cloud_resources() {
    let cloud = two_zone_cloud();
    let transport = RecordingTransport::new();
    transport.respond("status", 503);
    let mut registry = registry();

    let failure = engine(cloud.clone(), transport.clone())
        .migrate(&mut registry, RecordingCheckpoint::new().as_ref(), tracked_service().id)
        .await
        .unwrap_err();

    assert_eq!(failure.failed_at, MigrationPhase::ProxyVerified);
    assert!(matches!(failure.error, MtdError::ProxyRejected { status: 503, .. }));
    assert_eq!(failure.severity(), Severity::Clean);
    assert_eq!(cloud.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn service_without_entry_ip_is_not_migrated() {
    let cloud = two_zone_cloud();
    let mut service = tracked_service();
    service.entry_ip = None;
    let mut registry = ServiceRegistry::from_services(vec![service.clone()]);

    let failure = engine(cloud.clone(), RecordingTransport::new())
        .migrate(&mut registry, RecordingCheckpoint::new().as_ref(), service.id)
        .await
        .unwrap_err();

    assert!(matches!(failure.error, MtdError::NoControlEndpoint(_)));
    assert_eq!(cloud.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn stopped_source_is_not_imaged() {
    let cloud = two_zone_cloud();
    cloud.set_instance_state(REGION, "i-old", InstanceState::Stopped);
    let mut registry = registry();

    let failure = engine(cloud.clone(), RecordingTransport::new())
        .migrate(&mut registry, RecordingCheckpoint::new().as_ref(), tracked_service().id)
        .await
        .unwrap_err();

    assert_eq!(failure.failed_at, MigrationPhase::SourceValidated);
    assert!(matches!(failure.error, MtdError::InstanceNotRunning { .. }));
    assert_eq!(cloud.calls_of(CloudOperation::CreateImage), 0);
}

#[tokio::test(start_paused = true)]
async fn provider_mismatch_is_rejected() {
    let cloud = two_zone_cloud();
    let mut service = tracked_service();
    service.cloud_id = "gcp_us-east-1_i-old".into();
    let mut registry = ServiceRegistry::from_services(vec![service.clone()]);

    let failure = engine(cloud.clone(), RecordingTransport::new())
        .migrate(&mut registry, RecordingCheckpoint::new().as_ref(), service.id)
        .await
        .unwrap_err();

    assert!(matches!(failure.error, MtdError::ProviderMismatch { .. }));
    assert_eq!(failure.severity(), Severity::Clean);
}

#[tokio::test(start_paused = true)]
async fn single_zone_region_launches_nothing() {
    let cloud = std::sync::Arc::new(
        mtd_core::services::memory_cloud::InMemoryCloud::new("aws")
            .with_zones(REGION, &["us-east-1a"])
            .with_instance(common::instance("i-old", "us-east-1a", "10.0.0.5")),
    );
    let mut registry = registry();

    let failure = engine(cloud.clone(), RecordingTransport::new())
        .migrate(&mut registry, RecordingCheckpoint::new().as_ref(), tracked_service().id)
        .await
        .unwrap_err();

    assert_eq!(failure.failed_at, MigrationPhase::InstanceLaunched);
    assert!(matches!(failure.error, MtdError::NoAlternateZone(_)));
    assert_eq!(cloud.calls_of(CloudOperation::LaunchInstance), 0);
    // the image was already built and is reported for manual cleanup
    assert_eq!(failure.severity(), Severity::Leaked);
}

#[tokio::test(start_paused = true)]
async fn launched_instance_that_dies_is_reported_leaked() {
    let cloud = two_zone_cloud();
    cloud.set_instance_readiness(Readiness::FailAfter(3));
    let mut registry = registry();

    let failure = engine(cloud.clone(), RecordingTransport::new())
        .migrate(&mut registry, RecordingCheckpoint::new().as_ref(), tracked_service().id)
        .await
        .unwrap_err();

    assert_eq!(failure.failed_at, MigrationPhase::InstanceReady);
    assert_eq!(failure.severity(), Severity::Leaked);
    assert!(failure.leaked.instance_id.is_some());
    assert_eq!(registry.get(&tracked_service().id).unwrap().cloud_id, "aws_us-east-1_i-old");
}

#[tokio::test(start_paused = true)]
async fn rejected_redirect_is_critical() {
    let cloud = two_zone_cloud();
    cloud.queue_launch("i-new", Some("10.0.1.7"));
    let transport = RecordingTransport::new();
    transport.respond("modify", 500);
    let checkpoint = RecordingCheckpoint::new();
    let mut registry = registry();

    let failure = engine(cloud.clone(), transport.clone())
        .migrate(&mut registry, checkpoint.as_ref(), tracked_service().id)
        .await
        .unwrap_err();

    assert_eq!(failure.failed_at, MigrationPhase::ProxyRedirected);
    assert_eq!(failure.severity(), Severity::Critical);
    assert_eq!(failure.leaked.instance_id.as_deref(), Some("i-new"));
    assert_eq!(
        registry.get(&tracked_service().id).unwrap().cloud_id,
        "aws_us-east-1_i-old"
    );
    assert_eq!(checkpoint.attempts(), 0);
    // the old instance keeps serving
    assert_eq!(
        cloud.instance(REGION, "i-old").unwrap().state,
        InstanceState::Running
    );
}

#[tokio::test(start_paused = true)]
async fn failed_commit_restores_registry_entry() {
    let cloud = two_zone_cloud();
    cloud.queue_launch("i-new", Some("10.0.1.7"));
    let checkpoint = RecordingCheckpoint::failing();
    let mut registry = registry();
    let before = registry.to_services();

    let failure = engine(cloud.clone(), RecordingTransport::new())
        .migrate(&mut registry, checkpoint.as_ref(), tracked_service().id)
        .await
        .unwrap_err();

    assert_eq!(failure.failed_at, MigrationPhase::RegistryCommitted);
    assert_eq!(failure.severity(), Severity::Critical);
    assert_eq!(registry.to_services(), before);
    assert_eq!(checkpoint.attempts(), 1);
    assert_eq!(cloud.calls_of(CloudOperation::TerminateInstance), 0);
}

#[tokio::test(start_paused = true)]
async fn cleanup_failures_keep_the_commit() {
    let cloud = two_zone_cloud();
    cloud.queue_launch("i-new", Some("10.0.1.7"));
    cloud.fail_operation(CloudOperation::TerminateInstance);
    cloud.fail_operation(CloudOperation::DeregisterImage);
    let mut registry = registry();

    let outcome = engine(cloud.clone(), RecordingTransport::new())
        .migrate(&mut registry, RecordingCheckpoint::new().as_ref(), tracked_service().id)
        .await
        .unwrap();

    assert!(!outcome.cleanup.instance_terminated);
    assert!(!outcome.cleanup.image_deregistered);
    // snapshot deletion is still attempted
    assert_eq!(outcome.cleanup.snapshots_deleted.len(), 1);
    assert_eq!(outcome.cleanup.failures.len(), 2);
    assert_eq!(
        registry.get(&tracked_service().id).unwrap().cloud_id,
        "aws_us-east-1_i-new"
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_polling() {
    let cloud = two_zone_cloud();
    cloud.set_image_readiness(Readiness::Never);
    let (tx, rx) = watch::channel(false);
    let engine = MigrationEngine::new(cloud.clone(), RecordingTransport::new(), config())
        .with_shutdown(rx);
    let mut registry = registry();

    let stopper = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(3500)).await;
        tx.send(true).unwrap();
        tx
    });
    let failure = engine
        .migrate(&mut registry, RecordingCheckpoint::new().as_ref(), tracked_service().id)
        .await
        .unwrap_err();
    drop(stopper.await.unwrap());

    assert!(matches!(failure.error, MtdError::Cancelled));
    assert_eq!(failure.failed_at, MigrationPhase::ImageReady);
    assert!(cloud.calls_of(CloudOperation::DescribeImage) < 5);
}

#[tokio::test(start_paused = true)]
async fn selection_skips_ineligible_services() {
    let cloud = two_zone_cloud();
    let mut disabled = tracked_service();
    disabled.admin_enabled = false;
    let mut registry = ServiceRegistry::from_services(vec![disabled]);

    let result = engine(cloud.clone(), RecordingTransport::new())
        .migrate_selected(&mut registry, RecordingCheckpoint::new().as_ref(), &FirstEligible)
        .await;

    assert!(result.is_none());
    assert_eq!(cloud.call_count(), 0);
}
