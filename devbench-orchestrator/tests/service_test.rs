#![cfg(unix)]

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use devbench_orchestrator::{
    DevbenchService, OperationKind, OrchestratorError, SqliteStore, VmStatus,
};
use serial_test::serial;

const SCRIPT: &str = r#"case "$1" in
  create)
    echo "Creating $2"
    echo "VM_IP=10.0.0.5"
    echo "SSH_INFO=ssh $2@10.0.0.5"
    echo "VM_CREATION_COMPLETE"
    ;;
  activate)
    echo "status: running"
    echo "VNC_INFO=10.0.0.5:5901"
    ;;
esac
exit 0"#;

async fn service_with(script: &Path) -> DevbenchService {
    let store = Arc::new(SqliteStore::new(create_test_db().await));
    DevbenchService::new(store, Arc::new(test_config(script)))
}

#[tokio::test]
#[serial]
async fn test_create_devbench_provisions_in_background() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(&write_script(dir.path(), SCRIPT)).await;

    let (record, ticket) = service.create_devbench("  bench1 ", "alice").await.unwrap();
    assert_eq!(record.name, "bench1");
    assert_eq!(record.status, VmStatus::Creating);
    assert_eq!(ticket.vm_id(), record.id);
    assert_eq!(ticket.kind(), OperationKind::Create);

    let report = ticket.wait().await.unwrap();
    assert_eq!(report.final_status, Some(VmStatus::Ready));

    let stored = service.get_devbench(&record.id).await.unwrap();
    assert_eq!(stored.status, VmStatus::Ready);
    assert_eq!(stored.ip_address.as_deref(), Some("10.0.0.5"));
    assert_eq!(stored.ssh_info.as_deref(), Some("ssh alice_bench1@10.0.0.5"));

    let (lines, status) = service.get_logs(&record.id).await.unwrap();
    assert_eq!(status, VmStatus::Ready);
    assert!(lines[0].ends_with("] VM creation requested by alice"));
    assert!(lines.iter().any(|l| l.ends_with("] Creating alice_bench1")));
    assert!(lines.last().unwrap().contains("VM creation completed successfully"));
}

#[tokio::test]
async fn test_create_rejects_empty_name() {
    let service = service_with(Path::new("/nonexistent/provision_vm.sh")).await;

    let err = service.create_devbench("   ", "alice").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidInput(_)));
    assert!(service.list_devbenches(None).await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn test_activate_devbench_runs_activation() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(&write_script(dir.path(), SCRIPT)).await;

    let (record, ticket) = service.create_devbench("bench1", "alice").await.unwrap();
    ticket.wait().await.unwrap();

    let (activating, ticket) = service
        .activate_devbench(&record.id, "alice")
        .await
        .unwrap();
    assert_eq!(activating.status, VmStatus::Activating);

    let report = ticket.wait().await.unwrap();
    assert_eq!(report.final_status, Some(VmStatus::Ready));

    let stored = service.get_devbench(&record.id).await.unwrap();
    assert_eq!(stored.vnc_info.as_deref(), Some("10.0.0.5:5901"));
    // Earlier connection details survive a run that does not repeat them.
    assert_eq!(stored.ip_address.as_deref(), Some("10.0.0.5"));
}

#[tokio::test]
#[serial]
async fn test_activate_requires_owner() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(&write_script(dir.path(), SCRIPT)).await;

    let (record, ticket) = service.create_devbench("bench1", "alice").await.unwrap();
    ticket.wait().await.unwrap();

    let err = service
        .activate_devbench(&record.id, "mallory")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));

    let err = service
        .activate_devbench("missing", "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[tokio::test]
#[serial]
async fn test_activate_while_creating_is_busy() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(&write_script(dir.path(), "exec sleep 30")).await;

    let (record, ticket) = service.create_devbench("bench1", "alice").await.unwrap();
    let err = service
        .activate_devbench(&record.id, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Busy(_)));
    assert_eq!(service.live_jobs().len(), 1);

    assert!(service.cancel(&record.id));
    let report = ticket.wait().await.unwrap();
    assert_eq!(report.final_status, Some(VmStatus::Failed));
}

#[tokio::test]
#[serial]
async fn test_concurrent_activations_start_one_job_and_write_once() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        r#"echo "status: running"
sleep 30"#,
    );
    let store = Arc::new(SlowSaveStore::new(Duration::from_millis(200)));
    let record = seed_record(store.as_ref(), "bench1", "alice", VmStatus::Ready).await;
    let service = DevbenchService::new(store.clone(), Arc::new(test_config(&script)));

    let (first, second) = tokio::join!(
        service.activate_devbench(&record.id, "alice"),
        service.activate_devbench(&record.id, "alice"),
    );
    let (ticket, rejected) = match (first, second) {
        (Ok((_, ticket)), Err(err)) | (Err(err), Ok((_, ticket))) => (ticket, err),
        (first, second) => panic!("expected exactly one activation, got {:?} and {:?}", first, second),
    };
    assert!(matches!(rejected, OrchestratorError::Busy(id) if id == record.id));

    // Only the accepted call wrote its request to the store.
    let requested = store
        .saved()
        .iter()
        .filter(|saved| {
            saved.log.last().map(|entry| entry.message.as_str())
                == Some("VM activation requested by alice")
        })
        .count();
    assert_eq!(requested, 1);

    let running = wait_for_record(store.as_ref(), &record.id, |r| {
        r.status == VmStatus::Running
    })
    .await;
    assert_eq!(
        messages(&running),
        vec![
            "VM activation requested by alice",
            "Starting VM activation for bench1",
            "status: running"
        ]
    );

    assert!(service.cancel(&record.id));
    let report = ticket.wait().await.unwrap();
    assert_eq!(report.final_status, Some(VmStatus::Failed));
    assert!(report.elapsed.as_secs() < 5);

    let stored = service.get_devbench(&record.id).await.unwrap();
    let log = messages(&stored);
    assert_eq!(
        log.iter()
            .filter(|m| *m == "VM activation requested by alice")
            .count(),
        1
    );
    assert!(log.last().unwrap().starts_with("VM activation cancelled by operator"));
}

#[tokio::test]
async fn test_reservation_dropped_before_start_frees_the_vm() {
    let service = service_with(Path::new("/nonexistent/provision_vm.sh")).await;
    let scheduler = service.scheduler();

    let reservation = scheduler.reserve("vm-1", OperationKind::Activate).unwrap();
    assert_eq!(reservation.vm_id(), "vm-1");
    assert!(scheduler.is_busy("vm-1"));
    assert!(matches!(
        scheduler.reserve("vm-1", OperationKind::Create),
        Err(OrchestratorError::Busy(_))
    ));

    drop(reservation);
    assert!(!scheduler.is_busy("vm-1"));
    assert!(scheduler.live_jobs().is_empty());
}

#[tokio::test]
#[serial]
async fn test_delete_cancels_running_job() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(&write_script(dir.path(), "exec sleep 30")).await;

    let (record, ticket) = service.create_devbench("bench1", "alice").await.unwrap();
    service.delete_devbench(&record.id).await.unwrap();

    let report = ticket.wait().await.unwrap();
    assert_eq!(report.final_status, None);
    assert!(report.elapsed.as_secs() < 5);
    assert!(matches!(
        service.get_devbench(&record.id).await,
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(service.live_jobs().is_empty());
}

#[tokio::test]
async fn test_list_and_missing_lookups() {
    let service = service_with(Path::new("/nonexistent/provision_vm.sh")).await;

    let (a, ta) = service.create_devbench("a", "alice").await.unwrap();
    let (_, tb) = service.create_devbench("b", "bob").await.unwrap();
    ta.wait().await.unwrap();
    tb.wait().await.unwrap();

    let alice = service.list_devbenches(Some("alice")).await.unwrap();
    assert_eq!(alice.len(), 1);
    assert_eq!(alice[0].id, a.id);
    assert_eq!(alice[0].status, VmStatus::Failed);
    assert_eq!(service.list_devbenches(None).await.unwrap().len(), 2);

    assert!(matches!(
        service.get_logs("missing").await,
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(matches!(
        service.delete_devbench("missing").await,
        Err(OrchestratorError::NotFound(_))
    ));
}
