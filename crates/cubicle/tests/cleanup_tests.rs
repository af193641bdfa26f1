//! Idle and orphan reclamation.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::{FakeOp, Harness};
use cubicle::container::{ContainerState, HealthConfig};
use cubicle::fleet::{CleanupConfig, CleanupManager, ContainerCache, ContainerInfo, UserConfig};
use cubicle::registry::{ContainerRecord, ContainerRegistry};

fn cleanup_for(harness: &Harness, idle_timeout_secs: u64) -> CleanupManager {
    CleanupManager::new(
        harness.lifecycle.clone(),
        CleanupConfig {
            enabled: true,
            interval_secs: 1,
            idle_timeout_secs,
        },
    )
}

/// Provision a container for `user_id` and backdate its activity.
async fn provision_idle(harness: &Harness, user_id: &str, idle: chrono::Duration) -> String {
    let info = harness
        .lifecycle
        .get_or_create_container(user_id, &UserConfig::default())
        .await
        .unwrap();
    harness.cache.touch(user_id, Utc::now() - idle);
    info.id
}

#[tokio::test]
async fn orphan_is_removed_without_touching_other_rows() {
    let harness = Harness::new();
    let orphan = harness.runtime.add_user_container("7", ContainerState::Running);
    let owned = harness.runtime.add_user_container("8", ContainerState::Running);
    harness
        .registry
        .create("8", &owned, "claude-user-8")
        .await
        .unwrap();

    let cleaned = cleanup_for(&harness, 3600)
        .cleanup_orphaned_containers()
        .await
        .unwrap();

    assert_eq!(cleaned, 1);
    assert!(!harness.runtime.contains(&orphan));
    assert!(harness.runtime.contains(&owned));
    let row = harness.registry.get_by_user_id("8").await.unwrap().unwrap();
    assert_eq!(row.container_id, owned);
}

#[tokio::test]
async fn stopped_orphan_is_removed() {
    let harness = Harness::new();
    let orphan = harness.runtime.add_user_container("7", ContainerState::Exited);

    let cleaned = cleanup_for(&harness, 3600)
        .cleanup_orphaned_containers()
        .await
        .unwrap();

    assert_eq!(cleaned, 1);
    assert!(!harness.runtime.contains(&orphan));
}

#[tokio::test]
async fn unmanaged_containers_are_ignored() {
    let harness = Harness::new();
    let foreign = harness
        .runtime
        .add_container("postgres", ContainerState::Running, None);

    let cleaned = cleanup_for(&harness, 3600)
        .cleanup_orphaned_containers()
        .await
        .unwrap();

    assert_eq!(cleaned, 0);
    assert!(harness.runtime.contains(&foreign));
}

#[tokio::test]
async fn container_still_provisioning_is_not_an_orphan() {
    let harness = Harness::with_health(HealthConfig {
        max_attempts: 50,
        initial_delay_ms: 10,
        max_delay_ms: 10,
    });
    // Hold the new container short of running so provisioning stays in flight.
    harness.runtime.set_start_state(ContainerState::Created);

    let lifecycle = harness.lifecycle.clone();
    let provisioning = tokio::spawn(async move {
        lifecycle
            .get_or_create_container("7", &UserConfig::default())
            .await
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let ids = harness.runtime.ids_named("claude-user-7");
    assert_eq!(ids.len(), 1);
    assert!(harness.registry.get_by_user_id("7").await.unwrap().is_none());

    let cleaned = cleanup_for(&harness, 3600)
        .cleanup_orphaned_containers()
        .await
        .unwrap();
    assert_eq!(cleaned, 0);
    assert!(harness.runtime.contains(&ids[0]));

    harness.runtime.set_state(&ids[0], ContainerState::Running);
    let info = provisioning.await.unwrap().unwrap();
    assert_eq!(info.id, ids[0]);
    assert!(harness.registry.get_by_user_id("7").await.unwrap().is_some());
}

#[tokio::test]
async fn orphan_sweep_continues_past_failing_containers() {
    let harness = Harness::new();
    let stuck = harness.runtime.add_user_container("7", ContainerState::Running);
    let unstoppable = harness.runtime.add_user_container("8", ContainerState::Running);
    let plain = harness.runtime.add_user_container("9", ContainerState::Exited);
    harness.runtime.fail_on(FakeOp::Remove, &stuck);
    harness.runtime.fail_on(FakeOp::Stop, &unstoppable);

    let cleaned = cleanup_for(&harness, 3600)
        .cleanup_orphaned_containers()
        .await
        .unwrap();

    assert_eq!(cleaned, 2);
    assert!(harness.runtime.contains(&stuck));
    // A failed graceful stop still ends in a forced removal.
    assert!(!harness.runtime.contains(&unstoppable));
    assert!(!harness.runtime.contains(&plain));
}

#[tokio::test]
async fn idle_container_is_destroyed_and_recent_one_kept() {
    let harness = Harness::new();
    let idle = provision_idle(&harness, "idle", chrono::Duration::hours(2)).await;
    let recent = provision_idle(&harness, "recent", chrono::Duration::seconds(10)).await;

    let cleaned = cleanup_for(&harness, 3600)
        .cleanup_idle_containers(Duration::from_secs(3600))
        .await;

    assert_eq!(cleaned, 1);
    assert!(!harness.runtime.contains(&idle));
    assert!(harness.lifecycle.get_container_by_user_id("idle").is_none());
    assert!(harness.registry.get_by_user_id("idle").await.unwrap().is_none());
    // Idle reclamation keeps the user's files.
    assert!(harness.lifecycle.user_data_dir("idle").is_dir());

    assert!(harness.runtime.contains(&recent));
    assert!(harness.lifecycle.get_container_by_user_id("recent").is_some());
}

#[tokio::test]
async fn idle_sweep_reclaims_entries_without_daemon_container() {
    let harness = Harness::new();
    provision_idle(&harness, "a", chrono::Duration::hours(2)).await;
    provision_idle(&harness, "b", chrono::Duration::hours(2)).await;

    // Cached, but neither the daemon nor the registry knows it.
    let mut ghost: ContainerInfo =
        ContainerRecord::new("ghost", "ghost-id", "claude-user-ghost").into();
    ghost.last_active = Utc::now() - chrono::Duration::hours(3);
    harness.cache.insert(ghost);

    let cleaned = cleanup_for(&harness, 60)
        .cleanup_idle_containers(Duration::from_secs(60))
        .await;

    assert_eq!(cleaned, 3);
    assert_eq!(harness.lifecycle.cached_count(), 0);
}

#[tokio::test]
async fn idle_sweep_continues_past_failing_destroy() {
    let harness = Harness::new();
    let stuck = provision_idle(&harness, "a", chrono::Duration::hours(2)).await;
    let reclaimed = provision_idle(&harness, "b", chrono::Duration::hours(2)).await;
    harness.runtime.fail_on(FakeOp::Remove, &stuck);

    let cleaned = cleanup_for(&harness, 60)
        .cleanup_idle_containers(Duration::from_secs(60))
        .await;

    assert_eq!(cleaned, 1);
    assert!(harness.runtime.contains(&stuck));
    assert!(harness.lifecycle.get_container_by_user_id("a").is_some());
    assert!(harness.registry.get_by_user_id("a").await.unwrap().is_some());

    assert!(!harness.runtime.contains(&reclaimed));
    assert!(harness.lifecycle.get_container_by_user_id("b").is_none());
}

#[tokio::test]
async fn manual_cleanup_reports_both_sweeps() {
    let harness = Harness::new();
    provision_idle(&harness, "idle", chrono::Duration::hours(2)).await;
    harness.runtime.add_user_container("orphan", ContainerState::Running);
    harness.runtime.add_user_container("other", ContainerState::Exited);

    let report = cleanup_for(&harness, 3600).run_manual_cleanup().await.unwrap();

    assert_eq!(report.idle_containers, 1);
    assert_eq!(report.orphaned_containers, 2);
    assert_eq!(report.total, 3);
    assert_eq!(harness.runtime.container_count(), 0);
}

#[tokio::test]
async fn interval_sweeps_until_stopped() {
    let harness = Harness::new();
    let orphan = harness.runtime.add_user_container("7", ContainerState::Running);
    let cleanup = cleanup_for(&harness, 3600);

    cleanup
        .start_cleanup_interval(Duration::from_millis(20))
        .await;
    assert!(cleanup.is_running().await);

    // Restarting replaces the previous timer.
    cleanup
        .start_cleanup_interval(Duration::from_millis(20))
        .await;

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(!harness.runtime.contains(&orphan));

    cleanup.stop_cleanup_interval().await;
    assert!(!cleanup.is_running().await);

    let late = harness.runtime.add_user_container("9", ContainerState::Running);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(harness.runtime.contains(&late));
}
