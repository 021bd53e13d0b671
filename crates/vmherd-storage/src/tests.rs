use crate::{InstanceUpdate, NewInstance, VmStore};
use chrono::{Duration, Utc};
use vmherd_common::types::{InstanceStatus, PortSpec, Protocol};

async fn setup() -> VmStore {
    vmherd_common::id::init(1, 1);
    VmStore::connect("sqlite::memory:").await.unwrap()
}

fn make_instance(name: &str, owner: &str) -> NewInstance {
    NewInstance {
        owner_user_id: owner.to_string(),
        instance_name: name.to_string(),
        cloud_instance_id: Some(format!("cloud-{name}")),
        zone: "europe-west1-b".to_string(),
        template_name: "minecraft_vanilla".to_string(),
        status: InstanceStatus::Provisioning,
        ip_address: None,
        ports: vec![PortSpec {
            port: 25565,
            protocol: Protocol::Tcp,
        }],
        extra_config: None,
        auto_shutdown_hours: None,
    }
}

#[tokio::test]
async fn record_and_count_usage_within_window() {
    let store = setup().await;
    let now = Utc::now();

    for secs_ago in [10, 20, 30] {
        store
            .record_usage_at("user-1", "create", now - Duration::seconds(secs_ago))
            .await
            .unwrap();
    }
    // Outside the one-minute window
    store
        .record_usage_at("user-1", "create", now - Duration::seconds(120))
        .await
        .unwrap();
    // Different user
    store.record_usage("user-2", "create").await.unwrap();

    let count = store
        .count_usage_since("user-1", now - Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(count, 3);
}

#[tokio::test]
async fn last_usage_timestamp_returns_most_recent_per_command() {
    let store = setup().await;
    let now = Utc::now();

    store
        .record_usage_at("user-1", "create", now - Duration::seconds(300))
        .await
        .unwrap();
    store
        .record_usage_at("user-1", "create", now - Duration::seconds(30))
        .await
        .unwrap();
    store
        .record_usage_at("user-1", "stop", now - Duration::seconds(5))
        .await
        .unwrap();

    let last = store
        .last_usage_timestamp("user-1", "create")
        .await
        .unwrap()
        .unwrap();
    let delta = (now - Duration::seconds(30)) - last;
    assert!(delta.num_seconds().abs() <= 1);

    assert!(store
        .last_usage_timestamp("user-1", "delete")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn register_and_get_instance() {
    let store = setup().await;

    let record = store
        .register_instance(make_instance("my-server1", "user-1"))
        .await
        .unwrap();
    assert_eq!(record.status, InstanceStatus::Provisioning);
    assert_eq!(record.ports.len(), 1);

    let fetched = store.get_instance("my-server1").await.unwrap().unwrap();
    assert_eq!(fetched.owner_user_id, "user-1");
    assert_eq!(fetched.template_name, "minecraft_vanilla");
    assert_eq!(fetched.cloud_instance_id.as_deref(), Some("cloud-my-server1"));

    assert!(store.get_instance("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_instance_name_is_rejected() {
    let store = setup().await;

    store
        .register_instance(make_instance("dup", "user-1"))
        .await
        .unwrap();
    let mut second = make_instance("dup", "user-2");
    second.cloud_instance_id = Some("cloud-other".to_string());
    assert!(store.register_instance(second).await.is_err());
}

#[tokio::test]
async fn terminating_with_empty_ip_clears_the_address() {
    let store = setup().await;

    store
        .register_instance(make_instance("srv", "user-1"))
        .await
        .unwrap();
    store
        .update_instance_status(
            "srv",
            InstanceStatus::Running,
            InstanceUpdate {
                ip_address: Some("203.0.113.9".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        store
            .get_instance("srv")
            .await
            .unwrap()
            .unwrap()
            .ip_address
            .as_deref(),
        Some("203.0.113.9")
    );

    store
        .update_instance_status(
            "srv",
            InstanceStatus::Terminated,
            InstanceUpdate {
                ip_address: Some(String::new()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let record = store.get_instance("srv").await.unwrap().unwrap();
    assert_eq!(record.status, InstanceStatus::Terminated);
    assert!(record.ip_address.is_none());
}

#[tokio::test]
async fn partial_update_leaves_unsupplied_fields_alone() {
    let store = setup().await;

    let mut new = make_instance("srv", "user-1");
    new.ip_address = Some("203.0.113.9".to_string());
    new.status = InstanceStatus::Running;
    store.register_instance(new).await.unwrap();

    let before = store.get_instance("srv").await.unwrap().unwrap();
    let updated = store
        .update_instance_status("srv", InstanceStatus::Running, InstanceUpdate::default())
        .await
        .unwrap();
    assert!(updated);

    let after = store.get_instance("srv").await.unwrap().unwrap();
    assert_eq!(after.ip_address.as_deref(), Some("203.0.113.9"));
    assert_eq!(after.ports, before.ports);
    assert!(after.last_status_update >= before.last_status_update);
}

#[tokio::test]
async fn update_of_unknown_instance_reports_false() {
    let store = setup().await;
    let updated = store
        .update_instance_status(
            "ghost",
            InstanceStatus::Running,
            InstanceUpdate::default(),
        )
        .await
        .unwrap();
    assert!(!updated);
}

#[tokio::test]
async fn active_listing_filters_status_and_owner() {
    let store = setup().await;

    store
        .register_instance(make_instance("a", "user-1"))
        .await
        .unwrap();
    store
        .register_instance(make_instance("b", "user-1"))
        .await
        .unwrap();
    store
        .register_instance(make_instance("c", "user-2"))
        .await
        .unwrap();
    store
        .update_instance_status(
            "b",
            InstanceStatus::Terminated,
            InstanceUpdate {
                ip_address: Some(String::new()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let active = store.list_active_for_owner("user-1").await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].instance_name, "a");
}

#[tokio::test]
async fn auto_shutdown_listing_requires_policy_and_candidate_status() {
    let store = setup().await;

    let mut with_policy = make_instance("timed", "user-1");
    with_policy.auto_shutdown_hours = Some(4);
    with_policy.status = InstanceStatus::Running;
    store.register_instance(with_policy).await.unwrap();

    let mut stopped = make_instance("stopped", "user-1");
    stopped.auto_shutdown_hours = Some(4);
    stopped.status = InstanceStatus::Terminated;
    store.register_instance(stopped).await.unwrap();

    store
        .register_instance(make_instance("forever", "user-1"))
        .await
        .unwrap();

    let candidates = store.list_with_auto_shutdown().await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].instance_name, "timed");
}

#[tokio::test]
async fn remove_instance_hard_deletes() {
    let store = setup().await;

    store
        .register_instance(make_instance("gone", "user-1"))
        .await
        .unwrap();
    assert!(store.remove_instance("gone").await.unwrap());
    assert!(store.get_instance("gone").await.unwrap().is_none());
    assert!(!store.remove_instance("gone").await.unwrap());
}
