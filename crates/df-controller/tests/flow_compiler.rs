mod common;

use std::sync::Arc;

use common::{record, Harness, RecordingApp, NEXTHOP_MAC, UPLINK_PORT};
use df_controller::RouteRef;
use df_model::{EntityKind, EventKind};
use df_nb::NbApi;
use df_pipeline::{Action, PipelineTable, Priority, ETH_TYPE_IPV4, ETH_TYPE_MPLS};
use pretty_assertions::assert_eq;
use serde_json::json;

async fn create_local_route(harness: &Harness, id: &str, label: u32) {
    harness
        .driver
        .create(
            EntityKind::LocalLabeledRoute,
            id,
            record(json!({"dest_ip": "10.0.0.5/32", "port": "p1", "label": label})),
        )
        .await
        .unwrap();
}

async fn create_remote_route(harness: &Harness, id: &str, destination: &str, label: u32) {
    harness
        .driver
        .create(
            EntityKind::RemoteLabeledRoute,
            id,
            record(json!({
                "destination": destination,
                "nexthop": common::NEXTHOP_IP,
                "label": label,
                "helper_port": "p1",
            })),
        )
        .await
        .unwrap();
}

fn label_rules(harness: &Harness, label: u32) -> usize {
    harness
        .pipeline
        .rules_in(PipelineTable::IngressMpls)
        .iter()
        .filter(|(id, _)| id.priority == Priority::HIGH && id.matches.mpls_label == Some(label))
        .count()
}

#[tokio::test]
async fn test_local_route_create_then_delete() {
    let mut harness = Harness::new().await;
    harness.seed_port().await;
    create_local_route(&harness, "r1", 16).await;
    harness.poll(3).await;

    assert_eq!(label_rules(&harness, 16), 1);
    let (rule, entry) = &harness.pipeline.rules_in(PipelineTable::IngressMpls)[0];
    assert_eq!(rule.matches.in_port, Some(UPLINK_PORT));
    assert_eq!(rule.matches.eth_type, Some(ETH_TYPE_MPLS));
    assert_eq!(
        entry.instructions.actions,
        vec![
            Action::PopMpls {
                eth_type: ETH_TYPE_IPV4
            },
            Action::SetEthDst("fa:16:3e:00:00:01".parse().unwrap()),
            Action::SetReg7(5),
            Action::SetMetadata(7),
        ]
    );
    assert_eq!(entry.instructions.goto, Some(PipelineTable::IngressDispatch));

    harness
        .driver
        .delete(EntityKind::LocalLabeledRoute, "r1")
        .await
        .unwrap();
    harness.poll(1).await;

    assert_eq!(label_rules(&harness, 16), 0);
    assert_eq!(harness.mpls.installed_count(), 0);
}

#[tokio::test]
async fn test_remote_route_create_then_delete() {
    let mut harness = Harness::new().await;
    harness.seed_port().await;
    create_remote_route(&harness, "r2", "203.0.113.0/24", 30).await;
    harness.poll(3).await;

    let rules = harness.pipeline.rules_in(PipelineTable::L3Lookup);
    assert_eq!(rules.len(), 1);
    let (rule, entry) = &rules[0];
    assert_eq!(rule.priority, Priority::HIGH);
    assert_eq!(rule.matches.metadata, Some(7));
    assert_eq!(rule.matches.eth_type, Some(ETH_TYPE_IPV4));
    assert_eq!(
        rule.matches.ipv4_dst,
        Some("203.0.113.0/24".parse().unwrap())
    );
    assert!(entry
        .instructions
        .actions
        .contains(&Action::SetMplsLabel(30)));
    assert!(entry
        .instructions
        .actions
        .contains(&Action::SetEthDst(NEXTHOP_MAC.parse().unwrap())));
    assert_eq!(
        entry.instructions.actions.last(),
        Some(&Action::Output(UPLINK_PORT))
    );

    harness
        .driver
        .delete(EntityKind::RemoteLabeledRoute, "r2")
        .await
        .unwrap();
    harness.poll(1).await;
    assert!(harness.pipeline.rules_in(PipelineTable::L3Lookup).is_empty());
}

#[tokio::test]
async fn test_deleting_unknown_route_is_noop() {
    let mut harness = Harness::new().await;
    harness.seed_port().await;
    create_local_route(&harness, "r1", 16).await;
    harness.poll(3).await;
    let before = harness.pipeline.len();

    harness
        .driver
        .delete(EntityKind::LocalLabeledRoute, "r1")
        .await
        .unwrap();
    harness.poll(1).await;
    // Second delete of an absent key writes nothing.
    harness
        .driver
        .delete(EntityKind::LocalLabeledRoute, "r1")
        .await
        .unwrap();

    assert_eq!(harness.pipeline.len(), before - 1);
}

#[tokio::test]
async fn test_route_waits_for_port() {
    let mut harness = Harness::new().await;
    create_local_route(&harness, "r1", 16).await;
    harness.poll(1).await;

    let key = RouteRef::Local("r1".to_string());
    assert!(harness.mpls.is_parked(&key));
    assert_eq!(label_rules(&harness, 16), 0);

    harness.seed_port().await;
    harness.poll(2).await;

    assert!(!harness.mpls.is_parked(&key));
    assert_eq!(label_rules(&harness, 16), 1);
    assert!(harness.mpls.installed_rule(&key).is_some());
}

#[tokio::test]
async fn test_port_update_moves_route() {
    let mut harness = Harness::new().await;
    harness.seed_port().await;
    create_local_route(&harness, "r1", 16).await;
    harness.poll(3).await;

    harness
        .driver
        .update_lport("p1", record(json!({"tunnel_key": 9})))
        .await
        .unwrap();
    harness.poll(1).await;

    let rules = harness.pipeline.rules_in(PipelineTable::IngressMpls);
    assert_eq!(rules.len(), 1);
    assert!(rules[0].1.instructions.actions.contains(&Action::SetReg7(9)));
}

#[tokio::test]
async fn test_transient_pipeline_failures_are_retried() {
    let mut harness = Harness::new().await;
    harness.seed_port().await;
    create_local_route(&harness, "r1", 16).await;

    harness.pipeline.fail_next(2);
    harness.poll(3).await;
    assert_eq!(label_rules(&harness, 16), 1);
}

#[tokio::test]
async fn test_exhausted_retries_do_not_stop_the_loop() {
    let mut harness = Harness::new().await;
    harness.seed_port().await;
    create_local_route(&harness, "r1", 16).await;
    harness.poll(2).await;

    harness.pipeline.fail_next(3);
    harness.poll(1).await;
    assert_eq!(label_rules(&harness, 16), 0);
    assert_eq!(harness.watch.cursor(), 4);

    create_local_route(&harness, "r2", 17).await;
    harness.poll(1).await;
    assert_eq!(label_rules(&harness, 17), 1);
}

#[tokio::test]
async fn test_events_reach_handlers_in_store_order() {
    let recorder = Arc::new(RecordingApp::new(vec![
        (EntityKind::Chassis, EventKind::Created),
        (EntityKind::LogicalSwitch, EventKind::Updated),
        (EntityKind::LogicalPort, EventKind::Updated),
    ]));
    let mut harness = Harness::with_apps(vec![recorder.clone()]).await;

    harness
        .driver
        .add_chassis("host1", "192.0.2.1".parse().unwrap(), "vxlan")
        .await
        .unwrap();
    harness.seed_port().await;
    harness.poll(3).await;

    assert_eq!(
        recorder.events(),
        vec![
            "chassis created host1",
            "lswitch updated sw1",
            "lport updated p1",
        ]
    );
}

#[tokio::test]
async fn test_attach_installs_baseline_rules() {
    let harness = Harness::new().await;
    let rules = harness.pipeline.rules_in(PipelineTable::IngressClassification);
    assert_eq!(rules.len(), 2);
    assert!(rules.iter().all(|(id, _)| id.priority == Priority::MEDIUM));
    assert!(harness
        .driver
        .get(EntityKind::LocalLabeledRoute, "r1")
        .await
        .unwrap()
        .is_none());
}
