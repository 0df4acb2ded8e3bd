mod common;

use agv_coordinator::application::Dispatcher;
use agv_coordinator::domains::fleet::{AgvId, AgvStatus};
use agv_coordinator::domains::tasks::{Priority, TaskKind, TaskRequest, TaskStatus};
use agv_coordinator::domains::world::{Cell, WarehouseLayout};
use agv_coordinator::{ApplicationError, DomainError};
use common::{fast_config, harness, small_floor};
use std::collections::BTreeSet;

async fn choose(fleet: &[(&str, u32, u32, f64)], pickup: Cell) -> Option<AgvId> {
    let h = harness(fast_config(), small_floor(), fleet).await;
    let dispatcher = Dispatcher::new(h.coordinator.fleet().clone());
    let agvs = h.coordinator.agvs().await;
    dispatcher
        .select_transport_agv(&agvs, &BTreeSet::new(), pickup)
        .map(|agv| agv.id)
}

#[tokio::test]
async fn equidistant_agvs_are_split_by_id() {
    let pickup = Cell::new(1, 3);
    let fleet = [("AGV-B", 1, 1, 90.0), ("AGV-A", 1, 5, 90.0)];
    let first = choose(&fleet, pickup).await;
    let second = choose(&fleet, pickup).await;
    assert_eq!(first, Some(AgvId::new("AGV-A")));
    assert_eq!(first, second);
}

#[tokio::test]
async fn nearest_agv_wins_over_lower_id() {
    let fleet = [("AGV-A", 3, 5, 90.0), ("AGV-Z", 1, 2, 90.0)];
    assert_eq!(choose(&fleet, Cell::new(1, 3)).await, Some(AgvId::new("AGV-Z")));
}

#[tokio::test]
async fn low_battery_agv_is_not_eligible() {
    let fleet = [("AGV-A", 1, 2, 19.0)];
    assert_eq!(choose(&fleet, Cell::new(1, 3)).await, None);
}

#[tokio::test]
async fn no_eligible_agv_keeps_task_pending() {
    let mut config = fast_config();
    config.coordinator.low_battery_threshold = 10.0;
    let h = harness(config, small_floor(), &[("AGV-01", 1, 1, 15.0)]).await;
    let task_id = h
        .coordinator
        .submit_task(TaskRequest::transport("P", "D", Priority::Normal))
        .await
        .unwrap();

    h.coordinator.run_steps(10).await.unwrap();
    assert_eq!(h.status(&task_id).await, TaskStatus::Pending);
    assert!(h.sink.events_of_type("MissionFailed").await.is_empty());
}

#[tokio::test]
async fn low_battery_agv_is_sent_to_the_nearest_charger_first() {
    let layout = WarehouseLayout::new(&["C....", ".....", "C...."])
        .with_location("P", 1, 3)
        .with_location("D", 3, 5);
    let h = harness(fast_config(), layout, &[("AGV-01", 3, 2, 18.0)]).await;
    let transport = h
        .coordinator
        .submit_task(TaskRequest::transport("P", "D", Priority::Urgent))
        .await
        .unwrap();

    h.coordinator.run_steps(2).await.unwrap();
    let tasks = h.coordinator.tasks().await;
    let charge = tasks
        .iter()
        .find(|t| t.kind.is_charge())
        .expect("a charge task was synthesized");
    assert_eq!(charge.priority, Priority::Charge);
    assert!(matches!(
        &charge.kind,
        TaskKind::Charge { agv_id, station } if agv_id.as_str() == "AGV-01" && *station == Cell::new(3, 1)
    ));
    assert_eq!(charge.assigned_agv, Some(AgvId::new("AGV-01")));
    assert_eq!(h.status(&transport).await, TaskStatus::Pending);

    assert!(h.run_until(&charge.id, TaskStatus::Completed, 120).await);
    let agv = h.coordinator.agv(&AgvId::new("AGV-01")).await.unwrap();
    assert!(agv.battery >= 80.0);
    assert_eq!(agv.cell, Cell::new(3, 1));
    // Finished charge tasks leave memory once their events are out.
    assert!(h.coordinator.task(&charge.id).await.is_none());
    assert_eq!(h.store.task(&charge.id).await.unwrap().status, TaskStatus::Completed);

    let every = h.coordinator.fleet().settings.coordinator.dispatch_every_steps();
    h.coordinator.run_steps(every).await.unwrap();
    assert_ne!(h.status(&transport).await, TaskStatus::Pending);
}

#[tokio::test]
async fn only_one_charge_task_per_agv() {
    let layout = WarehouseLayout::new(&["C....", ".....", "....."])
        .with_location("P", 1, 3)
        .with_location("D", 3, 5);
    let mut config = fast_config();
    config.battery.charge_rate = 0.1;
    let h = harness(config, layout, &[("AGV-01", 2, 1, 10.0)]).await;

    h.coordinator.run_steps(12).await.unwrap();
    let charges = h
        .coordinator
        .tasks()
        .await
        .into_iter()
        .filter(|t| t.kind.is_charge())
        .count();
    assert_eq!(charges, 1);
}

#[tokio::test]
async fn failed_assignment_write_leaves_both_entities_unchanged() {
    let h = harness(fast_config(), small_floor(), &[("AGV-01", 1, 1, 100.0)]).await;
    let task_id = h
        .coordinator
        .submit_task(TaskRequest::transport("P", "D", Priority::Normal))
        .await
        .unwrap();
    let agv_id = AgvId::new("AGV-01");
    let agv_before = h.coordinator.agv(&agv_id).await.unwrap();

    h.store.fail_writes(true);
    h.coordinator.run_steps(2).await.unwrap();

    let task = h.coordinator.task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.assigned_agv.is_none());
    let agv = h.coordinator.agv(&agv_id).await.unwrap();
    assert_eq!(agv.version, agv_before.version);
    assert!(agv.current_task_id.is_none());
    assert!(h.task_statuses(&task_id).await.is_empty());

    h.store.fail_writes(false);
    h.coordinator.run_steps(2).await.unwrap();
    assert_ne!(h.status(&task_id).await, TaskStatus::Pending);
}

#[tokio::test]
async fn assigning_a_busy_agv_fails() {
    let h = harness(fast_config(), small_floor(), &[("AGV-01", 1, 1, 100.0)]).await;
    let fleet = h.coordinator.fleet().clone();
    let first = h
        .coordinator
        .submit_task(TaskRequest::transport("P", "D", Priority::Normal))
        .await
        .unwrap();
    let second = h
        .coordinator
        .submit_task(TaskRequest::transport("D", "P", Priority::Normal))
        .await
        .unwrap();
    let agv_id = AgvId::new("AGV-01");
    let version = h.coordinator.agv(&agv_id).await.unwrap().version;

    let (_, (_, agv)) = fleet.assign(&first, &agv_id, version).await.unwrap();
    assert_eq!(agv.current_task_id, Some(first));
    assert_eq!(agv.status, AgvStatus::Idle);

    let stale = fleet.assign(&second, &agv_id, version).await.unwrap_err();
    assert!(matches!(
        stale,
        ApplicationError::Domain(DomainError::ConcurrencyConflict { .. })
    ));
    let busy = fleet.assign(&second, &agv_id, agv.version).await.unwrap_err();
    assert!(matches!(
        busy,
        ApplicationError::Domain(DomainError::AgvBusy { ref detail, .. }) if detail.contains(&first.to_string())
    ));
    assert_eq!(h.status(&second).await, TaskStatus::Pending);
}

#[tokio::test]
async fn reposition_runs_on_the_agv_it_names() {
    let h = harness(
        fast_config(),
        small_floor(),
        &[("AGV-01", 1, 2, 100.0), ("AGV-02", 3, 5, 100.0)],
    )
    .await;
    let task_id = h
        .coordinator
        .submit_task(TaskRequest::reposition(AgvId::new("AGV-02"), Cell::new(2, 4)))
        .await
        .unwrap();
    let transport = h
        .coordinator
        .submit_task(TaskRequest::transport("P", "D", Priority::Urgent))
        .await
        .unwrap();

    h.coordinator.run_steps(2).await.unwrap();
    let task = h.coordinator.task(&task_id).await.unwrap();
    assert_eq!(task.assigned_agv, Some(AgvId::new("AGV-02")));
    let transport = h.coordinator.task(&transport).await.unwrap();
    assert_eq!(transport.assigned_agv, Some(AgvId::new("AGV-01")));

    assert!(h.run_until(&task_id, TaskStatus::Completed, 20).await);
    let agv = h.coordinator.agv(&AgvId::new("AGV-02")).await.unwrap();
    assert_eq!(agv.cell, Cell::new(2, 4));
    assert_eq!(agv.status, AgvStatus::Idle);
}

#[tokio::test]
async fn coordinator_task_for_a_faulted_agv_is_dropped() {
    let h = harness(fast_config(), small_floor(), &[("AGV-01", 3, 5, 100.0)]).await;
    let agv_id = AgvId::new("AGV-01");
    let task_id = h
        .coordinator
        .submit_task(TaskRequest::reposition(agv_id.clone(), Cell::new(2, 4)))
        .await
        .unwrap();
    h.coordinator.report_fault(&agv_id, "lidar dirty").await.unwrap();

    h.coordinator.run_steps(2).await.unwrap();
    assert_eq!(h.status(&task_id).await, TaskStatus::Cancelled);
    assert_eq!(h.task_statuses(&task_id).await, vec![TaskStatus::Cancelled]);
    assert!(h.coordinator.task(&task_id).await.is_none());
}
