mod common;

use agv_coordinator::domains::fleet::{AgvId, AgvStatus};
use agv_coordinator::domains::mission::MissionEvent;
use agv_coordinator::domains::tasks::{CancelOutcome, Priority, TaskId, TaskRequest, TaskStatus};
use agv_coordinator::domains::world::{Cell, WarehouseLayout};
use agv_coordinator::{ApplicationError, DomainError};
use common::{fast_config, harness, small_floor, Harness};

#[tokio::test]
async fn single_transport_runs_to_completion() {
    let h = harness(fast_config(), small_floor(), &[("AGV-01", 1, 1, 100.0)]).await;
    let task_id = h
        .coordinator
        .submit_task(TaskRequest::transport("P", "D", Priority::Normal))
        .await
        .unwrap();

    assert!(h.run_until(&task_id, TaskStatus::Completed, 40).await);

    let agv = h.coordinator.agv(&AgvId::new("AGV-01")).await.unwrap();
    assert_eq!(agv.cell, Cell::new(3, 5));
    assert_eq!(agv.status, AgvStatus::Idle);
    assert!(agv.current_task_id.is_none());
    assert!(agv.battery < 100.0);

    let task = h.coordinator.task(&task_id).await.unwrap();
    assert!(task.started_at.is_some());
    assert!(task.completed_at.is_some());
    assert_eq!(
        h.task_statuses(&task_id).await,
        vec![
            TaskStatus::Assigned,
            TaskStatus::EnRoute,
            TaskStatus::AtPickup,
            TaskStatus::Loaded,
            TaskStatus::EnRouteDropoff,
            TaskStatus::Completed,
        ]
    );

    // The stored copies match what the coordinator reports.
    assert_eq!(h.store.task(&task_id).await.unwrap(), task);
    assert_eq!(h.store.agv(&agv.id).await.unwrap(), agv);
    assert_eq!(h.coordinator.active_missions().await, 0);
}

#[tokio::test]
async fn movement_events_follow_the_route_in_order() {
    let h = harness(fast_config(), small_floor(), &[("AGV-01", 1, 1, 100.0)]).await;
    let task_id = h
        .coordinator
        .submit_task(TaskRequest::transport("P", "D", Priority::Normal))
        .await
        .unwrap();
    assert!(h.run_until(&task_id, TaskStatus::Completed, 40).await);

    let agv_events = h.sink.events_for("Agv", "AGV-01").await;
    let sequences: Vec<u64> = agv_events.iter().map(|e| e.sequence).collect();
    let mut sorted = sequences.clone();
    sorted.sort();
    assert_eq!(sequences, sorted, "per-AGV events must be delivered in order");

    let moves = agv_events
        .iter()
        .filter(|e| e.event_type == "AgvMoved")
        .count();
    // Two cells to the pickup, four to the dropoff.
    assert_eq!(moves, 6);

    let mission_events = h.sink.events_for("Mission", &task_id.to_string()).await;
    let stages: Vec<u64> = mission_events.iter().map(|e| e.sequence).collect();
    assert!(stages.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn second_task_waits_for_the_only_agv() {
    let layout = small_floor()
        .with_location("P2", 3, 1)
        .with_location("D2", 1, 5);
    let h = harness(fast_config(), layout, &[("AGV-01", 1, 1, 100.0)]).await;
    let first = h
        .coordinator
        .submit_task(TaskRequest::transport("P", "D", Priority::Normal))
        .await
        .unwrap();
    let second = h
        .coordinator
        .submit_task(TaskRequest::transport("P2", "D2", Priority::Normal))
        .await
        .unwrap();

    h.coordinator.run_steps(2).await.unwrap();
    assert_ne!(h.status(&first).await, TaskStatus::Pending);
    assert_eq!(h.status(&second).await, TaskStatus::Pending);

    assert!(h.run_until(&first, TaskStatus::Completed, 40).await);
    let every = h.coordinator.fleet().settings.coordinator.dispatch_every_steps();
    h.coordinator.run_steps(every).await.unwrap();
    assert_ne!(h.status(&second).await, TaskStatus::Pending);

    assert!(h.run_until(&second, TaskStatus::Completed, 60).await);
}

#[tokio::test]
async fn exhausted_no_path_budget_fails_the_task() {
    let mut config = fast_config();
    config.coordinator.no_path_retry_budget = 3;
    config.coordinator.search_horizon = 20;
    let h = harness(config, small_floor(), &[("AGV-01", 1, 1, 100.0)]).await;

    // Wall off bay 2 so the AGV can never leave bay 1.
    h.coordinator
        .fleet()
        .planner
        .with_table(|table| {
            for row in 1..=3 {
                table.quarantine(&AgvId::new(format!("WALL-{}", row)), Cell::new(row, 2));
            }
        })
        .await;

    let task_id = h
        .coordinator
        .submit_task(TaskRequest::transport("P", "D", Priority::Normal))
        .await
        .unwrap();

    assert!(h.run_until(&task_id, TaskStatus::Failed, 30).await);
    let task = h.coordinator.task(&task_id).await.unwrap();
    assert!(task.failure_reason.unwrap().contains("no path"));

    let agv = h.coordinator.agv(&AgvId::new("AGV-01")).await.unwrap();
    assert_eq!(agv.status, AgvStatus::Idle);
    assert!(agv.current_task_id.is_none());

    let failures = h.sink.events_of_type("MissionFailed").await;
    assert_eq!(failures.len(), 1);
    let event: MissionEvent = serde_json::from_value(failures[0].payload.clone()).unwrap();
    assert!(matches!(event, MissionEvent::Failed { .. }));
}

#[tokio::test]
async fn cancel_pending_task_is_idempotent() {
    let h = harness(fast_config(), small_floor(), &[]).await;
    let task_id = h
        .coordinator
        .submit_task(TaskRequest::transport("P", "D", Priority::High))
        .await
        .unwrap();

    let outcome = h.coordinator.cancel_task(&task_id).await.unwrap();
    assert!(matches!(outcome, CancelOutcome::Cancelled { previous: TaskStatus::Pending, .. }));
    let events_before = h.sink.events().await.len();

    let again = h.coordinator.cancel_task(&task_id).await.unwrap();
    assert_eq!(again, CancelOutcome::AlreadyCancelled);
    assert_eq!(h.sink.events().await.len(), events_before);
    assert_eq!(h.status(&task_id).await, TaskStatus::Cancelled);
}

#[tokio::test]
async fn cancel_en_route_stops_at_the_next_stage_boundary() {
    let h = harness(fast_config(), small_floor(), &[("AGV-01", 1, 1, 100.0)]).await;
    let task_id = h
        .coordinator
        .submit_task(TaskRequest::transport("P", "D", Priority::Normal))
        .await
        .unwrap();
    assert!(h.run_until(&task_id, TaskStatus::EnRoute, 10).await);

    let outcome = h.coordinator.cancel_task(&task_id).await.unwrap();
    assert!(matches!(outcome, CancelOutcome::AbortRequested(_)));
    // Nothing changes until the mission reaches a boundary.
    assert_eq!(h.status(&task_id).await, TaskStatus::EnRoute);

    assert!(h.run_until(&task_id, TaskStatus::Cancelled, 10).await);
    let agv = h.coordinator.agv(&AgvId::new("AGV-01")).await.unwrap();
    assert_eq!(agv.status, AgvStatus::Idle);
    assert!(agv.current_task_id.is_none());
    // The AGV finished its leg and stands on the pickup cell.
    assert_eq!(agv.cell, Cell::new(1, 3));
    assert!(!h.task_statuses(&task_id).await.contains(&TaskStatus::Loaded));
}

#[tokio::test]
async fn cancel_after_loading_is_refused() {
    let h = harness(fast_config(), small_floor(), &[("AGV-01", 1, 1, 100.0)]).await;
    let task_id = h
        .coordinator
        .submit_task(TaskRequest::transport("P", "D", Priority::Normal))
        .await
        .unwrap();
    assert!(h.run_until(&task_id, TaskStatus::EnRouteDropoff, 20).await);

    let err = h.coordinator.cancel_task(&task_id).await.unwrap_err();
    assert!(matches!(
        err,
        ApplicationError::Domain(DomainError::CannotCancelLoaded { .. })
    ));
    assert!(h.run_until(&task_id, TaskStatus::Completed, 30).await);
}

#[tokio::test]
async fn fault_during_mission_fails_task_and_quarantines_agv() {
    let h = harness(fast_config(), small_floor(), &[("AGV-01", 1, 1, 100.0)]).await;
    let task_id = h
        .coordinator
        .submit_task(TaskRequest::transport("P", "D", Priority::Normal))
        .await
        .unwrap();
    assert!(h.run_until(&task_id, TaskStatus::EnRoute, 10).await);

    let agv_id = AgvId::new("AGV-01");
    h.coordinator
        .report_fault(&agv_id, "drive controller offline")
        .await
        .unwrap();
    assert!(h.run_until(&task_id, TaskStatus::Failed, 5).await);

    let agv = h.coordinator.agv(&agv_id).await.unwrap();
    assert_eq!(agv.status, AgvStatus::Faulted);
    assert_eq!(agv.fault_reason.as_deref(), Some("drive controller offline"));
    assert!(h.coordinator.reservations().await.is_obstacle(agv.cell));
    assert_eq!(h.sink.events_of_type("AgvFaulted").await.len(), 1);

    // A faulted AGV never receives new work.
    let next = h
        .coordinator
        .submit_task(TaskRequest::transport("P", "D", Priority::Urgent))
        .await
        .unwrap();
    h.coordinator.run_steps(6).await.unwrap();
    assert_eq!(h.status(&next).await, TaskStatus::Pending);
}

#[tokio::test]
async fn fault_on_idle_agv_applies_immediately() {
    let h = harness(fast_config(), small_floor(), &[("AGV-01", 2, 2, 100.0)]).await;
    let agv_id = AgvId::new("AGV-01");
    h.coordinator.report_fault(&agv_id, "bumper tripped").await.unwrap();

    let agv = h.coordinator.agv(&agv_id).await.unwrap();
    assert_eq!(agv.status, AgvStatus::Faulted);
    assert!(h.coordinator.reservations().await.is_obstacle(Cell::new(2, 2)));

    // Reporting again is harmless.
    h.coordinator.report_fault(&agv_id, "bumper tripped").await.unwrap();
    assert_eq!(h.sink.events_of_type("AgvFaulted").await.len(), 1);
}

#[tokio::test]
async fn mission_detours_around_a_new_obstacle() {
    let layout = WarehouseLayout::new(&[".....", ".....", "....."])
        .with_location("P", 1, 5)
        .with_location("D", 3, 1);
    let h = harness(fast_config(), layout, &[("AGV-01", 1, 1, 100.0)]).await;
    let task_id = h
        .coordinator
        .submit_task(TaskRequest::transport("P", "D", Priority::Normal))
        .await
        .unwrap();
    assert!(h.run_until(&task_id, TaskStatus::EnRoute, 10).await);

    // Something drops onto the straight corridor ahead of the AGV.
    h.coordinator
        .fleet()
        .planner
        .with_table(|table| table.quarantine(&AgvId::new("PALLET"), Cell::new(1, 4)))
        .await;

    assert!(h.run_until(&task_id, TaskStatus::Completed, 60).await);
    assert!(h.coordinator.reservation_conflicts().await.is_empty());
}

/// Bay 2 walled off on every row, so an AGV in bay 1 never gets a route.
async fn wall_off_bay_two(h: &Harness) {
    h.coordinator
        .fleet()
        .planner
        .with_table(|table| {
            for row in 1..=3 {
                table.quarantine(&AgvId::new(format!("WALL-{}", row)), Cell::new(row, 2));
            }
        })
        .await;
}

async fn all_in(h: &Harness, tasks: &[TaskId], status: TaskStatus) -> bool {
    for task_id in tasks {
        if h.status(task_id).await != status {
            return false;
        }
    }
    true
}

#[tokio::test]
async fn cancel_before_the_first_route_frees_the_agv() {
    let mut config = fast_config();
    config.coordinator.no_path_retry_budget = 50;
    let h = harness(config, small_floor(), &[("AGV-01", 1, 1, 100.0)]).await;
    wall_off_bay_two(&h).await;

    let task_id = h
        .coordinator
        .submit_task(TaskRequest::transport("P", "D", Priority::Normal))
        .await
        .unwrap();
    assert!(h.run_until(&task_id, TaskStatus::Assigned, 5).await);
    h.coordinator.run_steps(3).await.unwrap();
    assert_eq!(h.status(&task_id).await, TaskStatus::Assigned);

    let outcome = h.coordinator.cancel_task(&task_id).await.unwrap();
    assert!(matches!(
        outcome,
        CancelOutcome::Cancelled { previous: TaskStatus::Assigned, .. }
    ));
    h.coordinator.run_steps(3).await.unwrap();

    assert_eq!(h.status(&task_id).await, TaskStatus::Cancelled);
    assert_eq!(h.coordinator.active_missions().await, 0);
    let agv = h.coordinator.agv(&AgvId::new("AGV-01")).await.unwrap();
    assert_eq!(agv.status, AgvStatus::Idle);
    assert!(agv.current_task_id.is_none());
    assert!(h.sink.events_of_type("MissionFailed").await.is_empty());
    assert_eq!(
        h.task_statuses(&task_id).await,
        vec![TaskStatus::Assigned, TaskStatus::Cancelled]
    );
}

#[tokio::test]
async fn idle_agv_on_the_dropoff_makes_room() {
    let h = harness(
        fast_config(),
        small_floor(),
        &[("AGV-01", 1, 1, 100.0), ("AGV-02", 3, 5, 100.0)],
    )
    .await;
    let task_id = h
        .coordinator
        .submit_task(TaskRequest::transport("P", "D", Priority::Normal))
        .await
        .unwrap();

    assert!(h.run_until(&task_id, TaskStatus::Completed, 80).await);
    let task = h.coordinator.task(&task_id).await.unwrap();
    assert_eq!(task.assigned_agv, Some(AgvId::new("AGV-01")));
    assert_eq!(
        h.coordinator.agv(&AgvId::new("AGV-01")).await.unwrap().cell,
        Cell::new(3, 5)
    );

    let moved = h.coordinator.agv(&AgvId::new("AGV-02")).await.unwrap();
    assert_eq!(moved.status, AgvStatus::Idle);
    assert!(!h.coordinator.world().is_work_cell(moved.cell));
    assert!(h.coordinator.reservation_conflicts().await.is_empty());
    assert!(h.sink.events_of_type("MissionFailed").await.is_empty());
    // The reposition task was archived once it finished.
    let tasks = h.coordinator.tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, task_id);
}

#[tokio::test]
async fn tasks_sharing_a_dropoff_both_complete() {
    let layout = small_floor().with_location("P2", 3, 1);
    let h = harness(
        fast_config(),
        layout,
        &[("AGV-01", 1, 1, 100.0), ("AGV-02", 2, 1, 100.0)],
    )
    .await;
    let first = h
        .coordinator
        .submit_task(TaskRequest::transport("P", "D", Priority::Normal))
        .await
        .unwrap();
    let second = h
        .coordinator
        .submit_task(TaskRequest::transport("P2", "D", Priority::Normal))
        .await
        .unwrap();

    let tasks = [first, second];
    for _ in 0..150 {
        h.coordinator.step().await.unwrap();
        assert!(h.coordinator.reservation_conflicts().await.is_empty());
        if all_in(&h, &tasks, TaskStatus::Completed).await {
            break;
        }
    }
    assert!(all_in(&h, &tasks, TaskStatus::Completed).await);
    assert!(h.sink.events_of_type("MissionFailed").await.is_empty());

    let agvs = h.coordinator.agvs().await;
    assert_ne!(agvs[0].cell, agvs[1].cell);
    assert!(agvs.iter().any(|a| a.cell == Cell::new(3, 5)));
}
