mod common;

use agv_coordinator::domains::tasks::{Priority, TaskRequest, TaskStatus};
use agv_coordinator::domains::world::{Cell, WarehouseLayout};
use common::{fast_config, harness};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashSet};

fn floor() -> WarehouseLayout {
    WarehouseLayout::new(&[
        "C.......",
        ".##..##.",
        "........",
        ".##..##.",
        "........",
        "C......D",
    ])
    .with_location("L1", 1, 4)
    .with_location("L2", 1, 8)
    .with_location("L3", 3, 2)
    .with_location("L4", 3, 6)
    .with_location("L5", 5, 1)
    .with_location("L6", 5, 5)
    .with_location("L7", 6, 3)
    .with_location("L8", 6, 8)
}

const LOCATIONS: [&str; 8] = ["L1", "L2", "L3", "L4", "L5", "L6", "L7", "L8"];

async fn simulate(seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let h = harness(
        fast_config(),
        floor(),
        &[
            ("AGV-01", 3, 1, 100.0),
            ("AGV-02", 3, 8, 100.0),
            ("AGV-03", 5, 3, 100.0),
            ("AGV-04", 1, 6, 100.0),
        ],
    )
    .await;

    let mut previous: BTreeMap<String, Cell> = h
        .coordinator
        .agvs()
        .await
        .into_iter()
        .map(|a| (a.id.to_string(), a.cell))
        .collect();
    let mut submitted = Vec::new();

    for _ in 0..300 {
        if rng.gen_bool(0.15) {
            let pickup = LOCATIONS[rng.gen_range(0..LOCATIONS.len())];
            let dropoff = LOCATIONS[rng.gen_range(0..LOCATIONS.len())];
            if pickup != dropoff {
                let priority = if rng.gen_bool(0.2) {
                    Priority::High
                } else {
                    Priority::Normal
                };
                let id = h
                    .coordinator
                    .submit_task(TaskRequest::transport(pickup, dropoff, priority))
                    .await
                    .unwrap();
                submitted.push(id);
            }
        }

        let step = h.coordinator.step().await.unwrap();
        let agvs = h.coordinator.agvs().await;

        let mut occupied = HashSet::new();
        for agv in &agvs {
            assert!(
                occupied.insert(agv.cell),
                "seed {}: two AGVs on {} at step {}",
                seed,
                agv.cell,
                step
            );
            let before = previous[agv.id.as_str()];
            assert!(
                before == agv.cell || before.is_adjacent(&agv.cell),
                "seed {}: {} jumped {} -> {} at step {}",
                seed,
                agv.id,
                before,
                agv.cell,
                step
            );
        }
        for a in &agvs {
            for b in &agvs {
                if a.id < b.id && a.cell != previous[a.id.as_str()] {
                    let swapped = previous[a.id.as_str()] == b.cell && previous[b.id.as_str()] == a.cell;
                    assert!(!swapped, "seed {}: {} and {} swapped at step {}", seed, a.id, b.id, step);
                }
            }
        }
        let conflicts = h.coordinator.reservation_conflicts().await;
        assert!(conflicts.is_empty(), "seed {}: {:?} at step {}", seed, conflicts, step);

        previous = agvs.into_iter().map(|a| (a.id.to_string(), a.cell)).collect();
    }

    // Every task completes or is still durably queued; none fail.
    let mut completed = 0;
    for id in &submitted {
        let task = h.coordinator.task(id).await.unwrap();
        assert_ne!(
            task.status,
            TaskStatus::Failed,
            "seed {}: task {} failed: {:?}",
            seed,
            id,
            task.failure_reason
        );
        if task.status == TaskStatus::Completed {
            completed += 1;
        }
        assert_eq!(h.store.task(id).await.unwrap().status, task.status);
    }
    assert!(completed > 0, "seed {}: nothing completed", seed);
    assert!(
        h.sink.events_of_type("MissionFailed").await.is_empty(),
        "seed {}: a mission failed",
        seed
    );
}

#[tokio::test]
async fn no_two_agvs_share_or_swap_a_cell() {
    for seed in [1, 7, 42, 2024] {
        simulate(seed).await;
    }
}
