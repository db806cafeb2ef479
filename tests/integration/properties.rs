//! Property tests over random task graphs using proptest

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;
use taskweave::{RunStatus, SchedulerPool, TaskBuilder, TaskId, WorkerId};

use crate::common::{Ledger, WAIT};

/// One node of a generated graph.
#[derive(Debug, Clone)]
struct Node {
    /// Indices of earlier nodes this one depends on.
    deps: Vec<usize>,
    /// Worker index this node is pinned to, if any.
    pinned: Option<usize>,
    /// Number of `Paused` returns before finishing.
    pauses: u32,
}

/// Strategy for generating acyclic graphs: edges only point backwards.
fn graph_strategy(workers: usize) -> impl Strategy<Value = Vec<Node>> {
    (1usize..16).prop_flat_map(move |len| {
        (0..len)
            .map(|i| {
                let deps = if i == 0 {
                    Just(Vec::new()).boxed()
                } else {
                    prop::collection::vec(0..i, 0..3).boxed()
                };
                let pinned = prop::option::weighted(0.3, 0..workers);
                (deps, pinned, 0u32..3).prop_map(|(mut deps, pinned, pauses)| {
                    deps.sort_unstable();
                    deps.dedup();
                    Node {
                        deps,
                        pinned,
                        pauses,
                    }
                })
            })
            .collect::<Vec<_>>()
    })
}

fn run_graph(
    graph: &[Node],
    worker_count: usize,
) -> (Arc<Ledger>, Vec<WorkerId>, Vec<Vec<WorkerId>>) {
    let mut pool = SchedulerPool::new();
    let workers: Vec<WorkerId> = (0..worker_count)
        .map(|_| pool.add_worker(()).unwrap())
        .collect();

    let ledger = Ledger::new();
    let ran_on: Vec<Arc<std::sync::Mutex<Vec<WorkerId>>>> =
        graph.iter().map(|_| Default::default()).collect();
    let mut ids: HashMap<usize, TaskId> = HashMap::new();

    for (index, node) in graph.iter().enumerate() {
        let mut builder = TaskBuilder::new().name(format!("node-{}", index));
        for dep in &node.deps {
            builder = builder.depends_on(ids[dep]);
        }
        if let Some(w) = node.pinned {
            builder = builder.run_on(workers[w]);
        }

        let ledger = ledger.clone();
        let ran_on = ran_on[index].clone();
        let key = index as u64;
        let mut remaining = node.pauses;
        let id = pool
            .add_task(builder.build_fn(move |cx| {
                ledger.enter(key);
                ran_on.lock().unwrap().push(cx.worker_id());
                ledger.leave(key);
                if remaining > 0 {
                    remaining -= 1;
                    return Ok(RunStatus::Paused);
                }
                ledger.finish(key);
                Ok(RunStatus::Finished)
            }))
            .unwrap();
        ids.insert(index, id);
    }

    assert!(pool.wait_idle(WAIT), "graph did not drain");
    pool.run().unwrap();

    let ran_on = ran_on
        .iter()
        .map(|r| r.lock().unwrap().clone())
        .collect();
    (ledger, workers, ran_on)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Every task finishes exactly once, after all of its dependencies.
    #[test]
    fn prop_graph_respects_dependencies(
        (workers, graph) in (1usize..5).prop_flat_map(|w| (Just(w), graph_strategy(w)))
    ) {
        let (ledger, _, _) = run_graph(&graph, workers);
        let finished = ledger.finished();

        prop_assert_eq!(finished.len(), graph.len());
        prop_assert!(ledger.overlaps().is_empty());
        for (index, node) in graph.iter().enumerate() {
            let at = ledger.position(index as u64).unwrap();
            for dep in &node.deps {
                prop_assert!(ledger.position(*dep as u64).unwrap() < at);
            }
        }
    }

    /// Pinned tasks never run anywhere else, including after pausing.
    #[test]
    fn prop_graph_respects_affinity(
        (workers, graph) in (1usize..5).prop_flat_map(|w| (Just(w), graph_strategy(w)))
    ) {
        let (_, ids, ran_on) = run_graph(&graph, workers);
        for (node, seen) in graph.iter().zip(&ran_on) {
            prop_assert_eq!(seen.len(), node.pauses as usize + 1);
            if let Some(w) = node.pinned {
                prop_assert!(seen.iter().all(|id| *id == ids[w]));
            }
        }
    }
}
