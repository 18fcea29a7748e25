//! Allocation invariants under randomized submit/complete/schedule
//! interleavings: a GPU belongs to at most one running job, free sets
//! and assignments partition every node's GPUs, and assignments exist
//! exactly while a job is running or cancelling.

use mgpu_master::config::MasterConfig;
use mgpu_master::scheduler::plan_cycle;
use mgpu_master::state::MasterState;
use mgpu_proto::message::{DistributedKind, GpuDesc, JobSpec, JobStatus};
use proptest::prelude::*;
use std::collections::HashSet;

#[derive(Debug, Clone)]
enum Op {
    Submit { gpus: u32, priority: i64 },
    CompleteOldest { code: i32 },
    Cycle,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..=4, -5i64..=5)
            .prop_map(|(gpus, priority)| Op::Submit { gpus, priority }),
        (0i32..=2).prop_map(|code| Op::CompleteOldest { code }),
        Just(Op::Cycle),
    ]
}

fn gpu_list(count: u32) -> Vec<GpuDesc> {
    (0..count)
        .map(|index| GpuDesc {
            index,
            model: "NVIDIA A100".into(),
            total_memory_mb: 80_000,
        })
        .collect()
}

fn spec(gpus: u32, priority: i64) -> JobSpec {
    JobSpec {
        owner: "prop".into(),
        command: "true".into(),
        gpus,
        pins: vec![],
        priority,
        distributed: DistributedKind::None,
        interactive: false,
        cancel_on_detach: None,
        mem_mb: None,
    }
}

fn check_invariants(st: &MasterState) {
    // every GPU sits in at most one live assignment
    let mut held: HashSet<(String, u32)> = HashSet::new();
    for job in st.jobs.values() {
        for share in &job.assignment {
            for gpu in &share.gpu_ids {
                assert!(
                    held.insert((share.node_id.clone(), *gpu)),
                    "gpu {}:{gpu} appears in two assignments",
                    share.node_id
                );
            }
        }
    }

    // per node: free set and held set are disjoint and cover the GPUs
    for node in st.nodes.values() {
        let total: HashSet<u32> = node.gpus.iter().map(|g| g.index).collect();
        let node_held: HashSet<u32> = held
            .iter()
            .filter(|(n, _)| n == &node.node_id)
            .map(|(_, g)| *g)
            .collect();
        let free: HashSet<u32> = node.free_gpus.iter().copied().collect();
        assert!(free.is_disjoint(&node_held), "free and held overlap on {}", node.node_id);
        let covered: HashSet<u32> = free.union(&node_held).copied().collect();
        assert_eq!(covered, total, "gpu accounting leak on {}", node.node_id);
    }

    // assignments exist exactly while running or cancelling
    for job in st.jobs.values() {
        match job.status {
            JobStatus::Running | JobStatus::Cancelling => {
                assert!(!job.assignment.is_empty(), "running job {} without assignment", job.id)
            }
            _ => assert!(
                job.assignment.is_empty(),
                "job {} in {:?} still holds an assignment",
                job.id,
                job.status
            ),
        }
    }
}

fn complete_oldest(st: &mut MasterState, code: i32) {
    let oldest = st
        .jobs
        .values()
        .filter(|j| j.status == JobStatus::Running)
        .min_by_key(|j| j.seq)
        .map(|j| (j.id.clone(), j.assignment.iter().map(|s| s.node_id.clone()).collect::<Vec<_>>()));
    if let Some((job_id, nodes)) = oldest {
        for node_id in nodes {
            if st.record_share_exit(&job_id, &node_id, code, None) {
                let (status, code, signal, reason) =
                    st.exit_outcome(&job_id).expect("fully reported job has an outcome");
                st.retire(&job_id, status, code, signal, &reason);
            }
        }
    }
}

proptest! {
    #[test]
    fn gpu_accounting_stays_consistent(
        ops in proptest::collection::vec(op_strategy(), 1..80)
    ) {
        let cfg = MasterConfig::default();
        let mut st = MasterState::default();
        st.register_node("n1".into(), "127.0.0.1:7801".into(), gpu_list(2));
        st.register_node("n2".into(), "127.0.0.1:7802".into(), gpu_list(4));

        for op in ops {
            match op {
                Op::Submit { gpus, priority } => {
                    // oversized requests are rejected up front; fine either way
                    let _ = st.submit(spec(gpus, priority), 4096);
                }
                Op::Cycle => {
                    plan_cycle(&mut st, &cfg);
                }
                Op::CompleteOldest { code } => complete_oldest(&mut st, code),
            }
            check_invariants(&st);
        }

        // drain: everything still placeable must eventually terminate
        for _ in 0..64 {
            plan_cycle(&mut st, &cfg);
            complete_oldest(&mut st, 0);
            check_invariants(&st);
        }
        let stuck = st
            .jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Running | JobStatus::Cancelling))
            .count();
        prop_assert_eq!(stuck, 0, "jobs left running after drain");
    }

    #[test]
    fn terminal_states_are_reached_once(
        codes in proptest::collection::vec(0i32..=1, 1..10)
    ) {
        let cfg = MasterConfig::default();
        let mut st = MasterState::default();
        st.register_node("n1".into(), "127.0.0.1:7801".into(), gpu_list(1));

        for code in codes {
            let id = st.submit(spec(1, 0), 4096).unwrap();
            plan_cycle(&mut st, &cfg);
            complete_oldest(&mut st, code);

            let job = &st.jobs[&id];
            let expected =
                if code == 0 { JobStatus::Completed } else { JobStatus::Failed };
            prop_assert_eq!(job.status, expected);
            prop_assert_eq!(job.exit_code, Some(code));

            // terminal is sticky: a late duplicate retire changes nothing
            st.retire(&id, JobStatus::Cancelled, -1, None, "late duplicate");
            prop_assert_eq!(st.jobs[&id].status, expected);
            prop_assert_eq!(st.jobs[&id].exit_code, Some(code));
            prop_assert_eq!(st.nodes["n1"].free_gpus.len(), 1);
        }
    }
}
