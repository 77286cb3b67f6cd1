use std::collections::{BTreeSet, HashSet};
use std::thread;
use std::time::Instant;
use tracing::{debug, info};

use super::constraint_tree::{Constraint, ConstraintTreeNode};
use super::SolverError;
use crate::graph::NodeId;
use crate::mapf::{Plan, Task};

pub const DEFAULT_MAX_THREADS: usize = 24;

/// Conflict-based search over a constraint tree, expanding the best
/// `max_threads` frontier nodes of every iteration in parallel.
///
/// The low-level planner is the graph's time-expanded A★ driven by the
/// supplied heuristic; optimality of the returned plan requires the
/// heuristic to be admissible.
pub struct CbsSolver<H> {
    heuristic: H,
    max_threads: usize,
}

impl<H> CbsSolver<H>
where
    H: Fn(&NodeId, &NodeId) -> f64 + Sync,
{
    pub fn new(heuristic: H) -> Self {
        Self::with_max_threads(heuristic, DEFAULT_MAX_THREADS)
    }

    pub fn with_max_threads(heuristic: H, max_threads: usize) -> Self {
        CbsSolver {
            heuristic,
            max_threads: max_threads.max(1),
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Solves the task into a vertex- and swap-conflict-free plan. An empty
    /// plan means the task has no solution under the current discretization;
    /// there is no retry.
    pub fn solve(&self, task: &Task) -> Result<Plan, SolverError> {
        let solve_start = Instant::now();
        let mut batches = 0usize;
        let mut expanded = 0usize;

        let mut open: BTreeSet<ConstraintTreeNode<'_>> = BTreeSet::new();
        let mut closed: HashSet<Vec<Constraint>> = HashSet::new();
        open.insert(ConstraintTreeNode::root(task, &self.heuristic));

        while !open.is_empty() {
            let batch_size = open.len().min(self.max_threads);
            let mut batch = Vec::with_capacity(batch_size);
            for _ in 0..batch_size {
                batch.push(open.pop_first().expect("batch within open length"));
            }
            batches += 1;

            // Fan the batch out; workers only read their parent node and
            // hand back freshly built children.
            let expansions: Vec<Result<Expansion<'_>, SolverError>> = thread::scope(|scope| {
                let workers: Vec<_> = batch
                    .iter()
                    .map(|parent| scope.spawn(move || expand(parent, &self.heuristic)))
                    .collect();
                workers
                    .into_iter()
                    .map(|worker| worker.join().expect("expansion worker panicked"))
                    .collect()
            });

            let mut winner: Option<&ConstraintTreeNode<'_>> = None;
            let mut branched: Vec<Vec<ConstraintTreeNode<'_>>> = Vec::new();
            for (parent, expansion) in batch.iter().zip(expansions) {
                match expansion? {
                    Expansion::Resolved => {
                        // Conflict free; the batch winner is the candidate
                        // with the smallest cost sum, first seen on ties.
                        if winner.map_or(true, |best| parent.cost_sum() < best.cost_sum()) {
                            winner = Some(parent);
                        }
                    }
                    Expansion::Branched(children) => branched.push(children),
                }
            }

            if let Some(solution_node) = winner {
                info!(
                    "CBS solved {} agents in {:?} ({} batches, {} expanded nodes, cost {})",
                    task.agent_count(),
                    solve_start.elapsed(),
                    batches,
                    expanded,
                    solution_node.cost_sum()
                );
                return Ok(Plan::new(solution_node.solution().clone()));
            }

            for children in branched {
                for child in children {
                    if !closed.contains(&child.canonical_constraints()) {
                        expanded += 1;
                        open.insert(child);
                    }
                }
            }
            for parent in batch {
                closed.insert(parent.canonical_constraints());
            }
        }

        info!(
            "CBS exhausted the constraint tree for {} agents after {:?} ({} batches); \
             task is unsolvable",
            task.agent_count(),
            solve_start.elapsed(),
            batches
        );
        Ok(Plan::default())
    }
}

enum Expansion<'a> {
    /// The parent's solution is conflict free.
    Resolved,
    /// Children for the parent's first conflict which still have a solution.
    Branched(Vec<ConstraintTreeNode<'a>>),
}

fn expand<'t, H>(
    parent: &ConstraintTreeNode<'t>,
    heuristic: &H,
) -> Result<Expansion<'t>, SolverError>
where
    H: Fn(&NodeId, &NodeId) -> f64,
{
    let Some(conflict) = parent.first_conflict()? else {
        return Ok(Expansion::Resolved);
    };
    debug!("resolving {conflict:?}");

    let children = [
        parent.child(
            Constraint {
                timestep: conflict.timestep,
                agent: conflict.agent_1,
                node: conflict.node_1.clone(),
            },
            heuristic,
        ),
        parent.child(
            Constraint {
                timestep: conflict.timestep,
                agent: conflict.agent_2,
                node: conflict.node_2.clone(),
            },
            heuristic,
        ),
    ]
    .into_iter()
    .filter(ConstraintTreeNode::has_solution)
    .collect();

    Ok(Expansion::Branched(children))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::mapf::AgentId;
    use crate::scenario;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("info")
            .try_init();
    }

    fn zero(_: &NodeId, _: &NodeId) -> f64 {
        0.0
    }

    /// Reconstructs per-agent paths from the plan and checks vertex and
    /// swap freedom plus start/target endpoints.
    fn assert_plan_valid(plan: &Plan, task: &Task) {
        assert!(!plan.is_empty(), "expected a solvable task");

        let mut snapshots: Vec<BTreeMap<AgentId, NodeId>> = Vec::new();
        plan.simulate(|step| snapshots.push(step.clone()));

        for (agent, (start, target)) in task.assignments() {
            assert_eq!(&snapshots[0][agent], start, "agent {agent} start");
            assert_eq!(
                &snapshots[snapshots.len() - 1][agent],
                target,
                "agent {agent} target"
            );
        }

        for (timestep, step) in snapshots.iter().enumerate() {
            let occupied: BTreeSet<&NodeId> = step.values().collect();
            assert_eq!(
                occupied.len(),
                step.len(),
                "vertex conflict at timestep {timestep}"
            );
        }
        for window in snapshots.windows(2) {
            for a1 in task.agents() {
                for a2 in task.agents() {
                    if a1 == a2 {
                        continue;
                    }
                    let swapped = window[0][&a1] == window[1][&a2]
                        && window[1][&a1] == window[0][&a2];
                    assert!(!swapped, "swap conflict between {a1} and {a2}");
                }
            }
        }
    }

    /// Cost of the plan as the sum of per-agent path costs, with trailing
    /// stay-at-target padding stripped.
    fn plan_cost(plan: &Plan, task: &Task) -> f64 {
        let mut snapshots: Vec<BTreeMap<AgentId, NodeId>> = Vec::new();
        plan.simulate(|step| snapshots.push(step.clone()));

        let mut total = 0.0;
        for agent in task.agents() {
            let mut path: Vec<NodeId> =
                snapshots.iter().map(|step| step[&agent].clone()).collect();
            while path.len() > 1 && path[path.len() - 1] == path[path.len() - 2] {
                path.pop();
            }
            total += task.graph().path_cost(&path);
        }
        total
    }

    /// Star around v5 with unit edges and self-loops everywhere.
    fn star_task() -> Task {
        let mut graph = Graph::new();
        for node in ["v1", "v2", "v3", "v4", "v5"] {
            graph.add_node(node.to_owned());
            graph.add_edge(node, node, 1.0);
        }
        for leaf in ["v1", "v2", "v3", "v4"] {
            graph.add_edge(leaf, "v5", 1.0);
            graph.add_edge("v5", leaf, 1.0);
        }
        let agents = BTreeMap::from([
            (0, ("v1".to_owned(), "v3".to_owned())),
            (1, ("v2".to_owned(), "v4".to_owned())),
            (2, ("v3".to_owned(), "v5".to_owned())),
        ]);
        Task::new(graph, agents)
    }

    #[test]
    fn test_empty_task_yields_empty_plan() {
        let task = Task::new(Graph::new(), BTreeMap::new());
        let solver = CbsSolver::new(zero);
        let plan = solver.solve(&task).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_single_agent_already_at_target() {
        let mut graph = Graph::new();
        graph.add_node("v1".to_owned());
        graph.add_edge("v1", "v1", 1.0);
        let task = Task::new(
            graph,
            BTreeMap::from([(0, ("v1".to_owned(), "v1".to_owned()))]),
        );
        let plan = CbsSolver::new(zero).solve(&task).unwrap();
        assert_eq!(plan.steps().len(), 1);
        assert_eq!(plan.steps()[&0][&0], "v1");
    }

    #[test]
    fn test_unreachable_target_yields_empty_plan() {
        let mut graph = Graph::new();
        graph.add_node("v1".to_owned());
        graph.add_node("island".to_owned());
        graph.add_edge("v1", "v1", 1.0);
        let task = Task::new(
            graph,
            BTreeMap::from([(0, ("v1".to_owned(), "island".to_owned()))]),
        );
        let plan = CbsSolver::new(zero).solve(&task).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_star_swap_is_solved_optimally() {
        init_tracing();
        let task = star_task();
        let solver = CbsSolver::new(zero);
        let plan = solver.solve(&task).unwrap();

        assert_plan_valid(&plan, &task);
        assert!(plan.steps().len() <= 8, "plan unexpectedly long");
        // Hand computed: agent 1 crosses the hub first (cost 2), agent 2
        // vacates v3 via the hub and dodges through v2 (cost 4), agent 0
        // loiters twice before crossing (cost 4).
        assert_eq!(plan_cost(&plan, &task), 10.0);
    }

    #[test]
    fn test_two_agents_head_on_corridor() {
        // Head-on traffic on a line must use the hub-free detour rules:
        // one agent steps aside in time, never swapping.
        let mut graph = Graph::new();
        for node in ["v1", "v2", "v3", "v4"] {
            graph.add_node(node.to_owned());
            graph.add_edge(node, node, 1.0);
        }
        for (from, to) in [("v1", "v2"), ("v2", "v3"), ("v3", "v4")] {
            graph.add_edge(from, to, 1.0);
            graph.add_edge(to, from, 1.0);
        }
        // Extra passing bay off v2.
        graph.add_node("bay".to_owned());
        graph.add_edge("bay", "bay", 1.0);
        graph.add_edge("v2", "bay", 1.0);
        graph.add_edge("bay", "v2", 1.0);

        let task = Task::new(
            graph,
            BTreeMap::from([
                (0, ("v1".to_owned(), "v4".to_owned())),
                (1, ("v4".to_owned(), "v1".to_owned())),
            ]),
        );
        let plan = CbsSolver::new(zero).solve(&task).unwrap();
        assert_plan_valid(&plan, &task);
    }

    #[test]
    fn test_random_grid_tasks_stay_conflict_free() {
        init_tracing();
        let graph = scenario::grid_graph(4, 4);

        for seed in [7, 21, 1234] {
            let mut rng = StdRng::seed_from_u64(seed);
            let assignment = scenario::random_assignment(&graph, 10, &mut rng);
            let task = Task::new(graph.clone(), assignment);

            let solver = CbsSolver::with_max_threads(scenario::manhattan, 8);
            let plan = solver.solve(&task).unwrap();
            assert_plan_valid(&plan, &task);
        }
    }
}
