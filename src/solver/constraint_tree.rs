use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use tracing::trace;

use super::SolverError;
use crate::graph::{NodeId, TimedConstraints};
use crate::mapf::{AgentId, Task};

/// Forbids one agent from occupying one node at one timestep.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Constraint {
    pub timestep: u32,
    pub agent: AgentId,
    pub node: NodeId,
}

impl Ord for Constraint {
    /// Timestep descending, then node, then agent. Any stable total order
    /// works; this one is what the constraint tree ordering builds on.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .timestep
            .cmp(&self.timestep)
            .then_with(|| self.node.cmp(&other.node))
            .then_with(|| self.agent.cmp(&other.agent))
    }
}

impl PartialOrd for Constraint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Two agents colliding: on the same node (`node_1 == node_2`) or by
/// swapping nodes between consecutive timesteps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub timestep: u32,
    pub agent_1: AgentId,
    pub agent_2: AgentId,
    pub node_1: NodeId,
    pub node_2: NodeId,
}

/// One node of the CBS constraint tree: a constraint set, the per-agent
/// shortest paths satisfying it (padded to equal length), their costs, and
/// a hash over the constraint set alone.
///
/// The solution is either empty (no feasible plan under these constraints)
/// or dense in time: every agent appears at every populated timestep.
#[derive(Debug, Clone)]
pub struct ConstraintTreeNode<'a> {
    task: &'a Task,
    constraints: BTreeMap<AgentId, TimedConstraints>,
    solution: BTreeMap<u32, BTreeMap<AgentId, NodeId>>,
    costs: BTreeMap<AgentId, f64>,
    cost_sum: f64,
    hash: u64,
}

impl<'a> ConstraintTreeNode<'a> {
    /// Root node: per-agent shortest paths without any constraints.
    pub fn root<H>(task: &'a Task, heuristic: &H) -> Self
    where
        H: Fn(&NodeId, &NodeId) -> f64,
    {
        let mut node = ConstraintTreeNode {
            task,
            constraints: BTreeMap::new(),
            solution: BTreeMap::new(),
            costs: BTreeMap::new(),
            cost_sum: 0.0,
            hash: 0,
        };
        node.calculate_solution(heuristic);
        node
    }

    /// Child node: the parent's state plus one constraint, with only the
    /// constrained agent's path recomputed.
    pub fn child<H>(&self, constraint: Constraint, heuristic: &H) -> ConstraintTreeNode<'a>
    where
        H: Fn(&NodeId, &NodeId) -> f64,
    {
        let mut node = self.clone();
        node.constraints
            .entry(constraint.agent)
            .or_default()
            .entry(constraint.timestep)
            .or_default()
            .insert(constraint.node.clone());
        node.update_solution(constraint.agent, heuristic);
        node
    }

    pub fn has_solution(&self) -> bool {
        !self.solution.is_empty()
    }

    pub fn solution(&self) -> &BTreeMap<u32, BTreeMap<AgentId, NodeId>> {
        &self.solution
    }

    pub fn cost_sum(&self) -> f64 {
        self.cost_sum
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// The constraint multiset flattened into its canonical sorted sequence.
    /// Used as the closed-set key and as the final ordering tiebreaker, so
    /// hash collisions can never merge distinct nodes.
    pub fn canonical_constraints(&self) -> Vec<Constraint> {
        let mut flattened: Vec<Constraint> = self
            .constraints
            .iter()
            .flat_map(|(agent, per_timestep)| {
                per_timestep.iter().flat_map(|(timestep, nodes)| {
                    nodes.iter().map(|node| Constraint {
                        timestep: *timestep,
                        agent: *agent,
                        node: node.clone(),
                    })
                })
            })
            .collect();
        flattened.sort();
        flattened
    }

    /// The first conflict in the solution, scanning vertex conflicts over
    /// all timesteps before swap conflicts. `None` means collision free.
    pub fn first_conflict(&self) -> Result<Option<Conflict>, SolverError> {
        if self.solution.len() <= 1 {
            return Ok(None);
        }
        let last = *self.solution.keys().next_back().expect("solution not empty");

        // The initial positions cannot collide, so vertex checks start at 1.
        for timestep in 1..=last {
            let step = self
                .solution
                .get(&timestep)
                .ok_or(SolverError::CorruptSolution("interrupted timeline"))?;
            if step.len() < self.task.agent_count() {
                return Err(SolverError::CorruptSolution(
                    "an agent is missing from a populated timestep",
                ));
            }
            let mut assignments: BTreeMap<&NodeId, AgentId> = BTreeMap::new();
            for (agent, node) in step {
                if let Some(&occupant) = assignments.get(node) {
                    return Ok(Some(Conflict {
                        timestep,
                        agent_1: occupant,
                        agent_2: *agent,
                        node_1: node.clone(),
                        node_2: node.clone(),
                    }));
                }
                assignments.insert(node, *agent);
            }
        }

        for timestep in 0..last {
            let step = &self.solution[&timestep];
            let next = &self.solution[&(timestep + 1)];
            for agent_1 in self.task.agents() {
                for agent_2 in self.task.agents() {
                    if agent_1 == agent_2 {
                        continue;
                    }
                    if step[&agent_1] == next[&agent_2] && next[&agent_1] == step[&agent_2] {
                        // The two agents exchanged nodes across this step.
                        return Ok(Some(Conflict {
                            timestep: timestep + 1,
                            agent_1,
                            agent_2,
                            node_1: next[&agent_1].clone(),
                            node_2: step[&agent_1].clone(),
                        }));
                    }
                }
            }
        }

        Ok(None)
    }

    fn constraints_for(&self, agent: AgentId) -> TimedConstraints {
        self.constraints.get(&agent).cloned().unwrap_or_default()
    }

    fn calculate_solution<H>(&mut self, heuristic: &H)
    where
        H: Fn(&NodeId, &NodeId) -> f64,
    {
        self.solution.clear();
        self.costs.clear();
        let mut feasible = true;

        for (agent, (start, target)) in self.task.assignments() {
            let path = self.task.graph().shortest_path(
                start,
                target,
                heuristic,
                &BTreeSet::new(),
                &self.constraints_for(*agent),
            );
            if path.is_empty() {
                feasible = false;
                break;
            }
            self.costs.insert(*agent, self.task.graph().path_cost(&path));
            self.overlay_path(*agent, &path);
        }

        if feasible {
            self.pad_solution();
        } else {
            self.solution.clear();
        }
        self.cost_sum = self.costs.values().sum();
        self.hash = self.compute_hash();
    }

    fn update_solution<H>(&mut self, agent: AgentId, heuristic: &H)
    where
        H: Fn(&NodeId, &NodeId) -> f64,
    {
        for step in self.solution.values_mut() {
            step.remove(&agent);
        }

        let (start, target) = &self.task.assignments()[&agent];
        let path = self.task.graph().shortest_path(
            start,
            target,
            heuristic,
            &BTreeSet::new(),
            &self.constraints_for(agent),
        );

        if path.is_empty() {
            self.solution.clear();
        } else {
            let new_cost = self.task.graph().path_cost(&path);
            let old_cost = self.costs.insert(agent, new_cost).unwrap_or(0.0);
            self.cost_sum += new_cost - old_cost;
            self.overlay_path(agent, &path);
            self.pad_solution();
        }
        self.hash = self.compute_hash();
        trace!(
            "recomputed agent {agent}: cost {:?}, sum {}",
            self.costs.get(&agent),
            self.cost_sum
        );
    }

    fn overlay_path(&mut self, agent: AgentId, path: &[NodeId]) {
        for (timestep, node) in path.iter().enumerate() {
            self.solution
                .entry(timestep as u32)
                .or_default()
                .insert(agent, node.clone());
        }
    }

    /// Pads short paths by repeating each agent's last node, so every agent
    /// appears at every populated timestep.
    fn pad_solution(&mut self) {
        let Some(last) = self.solution.keys().next_back().copied() else {
            return;
        };
        let agents: Vec<AgentId> = self.task.agents().collect();
        for timestep in 1..=last {
            let previous = self
                .solution
                .get(&(timestep - 1))
                .cloned()
                .unwrap_or_default();
            let step = self.solution.entry(timestep).or_default();
            for agent in &agents {
                if !step.contains_key(agent) {
                    if let Some(node) = previous.get(agent) {
                        step.insert(*agent, node.clone());
                    }
                }
            }
        }
    }

    /// Hash over the constraint set alone; stable under child construction
    /// that leaves the constraints untouched.
    fn compute_hash(&self) -> u64 {
        self.canonical_constraints()
            .iter()
            .map(constraint_hash)
            .reduce(hash_combine)
            .unwrap_or(0)
    }
}

fn constraint_hash(constraint: &Constraint) -> u64 {
    let mut hasher = DefaultHasher::new();
    constraint.hash(&mut hasher);
    hasher.finish()
}

fn hash_combine(lhs: u64, rhs: u64) -> u64 {
    lhs ^ rhs
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(lhs << 6)
        .wrapping_add(lhs >> 2)
}

impl Ord for ConstraintTreeNode<'_> {
    /// (cost sum, hash, canonical constraint sequence) — a true total order
    /// over distinct constraint sets, collision safe.
    fn cmp(&self, other: &Self) -> Ordering {
        self.cost_sum
            .total_cmp(&other.cost_sum)
            .then_with(|| self.hash.cmp(&other.hash))
            .then_with(|| self.canonical_constraints().cmp(&other.canonical_constraints()))
    }
}

impl PartialOrd for ConstraintTreeNode<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ConstraintTreeNode<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ConstraintTreeNode<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;

    fn zero(_: &NodeId, _: &NodeId) -> f64 {
        0.0
    }

    /// v1 - v2 - v3 - v4 line with self-loops, unit weights.
    fn line_task(agents: &[(AgentId, &str, &str)]) -> Task {
        let mut graph = Graph::new();
        for node in ["v1", "v2", "v3", "v4"] {
            graph.add_node(node.to_owned());
            graph.add_edge(node, node, 1.0);
        }
        for (from, to) in [("v1", "v2"), ("v2", "v3"), ("v3", "v4")] {
            graph.add_edge(from, to, 1.0);
            graph.add_edge(to, from, 1.0);
        }
        let assignments = agents
            .iter()
            .map(|(agent, start, target)| (*agent, ((*start).to_owned(), (*target).to_owned())))
            .collect();
        Task::new(graph, assignments)
    }

    #[test]
    fn test_root_pads_solution_dense() {
        // Agent 0 needs three steps, agent 1 none.
        let task = line_task(&[(0, "v1", "v4"), (1, "v2", "v2")]);
        let root = ConstraintTreeNode::root(&task, &zero);

        assert!(root.has_solution());
        assert_eq!(root.cost_sum(), 3.0);
        let last = *root.solution().keys().next_back().unwrap();
        assert_eq!(last, 3);
        for step in root.solution().values() {
            assert_eq!(step.len(), 2);
            assert_eq!(step[&1], "v2");
        }
        assert_eq!(root.hash(), 0);
    }

    #[test]
    fn test_child_recomputes_only_constrained_agent() {
        let task = line_task(&[(0, "v1", "v3"), (1, "v4", "v4")]);
        let root = ConstraintTreeNode::root(&task, &zero);
        assert_eq!(root.cost_sum(), 2.0);

        // Forbid agent 0 from entering v2 at t=1; it has to loiter first.
        let child = root.child(
            Constraint {
                timestep: 1,
                agent: 0,
                node: "v2".to_owned(),
            },
            &zero,
        );
        assert!(child.has_solution());
        assert_eq!(child.cost_sum(), 3.0);
        assert_ne!(child.solution()[&1][&0], "v2");
        assert_eq!(child.solution()[&0][&1], "v4");
        assert_ne!(child.hash(), root.hash());
    }

    #[test]
    fn test_child_without_feasible_path_has_no_solution() {
        let task = line_task(&[(0, "v1", "v2")]);
        let root = ConstraintTreeNode::root(&task, &zero);

        // v2 is the target; forbidding it forever is impossible to express,
        // but forbidding an isolated agent's only exit is: constrain both
        // reachable nodes at t=1 so no expansion survives.
        let child = root
            .child(
                Constraint {
                    timestep: 1,
                    agent: 0,
                    node: "v1".to_owned(),
                },
                &zero,
            )
            .child(
                Constraint {
                    timestep: 1,
                    agent: 0,
                    node: "v2".to_owned(),
                },
                &zero,
            );
        assert!(!child.has_solution());
    }

    #[test]
    fn test_first_conflict_vertex() {
        // Both agents reach v3 at t=2 on their shortest paths.
        let task = line_task(&[(0, "v1", "v4"), (1, "v3", "v3")]);
        let root = ConstraintTreeNode::root(&task, &zero);
        let conflict = root.first_conflict().unwrap().unwrap();
        assert_eq!(conflict.node_1, conflict.node_2);
        assert_eq!(conflict.node_1, "v3");
        assert_eq!(conflict.timestep, 2);
        assert_eq!((conflict.agent_1, conflict.agent_2), (0, 1));
    }

    #[test]
    fn test_first_conflict_swap() {
        let task = line_task(&[(0, "v1", "v2"), (1, "v2", "v1")]);
        let root = ConstraintTreeNode::root(&task, &zero);
        let conflict = root.first_conflict().unwrap().unwrap();
        assert_eq!(conflict.timestep, 1);
        assert_ne!(conflict.node_1, conflict.node_2);
        assert_eq!(
            BTreeSet::from([conflict.node_1.as_str(), conflict.node_2.as_str()]),
            BTreeSet::from(["v1", "v2"])
        );
    }

    #[test]
    fn test_first_conflict_none_on_disjoint_paths() {
        let task = line_task(&[(0, "v1", "v1"), (1, "v4", "v4")]);
        let root = ConstraintTreeNode::root(&task, &zero);
        assert_eq!(root.first_conflict().unwrap(), None);
    }

    #[test]
    fn test_ordering_prefers_lower_cost_sum() {
        let task_cheap = line_task(&[(0, "v1", "v2")]);
        let task_dear = line_task(&[(0, "v1", "v4")]);
        let cheap = ConstraintTreeNode::root(&task_cheap, &zero);
        let dear = ConstraintTreeNode::root(&task_dear, &zero);
        assert!(cheap < dear);
    }

    #[test]
    fn test_ordering_total_on_equal_cost() {
        let task = line_task(&[(0, "v1", "v3"), (1, "v4", "v4")]);
        let root = ConstraintTreeNode::root(&task, &zero);
        let child_a = root.child(
            Constraint {
                timestep: 1,
                agent: 1,
                node: "v3".to_owned(),
            },
            &zero,
        );
        let child_b = root.child(
            Constraint {
                timestep: 1,
                agent: 1,
                node: "v1".to_owned(),
            },
            &zero,
        );
        // Equal cost, distinct constraints: strictly ordered, never equal.
        assert_eq!(child_a.cost_sum(), child_b.cost_sum());
        assert_ne!(child_a.cmp(&child_b), Ordering::Equal);
        assert_eq!(child_a.cmp(&child_b), child_b.cmp(&child_a).reverse());
    }

    #[test]
    fn test_constraint_ordering() {
        let c = |timestep, agent: AgentId, node: &str| Constraint {
            timestep,
            agent,
            node: node.to_owned(),
        };
        // Timestep descending first, then node, then agent.
        assert!(c(3, 0, "a") < c(1, 0, "a"));
        assert!(c(2, 0, "a") < c(2, 0, "b"));
        assert!(c(2, 1, "a") < c(2, 2, "a"));
    }
}
