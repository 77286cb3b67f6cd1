use std::collections::BTreeMap;

use crate::graph::{Graph, NodeId};

/// Agents are drones; they share the 16 bit identifier space.
pub type AgentId = u16;

/// One multi-agent path finding problem: a graph and, per agent, a start
/// and target node. Immutable for the lifetime of a solve.
#[derive(Debug, Clone)]
pub struct Task {
    graph: Graph,
    agents: BTreeMap<AgentId, (NodeId, NodeId)>,
}

impl Task {
    pub fn new(graph: Graph, agents: BTreeMap<AgentId, (NodeId, NodeId)>) -> Self {
        Task { graph, agents }
    }

    pub fn add_agent(&mut self, agent: AgentId, start: NodeId, target: NodeId) {
        self.agents.insert(agent, (start, target));
    }

    pub fn remove_agent(&mut self, agent: AgentId) {
        self.agents.remove(&agent);
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn assignments(&self) -> &BTreeMap<AgentId, (NodeId, NodeId)> {
        &self.agents
    }

    pub fn agents(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.agents.keys().copied()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn start(&self, agent: AgentId) -> Option<&NodeId> {
        self.agents.get(&agent).map(|(start, _)| start)
    }

    pub fn target(&self, agent: AgentId) -> Option<&NodeId> {
        self.agents.get(&agent).map(|(_, target)| target)
    }
}

/// A solved movement sequence: per timestep, the node every agent occupies.
/// Steps may be sparse; an agent missing from a later step stays where it
/// was.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    steps: BTreeMap<u32, BTreeMap<AgentId, NodeId>>,
}

impl Plan {
    pub fn new(steps: BTreeMap<u32, BTreeMap<AgentId, NodeId>>) -> Self {
        Plan { steps }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &BTreeMap<u32, BTreeMap<AgentId, NodeId>> {
        &self.steps
    }

    /// Replays the plan in timestep order, invoking the observer with the
    /// cumulative agent positions so absent agents keep their last node.
    pub fn simulate<F>(&self, mut observer: F)
    where
        F: FnMut(&BTreeMap<AgentId, NodeId>),
    {
        let Some(last) = self.steps.keys().next_back().copied() else {
            return;
        };

        let mut current: BTreeMap<AgentId, NodeId> = BTreeMap::new();
        for timestep in 0..=last {
            if let Some(step) = self.steps.get(&timestep) {
                for (agent, node) in step {
                    current.insert(*agent, node.clone());
                }
            }
            observer(&current);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_accessors() {
        let mut graph = Graph::new();
        graph.add_node("a".to_owned());
        graph.add_node("b".to_owned());

        let mut task = Task::new(graph, BTreeMap::new());
        task.add_agent(3, "a".to_owned(), "b".to_owned());
        assert_eq!(task.agent_count(), 1);
        assert_eq!(task.start(3), Some(&"a".to_owned()));
        assert_eq!(task.target(3), Some(&"b".to_owned()));
        assert_eq!(task.start(4), None);

        task.remove_agent(3);
        assert_eq!(task.agent_count(), 0);
    }

    #[test]
    fn test_simulate_keeps_absent_agents_sticky() {
        let steps = BTreeMap::from([
            (
                0,
                BTreeMap::from([(0, "a".to_owned()), (1, "x".to_owned())]),
            ),
            (1, BTreeMap::from([(0, "b".to_owned())])),
            (2, BTreeMap::from([(0, "c".to_owned()), (1, "y".to_owned())])),
        ]);
        let plan = Plan::new(steps);

        let mut snapshots = Vec::new();
        plan.simulate(|step| snapshots.push(step.clone()));

        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0][&1], "x");
        // Agent 1 is missing at t=1 and stays on "x".
        assert_eq!(snapshots[1][&1], "x");
        assert_eq!(snapshots[1][&0], "b");
        assert_eq!(snapshots[2][&1], "y");
    }

    #[test]
    fn test_simulate_empty_plan_never_calls_observer() {
        let plan = Plan::default();
        plan.simulate(|_| panic!("observer must not run for an empty plan"));
    }
}
