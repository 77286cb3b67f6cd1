use rand::Rng;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};
use tracing::{debug, instrument, trace};

/// Nodes are opaque strings; geometry-generated nodes use the reversible
/// `"x,y,z"` index encoding.
pub type NodeId = String;

/// Per-timestep forbidden nodes for a single agent.
pub type TimedConstraints = BTreeMap<u32, BTreeSet<NodeId>>;

/// Directed weighted graph. Loops are allowed, at most one edge per ordered
/// node pair, and removing a node drops every incident edge.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    out_edges: BTreeMap<NodeId, BTreeMap<NodeId, f64>>,
    in_edges: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.out_edges.contains_key(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.out_edges.keys()
    }

    pub fn node_count(&self) -> usize {
        self.out_edges.len()
    }

    /// Inserts a node; false if it was already present.
    pub fn add_node(&mut self, node: NodeId) -> bool {
        if self.contains(&node) {
            return false;
        }
        self.in_edges.insert(node.clone(), BTreeSet::new());
        self.out_edges.insert(node, BTreeMap::new());
        true
    }

    /// Inserts a directed edge. Both endpoints must already exist and the
    /// ordered pair must not; loops (from == to) are fine.
    pub fn add_edge(&mut self, from: &str, to: &str, weight: f64) -> bool {
        if !self.contains(from) || !self.contains(to) {
            return false;
        }
        let outgoing = self.out_edges.get_mut(from).unwrap();
        if outgoing.contains_key(to) {
            return false;
        }
        outgoing.insert(to.to_owned(), weight);
        self.in_edges.get_mut(to).unwrap().insert(from.to_owned());
        true
    }

    /// Removes a node together with every incident edge in both directions.
    pub fn remove_node(&mut self, node: &str) -> bool {
        let Some(outgoing) = self.out_edges.remove(node) else {
            return false;
        };
        for successor in outgoing.keys() {
            if let Some(preds) = self.in_edges.get_mut(successor) {
                preds.remove(node);
            }
        }
        for predecessor in self.in_edges.remove(node).unwrap_or_default() {
            if let Some(successors) = self.out_edges.get_mut(&predecessor) {
                successors.remove(node);
            }
        }
        true
    }

    pub fn remove_edge(&mut self, from: &str, to: &str) -> bool {
        let Some(outgoing) = self.out_edges.get_mut(from) else {
            return false;
        };
        if outgoing.remove(to).is_none() {
            return false;
        }
        self.in_edges.get_mut(to).unwrap().remove(from);
        true
    }

    pub fn outgoing(&self, node: &str) -> impl Iterator<Item = &NodeId> + '_ {
        self.out_edges.get(node).into_iter().flat_map(|m| m.keys())
    }

    pub fn incoming(&self, node: &str) -> impl Iterator<Item = &NodeId> + '_ {
        self.in_edges.get(node).into_iter().flatten()
    }

    /// Weight of the (from, to) edge, 0.0 when absent.
    pub fn weight(&self, from: &str, to: &str) -> f64 {
        self.out_edges
            .get(from)
            .and_then(|m| m.get(to))
            .copied()
            .unwrap_or(0.0)
    }

    /// Sum of edge weights along consecutive path nodes; empty paths cost 0.
    pub fn path_cost(&self, path: &[NodeId]) -> f64 {
        path.windows(2).map(|pair| self.weight(&pair[0], &pair[1])).sum()
    }

    /// A fresh 20 digit node identifier that does not collide with the
    /// current node set.
    pub fn random_node_id(&self) -> NodeId {
        let mut rng = rand::thread_rng();
        loop {
            let id: NodeId = (0..20)
                .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
                .collect();
            if !self.contains(&id) {
                return id;
            }
        }
    }

    /// Dijkstra from `source`, avoiding `obstacles`. Returns the full node
    /// sequence (starting at `source`) for every reachable non-source node.
    pub fn all_shortest_paths(
        &self,
        source: &NodeId,
        obstacles: &BTreeSet<NodeId>,
    ) -> BTreeMap<NodeId, Vec<NodeId>> {
        if !self.contains(source) || obstacles.contains(source) {
            return BTreeMap::new();
        }

        let mut distance: BTreeMap<NodeId, f64> = BTreeMap::new();
        let mut predecessor: BTreeMap<NodeId, NodeId> = BTreeMap::new();
        let mut heap = BinaryHeap::new();

        distance.insert(source.clone(), 0.0);
        heap.push(Reverse(QueueEntry {
            cost: 0.0,
            node: source.clone(),
        }));

        while let Some(Reverse(entry)) = heap.pop() {
            if entry.cost > distance[&entry.node] {
                continue;
            }
            for successor in self.outgoing(&entry.node) {
                if obstacles.contains(successor) {
                    continue;
                }
                let next_cost = entry.cost + self.weight(&entry.node, successor);
                if distance.get(successor).map_or(true, |&known| next_cost < known) {
                    distance.insert(successor.clone(), next_cost);
                    predecessor.insert(successor.clone(), entry.node.clone());
                    heap.push(Reverse(QueueEntry {
                        cost: next_cost,
                        node: successor.clone(),
                    }));
                }
            }
        }

        let mut result = BTreeMap::new();
        for node in distance.keys().filter(|node| *node != source) {
            let mut path = vec![node.clone()];
            let mut current = node;
            while let Some(previous) = predecessor.get(current) {
                path.push(previous.clone());
                current = previous;
            }
            path.reverse();
            result.insert(node.clone(), path);
        }
        result
    }

    /// Time-expanded A★ from `start` to `target`.
    ///
    /// States are (node, timestep); waiting in place requires a self-loop
    /// edge. A neighbour is skipped when it is an obstacle or forbidden by
    /// `constraints` at the next timestep. Past the last constrained
    /// timestep the timestep is frozen, which keeps the state space finite
    /// and degenerates the search into a plain A★. A popped target state
    /// only terminates the search if no constraint at the current or a later
    /// timestep forbids the target.
    ///
    /// Returns the node sequence from `start` to `target`, or an empty
    /// vector when no path satisfies the constraints.
    #[instrument(skip_all, fields(start = %start, target = %target), level = "debug")]
    pub fn shortest_path<H>(
        &self,
        start: &NodeId,
        target: &NodeId,
        heuristic: H,
        obstacles: &BTreeSet<NodeId>,
        constraints: &TimedConstraints,
    ) -> Vec<NodeId>
    where
        H: Fn(&NodeId, &NodeId) -> f64,
    {
        if !self.contains(start) || !self.contains(target) || obstacles.contains(start) {
            return Vec::new();
        }

        let horizon = constraints.keys().next_back().copied().unwrap_or(0);

        let mut open: BTreeSet<AStarState> = BTreeSet::new();
        let mut closed: HashSet<(NodeId, u32)> = HashSet::new();
        let mut g: HashMap<(NodeId, u32), f64> = HashMap::new();
        let mut predecessor: HashMap<(u32, NodeId), (u32, NodeId)> = HashMap::new();

        g.insert((start.clone(), 0), 0.0);
        open.insert(AStarState {
            f: heuristic(start, target),
            timestep: 0,
            node: start.clone(),
        });

        while let Some(state) = open.pop_first() {
            trace!("expand {state:?}");

            if state.node == *target {
                let parked_forbidden = constraints
                    .range(state.timestep..)
                    .any(|(_, nodes)| nodes.contains(target));
                if !parked_forbidden {
                    return reconstruct(&predecessor, state.timestep, target);
                }
            }

            closed.insert((state.node.clone(), state.timestep));

            // Frozen past the constraint horizon; beyond it waiting cannot
            // help and the search must terminate on exhaustion.
            let next_timestep = if state.timestep > horizon {
                state.timestep
            } else {
                state.timestep + 1
            };
            let state_g = g[&(state.node.clone(), state.timestep)];

            for successor in self.outgoing(&state.node) {
                if obstacles.contains(successor) {
                    continue;
                }
                if constraints
                    .get(&next_timestep)
                    .is_some_and(|nodes| nodes.contains(successor))
                {
                    continue;
                }
                if closed.contains(&(successor.clone(), next_timestep)) {
                    continue;
                }

                let tentative_g = state_g + self.weight(&state.node, successor);
                if let Some(&known_g) = g.get(&(successor.clone(), next_timestep)) {
                    if known_g <= tentative_g {
                        continue;
                    }
                    open.remove(&AStarState {
                        f: known_g + heuristic(successor, target),
                        timestep: next_timestep,
                        node: successor.clone(),
                    });
                }

                g.insert((successor.clone(), next_timestep), tentative_g);
                predecessor.insert(
                    (next_timestep, successor.clone()),
                    (state.timestep, state.node.clone()),
                );
                open.insert(AStarState {
                    f: tentative_g + heuristic(successor, target),
                    timestep: next_timestep,
                    node: successor.clone(),
                });
            }
        }

        debug!("open list exhausted, no feasible path");
        Vec::new()
    }
}

fn reconstruct(
    predecessor: &HashMap<(u32, NodeId), (u32, NodeId)>,
    goal_timestep: u32,
    target: &NodeId,
) -> Vec<NodeId> {
    let mut path = vec![target.clone()];
    let mut current = (goal_timestep, target.clone());
    while let Some(previous) = predecessor.get(&current) {
        path.push(previous.1.clone());
        current = previous.clone();
    }
    path.reverse();
    path
}

/// Open-list entry ordered by (f, timestep, node).
#[derive(Debug, Clone)]
struct AStarState {
    f: f64,
    timestep: u32,
    node: NodeId,
}

impl PartialEq for AStarState {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for AStarState {}

impl Ord for AStarState {
    fn cmp(&self, other: &Self) -> Ordering {
        self.f
            .total_cmp(&other.f)
            .then_with(|| self.timestep.cmp(&other.timestep))
            .then_with(|| self.node.cmp(&other.node))
    }
}

impl PartialOrd for AStarState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct QueueEntry {
    cost: f64,
    node: NodeId,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cost
            .total_cmp(&other.cost)
            .then_with(|| self.node.cmp(&other.node))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
