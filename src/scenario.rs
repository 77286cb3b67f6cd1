use rand::prelude::*;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::time::Instant;
use tracing::{info, warn};

use crate::geometry::GeometryLayout;
use crate::graph::{Graph, NodeId};
use crate::mapf::{AgentId, Task};
use crate::solver::CbsSolver;

/// 2-D lattice with unit edges and a self-loop on every node, so agents can
/// wait in place. Nodes reuse the `"x,y,0"` naming of the flight lattice.
pub fn grid_graph(width: u32, height: u32) -> Graph {
    let mut graph = Graph::new();
    for y in 0..height {
        for x in 0..width {
            let name = GeometryLayout::node_name(x, y, 0);
            graph.add_node(name.clone());
            graph.add_edge(&name, &name, 1.0);
            if x > 0 {
                let left = GeometryLayout::node_name(x - 1, y, 0);
                graph.add_edge(&left, &name, 1.0);
                graph.add_edge(&name, &left, 1.0);
            }
            if y > 0 {
                let below = GeometryLayout::node_name(x, y - 1, 0);
                graph.add_edge(&below, &name, 1.0);
                graph.add_edge(&name, &below, 1.0);
            }
        }
    }
    graph
}

/// Manhattan distance between lattice node indices; 0 for nodes outside the
/// naming scheme, which keeps the heuristic merely uninformed, not wrong.
pub fn manhattan(a: &NodeId, b: &NodeId) -> f64 {
    match (
        GeometryLayout::node_grid_index(a),
        GeometryLayout::node_grid_index(b),
    ) {
        (Ok((ax, ay, az)), Ok((bx, by, bz))) => {
            (ax.abs_diff(bx) + ay.abs_diff(by) + az.abs_diff(bz)) as f64
        }
        _ => 0.0,
    }
}

/// Distinct random starts and distinct random targets for `agents` agents.
pub fn random_assignment(
    graph: &Graph,
    agents: usize,
    rng: &mut impl Rng,
) -> BTreeMap<AgentId, (NodeId, NodeId)> {
    assert!(
        agents <= graph.node_count(),
        "cannot place {agents} agents on {} nodes",
        graph.node_count()
    );

    let mut starts: Vec<NodeId> = graph.nodes().cloned().collect();
    let mut targets = starts.clone();
    starts.shuffle(rng);
    targets.shuffle(rng);

    (0..agents)
        .map(|agent| {
            (
                agent as AgentId,
                (starts[agent].clone(), targets[agent].clone()),
            )
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct GridDemo {
    pub width: u32,
    pub height: u32,
    pub agents: usize,
    pub cycles: usize,
    pub max_threads: usize,
    pub seed: Option<u64>,
    pub output_path: Option<String>,
}

/// Repeatedly solves random grid tasks and reports the solve time
/// distribution, optionally appending it to a file as `ms;count` lines.
pub fn run(demo: &GridDemo) -> anyhow::Result<()> {
    let graph = grid_graph(demo.width, demo.height);
    let solver = CbsSolver::with_max_threads(manhattan, demo.max_threads);
    let mut rng = match demo.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut distribution: BTreeMap<u128, u32> = BTreeMap::new();

    for cycle in 0..demo.cycles {
        let assignment = random_assignment(&graph, demo.agents, &mut rng);
        let task = Task::new(graph.clone(), assignment);

        let cycle_start = Instant::now();
        let plan = solver.solve(&task)?;
        let elapsed_ms = cycle_start.elapsed().as_millis();
        *distribution.entry(elapsed_ms).or_default() += 1;

        if plan.is_empty() {
            warn!("cycle {cycle}: no plan for this assignment");
        } else {
            info!(
                "cycle {cycle}: {} steps in {elapsed_ms} ms",
                plan.steps().len()
            );
        }
    }

    info!("solve time distribution: {distribution:?}");

    if let Some(path) = &demo.output_path {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        for (elapsed_ms, count) in &distribution {
            writeln!(file, "{elapsed_ms};{count}")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;

    #[test]
    fn test_grid_graph_shape() {
        let graph = grid_graph(4, 3);
        assert_eq!(graph.node_count(), 12);

        // A corner has two lattice neighbors plus its self-loop.
        assert_eq!(graph.outgoing("0,0,0").count(), 3);
        // An inner node has four plus the loop.
        assert_eq!(graph.outgoing("1,1,0").count(), 5);
        assert!(graph.outgoing("1,1,0").any(|n| n == "1,1,0"));
    }

    #[test]
    fn test_manhattan_distance() {
        assert_eq!(manhattan(&"0,0,0".to_owned(), &"3,1,0".to_owned()), 4.0);
        assert_eq!(manhattan(&"2,2,0".to_owned(), &"2,2,0".to_owned()), 0.0);
    }

    #[test]
    fn test_random_assignment_is_distinct() {
        let graph = grid_graph(4, 4);
        let mut rng = StdRng::seed_from_u64(99);
        let assignment = random_assignment(&graph, 10, &mut rng);
        assert_eq!(assignment.len(), 10);

        let starts: std::collections::BTreeSet<_> =
            assignment.values().map(|(start, _)| start).collect();
        let targets: std::collections::BTreeSet<_> =
            assignment.values().map(|(_, target)| target).collect();
        assert_eq!(starts.len(), 10);
        assert_eq!(targets.len(), 10);
    }
}
