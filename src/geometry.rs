use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::info;

use crate::graph::{Graph, NodeId};
use crate::position::Position;
use crate::protocol::DroneId;

/// Measurement slack applied when clipping refined targets into their cell.
const ACCURACY_CORRECTION: f64 = 0.05;

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("spanning the flight volume needs at least two drones, got {0}")]
    TooFewDrones(usize),
    #[error("cannot snap {positions} positions onto {nodes} lattice nodes")]
    NotEnoughNodes { positions: usize, nodes: usize },
    #[error("malformed lattice node name {0:?}")]
    MalformedNodeName(String),
    #[error("node {0:?} is not part of the lattice")]
    UnknownNode(String),
}

/// Shape of the discretized flight volume. Step sizes and edge weights are
/// per axis; the yaw component of both is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct GeometryConfig {
    pub min_altitude: f64,
    pub height: f64,
    pub step_sizes: Position,
    pub edge_weights: Position,
}

/// Discretizes the volume spanned by the initial drone positions into a
/// lattice graph ("hypercube") and converts between real-world coordinates
/// and lattice nodes.
///
/// The base area is the x/y bounding rectangle of the two drones that are
/// farthest apart; all drones are assumed to start inside it. A ground layer
/// of nodes covers that rectangle at the minimum flight altitude, and, when
/// the vertical step fits the volume height, an elevated "spike" node sits
/// over the centre of every ground cell.
#[derive(Debug, Clone)]
pub struct GeometryLayout {
    graph: Graph,
    node_positions: BTreeMap<NodeId, Position>,
    step_sizes: Position,
    min_altitude: f64,
    height: f64,
}

impl GeometryLayout {
    pub fn new(
        config: &GeometryConfig,
        initial_positions: &BTreeMap<DroneId, Position>,
    ) -> Result<Self, GeometryError> {
        let (anchor_a, anchor_b) = farthest_pair(initial_positions)?;

        let min_x = anchor_a.x.min(anchor_b.x);
        let max_x = anchor_a.x.max(anchor_b.x);
        let min_y = anchor_a.y.min(anchor_b.y);
        let max_y = anchor_a.y.max(anchor_b.y);

        let steps = config.step_sizes;
        let weights = config.edge_weights;

        info!(
            "lattice base area ({min_x}, {min_y}) .. ({max_x}, {max_y}), steps {steps}, \
             altitude {} + {}",
            config.min_altitude, config.height
        );

        let mut layout = GeometryLayout {
            graph: Graph::new(),
            node_positions: BTreeMap::new(),
            step_sizes: steps,
            min_altitude: config.min_altitude,
            height: config.height,
        };

        // The lattice covers the whole base rectangle; the last node per
        // axis may overshoot the extent by less than one step.
        let nodes_x = axis_node_count(max_x - min_x, steps.x);
        let nodes_y = axis_node_count(max_y - min_y, steps.y);

        for cy in 0..nodes_y {
            for cx in 0..nodes_x {
                let name = Self::node_name(cx, cy, 0);
                layout.insert_node(
                    name.clone(),
                    Position::new(
                        min_x + cx as f64 * steps.x,
                        min_y + cy as f64 * steps.y,
                        config.min_altitude,
                        0.0,
                    ),
                );
                if cx > 0 {
                    layout.link(&Self::node_name(cx - 1, cy, 0), &name, weights.x);
                }
                if cy > 0 {
                    layout.link(&Self::node_name(cx, cy - 1, 0), &name, weights.y);
                }
            }
        }

        if steps.z <= config.height {
            let spike_weight =
                (weights.x * weights.x + weights.y * weights.y + weights.z * weights.z).sqrt();
            for cy in 0..nodes_y.saturating_sub(1) {
                for cx in 0..nodes_x.saturating_sub(1) {
                    let name = Self::node_name(cx, cy, 1);
                    layout.insert_node(
                        name.clone(),
                        Position::new(
                            min_x + (cx as f64 + 0.5) * steps.x,
                            min_y + (cy as f64 + 0.5) * steps.y,
                            config.min_altitude + steps.z,
                            0.0,
                        ),
                    );
                    for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                        layout.link(&Self::node_name(cx + dx, cy + dy, 0), &name, spike_weight);
                    }
                }
            }
        }

        info!("lattice holds {} nodes", layout.node_positions.len());
        Ok(layout)
    }

    fn insert_node(&mut self, name: NodeId, position: Position) {
        self.graph.add_node(name.clone());
        self.node_positions.insert(name, position);
    }

    fn link(&mut self, a: &NodeId, b: &NodeId, weight: f64) {
        self.graph.add_edge(a, b, weight);
        self.graph.add_edge(b, a, weight);
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn node_positions(&self) -> &BTreeMap<NodeId, Position> {
        &self.node_positions
    }

    /// Canonical name of the lattice node with the given integer indices.
    pub fn node_name(x: u32, y: u32, z: u32) -> NodeId {
        format!("{x},{y},{z}")
    }

    /// Inverse of [`Self::node_name`]: the integer lattice indices encoded in
    /// a node name. These are grid coordinates, not real-world ones.
    pub fn node_grid_index(node: &str) -> Result<(u32, u32, u32), GeometryError> {
        let malformed = || GeometryError::MalformedNodeName(node.to_owned());
        let mut components = node.split(',');
        let mut take = || {
            components
                .next()
                .and_then(|c| c.parse::<u32>().ok())
                .ok_or_else(malformed)
        };
        let index = (take()?, take()?, take()?);
        if components.next().is_some() {
            return Err(malformed());
        }
        Ok(index)
    }

    /// Greedily assigns every position to its nearest still-unused node.
    /// Assignments are order dependent and the input order is preserved.
    pub fn snap(&self, positions: &[Position]) -> Result<Vec<NodeId>, GeometryError> {
        if positions.len() > self.node_positions.len() {
            return Err(GeometryError::NotEnoughNodes {
                positions: positions.len(),
                nodes: self.node_positions.len(),
            });
        }

        let mut result = Vec::with_capacity(positions.len());
        let mut used: BTreeSet<&NodeId> = BTreeSet::new();

        for position in positions {
            let mut nearest: Option<(&NodeId, f64)> = None;
            for (node, node_position) in &self.node_positions {
                if used.contains(node) {
                    continue;
                }
                let distance = node_position.distance(position);
                if nearest.map_or(true, |(_, shortest)| distance < shortest) {
                    nearest = Some((node, distance));
                }
            }
            let (node, _) = nearest.expect("more nodes than positions");
            used.insert(node);
            result.push(node.clone());
        }
        Ok(result)
    }

    /// [`Self::snap`] over a keyed map, preserving the keys.
    pub fn snap_map<K: Ord + Clone>(
        &self,
        positions: &BTreeMap<K, Position>,
    ) -> Result<BTreeMap<K, NodeId>, GeometryError> {
        let values: Vec<Position> = positions.values().copied().collect();
        let snapped = self.snap(&values)?;
        Ok(positions.keys().cloned().zip(snapped).collect())
    }

    /// Real-world position stored for a lattice node.
    pub fn translate(&self, node: &str) -> Result<Position, GeometryError> {
        self.node_positions
            .get(node)
            .copied()
            .ok_or_else(|| GeometryError::UnknownNode(node.to_owned()))
    }

    pub fn translate_all(&self, nodes: &[NodeId]) -> Result<Vec<Position>, GeometryError> {
        nodes.iter().map(|node| self.translate(node)).collect()
    }

    /// [`Self::translate`] over a keyed map, preserving the keys.
    pub fn translate_map<K: Ord + Clone>(
        &self,
        nodes: &BTreeMap<K, NodeId>,
    ) -> Result<BTreeMap<K, Position>, GeometryError> {
        nodes
            .iter()
            .map(|(key, node)| Ok((key.clone(), self.translate(node)?)))
            .collect()
    }

    /// Moves agents from their node centres towards their real targets while
    /// keeping the lattice spacing guarantees: each target is clipped into
    /// the lattice bounding box, then into a half-step box around the
    /// agent's node, and falls back to the node centre whenever it would
    /// come too close to an already refined target. Improves resting
    /// accuracy without changing discrete collision properties.
    pub fn refine<K: Ord + Clone>(
        &self,
        targets: &BTreeMap<K, Position>,
        positions: &BTreeMap<K, NodeId>,
    ) -> Result<BTreeMap<K, Position>, GeometryError> {
        let xs = self.node_positions.values().map(|p| p.x);
        let ys = self.node_positions.values().map(|p| p.y);
        let min_x = xs.clone().fold(f64::INFINITY, f64::min);
        let max_x = xs.fold(f64::NEG_INFINITY, f64::max);
        let min_y = ys.clone().fold(f64::INFINITY, f64::min);
        let max_y = ys.fold(f64::NEG_INFINITY, f64::max);
        let min_z = self.min_altitude;
        let max_z = self.min_altitude + self.height;

        let steps = self.step_sizes;
        let min_distance = [
            (steps.x * steps.x + steps.y * steps.y).sqrt(),
            (steps.x * steps.x + steps.z * steps.z).sqrt(),
            (steps.y * steps.y + steps.z * steps.z).sqrt(),
        ]
        .into_iter()
        .fold(0.0, f64::max)
            / 2.0;

        let mut result: BTreeMap<K, Position> = BTreeMap::new();

        for (key, node) in positions {
            let Some(target) = targets.get(key) else {
                continue;
            };
            let centre = self.translate(node)?;

            let mut refined = *target;
            refined.x = refined.x.clamp(min_x, max_x);
            refined.y = refined.y.clamp(min_y, max_y);
            refined.z = refined.z.clamp(min_z, max_z);

            refined.x = refined.x.clamp(
                centre.x - steps.x / 2.0 - ACCURACY_CORRECTION,
                centre.x + steps.x / 2.0 - ACCURACY_CORRECTION,
            );
            refined.y = refined.y.clamp(
                centre.y - steps.y / 2.0 - ACCURACY_CORRECTION,
                centre.y + steps.y / 2.0 - ACCURACY_CORRECTION,
            );
            refined.z = refined.z.clamp(
                centre.z - steps.z / 2.0 - ACCURACY_CORRECTION,
                centre.z + steps.z / 2.0 - ACCURACY_CORRECTION,
            );

            let crowded = result
                .values()
                .any(|chosen| refined.distance(chosen) < min_distance);
            result.insert(key.clone(), if crowded { centre } else { refined });
        }

        Ok(result)
    }
}

fn farthest_pair(
    positions: &BTreeMap<DroneId, Position>,
) -> Result<(Position, Position), GeometryError> {
    let mut best: Option<(Position, Position)> = None;
    let mut best_distance = -1.0;

    for (id_a, a) in positions {
        for (id_b, b) in positions {
            if id_a == id_b {
                continue;
            }
            let distance = a.distance(b);
            if distance > best_distance {
                best_distance = distance;
                best = Some((*a, *b));
            }
        }
    }

    best.ok_or(GeometryError::TooFewDrones(positions.len()))
}

fn axis_node_count(extent: f64, step: f64) -> u32 {
    (extent / step).ceil() as u32 + 1
}
