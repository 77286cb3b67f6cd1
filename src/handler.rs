use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::geometry::GeometryLayout;
use crate::graph::NodeId;
use crate::interfaces::{FleetInterface, InteractionInterface, LinkState};
use crate::mapf::Task;
use crate::position::Position;
use crate::protocol::{DroneId, DroneOperation, SwarmOperation, SwarmState};
use crate::solver::CbsSolver;

#[derive(Debug, Clone)]
pub struct HandlerSettings {
    /// Pairwise distance below which the watchdog fast-stops the swarm.
    pub proximity_alert: f64,
    /// Distance within which a drone counts as having reached its step target.
    pub target_tolerance: f64,
    /// Settling time after a target send before hovering advances the plan.
    pub hover_debounce: Duration,
    /// Parallel width of the CBS expansion.
    pub max_threads: usize,
    /// When set, every materialized plan is appended here as a JSON line.
    pub plan_dump_path: Option<String>,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        HandlerSettings {
            proximity_alert: 0.2,
            target_tolerance: 0.1,
            hover_debounce: Duration::from_millis(200),
            max_threads: crate::solver::DEFAULT_MAX_THREADS,
            plan_dump_path: None,
        }
    }
}

/// Turns swarm operation requests into drone directives: state-gated
/// dispatch, collision-free movement plans via CBS, stepwise plan execution
/// and a proximity watchdog. Runs on a single cooperative tick loop.
pub struct SwarmOperationHandler<'a, F, I> {
    fleet: &'a F,
    interaction: &'a I,
    geometry: &'a GeometryLayout,
    settings: HandlerSettings,
    plan: Option<PlanExecution>,
}

impl<'a, F, I> SwarmOperationHandler<'a, F, I>
where
    F: FleetInterface,
    I: InteractionInterface,
{
    pub fn new(
        fleet: &'a F,
        interaction: &'a I,
        geometry: &'a GeometryLayout,
        settings: HandlerSettings,
    ) -> Self {
        SwarmOperationHandler {
            fleet,
            interaction,
            geometry,
            settings,
            plan: None,
        }
    }

    /// One pass of the cooperative loop: request intake and dispatch, then
    /// the proximity watchdog, then plan progress, then telemetry.
    pub fn tick(&mut self) {
        if let Some(request) = self.interaction.take_request() {
            if self.fleet.link_state() != LinkState::Running {
                warn!("dropping {request:?} request, the drone endpoint is not connected");
            } else {
                info!("handling swarm operation request: {request:?}");
                let outcome = match request {
                    SwarmOperation::Takeoff => self.handle_takeoff(),
                    SwarmOperation::Land => self.handle_land(),
                    SwarmOperation::FastStop => self.handle_fast_stop(),
                    SwarmOperation::Move => self.handle_move(),
                };
                if let Err(error) = outcome {
                    error!("{request:?} request failed: {error:#}");
                }
            }
        }

        self.run_proximity_watchdog();

        if let Some(plan) = &mut self.plan {
            plan.advance(self.fleet, &self.settings);
            if plan.state() == PlanState::Done {
                info!("plan finished");
                self.plan = None;
            }
        }

        self.interaction.publish_positions(self.fleet.positions());
        self.interaction.publish_drone_states(self.fleet.drone_states());
        self.interaction.publish_swarm_state(self.fleet.swarm_state());
    }

    fn handle_takeoff(&mut self) -> Result<()> {
        match self.fleet.swarm_state() {
            SwarmState::Idle | SwarmState::Landing => {}
            state => {
                warn!("takeoff request ignored in swarm state {state:?}");
                return Ok(());
            }
        }

        // Each drone climbs to the lattice node above its resting spot.
        let current = self.fleet.positions();
        let snapped = self.geometry.snap_map(&current)?;
        let takeoff_targets = self.geometry.translate_map(&snapped)?;
        info!("takeoff snap points: {}", format_targets(&takeoff_targets));
        self.fleet.set_targets(takeoff_targets);

        let operations = current
            .keys()
            .map(|drone| (*drone, DroneOperation::TakeOff))
            .collect();
        self.fleet.set_operations(operations);
        info!("takeoff issued for {} drones", current.len());
        Ok(())
    }

    fn handle_land(&mut self) -> Result<()> {
        match self.fleet.swarm_state() {
            SwarmState::Idle | SwarmState::TakingOff | SwarmState::Hovering => {}
            state => {
                warn!("land request ignored in swarm state {state:?}");
                return Ok(());
            }
        }

        let operations = self
            .fleet
            .drones()
            .into_iter()
            .map(|drone| (drone, DroneOperation::Land))
            .collect();
        self.fleet.set_operations(operations);
        info!("landing issued");
        Ok(())
    }

    fn handle_fast_stop(&mut self) -> Result<()> {
        if matches!(
            self.fleet.swarm_state(),
            SwarmState::Idle | SwarmState::Stopping
        ) {
            warn!("fast stop will probably be ignored in the current swarm state");
        }

        let operations = self
            .fleet
            .drones()
            .into_iter()
            .map(|drone| (drone, DroneOperation::FastStop))
            .collect();
        self.fleet.set_operations(operations);
        info!("fast stop issued");
        Ok(())
    }

    fn handle_move(&mut self) -> Result<()> {
        match self.fleet.swarm_state() {
            SwarmState::Hovering | SwarmState::Moving => {}
            state => {
                warn!("move request ignored in swarm state {state:?}");
                return Ok(());
            }
        }

        let targets = self.interaction.targets();
        let current = self.fleet.positions();
        if targets.keys().any(|drone| !current.contains_key(drone)) {
            warn!("move request names a drone the fleet does not report");
            return Ok(());
        }

        info!("requested targets: {}", format_targets(&targets));
        let snapped_targets = self.geometry.snap_map(&targets)?;
        let mut snapped_positions = self.geometry.snap_map(&current)?;

        if !self.needs_replan(&snapped_targets, &mut snapped_positions)? {
            info!("snapped targets match the active plan, keeping it");
            return Ok(());
        }

        let mut agents: BTreeMap<DroneId, (NodeId, NodeId)> = BTreeMap::new();
        for (drone, target) in &snapped_targets {
            agents.insert(*drone, (snapped_positions[drone].clone(), target.clone()));
        }
        let task = Task::new(self.geometry.graph().clone(), agents);

        let solver = CbsSolver::with_max_threads(lattice_heuristic, self.settings.max_threads);
        let solve_start = Instant::now();
        let plan = solver.solve(&task).context("CBS solve failed")?;
        info!("CBS answered after {:?}", solve_start.elapsed());

        if plan.is_empty() {
            warn!("no collision-free plan under the current discretization, dropping request");
            return Ok(());
        }

        let mut node_steps: Vec<BTreeMap<DroneId, NodeId>> = Vec::new();
        plan.simulate(|snapshot| node_steps.push(snapshot.clone()));

        let mut steps = Vec::with_capacity(node_steps.len());
        for snapshot in &node_steps {
            steps.push(self.geometry.translate_map(snapshot)?);
        }
        for (index, step) in steps.iter().enumerate() {
            debug!("plan step {index}: {}", format_targets(step));
        }

        if let Err(error) = self.dump_plan(&steps) {
            error!("could not dump plan: {error:#}");
        }
        self.plan = Some(PlanExecution::new(steps));
        Ok(())
    }

    /// Whether the new snapped targets require a fresh plan. When they do
    /// and the active plan is mid-flight, the snapped start positions are
    /// replaced by the plan's current step, since the drones are already on
    /// their way there.
    fn needs_replan(
        &self,
        snapped_targets: &BTreeMap<DroneId, NodeId>,
        snapped_positions: &mut BTreeMap<DroneId, NodeId>,
    ) -> Result<bool> {
        let Some(plan) = &self.plan else {
            return Ok(true);
        };
        let Some(final_step) = plan.steps().last() else {
            return Ok(true);
        };

        let final_nodes = self.geometry.snap_map(final_step)?;
        let mut changed = false;
        for (drone, target) in snapped_targets {
            if final_nodes.get(drone) != Some(target) {
                changed = true;
            }
        }
        if !changed {
            return Ok(false);
        }

        match plan.state() {
            PlanState::WaitForTarget | PlanState::WaitForHover => {
                if let Some(step) = plan.current_step() {
                    let start_nodes = self.geometry.snap_map(step)?;
                    info!(
                        "plan is mid-flight, assuming start at the active step: {start_nodes:?}"
                    );
                    *snapped_positions = start_nodes;
                }
            }
            // No step is actively flown, the reported positions stand.
            _ => {}
        }
        Ok(true)
    }

    fn run_proximity_watchdog(&mut self) {
        let positions = self.fleet.positions();
        for (drone_a, position_a) in &positions {
            for (drone_b, position_b) in &positions {
                if drone_a >= drone_b {
                    continue;
                }
                let distance = position_a.distance(position_b);
                if distance <= self.settings.proximity_alert {
                    error!(
                        "drones {drone_a} and {drone_b} are close to colliding \
                         (distance {distance:.3}), fast stopping the swarm"
                    );
                    if let Err(error) = self.handle_fast_stop() {
                        error!("watchdog fast stop failed: {error:#}");
                    }
                    return;
                }
            }
        }
    }

    fn dump_plan(&self, steps: &[BTreeMap<DroneId, Position>]) -> Result<()> {
        let Some(path) = &self.settings.plan_dump_path else {
            return Ok(());
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening plan dump file {path}"))?;
        writeln!(file, "{}", serde_json::to_string(steps)?)?;
        Ok(())
    }
}

/// Euclidean distance between lattice indices, the low-level heuristic the
/// solver runs with on geometry graphs.
fn lattice_heuristic(a: &NodeId, b: &NodeId) -> f64 {
    match (
        GeometryLayout::node_grid_index(a),
        GeometryLayout::node_grid_index(b),
    ) {
        (Ok((ax, ay, az)), Ok((bx, by, bz))) => Position::new(ax as f64, ay as f64, az as f64, 0.0)
            .distance(&Position::new(bx as f64, by as f64, bz as f64, 0.0)),
        _ => 0.0,
    }
}

fn format_targets(targets: &BTreeMap<DroneId, Position>) -> String {
    targets
        .iter()
        .map(|(drone, position)| format!("{drone}: {position}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
    Initialize,
    WaitForFirstHover,
    SendNextTargets,
    WaitForTarget,
    WaitForHover,
    Done,
}

/// Drives one materialized plan step by step: wait until the swarm hovers,
/// push the step's target map, wait for every drone to reach its target and
/// settle, advance. MOVE is only issued to drones whose target actually
/// changed against the previous step.
#[derive(Debug)]
pub struct PlanExecution {
    steps: Vec<BTreeMap<DroneId, Position>>,
    cursor: usize,
    previous: Option<usize>,
    state: PlanState,
    stamped_at: Instant,
}

impl PlanExecution {
    pub fn new(steps: Vec<BTreeMap<DroneId, Position>>) -> Self {
        PlanExecution {
            steps,
            cursor: 0,
            previous: None,
            state: PlanState::Initialize,
            stamped_at: Instant::now(),
        }
    }

    pub fn state(&self) -> PlanState {
        self.state
    }

    pub fn steps(&self) -> &[BTreeMap<DroneId, Position>] {
        &self.steps
    }

    pub fn current_step(&self) -> Option<&BTreeMap<DroneId, Position>> {
        self.steps.get(self.cursor)
    }

    fn transition(&mut self, next: PlanState) {
        debug!("plan state {:?} -> {next:?}", self.state);
        self.state = next;
    }

    pub fn advance<F: FleetInterface>(&mut self, fleet: &F, settings: &HandlerSettings) {
        match self.state {
            PlanState::Initialize => {
                info!("executing a plan of {} steps", self.steps.len());
                self.cursor = 0;
                self.previous = None;
                self.stamped_at = Instant::now();
                self.transition(PlanState::WaitForFirstHover);
            }
            PlanState::WaitForFirstHover => {
                if fleet.swarm_state() == SwarmState::Hovering
                    && self.stamped_at.elapsed() >= settings.hover_debounce
                {
                    info!("hovering detected, issuing the first step");
                    self.transition(PlanState::SendNextTargets);
                }
            }
            PlanState::SendNextTargets => {
                let Some(step) = self.steps.get(self.cursor).cloned() else {
                    self.transition(PlanState::Done);
                    return;
                };
                fleet.set_targets(step.clone());

                let operations = step
                    .iter()
                    .map(|(drone, target)| {
                        let moved = match self.previous {
                            Some(previous) => self.steps[previous].get(drone) != Some(target),
                            None => true,
                        };
                        let operation = if moved {
                            DroneOperation::Move
                        } else {
                            DroneOperation::None
                        };
                        (*drone, operation)
                    })
                    .collect();
                fleet.set_operations(operations);

                self.stamped_at = Instant::now();
                self.transition(PlanState::WaitForTarget);
            }
            PlanState::WaitForTarget => {
                let Some(step) = self.steps.get(self.cursor) else {
                    self.transition(PlanState::Done);
                    return;
                };
                let positions = fleet.positions();
                let arrived = step.iter().all(|(drone, target)| {
                    positions
                        .get(drone)
                        .map_or(false, |position| {
                            position.distance(target) <= settings.target_tolerance
                        })
                });
                if arrived {
                    info!("step targets reached, waiting for hover");
                    self.transition(PlanState::WaitForHover);
                }
            }
            PlanState::WaitForHover => {
                if fleet.swarm_state() == SwarmState::Hovering
                    && self.stamped_at.elapsed() >= settings.hover_debounce
                {
                    self.previous = Some(self.cursor);
                    self.cursor += 1;
                    if self.cursor >= self.steps.len() {
                        self.transition(PlanState::Done);
                    } else {
                        info!("hovering detected, issuing step {}", self.cursor);
                        self.transition(PlanState::SendNextTargets);
                    }
                }
            }
            PlanState::Done => {}
        }
    }
}
