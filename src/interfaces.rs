pub mod drone;
pub mod interaction;

pub use drone::DroneFleetClient;
pub use interaction::InteractionServer;

use std::collections::{BTreeMap, BTreeSet};

use crate::position::Position;
use crate::protocol::{DroneId, DroneOperation, DroneState, SwarmOperation, SwarmState};

/// Connection state of an endpoint. A disconnected endpoint stays
/// disconnected; the handler refuses state-dependent operations until a new
/// connection is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Connecting,
    Running,
    Disconnected,
}

/// The drone-controller endpoint as the operation handler sees it.
pub trait FleetInterface {
    fn link_state(&self) -> LinkState;
    fn drones(&self) -> BTreeSet<DroneId>;
    fn positions(&self) -> BTreeMap<DroneId, Position>;
    fn drone_states(&self) -> BTreeMap<DroneId, DroneState>;
    fn swarm_state(&self) -> SwarmState;
    /// Queues a target update; delivered before any queued operation change.
    fn set_targets(&self, targets: BTreeMap<DroneId, Position>);
    fn set_operations(&self, operations: BTreeMap<DroneId, DroneOperation>);
}

/// The downstream interaction endpoint as the operation handler sees it.
pub trait InteractionInterface {
    /// Next pending swarm operation request, oldest first.
    fn take_request(&self) -> Option<SwarmOperation>;
    fn targets(&self) -> BTreeMap<DroneId, Position>;
    fn publish_positions(&self, positions: BTreeMap<DroneId, Position>);
    fn publish_drone_states(&self, states: BTreeMap<DroneId, DroneState>);
    fn publish_operations(&self, operations: BTreeMap<DroneId, DroneOperation>);
    fn publish_swarm_state(&self, state: SwarmState);
}
