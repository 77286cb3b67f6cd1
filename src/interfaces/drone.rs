use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{error, info, warn};

use super::{FleetInterface, LinkState};
use crate::position::Position;
use crate::protocol::{
    DroneId, DroneOperation, DroneState, Message, ProtocolError, StateNotification, SwarmState,
};

#[derive(Debug, Default)]
struct FleetShared {
    link: LinkState,
    positions: BTreeMap<DroneId, Position>,
    states: BTreeMap<DroneId, DroneState>,
    swarm_state: SwarmState,
    pending_targets: Option<BTreeMap<DroneId, Position>>,
    pending_operations: Option<BTreeMap<DroneId, DroneOperation>>,
}

/// TCP client towards the drone controller.
///
/// On connect it registers for cyclic state notifications; a background
/// thread decodes them into the shared snapshot. Queued target and
/// operation updates are flushed right after each notification, targets
/// strictly before operations. Read failures and malformed frames tear the
/// link down.
pub struct DroneFleetClient {
    shared: Arc<Mutex<FleetShared>>,
}

impl DroneFleetClient {
    pub fn connect(address: &str, notify_interval_ms: u16) -> io::Result<Self> {
        let mut stream = TcpStream::connect(address)?;
        info!("connected to drone endpoint at {address}");

        let register = Message::RegisterNotificationRequest {
            interval_ms: notify_interval_ms,
        }
        .serialize()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        stream.write_all(&register)?;

        let shared = Arc::new(Mutex::new(FleetShared::default()));
        let thread_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("drone-endpoint-rx".into())
            .spawn(move || receive_loop(stream, thread_shared))?;

        Ok(DroneFleetClient { shared })
    }
}

impl FleetInterface for DroneFleetClient {
    fn link_state(&self) -> LinkState {
        self.shared.lock().unwrap().link
    }

    fn drones(&self) -> BTreeSet<DroneId> {
        self.shared.lock().unwrap().positions.keys().copied().collect()
    }

    fn positions(&self) -> BTreeMap<DroneId, Position> {
        self.shared.lock().unwrap().positions.clone()
    }

    fn drone_states(&self) -> BTreeMap<DroneId, DroneState> {
        self.shared.lock().unwrap().states.clone()
    }

    fn swarm_state(&self) -> SwarmState {
        self.shared.lock().unwrap().swarm_state
    }

    fn set_targets(&self, targets: BTreeMap<DroneId, Position>) {
        self.shared.lock().unwrap().pending_targets = Some(targets);
    }

    fn set_operations(&self, operations: BTreeMap<DroneId, DroneOperation>) {
        self.shared.lock().unwrap().pending_operations = Some(operations);
    }
}

fn receive_loop(mut stream: TcpStream, shared: Arc<Mutex<FleetShared>>) {
    let mut pending = Vec::new();
    let mut chunk = [0u8; 2048];

    loop {
        let read = match stream.read(&mut chunk) {
            Ok(0) => {
                warn!("drone endpoint closed the connection");
                disconnect(&shared);
                return;
            }
            Ok(read) => read,
            Err(error) => {
                warn!("drone endpoint read failed: {error}");
                disconnect(&shared);
                return;
            }
        };
        pending.extend_from_slice(&chunk[..read]);

        loop {
            match Message::parse(&pending) {
                Ok((message, consumed)) => {
                    pending.drain(..consumed);
                    if let Err(error) = handle_message(message, &mut stream, &shared) {
                        warn!("drone endpoint write failed: {error}");
                        disconnect(&shared);
                        return;
                    }
                }
                Err(ProtocolError::Truncated) => break,
                Err(error) => {
                    error!("malformed frame from drone endpoint: {error}");
                    disconnect(&shared);
                    return;
                }
            }
        }
    }
}

fn handle_message(
    message: Message,
    stream: &mut TcpStream,
    shared: &Arc<Mutex<FleetShared>>,
) -> io::Result<()> {
    match message {
        Message::StateNotification(notification) => {
            apply_notification(notification, stream, shared)
        }
        // Plain acknowledgements carry no state.
        Message::RegisterNotificationResponse
        | Message::SetTargetsResponse
        | Message::DroneOperationsResponse
        | Message::SwarmOperationResponse => Ok(()),
        other => {
            warn!("ignoring unexpected message from drone endpoint: {other:?}");
            Ok(())
        }
    }
}

fn apply_notification(
    notification: StateNotification,
    stream: &mut TcpStream,
    shared: &Arc<Mutex<FleetShared>>,
) -> io::Result<()> {
    let mut guard = shared.lock().unwrap();
    guard.link = LinkState::Running;
    guard.positions = notification.positions;
    guard.states = notification.drone_states;
    guard.swarm_state = notification.swarm_state;

    // Targets go out before operation changes within the same exchange.
    if let Some(targets) = guard.pending_targets.take() {
        send(stream, Message::SetTargetsRequest { targets })?;
    }
    if let Some(operations) = guard.pending_operations.take() {
        send(stream, Message::DroneOperationsRequest { operations })?;
    }
    Ok(())
}

fn send(stream: &mut TcpStream, message: Message) -> io::Result<()> {
    let frame = message
        .serialize()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    stream.write_all(&frame)
}

fn disconnect(shared: &Arc<Mutex<FleetShared>>) {
    shared.lock().unwrap().link = LinkState::Disconnected;
}
