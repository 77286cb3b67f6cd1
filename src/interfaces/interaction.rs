use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use super::InteractionInterface;
use crate::position::Position;
use crate::protocol::{
    DroneId, DroneOperation, DroneState, Message, ProtocolError, StateNotification,
    SwarmOperation, SwarmState,
};

#[derive(Debug, Default)]
struct InteractionShared {
    positions: BTreeMap<DroneId, Position>,
    targets: BTreeMap<DroneId, Position>,
    states: BTreeMap<DroneId, DroneState>,
    operations: BTreeMap<DroneId, DroneOperation>,
    swarm_state: SwarmState,
    requests: VecDeque<SwarmOperation>,
}

/// TCP server towards interaction clients.
///
/// Clients subscribe to cyclic state notifications and submit target maps
/// and swarm operation requests. Requests queue first-in first-out. Each
/// connection gets a receive thread; its first registration additionally
/// spawns a notifier thread that snapshots the shared state and transmits
/// it at the requested interval.
pub struct InteractionServer {
    shared: Arc<Mutex<InteractionShared>>,
    address: SocketAddr,
}

impl InteractionServer {
    pub fn bind(address: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(address)?;
        let address = listener.local_addr()?;
        info!("interaction endpoint listening on {address}");

        let shared = Arc::new(Mutex::new(InteractionShared::default()));
        let accept_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("interaction-accept".into())
            .spawn(move || accept_loop(listener, accept_shared))?;

        Ok(InteractionServer { shared, address })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }
}

impl InteractionInterface for InteractionServer {
    fn take_request(&self) -> Option<SwarmOperation> {
        self.shared.lock().unwrap().requests.pop_front()
    }

    fn targets(&self) -> BTreeMap<DroneId, Position> {
        self.shared.lock().unwrap().targets.clone()
    }

    fn publish_positions(&self, positions: BTreeMap<DroneId, Position>) {
        self.shared.lock().unwrap().positions = positions;
    }

    fn publish_drone_states(&self, states: BTreeMap<DroneId, DroneState>) {
        self.shared.lock().unwrap().states = states;
    }

    fn publish_operations(&self, operations: BTreeMap<DroneId, DroneOperation>) {
        self.shared.lock().unwrap().operations = operations;
    }

    fn publish_swarm_state(&self, state: SwarmState) {
        self.shared.lock().unwrap().swarm_state = state;
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Mutex<InteractionShared>>) {
    for connection in listener.incoming() {
        match connection {
            Ok(stream) => {
                let connection_shared = Arc::clone(&shared);
                if let Err(error) = thread::Builder::new()
                    .name("interaction-rx".into())
                    .spawn(move || connection_loop(stream, connection_shared))
                {
                    error!("could not spawn interaction connection thread: {error}");
                }
            }
            Err(error) => warn!("interaction accept failed: {error}"),
        }
    }
}

fn connection_loop(mut stream: TcpStream, shared: Arc<Mutex<InteractionShared>>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("interaction client {peer} connected");

    let mut notifier_running = false;
    let mut pending = Vec::new();
    let mut chunk = [0u8; 2048];

    loop {
        let read = match stream.read(&mut chunk) {
            Ok(0) => {
                info!("interaction client {peer} disconnected");
                return;
            }
            Ok(read) => read,
            Err(error) => {
                warn!("interaction client {peer} read failed: {error}");
                return;
            }
        };
        pending.extend_from_slice(&chunk[..read]);

        loop {
            match Message::parse(&pending) {
                Ok((message, consumed)) => {
                    pending.drain(..consumed);
                    handle_message(message, &stream, &shared, &mut notifier_running);
                }
                Err(ProtocolError::Truncated) => break,
                Err(error) => {
                    error!("malformed frame from interaction client {peer}: {error}");
                    return;
                }
            }
        }
    }
}

fn handle_message(
    message: Message,
    stream: &TcpStream,
    shared: &Arc<Mutex<InteractionShared>>,
    notifier_running: &mut bool,
) {
    match message {
        Message::RegisterNotificationRequest { interval_ms } => {
            if *notifier_running {
                // One notifier per connection; repeated registrations are
                // ignored on purpose.
                return;
            }
            match stream.try_clone() {
                Ok(notify_stream) => {
                    let notify_shared = Arc::clone(shared);
                    let spawned = thread::Builder::new()
                        .name("interaction-notify".into())
                        .spawn(move || {
                            notification_loop(notify_stream, notify_shared, interval_ms)
                        });
                    match spawned {
                        Ok(_) => *notifier_running = true,
                        Err(error) => error!("could not spawn notifier: {error}"),
                    }
                }
                Err(error) => error!("could not clone interaction stream: {error}"),
            }
        }
        Message::SetTargetsRequest { targets } => {
            info!("received targets for {} drones", targets.len());
            shared.lock().unwrap().targets = targets;
        }
        Message::SwarmOperationRequest { operation } => {
            info!("queued swarm operation request: {operation:?}");
            shared.lock().unwrap().requests.push_back(operation);
        }
        Message::RegisterNotificationResponse
        | Message::SetTargetsResponse
        | Message::SwarmOperationResponse
        | Message::DroneOperationsResponse => {}
        other => {
            warn!("ignoring unexpected message from interaction client: {other:?}");
        }
    }
}

fn notification_loop(
    mut stream: TcpStream,
    shared: Arc<Mutex<InteractionShared>>,
    interval_ms: u16,
) {
    loop {
        let notification = {
            let guard = shared.lock().unwrap();
            StateNotification {
                positions: guard.positions.clone(),
                targets: guard.targets.clone(),
                drone_states: guard.states.clone(),
                drone_operations: guard.operations.clone(),
                swarm_state: guard.swarm_state,
            }
        };

        let frame = match Message::StateNotification(notification).serialize() {
            Ok(frame) => frame,
            Err(error) => {
                error!("cannot serialize state notification: {error}");
                return;
            }
        };
        if stream.write_all(&frame).is_err() {
            return;
        }
        thread::sleep(Duration::from_millis(interval_ms as u64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !predicate() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn read_message(stream: &mut TcpStream, buffer: &mut Vec<u8>) -> Message {
        let mut chunk = [0u8; 1024];
        loop {
            match Message::parse(buffer) {
                Ok((message, consumed)) => {
                    buffer.drain(..consumed);
                    return message;
                }
                Err(ProtocolError::Truncated) => {
                    let read = stream.read(&mut chunk).expect("client read");
                    assert!(read > 0, "server closed early");
                    buffer.extend_from_slice(&chunk[..read]);
                }
                Err(error) => panic!("unexpected frame: {error}"),
            }
        }
    }

    #[test]
    fn test_requests_queue_fifo() {
        let server = InteractionServer::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(server.local_addr()).unwrap();

        for operation in [SwarmOperation::Takeoff, SwarmOperation::Move] {
            client
                .write_all(&Message::SwarmOperationRequest { operation }.serialize().unwrap())
                .unwrap();
        }

        wait_until("two queued requests", || {
            server.shared.lock().unwrap().requests.len() == 2
        });
        assert_eq!(server.take_request(), Some(SwarmOperation::Takeoff));
        assert_eq!(server.take_request(), Some(SwarmOperation::Move));
        assert_eq!(server.take_request(), None);
    }

    #[test]
    fn test_set_targets_replaces_target_map() {
        let server = InteractionServer::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(server.local_addr()).unwrap();

        let targets = BTreeMap::from([(3, Position::new(1.0, 2.0, 1.5, 0.0))]);
        client
            .write_all(
                &Message::SetTargetsRequest {
                    targets: targets.clone(),
                }
                .serialize()
                .unwrap(),
            )
            .unwrap();

        wait_until("targets arrive", || !server.targets().is_empty());
        assert_eq!(server.targets(), targets);
    }

    #[test]
    fn test_notifier_reports_published_state() {
        let server = InteractionServer::bind("127.0.0.1:0").unwrap();
        server.publish_positions(BTreeMap::from([(1, Position::new(0.5, 0.5, 1.0, 0.0))]));
        server.publish_swarm_state(SwarmState::Hovering);

        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client
            .write_all(
                &Message::RegisterNotificationRequest { interval_ms: 10 }
                    .serialize()
                    .unwrap(),
            )
            .unwrap();

        let mut buffer = Vec::new();
        let notification = match read_message(&mut client, &mut buffer) {
            Message::StateNotification(notification) => notification,
            other => panic!("expected a state notification, got {other:?}"),
        };
        assert_eq!(notification.swarm_state, SwarmState::Hovering);
        assert!(notification.positions[&1].distance(&Position::new(0.5, 0.5, 1.0, 0.0)) < 1e-4);
    }
}
