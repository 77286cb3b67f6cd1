use bytes::BufMut;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::position::Position;

/// Drones are addressed by a 16 bit identifier on the wire and everywhere else.
pub type DroneId = u16;

/// Positions travel as `round(component * 10000)` in a signed 32 bit integer.
const POSITION_SCALE: f64 = 10_000.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown message id {0}")]
    UnknownId(u8),
    #[error("frame truncated")]
    Truncated,
    #[error("invalid {kind} value {value}")]
    InvalidEnum { kind: &'static str, value: u8 },
    #[error("section of {0} entries does not fit a one byte count")]
    TooManyEntries(usize),
}

mod frame_id {
    pub const REGISTER_NOTIFICATION_REQUEST: u8 = 1;
    pub const REGISTER_NOTIFICATION_RESPONSE: u8 = 2;
    pub const STATE_NOTIFICATION: u8 = 3;
    pub const SET_TARGETS_REQUEST: u8 = 4;
    pub const SET_TARGETS_RESPONSE: u8 = 5;
    pub const SWARM_OPERATION_REQUEST: u8 = 6;
    pub const SWARM_OPERATION_RESPONSE: u8 = 7;
    pub const DRONE_OPERATIONS_REQUEST: u8 = 8;
    pub const DRONE_OPERATIONS_RESPONSE: u8 = 9;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DroneOperation {
    None = 0,
    TakeOff = 1,
    Land = 2,
    FastStop = 3,
    Move = 4,
}

impl TryFrom<u8> for DroneOperation {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(DroneOperation::None),
            1 => Ok(DroneOperation::TakeOff),
            2 => Ok(DroneOperation::Land),
            3 => Ok(DroneOperation::FastStop),
            4 => Ok(DroneOperation::Move),
            value => Err(ProtocolError::InvalidEnum {
                kind: "drone operation",
                value,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SwarmOperation {
    Takeoff = 0,
    Land = 1,
    Move = 2,
    FastStop = 3,
}

impl TryFrom<u8> for SwarmOperation {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(SwarmOperation::Takeoff),
            1 => Ok(SwarmOperation::Land),
            2 => Ok(SwarmOperation::Move),
            3 => Ok(SwarmOperation::FastStop),
            value => Err(ProtocolError::InvalidEnum {
                kind: "swarm operation",
                value,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DroneState {
    Idle = 0,
    TakingOff = 1,
    Hovering = 2,
    Moving = 3,
    Landing = 4,
    Stopping = 5,
}

impl TryFrom<u8> for DroneState {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(DroneState::Idle),
            1 => Ok(DroneState::TakingOff),
            2 => Ok(DroneState::Hovering),
            3 => Ok(DroneState::Moving),
            4 => Ok(DroneState::Landing),
            5 => Ok(DroneState::Stopping),
            value => Err(ProtocolError::InvalidEnum {
                kind: "drone state",
                value,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum SwarmState {
    #[default]
    Idle = 0,
    TakingOff = 1,
    Hovering = 2,
    Moving = 3,
    Landing = 4,
    Stopping = 5,
}

impl TryFrom<u8> for SwarmState {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(SwarmState::Idle),
            1 => Ok(SwarmState::TakingOff),
            2 => Ok(SwarmState::Hovering),
            3 => Ok(SwarmState::Moving),
            4 => Ok(SwarmState::Landing),
            5 => Ok(SwarmState::Stopping),
            value => Err(ProtocolError::InvalidEnum {
                kind: "swarm state",
                value,
            }),
        }
    }
}

/// Cyclic full-state report: positions, targets, per-drone states and
/// operations, plus the aggregate swarm state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateNotification {
    pub positions: BTreeMap<DroneId, Position>,
    pub targets: BTreeMap<DroneId, Position>,
    pub drone_states: BTreeMap<DroneId, DroneState>,
    pub drone_operations: BTreeMap<DroneId, DroneOperation>,
    pub swarm_state: SwarmState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    RegisterNotificationRequest { interval_ms: u16 },
    RegisterNotificationResponse,
    StateNotification(StateNotification),
    SetTargetsRequest { targets: BTreeMap<DroneId, Position> },
    SetTargetsResponse,
    SwarmOperationRequest { operation: SwarmOperation },
    SwarmOperationResponse,
    DroneOperationsRequest { operations: BTreeMap<DroneId, DroneOperation> },
    DroneOperationsResponse,
}

impl Message {
    pub fn id(&self) -> u8 {
        match self {
            Message::RegisterNotificationRequest { .. } => frame_id::REGISTER_NOTIFICATION_REQUEST,
            Message::RegisterNotificationResponse => frame_id::REGISTER_NOTIFICATION_RESPONSE,
            Message::StateNotification(_) => frame_id::STATE_NOTIFICATION,
            Message::SetTargetsRequest { .. } => frame_id::SET_TARGETS_REQUEST,
            Message::SetTargetsResponse => frame_id::SET_TARGETS_RESPONSE,
            Message::SwarmOperationRequest { .. } => frame_id::SWARM_OPERATION_REQUEST,
            Message::SwarmOperationResponse => frame_id::SWARM_OPERATION_RESPONSE,
            Message::DroneOperationsRequest { .. } => frame_id::DRONE_OPERATIONS_REQUEST,
            Message::DroneOperationsResponse => frame_id::DRONE_OPERATIONS_RESPONSE,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut frame = Vec::new();
        frame.put_u8(self.id());

        match self {
            Message::RegisterNotificationRequest { interval_ms } => {
                frame.put_u16(*interval_ms);
            }
            Message::StateNotification(notification) => {
                put_position_section(&mut frame, &notification.positions)?;
                put_position_section(&mut frame, &notification.targets)?;
                put_section_count(&mut frame, notification.drone_states.len())?;
                for (drone, state) in &notification.drone_states {
                    frame.put_u16(*drone);
                    frame.put_u8(*state as u8);
                }
                put_section_count(&mut frame, notification.drone_operations.len())?;
                for (drone, operation) in &notification.drone_operations {
                    frame.put_u16(*drone);
                    frame.put_u8(*operation as u8);
                }
                frame.put_u8(notification.swarm_state as u8);
            }
            Message::SetTargetsRequest { targets } => {
                put_position_section(&mut frame, targets)?;
            }
            Message::SwarmOperationRequest { operation } => {
                frame.put_u8(*operation as u8);
            }
            Message::DroneOperationsRequest { operations } => {
                put_section_count(&mut frame, operations.len())?;
                for (drone, operation) in operations {
                    frame.put_u16(*drone);
                    frame.put_u8(*operation as u8);
                }
            }
            Message::RegisterNotificationResponse
            | Message::SetTargetsResponse
            | Message::SwarmOperationResponse
            | Message::DroneOperationsResponse => {}
        }

        Ok(frame)
    }

    /// Decodes one message from the front of `data`, returning it together
    /// with the number of bytes consumed. `Truncated` means the frame is not
    /// complete yet and the caller should read more bytes.
    pub fn parse(data: &[u8]) -> Result<(Message, usize), ProtocolError> {
        let mut cursor = Cursor::new(data);
        let id = cursor.take_u8()?;

        let message = match id {
            frame_id::REGISTER_NOTIFICATION_REQUEST => Message::RegisterNotificationRequest {
                interval_ms: cursor.take_u16()?,
            },
            frame_id::REGISTER_NOTIFICATION_RESPONSE => Message::RegisterNotificationResponse,
            frame_id::STATE_NOTIFICATION => {
                let positions = take_position_section(&mut cursor)?;
                let targets = take_position_section(&mut cursor)?;

                let mut drone_states = BTreeMap::new();
                for _ in 0..cursor.take_u8()? {
                    let drone = cursor.take_u16()?;
                    drone_states.insert(drone, DroneState::try_from(cursor.take_u8()?)?);
                }

                let mut drone_operations = BTreeMap::new();
                for _ in 0..cursor.take_u8()? {
                    let drone = cursor.take_u16()?;
                    drone_operations.insert(drone, DroneOperation::try_from(cursor.take_u8()?)?);
                }

                let swarm_state = SwarmState::try_from(cursor.take_u8()?)?;
                Message::StateNotification(StateNotification {
                    positions,
                    targets,
                    drone_states,
                    drone_operations,
                    swarm_state,
                })
            }
            frame_id::SET_TARGETS_REQUEST => Message::SetTargetsRequest {
                targets: take_position_section(&mut cursor)?,
            },
            frame_id::SET_TARGETS_RESPONSE => Message::SetTargetsResponse,
            frame_id::SWARM_OPERATION_REQUEST => Message::SwarmOperationRequest {
                operation: SwarmOperation::try_from(cursor.take_u8()?)?,
            },
            frame_id::SWARM_OPERATION_RESPONSE => Message::SwarmOperationResponse,
            frame_id::DRONE_OPERATIONS_REQUEST => {
                let mut operations = BTreeMap::new();
                for _ in 0..cursor.take_u8()? {
                    let drone = cursor.take_u16()?;
                    operations.insert(drone, DroneOperation::try_from(cursor.take_u8()?)?);
                }
                Message::DroneOperationsRequest { operations }
            }
            frame_id::DRONE_OPERATIONS_RESPONSE => Message::DroneOperationsResponse,
            id => return Err(ProtocolError::UnknownId(id)),
        };

        Ok((message, cursor.consumed()))
    }
}

fn put_section_count(frame: &mut Vec<u8>, count: usize) -> Result<(), ProtocolError> {
    if count > u8::MAX as usize {
        return Err(ProtocolError::TooManyEntries(count));
    }
    frame.put_u8(count as u8);
    Ok(())
}

fn put_position_section(
    frame: &mut Vec<u8>,
    positions: &BTreeMap<DroneId, Position>,
) -> Result<(), ProtocolError> {
    put_section_count(frame, positions.len())?;
    for (drone, position) in positions {
        frame.put_u16(*drone);
        frame.put_i32((position.x * POSITION_SCALE).round() as i32);
        frame.put_i32((position.y * POSITION_SCALE).round() as i32);
        frame.put_i32((position.z * POSITION_SCALE).round() as i32);
        frame.put_i32((position.yaw * POSITION_SCALE).round() as i32);
    }
    Ok(())
}

fn take_position_section(
    cursor: &mut Cursor<'_>,
) -> Result<BTreeMap<DroneId, Position>, ProtocolError> {
    let mut positions = BTreeMap::new();
    for _ in 0..cursor.take_u8()? {
        let drone = cursor.take_u16()?;
        let x = cursor.take_i32()? as f64 / POSITION_SCALE;
        let y = cursor.take_i32()? as f64 / POSITION_SCALE;
        let z = cursor.take_i32()? as f64 / POSITION_SCALE;
        let yaw = cursor.take_i32()? as f64 / POSITION_SCALE;
        positions.insert(drone, Position::new(x, y, z, yaw));
    }
    Ok(positions)
}

/// Bounds-checked big-endian reader over a byte slice.
struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, offset: 0 }
    }

    fn consumed(&self) -> usize {
        self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.data.len() - self.offset < len {
            return Err(ProtocolError::Truncated);
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, ProtocolError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn take_i32(&mut self) -> Result<i32, ProtocolError> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) -> Message {
        let frame = message.serialize().unwrap();
        let (parsed, consumed) = Message::parse(&frame).unwrap();
        assert_eq!(consumed, frame.len());
        parsed
    }

    #[test]
    fn test_roundtrip_empty_payload_messages() {
        for message in [
            Message::RegisterNotificationResponse,
            Message::SetTargetsResponse,
            Message::SwarmOperationResponse,
            Message::DroneOperationsResponse,
        ] {
            assert_eq!(roundtrip(message.clone()), message);
        }
    }

    #[test]
    fn test_roundtrip_register_notification_request() {
        let message = Message::RegisterNotificationRequest { interval_ms: 15 };
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_roundtrip_swarm_operation_request() {
        for operation in [
            SwarmOperation::Takeoff,
            SwarmOperation::Land,
            SwarmOperation::Move,
            SwarmOperation::FastStop,
        ] {
            let message = Message::SwarmOperationRequest { operation };
            assert_eq!(roundtrip(message.clone()), message);
        }
    }

    #[test]
    fn test_roundtrip_set_targets_request() {
        let targets = BTreeMap::from([
            (1, Position::new(0.5, -1.25, 1.0, 0.0)),
            (7, Position::new(-3.75, 2.0, 1.6, 1.5)),
        ]);
        let message = Message::SetTargetsRequest { targets: targets.clone() };
        match roundtrip(message) {
            Message::SetTargetsRequest { targets: parsed } => assert_eq!(parsed, targets),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_roundtrip_drone_operations_request() {
        let operations = BTreeMap::from([
            (0, DroneOperation::TakeOff),
            (1, DroneOperation::Move),
            (9, DroneOperation::FastStop),
        ]);
        let message = Message::DroneOperationsRequest {
            operations: operations.clone(),
        };
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_roundtrip_state_notification() {
        let mut notification = StateNotification::default();
        for drone in 0..5u16 {
            let offset = drone as f64;
            notification.positions.insert(
                drone,
                Position::new(0.1 + offset, -0.2 - offset, 1.0, 0.5),
            );
            notification
                .targets
                .insert(drone, Position::new(offset * 0.6, offset * 0.6, 1.3, 0.0));
            notification
                .drone_operations
                .insert(drone, DroneOperation::Move);
        }
        notification.swarm_state = SwarmState::Hovering;

        let parsed = match roundtrip(Message::StateNotification(notification.clone())) {
            Message::StateNotification(parsed) => parsed,
            other => panic!("unexpected message {other:?}"),
        };

        assert_eq!(parsed.positions.len(), 5);
        assert_eq!(parsed.targets.len(), 5);
        assert!(parsed.drone_states.is_empty());
        assert_eq!(parsed.drone_operations, notification.drone_operations);
        assert_eq!(parsed.swarm_state, SwarmState::Hovering);

        for (drone, position) in &notification.positions {
            let parsed_position = &parsed.positions[drone];
            assert!((parsed_position.x - position.x).abs() < 1e-4);
            assert!((parsed_position.y - position.y).abs() < 1e-4);
            assert!((parsed_position.z - position.z).abs() < 1e-4);
            assert!((parsed_position.yaw - position.yaw).abs() < 1e-4);
        }
        for (drone, target) in &notification.targets {
            assert!(parsed.targets[drone].distance(target) < 1e-4);
        }
    }

    #[test]
    fn test_quantization_is_exact_at_scale() {
        // Values on the 1e-4 lattice survive the integer scaling bit for bit.
        let targets = BTreeMap::from([(3, Position::new(1.2345, -0.0001, 0.0, 2.5))]);
        let message = Message::SetTargetsRequest { targets: targets.clone() };
        match roundtrip(message) {
            Message::SetTargetsRequest { targets: parsed } => assert_eq!(parsed, targets),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_parse_unknown_id() {
        assert_eq!(Message::parse(&[0xAA]), Err(ProtocolError::UnknownId(0xAA)));
        assert_eq!(Message::parse(&[0]), Err(ProtocolError::UnknownId(0)));
    }

    #[test]
    fn test_parse_truncated_frame() {
        let frame = Message::SetTargetsRequest {
            targets: BTreeMap::from([(1, Position::new(1.0, 2.0, 3.0, 0.0))]),
        }
        .serialize()
        .unwrap();

        for len in 0..frame.len() {
            assert_eq!(
                Message::parse(&frame[..len]),
                Err(ProtocolError::Truncated),
                "prefix of {len} bytes should be truncated"
            );
        }
    }

    #[test]
    fn test_parse_back_to_back_frames() {
        let mut stream = Message::SwarmOperationRequest {
            operation: SwarmOperation::Move,
        }
        .serialize()
        .unwrap();
        stream.extend(Message::RegisterNotificationResponse.serialize().unwrap());

        let (first, used) = Message::parse(&stream).unwrap();
        assert_eq!(
            first,
            Message::SwarmOperationRequest {
                operation: SwarmOperation::Move
            }
        );
        let (second, _) = Message::parse(&stream[used..]).unwrap();
        assert_eq!(second, Message::RegisterNotificationResponse);
    }

    #[test]
    fn test_invalid_enum_value() {
        let frame = vec![frame_id::SWARM_OPERATION_REQUEST, 9];
        assert_eq!(
            Message::parse(&frame),
            Err(ProtocolError::InvalidEnum {
                kind: "swarm operation",
                value: 9
            })
        );
    }
}
