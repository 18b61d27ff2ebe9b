use crate::error::{ErrorKind, FlightError};
use crate::events::ObserverEvent;
use crate::patrol::PatrolKind;
use crate::transport::{MoveDirection, RotateDirection};
use arrayvec::ArrayString;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const MAX_COMMAND_SIZE: usize = 512;
pub const MAX_RESPONSE_SIZE: usize = 32 * 1024;
pub const MAX_EVENT_SIZE: usize = 32 * 1024;

pub type CommandBuffer = ArrayString<MAX_COMMAND_SIZE>;
pub type ResponseBuffer = ArrayString<MAX_RESPONSE_SIZE>;
pub type EventBuffer = ArrayString<MAX_EVENT_SIZE>;

const MAX_TRACKED_COMMANDS: usize = 16;
const MAX_MOVE_DISTANCE_CM: u32 = 500;
const MAX_ROTATION_DEG: u32 = 360;
const MAX_HISTORY_QUERY: usize = 40;

/// Wall-clock milliseconds since the Unix epoch.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: u32,
    #[serde(default)]
    pub timestamp: u64,
    pub command_type: CommandType,
}

/// Commands accepted from the observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandType {
    Connect,
    Takeoff,
    Land,
    Emergency,
    Move { direction: MoveDirection, distance: u32 },
    Rotate { direction: RotateDirection, degrees: u32 },
    StartPatrol { patrol_type: PatrolKind },
    StopPatrol,
    GetStatus,
    GetPatrolHistory {
        #[serde(default)]
        limit: Option<usize>,
    },
    SetPatrolParameters { height: f32, side_length: f32 },
    ResetPatrol,
}

impl CommandType {
    pub fn name(&self) -> &'static str {
        match self {
            CommandType::Connect => "connect",
            CommandType::Takeoff => "takeoff",
            CommandType::Land => "land",
            CommandType::Emergency => "emergency",
            CommandType::Move { .. } => "move",
            CommandType::Rotate { .. } => "rotate",
            CommandType::StartPatrol { .. } => "start_patrol",
            CommandType::StopPatrol => "stop_patrol",
            CommandType::GetStatus => "get_status",
            CommandType::GetPatrolHistory { .. } => "get_patrol_history",
            CommandType::SetPatrolParameters { .. } => "set_patrol_parameters",
            CommandType::ResetPatrol => "reset_patrol",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    Error,
    // Rejected before execution: malformed, invalid or duplicate
    NegativeAck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: u32,
    pub timestamp: u64,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CommandResponse {
    pub fn success(id: u32, message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            id,
            timestamp: current_timestamp_ms(),
            status: ResponseStatus::Success,
            error_kind: None,
            message: Some(message.into()),
            data,
        }
    }

    pub fn failure(id: u32, error: &FlightError) -> Self {
        Self {
            id,
            timestamp: current_timestamp_ms(),
            status: ResponseStatus::Error,
            error_kind: Some(error.kind()),
            message: Some(error.reason().to_string()),
            data: None,
        }
    }

    pub fn nack(id: u32, error: &ProtocolError) -> Self {
        Self {
            id,
            timestamp: current_timestamp_ms(),
            status: ResponseStatus::NegativeAck,
            error_kind: None,
            message: Some(error.to_string()),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("message exceeds buffer size")]
    MessageTooLarge,

    #[error("serialization failed")]
    SerializationError,

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("command {0} is already in progress")]
    DuplicateCommand(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandTracker {
    pub command_id: u32,
    pub command: String,
    pub timestamp: u64,
    pub timeout_ms: u64,
}

impl CommandTracker {
    pub fn is_expired(&self, current_time: u64) -> bool {
        current_time > self.timestamp + self.timeout_ms
    }
}

/// Bounded JSON framing for the observer link plus in-flight command tracking.
#[derive(Debug)]
pub struct ProtocolHandler {
    command_counter: u32,
    command_buffer: CommandBuffer,
    response_buffer: ResponseBuffer,
    event_buffer: EventBuffer,
    tracked_commands: Vec<CommandTracker, MAX_TRACKED_COMMANDS>,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self {
            command_counter: 0,
            command_buffer: ArrayString::new(),
            response_buffer: ArrayString::new(),
            event_buffer: ArrayString::new(),
            tracked_commands: Vec::new(),
        }
    }

    pub fn parse_command(&mut self, json_str: &str) -> Result<Command, ProtocolError> {
        self.command_buffer.clear();
        let json_str = json_str.trim();
        self.command_buffer
            .try_push_str(json_str)
            .map_err(|_| ProtocolError::MessageTooLarge)?;

        serde_json::from_str::<Command>(&self.command_buffer).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }

    pub fn validate_command(&self, command: &Command) -> Result<(), ProtocolError> {
        if command.id == 0 {
            return Err(ProtocolError::InvalidCommand("command id must be non-zero".into()));
        }

        match &command.command_type {
            CommandType::Move { distance, .. } => {
                if *distance == 0 || *distance > MAX_MOVE_DISTANCE_CM {
                    return Err(ProtocolError::InvalidParameter(format!(
                        "distance must be 1-{}cm",
                        MAX_MOVE_DISTANCE_CM
                    )));
                }
            }
            CommandType::Rotate { degrees, .. } => {
                if *degrees == 0 || *degrees > MAX_ROTATION_DEG {
                    return Err(ProtocolError::InvalidParameter(format!(
                        "rotation must be 1-{} degrees",
                        MAX_ROTATION_DEG
                    )));
                }
            }
            CommandType::GetPatrolHistory { limit: Some(limit) } => {
                if *limit == 0 || *limit > MAX_HISTORY_QUERY {
                    return Err(ProtocolError::InvalidParameter(format!(
                        "history limit must be 1-{}",
                        MAX_HISTORY_QUERY
                    )));
                }
            }
            CommandType::SetPatrolParameters { height, side_length } => {
                if !height.is_finite() || !side_length.is_finite() {
                    return Err(ProtocolError::InvalidParameter("patrol parameters must be numbers".into()));
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Start tracking a command. Fails if the same id is still in flight.
    pub fn track_command(&mut self, command: &Command, current_time: u64, timeout_ms: u64) -> Result<(), ProtocolError> {
        self.cleanup_expired_commands(current_time);

        if self.tracked_commands.iter().any(|t| t.command_id == command.id) {
            return Err(ProtocolError::DuplicateCommand(command.id));
        }

        let tracker = CommandTracker {
            command_id: command.id,
            command: command.command_type.name().to_string(),
            timestamp: current_time,
            timeout_ms,
        };
        if let Err(tracker) = self.tracked_commands.push(tracker) {
            // Evict the oldest when full
            self.tracked_commands.remove(0);
            let _ = self.tracked_commands.push(tracker);
        }
        Ok(())
    }

    pub fn complete_command(&mut self, command_id: u32) {
        self.tracked_commands.retain(|t| t.command_id != command_id);
    }

    pub fn cleanup_expired_commands(&mut self, current_time: u64) {
        self.tracked_commands.retain(|tracker| !tracker.is_expired(current_time));
    }

    pub fn get_tracked_commands(&self) -> &[CommandTracker] {
        &self.tracked_commands
    }

    pub fn serialize_response(&mut self, response: &CommandResponse) -> Result<&str, ProtocolError> {
        self.response_buffer.clear();
        let json_str = serde_json::to_string(response).map_err(|_| ProtocolError::SerializationError)?;
        self.response_buffer
            .try_push_str(&json_str)
            .map_err(|_| ProtocolError::MessageTooLarge)?;
        Ok(&self.response_buffer)
    }

    pub fn serialize_event(&mut self, event: &ObserverEvent) -> Result<&str, ProtocolError> {
        self.event_buffer.clear();
        let json_str = serde_json::to_string(event).map_err(|_| ProtocolError::SerializationError)?;
        self.event_buffer
            .try_push_str(&json_str)
            .map_err(|_| ProtocolError::MessageTooLarge)?;
        Ok(&self.event_buffer)
    }

    pub fn next_command_id(&mut self) -> u32 {
        self.command_counter = self.command_counter.wrapping_add(1).max(1);
        self.command_counter
    }

    pub fn create_command(&mut self, command_type: CommandType) -> Command {
        Command {
            id: self.next_command_id(),
            timestamp: current_timestamp_ms(),
            command_type,
        }
    }
}

impl Default for ProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tagged_command() {
        let mut handler = ProtocolHandler::new();
        let command = handler
            .parse_command(r#"{"id":7,"command_type":{"type":"move","direction":"up","distance":50}}"#)
            .unwrap();
        assert_eq!(command.id, 7);
        assert_eq!(
            command.command_type,
            CommandType::Move { direction: MoveDirection::Up, distance: 50 }
        );

        let patrol = handler
            .parse_command(r#"{"id":8,"command_type":{"type":"start_patrol","patrol_type":"specific:top_left"}}"#)
            .unwrap();
        assert_eq!(patrol.command_type.name(), "start_patrol");
    }

    #[test]
    fn test_oversized_and_malformed_input() {
        let mut handler = ProtocolHandler::new();
        let huge = "x".repeat(MAX_COMMAND_SIZE + 1);
        assert_eq!(handler.parse_command(&huge).unwrap_err(), ProtocolError::MessageTooLarge);
        assert!(matches!(handler.parse_command("{nope"), Err(ProtocolError::InvalidJson(_))));
    }

    #[test]
    fn test_validation_limits() {
        let handler = ProtocolHandler::new();
        let make = |command_type| Command { id: 1, timestamp: 0, command_type };

        assert!(handler.validate_command(&make(CommandType::Takeoff)).is_ok());
        assert!(handler
            .validate_command(&make(CommandType::Move { direction: MoveDirection::Left, distance: 0 }))
            .is_err());
        assert!(handler
            .validate_command(&make(CommandType::Rotate { direction: RotateDirection::Clockwise, degrees: 720 }))
            .is_err());
        assert!(handler
            .validate_command(&Command { id: 0, timestamp: 0, command_type: CommandType::GetStatus })
            .is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected_while_in_flight() {
        let mut handler = ProtocolHandler::new();
        let command = handler.create_command(CommandType::Connect);

        handler.track_command(&command, 1000, 5000).unwrap();
        assert_eq!(
            handler.track_command(&command, 1500, 5000),
            Err(ProtocolError::DuplicateCommand(command.id))
        );

        handler.complete_command(command.id);
        assert!(handler.track_command(&command, 2000, 5000).is_ok());

        // Expired trackers are dropped
        assert!(handler.track_command(&command, 8000, 5000).is_ok());
    }

    #[test]
    fn test_failure_response_carries_kind() {
        let response = CommandResponse::failure(3, &FlightError::SafetyViolation("aircraft is not airborne".into()));
        let mut handler = ProtocolHandler::new();
        let json = handler.serialize_response(&response).unwrap();
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(value["status"], "Error");
        assert_eq!(value["error_kind"], "SafetyViolation");
        assert!(value.get("data").is_none());
    }
}
