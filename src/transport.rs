use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveDirection {
    Up,
    Down,
    Left,
    Right,
    Forward,
    Back,
}

impl MoveDirection {
    pub fn is_vertical(self) -> bool {
        matches!(self, MoveDirection::Up | MoveDirection::Down)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MoveDirection::Up => "up",
            MoveDirection::Down => "down",
            MoveDirection::Left => "left",
            MoveDirection::Right => "right",
            MoveDirection::Forward => "forward",
            MoveDirection::Back => "back",
        }
    }
}

impl std::str::FromStr for MoveDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(MoveDirection::Up),
            "down" => Ok(MoveDirection::Down),
            "left" => Ok(MoveDirection::Left),
            "right" => Ok(MoveDirection::Right),
            "forward" => Ok(MoveDirection::Forward),
            "back" => Ok(MoveDirection::Back),
            other => Err(format!("invalid movement direction '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotateDirection {
    #[serde(alias = "cw")]
    Clockwise,
    #[serde(alias = "ccw", alias = "counterclockwise")]
    CounterClockwise,
}

impl RotateDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            RotateDirection::Clockwise => "cw",
            RotateDirection::CounterClockwise => "ccw",
        }
    }
}

impl std::str::FromStr for RotateDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cw" | "clockwise" => Ok(RotateDirection::Clockwise),
            "ccw" | "counterclockwise" | "counter_clockwise" => Ok(RotateDirection::CounterClockwise),
            other => Err(format!("invalid rotation direction '{}'", other)),
        }
    }
}

/// Capability interface over the wireless command link to the aircraft.
///
/// Implemented once per SDK binding. Only the command executor calls it, and
/// never concurrently: every method may assume exclusive access to the link.
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Human-readable name for this link (e.g. "tello-udp", "sim").
    fn name(&self) -> &str;

    /// Open the link and perform the SDK handshake.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Release the link. Must tolerate being called while already closed.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    async fn takeoff(&mut self) -> Result<(), TransportError>;

    async fn land(&mut self) -> Result<(), TransportError>;

    async fn move_by(&mut self, direction: MoveDirection, distance_cm: u32) -> Result<(), TransportError>;

    async fn rotate(&mut self, direction: RotateDirection, degrees: u32) -> Result<(), TransportError>;

    /// Cut motors immediately.
    async fn emergency(&mut self) -> Result<(), TransportError>;

    /// Battery charge, 0-100.
    async fn battery(&mut self) -> Result<u8, TransportError>;

    /// Height above takeoff point in centimeters.
    async fn height(&mut self) -> Result<u32, TransportError>;

    /// Yaw heading in degrees.
    async fn heading(&mut self) -> Result<i32, TransportError>;

    async fn is_flying(&mut self) -> Result<bool, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_parsing() {
        assert_eq!("down".parse::<MoveDirection>().unwrap(), MoveDirection::Down);
        assert!("sideways".parse::<MoveDirection>().is_err());
        assert!(MoveDirection::Up.is_vertical());
        assert!(!MoveDirection::Left.is_vertical());
        assert_eq!("ccw".parse::<RotateDirection>().unwrap(), RotateDirection::CounterClockwise);
    }

    #[test]
    fn test_direction_serde_names() {
        let json = serde_json::to_string(&MoveDirection::Forward).unwrap();
        assert_eq!(json, "\"forward\"");
        let back: RotateDirection = serde_json::from_str("\"clockwise\"").unwrap();
        assert_eq!(back, RotateDirection::Clockwise);
    }
}
