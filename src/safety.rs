use crate::config::ExecutorConfig;
use crate::connection::ConnectionState;
use crate::error::FlightError;
use crate::executor::{FlightCommand, FlightState};
use crate::transport::MoveDirection;
use heapless::Vec;
use serde::{Deserialize, Serialize};

const MAX_SAFETY_EVENTS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SafetyLevel {
    Normal,
    Caution,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyEvent {
    BatteryLowAirborne,
    LinkDegradedAirborne,
    LinkLostAirborne,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyEventRecord {
    pub event: SafetyEvent,
    pub timestamp: u64,
    pub level: SafetyLevel,
    pub resolved: bool,
}

/// Pre-dispatch checks applied to every takeoff and movement command.
///
/// A gate failure is returned as [`FlightError::SafetyViolation`] and the
/// command never reaches the transport.
#[derive(Debug, Clone)]
pub struct SafetyGate {
    min_battery: u8,
    min_height_cm: u32,
    max_height_cm: u32,
    ground_clearance_cm: u32,
}

impl SafetyGate {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            min_battery: config.min_battery,
            min_height_cm: config.min_height_cm,
            max_height_cm: config.max_height_cm,
            ground_clearance_cm: config.ground_clearance_cm,
        }
    }

    pub fn check(&self, command: &FlightCommand, battery: u8, flight: &FlightState) -> Result<(), FlightError> {
        match command {
            FlightCommand::Takeoff => {
                self.check_battery(battery)?;
                if flight.is_flying {
                    return Err(FlightError::SafetyViolation("aircraft is already airborne".into()));
                }
                Ok(())
            }
            FlightCommand::Land => self.check_airborne(flight),
            FlightCommand::Move { direction, distance_cm } => {
                self.check_battery(battery)?;
                self.check_airborne(flight)?;
                if *distance_cm == 0 {
                    return Err(FlightError::SafetyViolation("move distance must be positive".into()));
                }
                if direction.is_vertical() {
                    self.check_vertical(*direction, *distance_cm, flight.height_cm)?;
                }
                Ok(())
            }
            FlightCommand::Rotate { .. } => {
                self.check_battery(battery)?;
                self.check_airborne(flight)
            }
        }
    }

    fn check_battery(&self, battery: u8) -> Result<(), FlightError> {
        if battery < self.min_battery {
            return Err(FlightError::SafetyViolation(format!(
                "battery {}% below minimum {}%",
                battery, self.min_battery
            )));
        }
        Ok(())
    }

    fn check_airborne(&self, flight: &FlightState) -> Result<(), FlightError> {
        if !flight.is_flying {
            return Err(FlightError::SafetyViolation("aircraft is not airborne".into()));
        }
        Ok(())
    }

    fn check_vertical(&self, direction: MoveDirection, distance_cm: u32, height_cm: u32) -> Result<(), FlightError> {
        let resulting = match direction {
            MoveDirection::Up => height_cm.saturating_add(distance_cm),
            _ => {
                // Down must leave ground clearance before the height window is considered
                let resulting = height_cm as i64 - distance_cm as i64;
                if resulting < self.ground_clearance_cm as i64 {
                    return Err(FlightError::SafetyViolation(format!(
                        "descending {}cm from {}cm leaves less than {}cm ground clearance",
                        distance_cm, height_cm, self.ground_clearance_cm
                    )));
                }
                resulting as u32
            }
        };

        if resulting < self.min_height_cm || resulting > self.max_height_cm {
            return Err(FlightError::SafetyViolation(format!(
                "resulting height {}cm outside [{}, {}]cm",
                resulting, self.min_height_cm, self.max_height_cm
            )));
        }
        Ok(())
    }
}

/// What the telemetry reporter should do about the airborne state it sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyAction {
    None,
    /// Controlled landing, falling back to an emergency stop if it fails.
    Land,
    /// Link lost: land without waiting for the link state, cutting motors
    /// only if the aircraft does not answer.
    EmergencyLand,
}

/// Watches airborne conditions independently of the patrol engine.
#[derive(Debug)]
pub struct SafetyMonitor {
    min_battery: u8,
    level: SafetyLevel,
    event_history: Vec<SafetyEventRecord, MAX_SAFETY_EVENTS>,
}

impl SafetyMonitor {
    pub fn new(min_battery: u8) -> Self {
        Self {
            min_battery,
            level: SafetyLevel::Normal,
            event_history: Vec::new(),
        }
    }

    /// Evaluate one telemetry sample. `battery` is `None` when it cannot be trusted.
    ///
    /// Missed pings below the drop threshold count as a degraded link.
    pub fn evaluate(
        &mut self,
        current_time: u64,
        flight: &FlightState,
        connection: ConnectionState,
        missed_pings: u32,
        battery: Option<u8>,
    ) -> SafetyAction {
        let link_lost = flight.is_flying
            && matches!(connection, ConnectionState::Disconnected | ConnectionState::Connecting);
        let link_degraded = flight.is_flying
            && !link_lost
            && (connection == ConnectionState::Degraded || missed_pings > 0);
        let battery_low = flight.is_flying && battery.map_or(false, |b| b < self.min_battery);

        self.set_condition(SafetyEvent::LinkLostAirborne, link_lost, current_time, SafetyLevel::Critical);
        self.set_condition(SafetyEvent::LinkDegradedAirborne, link_degraded, current_time, SafetyLevel::Caution);
        self.set_condition(SafetyEvent::BatteryLowAirborne, battery_low, current_time, SafetyLevel::Critical);
        self.update_safety_level();

        if link_lost {
            SafetyAction::EmergencyLand
        } else if battery_low {
            SafetyAction::Land
        } else {
            SafetyAction::None
        }
    }

    fn set_condition(&mut self, event: SafetyEvent, active: bool, timestamp: u64, level: SafetyLevel) {
        if active {
            self.record_event(event, timestamp, level);
        } else {
            for record in self.event_history.iter_mut().filter(|e| e.event == event && !e.resolved) {
                record.resolved = true;
            }
        }
    }

    fn record_event(&mut self, event: SafetyEvent, timestamp: u64, level: SafetyLevel) {
        // Refresh an event that is already active
        if let Some(existing) = self.event_history.iter_mut().find(|e| e.event == event && !e.resolved) {
            existing.timestamp = timestamp;
            existing.level = level;
            return;
        }

        tracing::warn!("Safety event raised: {:?} ({:?})", event, level);

        if self.event_history.is_full() {
            self.event_history.remove(0);
        }
        let _ = self.event_history.push(SafetyEventRecord {
            event,
            timestamp,
            level,
            resolved: false,
        });
    }

    fn update_safety_level(&mut self) {
        self.level = self
            .event_history
            .iter()
            .filter(|e| !e.resolved)
            .map(|e| e.level)
            .max()
            .unwrap_or(SafetyLevel::Normal);
    }

    pub fn get_level(&self) -> SafetyLevel {
        self.level
    }

    pub fn get_event_history(&self) -> &[SafetyEventRecord] {
        &self.event_history
    }

    pub fn active_events(&self) -> usize {
        self.event_history.iter().filter(|e| !e.resolved).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RotateDirection;

    fn airborne(height_cm: u32) -> FlightState {
        FlightState { is_flying: true, height_cm, heading: 0 }
    }

    #[test]
    fn test_takeoff_gates() {
        let gate = SafetyGate::new(&ExecutorConfig::default());
        let grounded = FlightState::default();

        assert!(gate.check(&FlightCommand::Takeoff, 85, &grounded).is_ok());
        assert!(gate.check(&FlightCommand::Takeoff, 15, &grounded).unwrap_err().is_safety_violation());
        assert!(gate.check(&FlightCommand::Takeoff, 85, &airborne(80)).is_err());
    }

    #[test]
    fn test_vertical_limits() {
        let gate = SafetyGate::new(&ExecutorConfig::default());
        let up = |d| FlightCommand::Move { direction: MoveDirection::Up, distance_cm: d };
        let down = |d| FlightCommand::Move { direction: MoveDirection::Down, distance_cm: d };

        assert!(gate.check(&up(120), 80, &airborne(80)).is_ok());
        assert!(gate.check(&up(450), 80, &airborne(80)).is_err());
        assert!(gate.check(&down(60), 80, &airborne(80)).is_ok());
        // 80 - 75 = 5cm, below ground clearance
        let err = gate.check(&down(75), 80, &airborne(80)).unwrap_err();
        assert!(err.reason().contains("ground clearance"));
        // 80 - 65 = 15cm, above clearance but below the minimum height
        assert!(gate.check(&down(65), 80, &airborne(80)).is_err());
    }

    #[test]
    fn test_moves_require_airborne() {
        let gate = SafetyGate::new(&ExecutorConfig::default());
        let grounded = FlightState::default();
        let down = FlightCommand::Move { direction: MoveDirection::Down, distance_cm: 50 };
        let rotate = FlightCommand::Rotate { direction: RotateDirection::Clockwise, degrees: 90 };

        assert!(gate.check(&down, 90, &grounded).unwrap_err().is_safety_violation());
        assert!(gate.check(&rotate, 90, &grounded).is_err());
        assert!(gate.check(&FlightCommand::Land, 90, &grounded).is_err());
        // Landing is never battery gated
        assert!(gate.check(&FlightCommand::Land, 5, &airborne(100)).is_ok());
    }

    #[test]
    fn test_monitor_actions() {
        let mut monitor = SafetyMonitor::new(20);

        let action = monitor.evaluate(1000, &airborne(200), ConnectionState::Connected, 0, Some(15));
        assert_eq!(action, SafetyAction::Land);
        assert_eq!(monitor.get_level(), SafetyLevel::Critical);

        let action = monitor.evaluate(2000, &airborne(200), ConnectionState::Disconnected, 0, Some(15));
        assert_eq!(action, SafetyAction::EmergencyLand);

        // Grounded: nothing to do, everything resolves
        let action = monitor.evaluate(3000, &FlightState::default(), ConnectionState::Disconnected, 0, None);
        assert_eq!(action, SafetyAction::None);
        assert_eq!(monitor.active_events(), 0);
        assert_eq!(monitor.get_level(), SafetyLevel::Normal);
    }

    #[test]
    fn test_repeated_condition_is_recorded_once() {
        let mut monitor = SafetyMonitor::new(20);
        for t in 0..5 {
            monitor.evaluate(t * 1000, &airborne(150), ConnectionState::Degraded, 3, Some(60));
        }
        assert_eq!(monitor.get_event_history().len(), 1);
        assert_eq!(monitor.get_event_history()[0].timestamp, 4000);
        assert_eq!(monitor.get_level(), SafetyLevel::Caution);
    }

    #[test]
    fn test_missed_pings_raise_caution_only() {
        let mut monitor = SafetyMonitor::new(20);

        let action = monitor.evaluate(1000, &airborne(150), ConnectionState::Connected, 1, Some(60));
        assert_eq!(action, SafetyAction::None);
        assert_eq!(monitor.get_level(), SafetyLevel::Caution);

        monitor.evaluate(3000, &airborne(150), ConnectionState::Connected, 0, Some(60));
        assert_eq!(monitor.get_level(), SafetyLevel::Normal);
    }
}
