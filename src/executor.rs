//! Single serialization point between every caller and the link transport.
//!
//! Manual observer commands, the patrol worker, the heartbeat loop and the
//! safety monitor all reach the aircraft through [`CommandExecutor`]. The
//! transport sits behind one async mutex, so no two calls are ever in flight
//! at the same time, and motion commands are spaced by a cooldown.

use crate::config::ExecutorConfig;
use crate::connection::{ConnectionHandle, ConnectionState};
use crate::error::{FlightError, TransportError};
use crate::events::{EmergencyOutcome, EventBus, ObserverEvent};
use crate::safety::SafetyGate;
use crate::transport::{LinkTransport, MoveDirection, RotateDirection};
use heapless::HistoryBuffer;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

const RESPONSE_TIME_WINDOW: usize = 64;
const BATTERY_WINDOW: usize = 32;
const QUERY_TIMEOUT_MS: u64 = 2000;
// The SDK takes off to roughly this height before accepting moves
const TAKEOFF_HEIGHT_ESTIMATE_CM: u32 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum FlightCommand {
    Takeoff,
    Land,
    Move { direction: MoveDirection, distance_cm: u32 },
    Rotate { direction: RotateDirection, degrees: u32 },
}

impl FlightCommand {
    pub fn name(&self) -> &'static str {
        match self {
            FlightCommand::Takeoff => "takeoff",
            FlightCommand::Land => "land",
            FlightCommand::Move { .. } => "move",
            FlightCommand::Rotate { .. } => "rotate",
        }
    }

    pub fn args(&self) -> String {
        match self {
            FlightCommand::Takeoff | FlightCommand::Land => String::new(),
            FlightCommand::Move { direction, distance_cm } => format!("{} {}", direction.as_str(), distance_cm),
            FlightCommand::Rotate { direction, degrees } => format!("{} {}", direction.as_str(), degrees),
        }
    }
}

impl std::fmt::Display for FlightCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let args = self.args();
        if args.is_empty() {
            write!(f, "{}", self.name())
        } else {
            write!(f, "{} {}", self.name(), args)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Success,
    Failure(String),
}

/// One dispatched command. Not retained beyond the aggregate metrics.
#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub name: &'static str,
    pub args: String,
    pub issued_at: Instant,
    pub completed_at: Instant,
    pub outcome: CommandOutcome,
}

impl CommandRecord {
    pub fn latency(&self) -> Duration {
        self.completed_at.saturating_duration_since(self.issued_at)
    }
}

/// Commanded flight state. Derived from acknowledged commands, resynced from
/// telemetry queries where available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightState {
    pub is_flying: bool,
    pub height_cm: u32,
    pub heading: i32,
}

#[derive(Debug)]
pub struct ExecutorMetrics {
    commands_sent: u32,
    commands_failed: u32,
    gate_rejections: u32,
    connection_drops: u32,
    emergency_stops: u32,
    response_times_ms: HistoryBuffer<u32, RESPONSE_TIME_WINDOW>,
    battery_readings: HistoryBuffer<u8, BATTERY_WINDOW>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub commands_sent: u32,
    pub commands_failed: u32,
    pub gate_rejections: u32,
    pub connection_drops: u32,
    pub emergency_stops: u32,
    pub avg_response_ms: f32,
    pub last_response_ms: Option<u32>,
    pub recent_battery: Vec<u8>,
}

impl ExecutorMetrics {
    pub fn new() -> Self {
        Self {
            commands_sent: 0,
            commands_failed: 0,
            gate_rejections: 0,
            connection_drops: 0,
            emergency_stops: 0,
            response_times_ms: HistoryBuffer::new(),
            battery_readings: HistoryBuffer::new(),
        }
    }

    fn record_success(&mut self, latency: Duration) {
        self.commands_sent = self.commands_sent.saturating_add(1);
        self.response_times_ms.write(latency.as_millis().min(u32::MAX as u128) as u32);
    }

    fn record_failure(&mut self) {
        self.commands_failed = self.commands_failed.saturating_add(1);
    }

    pub(crate) fn record_battery(&mut self, battery: u8) {
        self.battery_readings.write(battery);
    }

    pub(crate) fn record_connection_drop(&mut self) {
        self.connection_drops = self.connection_drops.saturating_add(1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let samples = self.response_times_ms.len();
        let avg_response_ms = if samples == 0 {
            0.0
        } else {
            self.response_times_ms.iter().map(|&ms| ms as f32).sum::<f32>() / samples as f32
        };

        MetricsSnapshot {
            commands_sent: self.commands_sent,
            commands_failed: self.commands_failed,
            gate_rejections: self.gate_rejections,
            connection_drops: self.connection_drops,
            emergency_stops: self.emergency_stops,
            avg_response_ms,
            last_response_ms: self.response_times_ms.recent().copied(),
            recent_battery: self.battery_readings.oldest_ordered().copied().collect(),
        }
    }
}

impl Default for ExecutorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

struct Link {
    transport: Box<dyn LinkTransport>,
    last_command_at: Option<Instant>,
}

pub struct CommandExecutor {
    link: Mutex<Link>,
    link_name: String,
    connection: ConnectionHandle,
    gate: SafetyGate,
    config: ExecutorConfig,
    flight: Mutex<FlightState>,
    metrics: Mutex<ExecutorMetrics>,
    events: EventBus,
}

impl CommandExecutor {
    pub fn new(
        config: ExecutorConfig,
        transport: Box<dyn LinkTransport>,
        connection: ConnectionHandle,
        events: EventBus,
    ) -> Self {
        Self {
            link_name: transport.name().to_string(),
            link: Mutex::new(Link { transport, last_command_at: None }),
            connection,
            gate: SafetyGate::new(&config),
            config,
            flight: Mutex::new(FlightState::default()),
            metrics: Mutex::new(ExecutorMetrics::new()),
            events,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn link_name(&self) -> &str {
        &self.link_name
    }

    pub async fn flight_state(&self) -> FlightState {
        *self.flight.lock().await
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        self.metrics.lock().await.snapshot()
    }

    pub(crate) async fn with_metrics<R>(&self, f: impl FnOnce(&mut ExecutorMetrics) -> R) -> R {
        let mut metrics = self.metrics.lock().await;
        f(&mut metrics)
    }

    /// Validate and send one command.
    ///
    /// Requires a `Connected` link and a passing safety gate. A dispatch issued
    /// before the cooldown has elapsed waits for it; it is never dropped.
    pub async fn dispatch(&self, command: FlightCommand) -> Result<CommandRecord, FlightError> {
        self.execute(command, true).await
    }

    pub async fn takeoff(&self) -> Result<CommandRecord, FlightError> {
        self.dispatch(FlightCommand::Takeoff).await
    }

    /// Land, falling back to an emergency stop if an airborne landing fails.
    pub async fn land(&self) -> Result<CommandRecord, FlightError> {
        let was_flying = self.flight_state().await.is_flying;
        match self.dispatch(FlightCommand::Land).await {
            Ok(record) => Ok(record),
            Err(e) if e.is_safety_violation() || !was_flying => Err(e),
            Err(e) => {
                error!("Landing failed ({}), falling back to emergency stop", e.reason());
                self.emergency_stop(&format!("landing failed: {}", e.reason())).await;
                Err(e)
            }
        }
    }

    pub async fn move_by(&self, direction: MoveDirection, distance_cm: u32) -> Result<CommandRecord, FlightError> {
        self.dispatch(FlightCommand::Move { direction, distance_cm }).await
    }

    pub async fn rotate(&self, direction: RotateDirection, degrees: u32) -> Result<CommandRecord, FlightError> {
        self.dispatch(FlightCommand::Rotate { direction, degrees }).await
    }

    /// Landing used during teardown: skips the link state and safety gates.
    pub async fn best_effort_land(&self) -> Result<(), FlightError> {
        if !self.flight_state().await.is_flying {
            return Ok(());
        }
        self.execute(FlightCommand::Land, false).await.map(|_| ())
    }

    /// Cut motors. Bypasses every gate and the cooldown, and gives up after
    /// the emergency timeout. Local state is marked grounded either way.
    pub async fn emergency_stop(&self, reason: &str) -> EmergencyOutcome {
        warn!("EMERGENCY STOP: {}", reason);

        let attempt = async {
            let mut link = self.link.lock().await;
            let result = link.transport.emergency().await;
            link.last_command_at = Some(Instant::now());
            result
        };

        let outcome = match timeout(self.config.emergency_timeout(), attempt).await {
            Ok(Ok(())) => {
                info!("Emergency stop acknowledged");
                EmergencyOutcome::Completed
            }
            Ok(Err(e)) => {
                error!("Emergency stop failed: {}; marking aircraft grounded anyway", e);
                EmergencyOutcome::Failed
            }
            Err(_) => {
                error!(
                    "Emergency stop not acknowledged within {:?}; abandoning attempt",
                    self.config.emergency_timeout()
                );
                EmergencyOutcome::Failed
            }
        };

        {
            let mut flight = self.flight.lock().await;
            flight.is_flying = false;
            flight.height_cm = 0;
        }
        self.metrics.lock().await.emergency_stops += 1;

        self.events.emit(ObserverEvent::EmergencyStop {
            outcome,
            reason: reason.to_string(),
        });
        outcome
    }

    async fn execute(&self, command: FlightCommand, gated: bool) -> Result<CommandRecord, FlightError> {
        let mut link = self.link.lock().await;

        if gated {
            let (state, battery) = {
                let connection = self.connection.lock().await;
                (connection.state, connection.battery_level)
            };
            if state != ConnectionState::Connected {
                warn!("Refusing {}: link is {:?}", command, state);
                return Err(FlightError::Connection(format!(
                    "cannot {} while link is {}",
                    command.name(),
                    state.as_str()
                )));
            }

            let flight = *self.flight.lock().await;
            if let Err(e) = self.gate.check(&command, battery, &flight) {
                warn!("Safety gate rejected {}: {}", command, e.reason());
                self.metrics.lock().await.gate_rejections += 1;
                return Err(e);
            }
        }

        // Cooldown: wait, never drop
        if let Some(last) = link.last_command_at {
            let ready_at = last + self.config.cooldown();
            if Instant::now() < ready_at {
                debug!("Cooldown: holding {} until the link is ready", command);
                tokio::time::sleep_until(ready_at).await;
            }
        }

        debug!("Dispatching {}", command);
        let issued_at = Instant::now();
        let result = match timeout(self.config.command_timeout(), send(link.transport.as_mut(), command)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(command.name())),
        };
        let completed_at = Instant::now();
        link.last_command_at = Some(completed_at);
        drop(link);

        match result {
            Ok(()) => {
                self.metrics.lock().await.record_success(completed_at - issued_at);
                self.apply(command).await;
                info!("{} completed in {:?}", command, completed_at - issued_at);
                Ok(CommandRecord {
                    name: command.name(),
                    args: command.args(),
                    issued_at,
                    completed_at,
                    outcome: CommandOutcome::Success,
                })
            }
            Err(e) => {
                self.metrics.lock().await.record_failure();
                warn!("{} failed: {}", command, e);
                Err(e.into())
            }
        }
    }

    async fn apply(&self, command: FlightCommand) {
        let mut flight = self.flight.lock().await;
        match command {
            FlightCommand::Takeoff => {
                flight.is_flying = true;
                flight.height_cm = TAKEOFF_HEIGHT_ESTIMATE_CM;
            }
            FlightCommand::Land => {
                flight.is_flying = false;
                flight.height_cm = 0;
            }
            FlightCommand::Move { direction: MoveDirection::Up, distance_cm } => {
                flight.height_cm = flight.height_cm.saturating_add(distance_cm);
            }
            FlightCommand::Move { direction: MoveDirection::Down, distance_cm } => {
                flight.height_cm = flight.height_cm.saturating_sub(distance_cm);
            }
            FlightCommand::Move { .. } => {}
            FlightCommand::Rotate { direction, degrees } => {
                let delta = (degrees % 360) as i32;
                flight.heading = match direction {
                    RotateDirection::Clockwise => (flight.heading + delta).rem_euclid(360),
                    RotateDirection::CounterClockwise => (flight.heading - delta).rem_euclid(360),
                };
            }
        }
    }

    // Link management and telemetry queries. These bypass the safety gates
    // but still go through the link mutex.

    pub(crate) async fn open_link(&self, within: Duration) -> Result<(), FlightError> {
        let mut link = self.link.lock().await;
        match timeout(within, link.transport.connect()).await {
            Ok(Ok(())) => {
                link.last_command_at = None;
                Ok(())
            }
            Ok(Err(e)) => Err(FlightError::Connection(e.to_string())),
            Err(_) => Err(FlightError::Connection(format!("handshake timed out after {:?}", within))),
        }
    }

    pub(crate) async fn close_link(&self) {
        let mut link = self.link.lock().await;
        if let Err(e) = link.transport.disconnect().await {
            warn!("Releasing link {} failed: {}", self.link_name, e);
        }
    }

    pub async fn query_battery(&self) -> Result<u8, FlightError> {
        let battery = {
            let mut link = self.link.lock().await;
            timeout(query_timeout(), link.transport.battery())
                .await
                .map_err(|_| TransportError::Timeout("battery"))??
        };
        let battery = battery.min(100);
        self.metrics.lock().await.record_battery(battery);
        Ok(battery)
    }

    /// Measured height. Also resyncs the commanded height while airborne.
    pub async fn query_height(&self) -> Result<u32, FlightError> {
        let height = {
            let mut link = self.link.lock().await;
            timeout(query_timeout(), link.transport.height())
                .await
                .map_err(|_| TransportError::Timeout("height"))??
        };
        let mut flight = self.flight.lock().await;
        if flight.is_flying {
            flight.height_cm = height;
        }
        Ok(height)
    }

    /// Resync the whole flight state from the aircraft, e.g. after a reconnect.
    pub async fn sync_flight_state(&self) -> Result<FlightState, FlightError> {
        let state = {
            let mut link = self.link.lock().await;
            let is_flying = timeout(query_timeout(), link.transport.is_flying())
                .await
                .map_err(|_| TransportError::Timeout("is_flying"))??;
            let height_cm = timeout(query_timeout(), link.transport.height())
                .await
                .map_err(|_| TransportError::Timeout("height"))??;
            let heading = timeout(query_timeout(), link.transport.heading())
                .await
                .map_err(|_| TransportError::Timeout("heading"))??;
            FlightState { is_flying, height_cm, heading }
        };
        *self.flight.lock().await = state;
        Ok(state)
    }
}

fn query_timeout() -> Duration {
    Duration::from_millis(QUERY_TIMEOUT_MS)
}

async fn send(transport: &mut dyn LinkTransport, command: FlightCommand) -> Result<(), TransportError> {
    match command {
        FlightCommand::Takeoff => transport.takeoff().await,
        FlightCommand::Land => transport.land().await,
        FlightCommand::Move { direction, distance_cm } => transport.move_by(direction, distance_cm).await,
        FlightCommand::Rotate { direction, degrees } => transport.rotate(direction, degrees).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::sim::{SimControl, SimulatedDrone};

    async fn connected_executor(battery: u8) -> (CommandExecutor, SimControl, ConnectionHandle) {
        let drone = SimulatedDrone::with_battery(battery);
        let control = drone.control();
        let connection = ConnectionHandle::new(Connection::new());
        let executor = CommandExecutor::new(
            ExecutorConfig::default(),
            Box::new(drone),
            connection.clone(),
            EventBus::new(),
        );
        executor.open_link(Duration::from_secs(1)).await.unwrap();
        let battery = executor.query_battery().await.unwrap();
        {
            let mut c = connection.lock().await;
            c.state = ConnectionState::Connected;
            c.battery_level = battery;
        }
        (executor, control, connection)
    }

    #[tokio::test(start_paused = true)]
    async fn test_takeoff_and_bookkeeping() {
        let (executor, _control, _) = connected_executor(85).await;

        let record = executor.takeoff().await.unwrap();
        assert_eq!(record.name, "takeoff");
        assert_eq!(record.outcome, CommandOutcome::Success);

        executor.move_by(MoveDirection::Up, 120).await.unwrap();
        executor.rotate(RotateDirection::Clockwise, 450).await.unwrap();

        let flight = executor.flight_state().await;
        assert!(flight.is_flying);
        assert_eq!(flight.height_cm, 200);
        assert_eq!(flight.heading, 90);
        assert_eq!(executor.metrics().await.commands_sent, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_battery_takeoff_never_reaches_transport() {
        let (executor, control, _) = connected_executor(15).await;

        let err = executor.takeoff().await.unwrap_err();
        assert!(err.is_safety_violation());
        assert!(!executor.flight_state().await.is_flying);
        assert!(control.motion_calls().await.is_empty());
        let metrics = executor.metrics().await;
        assert_eq!(metrics.commands_sent, 0);
        assert_eq!(metrics.commands_failed, 0);
        assert_eq!(metrics.gate_rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_spaces_commands() {
        let (executor, control, _) = connected_executor(85).await;
        control.set_latency(Duration::ZERO).await;

        let first = executor.takeoff().await.unwrap();
        let second = executor.move_by(MoveDirection::Forward, 50).await.unwrap();
        assert!(second.issued_at - first.completed_at >= Duration::from_millis(100));
        assert_eq!(control.motion_calls().await, vec!["takeoff", "move forward 50"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_counts_and_maps() {
        let (executor, control, _) = connected_executor(85).await;
        executor.takeoff().await.unwrap();
        control.reject("rotate").await;

        let err = executor.rotate(RotateDirection::Clockwise, 360).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CommandError);
        let metrics = executor.metrics().await;
        assert_eq!(metrics.commands_sent, 1);
        assert_eq!(metrics.commands_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_landing_falls_back_to_emergency() {
        let (executor, control, _) = connected_executor(85).await;
        executor.takeoff().await.unwrap();
        control.reject("land").await;

        assert!(executor.land().await.is_err());
        assert!(!executor.flight_state().await.is_flying);
        assert_eq!(control.count("emergency").await, 1);
        assert_eq!(executor.metrics().await.emergency_stops, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_stop_is_bounded() {
        let (executor, control, _) = connected_executor(85).await;
        executor.takeoff().await.unwrap();
        control.set_hang_emergency(true).await;

        let started = Instant::now();
        let outcome = executor.emergency_stop("operator").await;
        assert_eq!(outcome, EmergencyOutcome::Failed);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(!executor.flight_state().await.is_flying);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_refused_while_degraded() {
        let (executor, control, connection) = connected_executor(85).await;
        connection.lock().await.state = ConnectionState::Degraded;

        let err = executor.takeoff().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConnectionError);
        assert!(control.motion_calls().await.is_empty());
    }
}
