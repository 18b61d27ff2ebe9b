use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionHandle, ConnectionSupervisor};
use crate::error::{ErrorKind, FlightError};
use crate::events::{EmergencyOutcome, EventBus, ObserverEvent};
use crate::executor::{CommandExecutor, CommandRecord};
use crate::patrol::PatrolEngine;
use crate::protocol::{
    current_timestamp_ms, Command, CommandResponse, CommandType, ProtocolError, ProtocolHandler,
};
use crate::telemetry::TelemetryReporter;
use crate::transport::LinkTransport;
use crate::vision::{Detector, VideoSource};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentState {
    pub running: bool,
    pub command_count: u32,
    pub failed_commands: u32,
    pub last_error: Option<String>,
}

/// Application context for one flight session.
///
/// Builds every component around a single transport, routes observer
/// commands to them, and owns teardown. Every outcome is returned as a
/// [`CommandResponse`]; nothing propagates to the observer as an error.
pub struct FlightAgent {
    config: SessionConfig,
    events: EventBus,
    connection: ConnectionHandle,
    executor: Arc<CommandExecutor>,
    supervisor: Arc<ConnectionSupervisor>,
    patrol: Arc<PatrolEngine>,
    telemetry: Arc<TelemetryReporter>,
    video: Arc<dyn VideoSource>,
    protocol: Mutex<ProtocolHandler>,
    state: Mutex<AgentState>,
}

impl FlightAgent {
    pub fn new(
        config: SessionConfig,
        transport: Box<dyn LinkTransport>,
        video: Arc<dyn VideoSource>,
        detector: Arc<dyn Detector>,
    ) -> Self {
        let events = EventBus::new();
        let connection = ConnectionHandle::new(Connection::new());
        let executor = Arc::new(CommandExecutor::new(
            config.executor.clone(),
            transport,
            connection.clone(),
            events.clone(),
        ));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            config.link.clone(),
            connection.clone(),
            Arc::clone(&executor),
            events.clone(),
        ));
        let patrol = Arc::new(PatrolEngine::new(
            config.patrol.clone(),
            Arc::clone(&executor),
            connection.clone(),
            Arc::clone(&video),
            detector,
            events.clone(),
        ));
        let telemetry = Arc::new(TelemetryReporter::new(
            config.telemetry.clone(),
            connection.clone(),
            Arc::clone(&executor),
            Arc::clone(&patrol),
            events.clone(),
        ));

        Self {
            config,
            events,
            connection,
            executor,
            supervisor,
            patrol,
            telemetry,
            video,
            protocol: Mutex::new(ProtocolHandler::new()),
            state: Mutex::new(AgentState::default()),
        }
    }

    /// Start background reporting. The link is opened by the `connect` command.
    pub async fn start(&self) {
        self.telemetry.start().await;
        self.state.lock().await.running = true;
        info!(
            "Flight agent ready on link {} (min battery {}%, max failed pings {})",
            self.executor.link_name(),
            self.config.executor.min_battery,
            self.config.link.max_failed_pings
        );
    }

    /// Stop reporting, land if airborne, release the link and the video stream.
    pub async fn shutdown(&self) {
        info!("Flight agent shutting down");
        self.telemetry.stop().await;
        self.patrol.abort("agent shutdown").await;
        self.supervisor.shutdown().await;
        if self.video.is_streaming() {
            self.video.stop_streaming();
        }
        self.state.lock().await.running = false;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObserverEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn executor(&self) -> &Arc<CommandExecutor> {
        &self.executor
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    pub fn patrol(&self) -> &Arc<PatrolEngine> {
        &self.patrol
    }

    pub fn telemetry(&self) -> &Arc<TelemetryReporter> {
        &self.telemetry
    }

    pub async fn get_state(&self) -> AgentState {
        self.state.lock().await.clone()
    }

    /// Parse, validate and execute one JSON command line; returns the JSON response.
    pub async fn handle_line(&self, line: &str) -> String {
        let command = {
            let mut protocol = self.protocol.lock().await;
            let timeout_ms = self.config.executor.command_timeout_ms * 2;
            match admit(&mut protocol, line, timeout_ms) {
                Ok(command) => command,
                Err(e) => {
                    warn!("Rejected command: {}", e);
                    let id = serde_json::from_str::<serde_json::Value>(line)
                        .ok()
                        .and_then(|v| v.get("id").and_then(|id| id.as_u64()))
                        .unwrap_or(0) as u32;
                    return self.serialize(&CommandResponse::nack(id, &e), &mut protocol);
                }
            }
        };

        let id = command.id;
        let response = self.handle(command).await;

        let mut protocol = self.protocol.lock().await;
        protocol.complete_command(id);
        self.serialize(&response, &mut protocol)
    }

    fn serialize(&self, response: &CommandResponse, protocol: &mut ProtocolHandler) -> String {
        match protocol.serialize_response(response) {
            Ok(json) => json.to_string(),
            Err(e) => {
                error!("Response {} could not be serialized: {}", response.id, e);
                json!({
                    "id": response.id,
                    "timestamp": response.timestamp,
                    "status": "Error",
                    "message": e.to_string(),
                })
                .to_string()
            }
        }
    }

    /// Execute a command and convert the outcome into a response.
    pub async fn handle(&self, command: Command) -> CommandResponse {
        let name = command.command_type.name();
        let result = self.execute(command.command_type).await;

        let mut state = self.state.lock().await;
        state.command_count = state.command_count.saturating_add(1);
        match result {
            Ok((message, data)) => CommandResponse::success(command.id, message, data),
            Err(e) => {
                warn!("{} failed: {}", name, e);
                state.failed_commands = state.failed_commands.saturating_add(1);
                state.last_error = Some(e.to_string());
                CommandResponse::failure(command.id, &e)
            }
        }
    }

    async fn execute(&self, command_type: CommandType) -> Result<(String, Option<serde_json::Value>), FlightError> {
        match command_type {
            CommandType::Connect => {
                self.supervisor.connect().await?;
                let connection = self.connection.snapshot().await;
                Ok((
                    "connected".into(),
                    Some(json!({ "connected": true, "battery": connection.battery_level })),
                ))
            }
            CommandType::Takeoff => {
                let record = self.executor.takeoff().await?;
                Ok((format!("takeoff completed in {:?}", record.latency()), None))
            }
            CommandType::Land => {
                let record = self.executor.land().await?;
                Ok((format!("landed in {:?}", record.latency()), None))
            }
            CommandType::Emergency => match self.patrol.emergency("operator emergency stop").await {
                EmergencyOutcome::Completed => Ok(("emergency stop completed".into(), None)),
                EmergencyOutcome::Failed => Err(FlightError::EmergencyTriggered(
                    "emergency stop not acknowledged; aircraft marked grounded".into(),
                )),
            },
            CommandType::Move { direction, distance } => {
                let result = self.executor.move_by(direction, distance).await;
                if !direction.is_vertical() && reached_aircraft(&result) {
                    self.patrol.mark_displaced(&format!("manual move {} {}cm", direction.as_str(), distance)).await;
                }
                result?;
                Ok((format!("moved {} {}cm", direction.as_str(), distance), None))
            }
            CommandType::Rotate { direction, degrees } => {
                let result = self.executor.rotate(direction, degrees).await;
                if degrees % 360 != 0 && reached_aircraft(&result) {
                    self.patrol.mark_displaced(&format!("manual rotate {} {}", direction.as_str(), degrees)).await;
                }
                result?;
                Ok((format!("rotated {} {} degrees", direction.as_str(), degrees), None))
            }
            CommandType::StartPatrol { patrol_type } => {
                // The worker runs to completion on its own; progress arrives as events
                let _worker = self.patrol.start_patrol(patrol_type).await?;
                let report = self.patrol.get_status().await;
                Ok((
                    format!("{} patrol started", patrol_type),
                    Some(json!({ "run_id": report.active_run })),
                ))
            }
            CommandType::StopPatrol => {
                self.patrol.stop_patrol().await?;
                Ok(("patrol stop requested".into(), None))
            }
            CommandType::GetStatus => {
                let snapshot = self.telemetry.sample().await;
                Ok(("status".into(), Some(to_value(&snapshot)?)))
            }
            CommandType::GetPatrolHistory { limit } => {
                let runs = self.patrol.get_history().await;
                let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
                let recent = runs[runs.len().saturating_sub(limit)..].to_vec();
                self.events.emit(ObserverEvent::PatrolHistory { runs: recent.clone() });
                Ok((format!("{} of {} runs", recent.len(), runs.len()), Some(to_value(&recent)?)))
            }
            CommandType::SetPatrolParameters { height, side_length } => {
                let parameters = self.patrol.set_patrol_parameters(height, side_length).await?;
                Ok(("patrol parameters updated".into(), Some(to_value(&parameters)?)))
            }
            CommandType::ResetPatrol => {
                self.patrol.reset().await?;
                Ok(("patrol state reset".into(), None))
            }
        }
    }
}

fn admit(protocol: &mut ProtocolHandler, line: &str, timeout_ms: u64) -> Result<Command, ProtocolError> {
    let command = protocol.parse_command(line)?;
    protocol.validate_command(&command)?;
    protocol.track_command(&command, current_timestamp_ms(), timeout_ms)?;
    Ok(command)
}

// A transport failure leaves the outcome unknown, so assume the aircraft moved
fn reached_aircraft(result: &Result<CommandRecord, FlightError>) -> bool {
    match result {
        Ok(_) => true,
        Err(e) => e.kind() == ErrorKind::CommandError,
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value, FlightError> {
    serde_json::to_value(value).map_err(|e| FlightError::Command(format!("failed to encode response: {}", e)))
}
