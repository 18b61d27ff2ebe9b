use crate::config::TelemetryConfig;
use crate::connection::{ConnectionHandle, ConnectionState};
use crate::events::{EventBus, ObserverEvent};
use crate::executor::{CommandExecutor, FlightState, MetricsSnapshot};
use crate::patrol::{PatrolEngine, PatrolReport};
use crate::protocol::current_timestamp_ms;
use crate::safety::{SafetyAction, SafetyLevel, SafetyMonitor};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// Snapshot pushed to the observer as `status_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub timestamp: u64,
    pub sequence_number: u32,
    pub connection_state: ConnectionState,
    pub connected: bool,
    /// Only reported while the link is `Connected`.
    pub battery: Option<u8>,
    pub consecutive_failed_pings: u32,
    pub flight: FlightState,
    pub patrol: PatrolReport,
    pub metrics: MetricsSnapshot,
    pub safety_level: SafetyLevel,
}

/// Periodic sampler and airborne safety watchdog.
///
/// Ticks on its own interval and on every state-changing event from the bus,
/// so the observer sees transitions without waiting for the next period.
pub struct TelemetryReporter {
    config: TelemetryConfig,
    connection: ConnectionHandle,
    executor: Arc<CommandExecutor>,
    patrol: Arc<PatrolEngine>,
    events: EventBus,
    monitor: Mutex<SafetyMonitor>,
    sequence_number: AtomicU32,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TelemetryReporter {
    pub fn new(
        config: TelemetryConfig,
        connection: ConnectionHandle,
        executor: Arc<CommandExecutor>,
        patrol: Arc<PatrolEngine>,
        events: EventBus,
    ) -> Self {
        let min_battery = executor.config().min_battery;
        Self {
            config,
            connection,
            executor,
            patrol,
            events,
            monitor: Mutex::new(SafetyMonitor::new(min_battery)),
            sequence_number: AtomicU32::new(0),
            task: Mutex::new(None),
        }
    }

    /// Read-only sample of connection, executor and patrol state.
    pub async fn sample(&self) -> TelemetrySnapshot {
        let connection = self.connection.snapshot().await;
        let flight = self.executor.flight_state().await;
        let metrics = self.executor.metrics().await;
        let patrol = self.patrol.get_status().await;
        let safety_level = self.monitor.lock().await.get_level();

        TelemetrySnapshot {
            timestamp: current_timestamp_ms(),
            sequence_number: self.sequence_number.load(Ordering::SeqCst),
            connection_state: connection.state,
            connected: connection.is_connected(),
            battery: connection.trusted_battery(),
            consecutive_failed_pings: connection.consecutive_failed_pings,
            flight,
            patrol,
            metrics,
            safety_level,
        }
    }

    /// Sample, act on any airborne safety condition, and emit a `status_update`.
    pub async fn tick(&self) -> TelemetrySnapshot {
        self.sequence_number.fetch_add(1, Ordering::SeqCst);
        let snapshot = self.sample().await;

        let action = self.monitor.lock().await.evaluate(
            snapshot.timestamp,
            &snapshot.flight,
            snapshot.connection_state,
            snapshot.consecutive_failed_pings,
            snapshot.battery,
        );

        let snapshot = match action {
            SafetyAction::None => snapshot,
            SafetyAction::Land => {
                let reason = format!(
                    "battery {}% below minimum while airborne",
                    snapshot.battery.unwrap_or_default()
                );
                warn!("{}; landing", reason);
                self.patrol.abort(&reason).await;
                if let Err(e) = self.executor.land().await {
                    error!("Low-battery landing failed: {}", e.reason());
                }
                self.sample().await
            }
            SafetyAction::EmergencyLand => {
                let reason = format!("link {} while airborne", snapshot.connection_state.as_str());
                warn!("{}; emergency landing", reason);
                self.patrol.abort(&reason).await;
                if let Err(e) = self.executor.best_effort_land().await {
                    error!("Emergency landing failed: {}", e.reason());
                    self.executor
                        .emergency_stop(&format!("{}; landing failed: {}", reason, e.reason()))
                        .await;
                }
                self.sample().await
            }
        };

        self.events.emit(ObserverEvent::StatusUpdate(snapshot.clone()));
        snapshot
    }

    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        // Subscribe before spawning so no transition is missed
        let receiver = self.events.subscribe();
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move { this.run_loop(receiver).await }));
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }

    async fn run_loop(self: Arc<Self>, mut events: broadcast::Receiver<ObserverEvent>) {
        let mut ticker = tokio::time::interval(self.config.report_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                received = events.recv() => match received {
                    // Our own output and pure notifications do not change state
                    Ok(ObserverEvent::StatusUpdate(_))
                    | Ok(ObserverEvent::ThreatAlert { .. })
                    | Ok(ObserverEvent::WaypointReached { .. })
                    | Ok(ObserverEvent::PatrolHistory { .. }) => continue,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Telemetry reporter lagged by {} events", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
            self.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::FlightAgent;
    use crate::config::SessionConfig;
    use crate::events::EmergencyOutcome;
    use crate::protocol::{Command, CommandType};
    use crate::sim::SimulatedDrone;
    use crate::vision::{BlankVideoSource, NullDetector};

    async fn airborne_agent() -> (FlightAgent, crate::sim::SimControl) {
        let drone = SimulatedDrone::new();
        let control = drone.control();
        let agent = FlightAgent::new(
            SessionConfig::default(),
            Box::new(drone),
            Arc::new(BlankVideoSource::new()),
            Arc::new(NullDetector),
        );
        for (id, command_type) in [(1, CommandType::Connect), (2, CommandType::Takeoff)] {
            assert!(agent.handle(Command { id, timestamp: 0, command_type }).await.is_success());
        }
        (agent, control)
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_lands_when_aircraft_still_answers() {
        let (agent, control) = airborne_agent().await;
        let mut rx = agent.subscribe();
        // Mid-reconnect: the supervisor has not confirmed the link yet
        agent.connection().lock().await.state = ConnectionState::Connecting;

        let snapshot = agent.telemetry().tick().await;
        assert!(!snapshot.flight.is_flying);
        assert_eq!(control.count("land").await, 1);
        assert_eq!(control.count("emergency").await, 0);
        assert!(!control.is_flying().await);
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, ObserverEvent::EmergencyStop { .. }));
        }

        agent.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_cuts_motors_only_after_landing_fails() {
        let (agent, control) = airborne_agent().await;
        let mut rx = agent.subscribe();
        control.reject("land").await;
        agent.connection().lock().await.state = ConnectionState::Disconnected;

        agent.telemetry().tick().await;
        let calls = control.calls().await;
        let land = calls.iter().rposition(|c| c.starts_with("land"));
        let cut = calls.iter().rposition(|c| c.starts_with("emergency"));
        assert!(land.is_some() && cut.is_some() && land < cut, "{:?}", calls);

        let mut outcome = None;
        while let Ok(event) = rx.try_recv() {
            if let ObserverEvent::EmergencyStop { outcome: o, reason } = event {
                assert!(reason.contains("landing failed"));
                outcome = Some(o);
            }
        }
        assert_eq!(outcome, Some(EmergencyOutcome::Completed));
        assert!(!agent.executor().flight_state().await.is_flying);

        agent.shutdown().await;
    }
}
