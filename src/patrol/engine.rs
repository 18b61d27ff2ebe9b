use super::route::{horizontal_moves, vertical_move, PatrolKind, Route, RouteGeometry, Waypoint};
use super::run::{ActiveRun, CompletionStatus, PatrolHistory, PatrolRun};
use crate::config::PatrolConfig;
use crate::connection::ConnectionHandle;
use crate::error::FlightError;
use crate::events::{EmergencyOutcome, EventBus, ObserverEvent};
use crate::executor::CommandExecutor;
use crate::transport::{MoveDirection, RotateDirection};
use crate::vision::{Detector, VideoSource};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

const FULL_ROTATION_DEG: u32 = 360;
// Runs pushed with each patrol_history event; keeps the event under the wire limit
const HISTORY_EVENT_RUNS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatrolStatus {
    Idle,
    Takeoff,
    Patrolling,
    Scanning,
    Landing,
    Emergency,
    Error,
}

/// Operator-tunable patrol size, in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatrolParameters {
    pub height_m: f32,
    pub side_length_m: f32,
}

impl PatrolParameters {
    pub fn height_cm(&self) -> u32 {
        (self.height_m * 100.0).round() as u32
    }

    pub fn side_cm(&self) -> i32 {
        (self.side_length_m * 100.0).round() as i32
    }
}

/// Point-in-time view of the engine for the observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatrolReport {
    pub status: PatrolStatus,
    pub current_waypoint: Option<String>,
    pub active_run: Option<u32>,
    pub stop_requested: bool,
    pub parameters: PatrolParameters,
    pub runs_recorded: usize,
}

#[derive(Debug)]
struct PatrolState {
    status: PatrolStatus,
    current_waypoint: Option<String>,
    at_home: bool,
    active_run: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Takeoff,
    Climb,
    Navigate,
    Scan,
    Return,
    Landing,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Takeoff => "takeoff",
            Phase::Climb => "climb",
            Phase::Navigate => "navigate",
            Phase::Scan => "scan",
            Phase::Return => "return",
            Phase::Landing => "landing",
        }
    }
}

#[derive(Debug)]
struct StepError {
    phase: Phase,
    error: FlightError,
}

fn at(phase: Phase) -> impl FnOnce(FlightError) -> StepError {
    move |error| StepError { phase, error }
}

/// Patrol state machine.
///
/// ```text
/// Idle -> Takeoff -> Patrolling <-> Scanning -> Landing -> Idle
/// any  -> Emergency -> Idle
/// Takeoff/Landing failure -> Error (until reset)
/// ```
///
/// One run at a time: `start_patrol` takes a non-blocking lock that the
/// worker task holds until the run is finalized. Status and history reads
/// never touch that lock.
pub struct PatrolEngine {
    config: PatrolConfig,
    executor: Arc<CommandExecutor>,
    connection: ConnectionHandle,
    video: Arc<dyn VideoSource>,
    detector: Arc<dyn Detector>,
    events: EventBus,
    parameters: Mutex<PatrolParameters>,
    state: Mutex<PatrolState>,
    history: PatrolHistory,
    run_lock: Arc<Mutex<()>>,
    stop_requested: AtomicBool,
    aborted: AtomicBool,
    abort_reason: Mutex<Option<String>>,
    next_run_id: AtomicU32,
}

impl PatrolEngine {
    pub fn new(
        config: PatrolConfig,
        executor: Arc<CommandExecutor>,
        connection: ConnectionHandle,
        video: Arc<dyn VideoSource>,
        detector: Arc<dyn Detector>,
        events: EventBus,
    ) -> Self {
        let parameters = PatrolParameters {
            height_m: config.height_m,
            side_length_m: config.side_length_m,
        };
        Self {
            config,
            executor,
            connection,
            video,
            detector,
            events,
            parameters: Mutex::new(parameters),
            state: Mutex::new(PatrolState {
                status: PatrolStatus::Idle,
                current_waypoint: None,
                at_home: true,
                active_run: None,
            }),
            history: PatrolHistory::new(),
            run_lock: Arc::new(Mutex::new(())),
            stop_requested: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
            next_run_id: AtomicU32::new(1),
        }
    }

    pub fn history(&self) -> PatrolHistory {
        self.history.clone()
    }

    pub async fn get_status(&self) -> PatrolReport {
        let parameters = *self.parameters.lock().await;
        let runs_recorded = self.history.len().await;
        let state = self.state.lock().await;
        PatrolReport {
            status: state.status,
            current_waypoint: state.current_waypoint.clone(),
            active_run: state.active_run,
            stop_requested: self.stop_requested.load(Ordering::SeqCst),
            parameters,
            runs_recorded,
        }
    }

    pub async fn status(&self) -> PatrolStatus {
        self.state.lock().await.status
    }

    pub async fn get_history(&self) -> Vec<PatrolRun> {
        self.history.snapshot().await
    }

    pub async fn patrol_parameters(&self) -> PatrolParameters {
        *self.parameters.lock().await
    }

    /// Replace the patrol size. Out-of-range values are rejected and the
    /// previous parameters kept. A run in progress keeps its own route.
    pub async fn set_patrol_parameters(&self, height_m: f32, side_length_m: f32) -> Result<PatrolParameters, FlightError> {
        let c = &self.config;
        if !height_m.is_finite() || height_m < c.min_height_m || height_m > c.max_height_m {
            return Err(FlightError::PatrolValidation(format!(
                "height {}m outside [{}, {}]m",
                height_m, c.min_height_m, c.max_height_m
            )));
        }
        if !side_length_m.is_finite() || side_length_m < c.min_side_m || side_length_m > c.max_side_m {
            return Err(FlightError::PatrolValidation(format!(
                "side length {}m outside [{}, {}]m",
                side_length_m, c.min_side_m, c.max_side_m
            )));
        }

        let parameters = PatrolParameters { height_m, side_length_m };
        *self.parameters.lock().await = parameters;
        info!("Patrol parameters set: height {}m, side {}m", height_m, side_length_m);
        Ok(parameters)
    }

    /// Check whether a run could start right now.
    pub async fn validate(&self) -> Result<(), FlightError> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| FlightError::PatrolValidation("patrol already in progress".into()))?;
        self.check_preconditions().await
    }

    async fn check_preconditions(&self) -> Result<(), FlightError> {
        let connection = self.connection.snapshot().await;
        if !connection.is_connected() {
            return Err(FlightError::PatrolValidation(format!(
                "drone not connected (link {})",
                connection.state.as_str()
            )));
        }
        let min_battery = self.executor.config().min_battery;
        if connection.battery_level < min_battery {
            return Err(FlightError::PatrolValidation(format!(
                "battery {}% below minimum {}%",
                connection.battery_level, min_battery
            )));
        }
        {
            let state = self.state.lock().await;
            if state.status == PatrolStatus::Error {
                return Err(FlightError::PatrolValidation("patrol engine in error state; reset required".into()));
            }
            if !state.at_home {
                return Err(FlightError::PatrolValidation("aircraft is not at the home waypoint".into()));
            }
        }
        if self.executor.flight_state().await.is_flying {
            return Err(FlightError::PatrolValidation("aircraft is already airborne".into()));
        }
        Ok(())
    }

    /// Validate and launch a run on its own worker task.
    ///
    /// A concurrent call fails immediately with "already in progress".
    pub async fn start_patrol(self: &Arc<Self>, kind: PatrolKind) -> Result<JoinHandle<PatrolRun>, FlightError> {
        let guard = Arc::clone(&self.run_lock).try_lock_owned().map_err(|_| {
            warn!("Patrol {} rejected: another run is active", kind);
            FlightError::PatrolValidation("patrol already in progress".into())
        })?;

        if let Err(e) = self.check_preconditions().await {
            warn!("Patrol {} rejected: {}", kind, e.reason());
            return Err(e);
        }

        self.stop_requested.store(false, Ordering::SeqCst);
        self.aborted.store(false, Ordering::SeqCst);
        *self.abort_reason.lock().await = None;

        let parameters = *self.parameters.lock().await;
        let battery = self.connection.snapshot().await.battery_level;
        let geometry = RouteGeometry {
            side_cm: parameters.side_cm(),
            height_cm: parameters.height_cm(),
            buffer_cm: self.config.buffer_cm,
            random_points: if battery > self.config.random_battery_threshold {
                self.config.random_points_high_battery
            } else {
                self.config.random_points_low_battery
            },
        };
        let route = {
            let mut rng = rand::thread_rng();
            Route::plan(kind, &geometry, &mut rng)
        };

        let id = self.next_run_id.fetch_add(1, Ordering::SeqCst);
        let run = ActiveRun::new(id, kind, battery, parameters.side_length_m, parameters.height_m);
        self.state.lock().await.active_run = Some(id);
        info!("Patrol run {} starting: {} with {} waypoint(s)", id, route.kind(), route.waypoints().len());

        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let _guard = guard;
            this.run_worker(run, route, parameters).await
        }))
    }

    /// Request a cooperative stop. The run finishes its current step, returns
    /// home and lands.
    pub async fn stop_patrol(&self) -> Result<(), FlightError> {
        if self.state.lock().await.active_run.is_none() {
            return Err(FlightError::PatrolValidation("no patrol in progress".into()));
        }
        info!("Patrol stop requested");
        self.stop_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Flag the active run for emergency termination without commanding the aircraft.
    /// Does nothing when no run is active.
    pub async fn abort(&self, reason: &str) {
        let state = self.state.lock().await;
        if state.active_run.is_none() {
            return;
        }
        *self.abort_reason.lock().await = Some(reason.to_string());
        self.aborted.store(true, Ordering::SeqCst);
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Record that the aircraft was moved or turned outside a run. The next
    /// run is refused until `reset_patrol` confirms it is back at home.
    pub async fn mark_displaced(&self, cause: &str) {
        let mut state = self.state.lock().await;
        if state.active_run.is_some() || !state.at_home {
            return;
        }
        state.at_home = false;
        state.current_waypoint = None;
        info!("Aircraft left the home waypoint ({})", cause);
    }

    /// Emergency stop the aircraft and terminate any active run.
    pub async fn emergency(&self, reason: &str) -> EmergencyOutcome {
        self.abort(reason).await;
        let active = self.state.lock().await.active_run.is_some();
        if active {
            self.set_status(PatrolStatus::Emergency, None, reason).await;
        }
        self.executor.emergency_stop(reason).await
    }

    /// Clear the sticky error state once the operator has recovered the aircraft.
    pub async fn reset(&self) -> Result<(), FlightError> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| FlightError::PatrolValidation("cannot reset while a patrol is running".into()))?;
        {
            let mut state = self.state.lock().await;
            if state.status == PatrolStatus::Error {
                info!("Patrol error state cleared");
            }
            state.at_home = true;
            state.current_waypoint = None;
        }
        self.set_status(PatrolStatus::Idle, None, "patrol reset").await;
        Ok(())
    }

    async fn set_status(&self, status: PatrolStatus, waypoint: Option<&str>, message: &str) {
        let waypoint = {
            let mut state = self.state.lock().await;
            state.status = status;
            if let Some(name) = waypoint {
                state.current_waypoint = Some(name.to_string());
            }
            state.current_waypoint.clone()
        };
        debug!("Patrol status {:?}: {}", status, message);
        self.events.emit(ObserverEvent::PatrolStatus {
            status,
            waypoint,
            message: message.to_string(),
        });
    }

    async fn set_position(&self, waypoint: &Waypoint, home: &Waypoint) {
        let mut state = self.state.lock().await;
        state.current_waypoint = Some(waypoint.name.clone());
        state.at_home = waypoint.same_position(home);
    }

    fn should_stop(&self, run: &mut ActiveRun) -> bool {
        if self.stop_requested.load(Ordering::SeqCst) {
            if !run.stopped_early {
                info!("Patrol run {} stopping early", run.id);
            }
            run.stopped_early = true;
        }
        run.stopped_early
    }

    async fn ensure_not_aborted(&self) -> Result<(), FlightError> {
        if !self.aborted.load(Ordering::SeqCst) {
            return Ok(());
        }
        let reason = self.abort_reason.lock().await.clone().unwrap_or_default();
        Err(FlightError::EmergencyTriggered(format!("patrol aborted: {}", reason)))
    }

    async fn run_worker(self: Arc<Self>, mut run: ActiveRun, route: Route, parameters: PatrolParameters) -> PatrolRun {
        let result = self.fly(&mut run, &route, &parameters).await;

        let completion = match result {
            Ok(()) if run.stopped_early => CompletionStatus::Stopped,
            Ok(()) => CompletionStatus::Completed,
            Err(step) => {
                error!(
                    "Patrol run {} failed during {}: {}",
                    run.id,
                    step.phase.as_str(),
                    step.error.reason()
                );
                run.record_error(format!("{}: {}", step.phase.as_str(), step.error.reason()));
                self.recover(&step).await;
                if matches!(step.phase, Phase::Takeoff | Phase::Landing) {
                    CompletionStatus::Error
                } else {
                    CompletionStatus::Emergency
                }
            }
        };

        let battery_end = self.connection.snapshot().await.trusted_battery();
        let run_id = run.id;
        let finished = run.finalize(completion, battery_end);
        self.history.push(finished.clone()).await;

        let final_status = if completion == CompletionStatus::Error {
            PatrolStatus::Error
        } else {
            PatrolStatus::Idle
        };
        {
            let mut state = self.state.lock().await;
            state.active_run = None;
            if matches!(completion, CompletionStatus::Completed | CompletionStatus::Stopped) {
                state.at_home = true;
                state.current_waypoint = Some(route.home().name.clone());
            }
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        self.aborted.store(false, Ordering::SeqCst);

        let message = format!("patrol run {} finished: {:?}", run_id, completion);
        info!("{}", message);
        self.set_status(final_status, None, &message).await;
        let runs = self.history.snapshot().await;
        self.events.emit(ObserverEvent::PatrolHistory {
            runs: runs[runs.len().saturating_sub(HISTORY_EVENT_RUNS)..].to_vec(),
        });
        finished
    }

    async fn fly(&self, run: &mut ActiveRun, route: &Route, parameters: &PatrolParameters) -> Result<(), StepError> {
        self.set_status(PatrolStatus::Takeoff, Some(route.home().name.as_str()), "taking off").await;
        self.executor.takeoff().await.map_err(at(Phase::Takeoff))?;

        self.set_status(PatrolStatus::Patrolling, None, "climbing to patrol height").await;
        self.adjust_height(parameters.height_cm(), run).await.map_err(at(Phase::Climb))?;
        self.verify_height(parameters.height_cm(), run).await.map_err(at(Phase::Climb))?;

        let mut current = route.home().clone();
        let total = route.waypoints().len();
        for (index, waypoint) in route.waypoints().iter().enumerate() {
            if self.should_stop(run) {
                break;
            }
            self.ensure_not_aborted().await.map_err(at(Phase::Navigate))?;
            self.set_status(PatrolStatus::Patrolling, None, &format!("flying to {}", waypoint.name))
                .await;
            self.fly_to(&current, waypoint, run).await.map_err(at(Phase::Navigate))?;
            current = waypoint.clone();
            run.visit(&waypoint.name);
            self.set_position(waypoint, route.home()).await;
            self.events.emit(ObserverEvent::WaypointReached {
                run_id: run.id,
                waypoint: waypoint.name.clone(),
                reached: index + 1,
                total,
                distance_traveled_cm: run.distance_traveled_cm(),
            });

            if self.should_stop(run) {
                break;
            }
            self.ensure_not_aborted().await.map_err(at(Phase::Scan))?;
            self.scan(waypoint, run).await.map_err(at(Phase::Scan))?;
            if self.should_stop(run) {
                break;
            }
        }

        self.return_and_land(&current, route.home(), run).await
    }

    /// Correct height first, then fly the horizontal legs, waiting out each
    /// move's estimated duration.
    async fn fly_to(&self, from: &Waypoint, to: &Waypoint, run: &mut ActiveRun) -> Result<(), FlightError> {
        self.adjust_height(to.height_cm, run).await?;

        let (dx, dy) = from.displacement_to(to);
        for (direction, distance) in horizontal_moves(dx, dy, self.config.min_move_cm) {
            self.ensure_not_aborted().await?;
            self.timed_move(direction, distance, run).await?;
        }
        Ok(())
    }

    async fn adjust_height(&self, target_cm: u32, run: &mut ActiveRun) -> Result<(), FlightError> {
        let current_cm = self.executor.flight_state().await.height_cm;
        if let Some((direction, distance)) = vertical_move(current_cm, target_cm, self.config.min_move_cm) {
            self.ensure_not_aborted().await?;
            self.timed_move(direction, distance, run).await?;
        }
        Ok(())
    }

    async fn timed_move(&self, direction: MoveDirection, distance_cm: u32, run: &mut ActiveRun) -> Result<(), FlightError> {
        self.executor.move_by(direction, distance_cm).await?;
        run.add_distance(distance_cm);
        sleep(self.config.travel_time(distance_cm)).await;
        Ok(())
    }

    async fn verify_height(&self, target_cm: u32, run: &mut ActiveRun) -> Result<(), FlightError> {
        let measured = match self.executor.query_height().await {
            Ok(measured) => measured,
            Err(e) => {
                warn!("Height verification skipped: {}", e.reason());
                return Ok(());
            }
        };
        let deviation = measured.abs_diff(target_cm);
        run.record_height_deviation(deviation);
        if deviation > self.config.position_tolerance_cm {
            warn!("Height {}cm is {}cm off target {}cm; correcting", measured, deviation, target_cm);
            self.adjust_height(target_cm, run).await?;
        }
        Ok(())
    }

    fn ensure_streaming(&self) {
        if self.video.is_streaming() {
            return;
        }
        if !self.video.start_streaming(self.executor.link_name()) {
            warn!("Video stream unavailable; scanning without frames");
        }
    }

    /// Full clockwise rotation, sampling the detector at fixed sub-intervals.
    async fn scan(&self, waypoint: &Waypoint, run: &mut ActiveRun) -> Result<(), FlightError> {
        self.set_status(PatrolStatus::Scanning, Some(waypoint.name.as_str()), &format!("scanning at {}", waypoint.name))
            .await;
        self.ensure_streaming();

        let started = Instant::now();
        self.executor.rotate(RotateDirection::Clockwise, FULL_ROTATION_DEG).await?;

        let samples = self.config.scan_samples.max(1);
        let slice = self.config.rotation_time(FULL_ROTATION_DEG) / samples;
        for _ in 0..samples {
            sleep(slice).await;
            let Some(frame) = self.video.latest_frame() else {
                continue;
            };
            for detection in self.detector.detect_objects(&frame) {
                run.record_detection(detection.is_threat());
                if detection.is_threat() {
                    warn!(
                        "Threat at {}: {} ({:.0}%)",
                        waypoint.name,
                        detection.class,
                        detection.confidence * 100.0
                    );
                    self.events.emit(ObserverEvent::ThreatAlert {
                        waypoint: waypoint.name.clone(),
                        detection,
                    });
                }
            }
        }

        run.record_scan(started.elapsed());
        self.set_status(PatrolStatus::Patrolling, None, &format!("scan complete at {}", waypoint.name))
            .await;
        Ok(())
    }

    /// Return home if needed, descend in stages, then land.
    async fn return_and_land(&self, current: &Waypoint, home: &Waypoint, run: &mut ActiveRun) -> Result<(), StepError> {
        self.set_status(PatrolStatus::Landing, None, "preparing to land").await;

        if !current.same_position(home) {
            info!("Returning from {} to {} before landing", current.name, home.name);
            self.fly_to(current, home, run).await.map_err(at(Phase::Return))?;
            self.set_position(home, home).await;
        }

        self.ensure_not_aborted().await.map_err(at(Phase::Return))?;
        let height_cm = self.executor.flight_state().await.height_cm;
        if height_cm > self.config.low_safety_height_cm {
            if let Some((direction, distance)) =
                vertical_move(height_cm, self.config.low_safety_height_cm, self.config.min_move_cm)
            {
                self.timed_move(direction, distance, run).await.map_err(at(Phase::Return))?;
            }
        }

        self.executor.land().await.map_err(at(Phase::Landing))?;
        Ok(())
    }

    /// Emergency recovery for a failed run.
    async fn recover(&self, step: &StepError) {
        let reason = format!("patrol {} failed: {}", step.phase.as_str(), step.error.reason());
        self.set_status(PatrolStatus::Emergency, None, &reason).await;
        self.stop_requested.store(true, Ordering::SeqCst);

        // A timed-out takeoff may have left the aircraft hovering
        let flying = self.executor.flight_state().await.is_flying;
        let takeoff_uncertain = step.phase == Phase::Takeoff && !step.error.is_safety_violation();
        if flying || takeoff_uncertain {
            self.executor.emergency_stop(&reason).await;
        } else {
            info!("Aircraft already grounded; no emergency stop needed");
        }
    }
}
