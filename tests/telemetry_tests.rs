use dronewatch::connection::ConnectionState;
use dronewatch::events::EmergencyOutcome;
use dronewatch::safety::SafetyLevel;
use dronewatch::sim::{SimControl, SimulatedDrone};
use dronewatch::vision::{BlankVideoSource, NullDetector};
use dronewatch::{Command, CommandType, FlightAgent, ObserverEvent, SessionConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

fn agent() -> (FlightAgent, SimControl) {
    let drone = SimulatedDrone::new();
    let control = drone.control();
    let agent = FlightAgent::new(
        SessionConfig::default(),
        Box::new(drone),
        Arc::new(BlankVideoSource::new()),
        Arc::new(NullDetector),
    );
    (agent, control)
}

async fn airborne_agent() -> (FlightAgent, SimControl) {
    let (agent, control) = agent();
    agent.start().await;
    for (id, command_type) in [(1, CommandType::Connect), (2, CommandType::Takeoff)] {
        let response = agent.handle(Command { id, timestamp: 0, command_type }).await;
        assert!(response.is_success(), "{:?}", response);
    }
    (agent, control)
}

async fn wait_for(
    rx: &mut broadcast::Receiver<ObserverEvent>,
    matches: impl Fn(&ObserverEvent) -> bool,
) -> ObserverEvent {
    let found = tokio::time::timeout(Duration::from_secs(300), async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await;
    found.expect("expected event was never emitted")
}

#[tokio::test(start_paused = true)]
async fn test_status_updates_are_periodic_and_sequenced() {
    let (agent, _control) = agent();
    let mut rx = agent.subscribe();
    agent.start().await;

    let mut sequences = Vec::new();
    for _ in 0..3 {
        if let ObserverEvent::StatusUpdate(snapshot) =
            wait_for(&mut rx, |e| matches!(e, ObserverEvent::StatusUpdate(_))).await
        {
            assert_eq!(snapshot.connection_state, ConnectionState::Disconnected);
            assert!(!snapshot.connected);
            assert_eq!(snapshot.battery, None);
            sequences.push(snapshot.sequence_number);
        }
    }
    assert_eq!(sequences.len(), 3);
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));

    agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_sample_reports_connected_battery() {
    let (agent, _control) = airborne_agent().await;

    let snapshot = agent.telemetry().sample().await;
    assert!(snapshot.connected);
    assert_eq!(snapshot.battery, Some(85));
    assert!(snapshot.flight.is_flying);
    assert_eq!(snapshot.flight.height_cm, 80);
    assert_eq!(snapshot.metrics.commands_sent, 1);
    assert_eq!(snapshot.safety_level, SafetyLevel::Normal);

    agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_low_battery_airborne_lands() {
    let (agent, control) = airborne_agent().await;

    control.set_battery(10).await;
    // The next battery check is due 30s after connecting
    tokio::time::sleep(Duration::from_secs(40)).await;

    assert!(!control.is_flying().await);
    assert!(!agent.executor().flight_state().await.is_flying);
    assert_eq!(control.count("land").await, 1);
    assert_eq!(control.count("emergency").await, 0);
    assert_eq!(agent.connection().snapshot().await.battery_level, 10);

    agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_missed_ping_alone_does_not_stop_the_aircraft() {
    let (agent, control) = airborne_agent().await;

    control.set_link_down(true).await;
    tokio::time::sleep(Duration::from_millis(2500)).await;

    agent.telemetry().tick().await;
    let snapshot = agent.telemetry().sample().await;
    assert_eq!(snapshot.connection_state, ConnectionState::Connected);
    assert_eq!(snapshot.consecutive_failed_pings, 1);
    assert_eq!(snapshot.safety_level, SafetyLevel::Caution);
    assert!(snapshot.flight.is_flying);
    assert_eq!(control.count("emergency").await, 0);
    assert_eq!(control.count("land").await, 0);

    control.set_link_down(false).await;
    agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_link_lost_airborne_triggers_emergency_stop() {
    let (agent, control) = airborne_agent().await;
    let mut rx = agent.subscribe();

    control.set_link_down(true).await;
    wait_for(&mut rx, |e| matches!(e, ObserverEvent::ConnectionLost { .. })).await;

    let event = wait_for(&mut rx, |e| matches!(e, ObserverEvent::EmergencyStop { .. })).await;
    let ObserverEvent::EmergencyStop { outcome, reason } = event else {
        panic!("expected emergency stop");
    };
    // The link is already closed, so neither the landing nor the stop is acknowledged
    assert_eq!(outcome, EmergencyOutcome::Failed);
    assert!(reason.contains("link"));
    assert!(control.count("land").await >= 1);

    assert!(!agent.executor().flight_state().await.is_flying);
    assert_eq!(agent.executor().metrics().await.emergency_stops, 1);

    agent.shutdown().await;
}
