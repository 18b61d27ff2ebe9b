use dronewatch::config::{ExecutorConfig, LinkConfig};
use dronewatch::connection::{Connection, ConnectionHandle, ConnectionState, ConnectionSupervisor};
use dronewatch::error::ErrorKind;
use dronewatch::executor::CommandExecutor;
use dronewatch::sim::{SimControl, SimulatedDrone};
use dronewatch::{EventBus, ObserverEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

struct Rig {
    events: EventBus,
    connection: ConnectionHandle,
    executor: Arc<CommandExecutor>,
    supervisor: Arc<ConnectionSupervisor>,
    control: SimControl,
}

fn rig(link: LinkConfig) -> Rig {
    let drone = SimulatedDrone::new();
    let control = drone.control();
    let events = EventBus::new();
    let connection = ConnectionHandle::new(Connection::new());
    let executor = Arc::new(CommandExecutor::new(
        ExecutorConfig::default(),
        Box::new(drone),
        connection.clone(),
        events.clone(),
    ));
    let supervisor = Arc::new(ConnectionSupervisor::new(
        link,
        connection.clone(),
        Arc::clone(&executor),
        events.clone(),
    ));
    Rig { events, connection, executor, supervisor, control }
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
async fn test_connect_reads_battery_and_announces_it() {
    let rig = rig(LinkConfig::default());
    let mut rx = rig.events.subscribe();

    rig.supervisor.connect().await.unwrap();

    let connection = rig.connection.snapshot().await;
    assert_eq!(connection.state, ConnectionState::Connected);
    assert_eq!(connection.battery_level, 85);
    assert_eq!(connection.consecutive_failed_pings, 0);
    assert!(connection.last_heartbeat_at.is_some());

    let event = wait_for(&mut rx, |e| matches!(e, ObserverEvent::BatteryUpdate { .. })).await;
    assert_eq!(event, ObserverEvent::BatteryUpdate { battery: 85 });

    // Second connect is a no-op
    rig.supervisor.connect().await.unwrap();
    assert_eq!(rig.control.count("connect").await, 1);

    rig.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_refused_handshake_leaves_link_disconnected() {
    let rig = rig(LinkConfig::default());
    rig.control.set_refuse_handshake(true).await;

    let err = rig.supervisor.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionError);
    assert_eq!(rig.supervisor.state().await, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_failed_battery_read_closes_the_link() {
    let rig = rig(LinkConfig::default());
    rig.control.set_fail_battery_read(true).await;

    let err = rig.supervisor.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionError);
    assert!(err.reason().contains("battery"));
    assert!(!rig.control.is_link_open().await);
    assert_eq!(rig.supervisor.state().await, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_missed_ping_below_threshold_keeps_link_usable() {
    let rig = rig(LinkConfig::default());
    let mut rx = rig.events.subscribe();
    rig.supervisor.connect().await.unwrap();

    rig.control.set_link_down(true).await;
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let connection = rig.connection.snapshot().await;
    assert_eq!(connection.state, ConnectionState::Connected);
    assert_eq!(connection.consecutive_failed_pings, 1);
    assert_eq!(connection.trusted_battery(), Some(85));

    // Commands are still accepted once the link answers again
    rig.control.set_link_down(false).await;
    rig.executor.takeoff().await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    let connection = rig.connection.snapshot().await;
    assert_eq!(connection.state, ConnectionState::Connected);
    assert_eq!(connection.consecutive_failed_pings, 0);
    while let Ok(event) = rx.try_recv() {
        assert!(!matches!(event, ObserverEvent::ConnectionLost { .. }));
    }
    assert_eq!(rig.executor.metrics().await.connection_drops, 0);

    rig.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reaching_max_failed_pings_degrades() {
    let rig = rig(LinkConfig::default());
    let mut rx = rig.events.subscribe();
    rig.supervisor.connect().await.unwrap();

    rig.control.set_link_down(true).await;
    tokio::time::sleep(Duration::from_millis(4500)).await;
    let connection = rig.connection.snapshot().await;
    assert_eq!(connection.state, ConnectionState::Connected);
    assert_eq!(connection.consecutive_failed_pings, 2);

    wait_for(&mut rx, |e| matches!(e, ObserverEvent::ConnectionLost { .. })).await;
    assert_ne!(rig.supervisor.state().await, ConnectionState::Connected);
    let err = rig.executor.takeoff().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionError);

    rig.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_connection_lost_signalled_once_then_reconnects() {
    let rig = rig(LinkConfig::default());
    let mut rx = rig.events.subscribe();
    rig.supervisor.connect().await.unwrap();

    rig.control.set_link_down(true).await;
    let lost = wait_for(&mut rx, |e| matches!(e, ObserverEvent::ConnectionLost { .. })).await;
    match lost {
        ObserverEvent::ConnectionLost { connection_drops, .. } => assert_eq!(connection_drops, 1),
        other => panic!("unexpected event {:?}", other),
    }

    // The first reconnect attempt waits out the base backoff
    rig.control.set_link_down(false).await;
    wait_for(&mut rx, |e| matches!(e, ObserverEvent::BatteryUpdate { .. })).await;

    let connection = rig.connection.snapshot().await;
    assert_eq!(connection.state, ConnectionState::Connected);
    assert_eq!(connection.retry_count, 0);
    assert_eq!(rig.executor.metrics().await.connection_drops, 1);

    // Nothing else was signalled for the same outage
    tokio::time::sleep(Duration::from_secs(10)).await;
    while let Ok(event) = rx.try_recv() {
        assert!(!matches!(event, ObserverEvent::ConnectionLost { .. }));
    }

    rig.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_with_link_failure() {
    let link = LinkConfig { max_retries: 3, ..LinkConfig::default() };
    let rig = rig(link);
    let mut rx = rig.events.subscribe();
    rig.supervisor.connect().await.unwrap();

    rig.control.set_link_down(true).await;
    let failure = wait_for(&mut rx, |e| matches!(e, ObserverEvent::LinkFailure { .. })).await;
    match failure {
        ObserverEvent::LinkFailure { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected event {:?}", other),
    }

    let connection = rig.connection.snapshot().await;
    assert_eq!(connection.state, ConnectionState::Disconnected);
    assert_eq!(connection.retry_count, 3);
    // One initial handshake plus one per attempt
    assert_eq!(rig.control.count("connect").await, 4);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_reconnect_is_refused() {
    let rig = rig(LinkConfig::default());
    rig.supervisor.connect().await.unwrap();
    rig.control.set_link_down(true).await;

    let first = {
        let supervisor = Arc::clone(&rig.supervisor);
        tokio::spawn(async move { supervisor.reconnect().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = rig.supervisor.reconnect().await.unwrap_err();
    assert!(err.reason().contains("already in progress"));

    rig.control.set_link_down(false).await;
    first.await.unwrap().unwrap();
    assert_eq!(rig.supervisor.state().await, ConnectionState::Connected);

    rig.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_lands_and_is_idempotent() {
    let rig = rig(LinkConfig::default());
    rig.supervisor.connect().await.unwrap();
    rig.executor.takeoff().await.unwrap();
    assert!(rig.control.is_flying().await);

    rig.supervisor.cleanup().await;
    assert!(!rig.control.is_flying().await);
    assert!(!rig.control.is_link_open().await);
    assert_eq!(rig.control.count("land").await, 1);

    rig.supervisor.cleanup().await;
    rig.supervisor.cleanup().await;
    assert_eq!(rig.control.count("land").await, 1);
    assert_eq!(rig.supervisor.state().await, ConnectionState::Disconnected);
    assert!(!rig.executor.flight_state().await.is_flying);
}
