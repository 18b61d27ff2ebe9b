use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::patrol::{PatrolRun, PatrolStatus};
use crate::telemetry::TelemetrySnapshot;
use crate::vision::Detection;

const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyOutcome {
    Completed,
    Failed,
}

/// Structured notification pushed to the observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ObserverEvent {
    StatusUpdate(TelemetrySnapshot),
    BatteryUpdate {
        battery: u8,
    },
    ConnectionLost {
        reason: String,
        connection_drops: u32,
    },
    PatrolStatus {
        status: PatrolStatus,
        waypoint: Option<String>,
        message: String,
    },
    PatrolHistory {
        runs: Vec<PatrolRun>,
    },
    /// One route waypoint reached during a run, before its scan.
    WaypointReached {
        run_id: u32,
        waypoint: String,
        reached: usize,
        total: usize,
        distance_traveled_cm: u32,
    },
    ThreatAlert {
        waypoint: String,
        detection: Detection,
    },
    EmergencyStop {
        outcome: EmergencyOutcome,
        reason: String,
    },
    LinkFailure {
        attempts: u32,
        reason: String,
    },
}

impl ObserverEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ObserverEvent::StatusUpdate(_) => "status_update",
            ObserverEvent::BatteryUpdate { .. } => "battery_update",
            ObserverEvent::ConnectionLost { .. } => "connection_lost",
            ObserverEvent::PatrolStatus { .. } => "patrol_status",
            ObserverEvent::PatrolHistory { .. } => "patrol_history",
            ObserverEvent::WaypointReached { .. } => "waypoint_reached",
            ObserverEvent::ThreatAlert { .. } => "threat_alert",
            ObserverEvent::EmergencyStop { .. } => "emergency_stop",
            ObserverEvent::LinkFailure { .. } => "link_failure",
        }
    }
}

/// Fan-out of observer events to every subscriber.
///
/// Emitting never fails: with no subscribers the event is dropped, and a slow
/// subscriber sees `Lagged` rather than blocking the emitter.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ObserverEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObserverEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ObserverEvent) {
        debug!("Emitting {}", event.name());
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(ObserverEvent::BatteryUpdate { battery: 64 });

        assert_eq!(a.recv().await.unwrap(), ObserverEvent::BatteryUpdate { battery: 64 });
        assert_eq!(b.recv().await.unwrap().name(), "battery_update");
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(ObserverEvent::LinkFailure { attempts: 5, reason: "gone".into() });
    }

    #[test]
    fn test_event_json_is_tagged() {
        let event = ObserverEvent::EmergencyStop {
            outcome: EmergencyOutcome::Failed,
            reason: "operator".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "emergency_stop");
        assert_eq!(json["outcome"], "failed");
    }
}
