use crate::config::LinkConfig;
use crate::error::FlightError;
use crate::events::{EventBus, ObserverEvent};
use crate::executor::CommandExecutor;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
        }
    }
}

/// Link session state. Mutated only by the [`ConnectionSupervisor`].
#[derive(Debug, Clone)]
pub struct Connection {
    pub state: ConnectionState,
    pub retry_count: u32,
    pub backoff_interval: Duration,
    pub last_heartbeat_at: Option<Instant>,
    pub battery_level: u8,
    pub consecutive_failed_pings: u32,
    drop_signalled: bool,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            retry_count: 0,
            backoff_interval: Duration::ZERO,
            last_heartbeat_at: None,
            battery_level: 0,
            consecutive_failed_pings: 0,
            drop_signalled: false,
        }
    }

    /// Battery level, only while the link is `Connected`.
    pub fn trusted_battery(&self) -> Option<u8> {
        (self.state == ConnectionState::Connected).then_some(self.battery_level)
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to the [`Connection`]. Readers outside the supervisor only
/// ever get snapshots.
#[derive(Debug, Clone, Default)]
pub struct ConnectionHandle {
    inner: Arc<Mutex<Connection>>,
}

impl ConnectionHandle {
    pub fn new(connection: Connection) -> Self {
        Self { inner: Arc::new(Mutex::new(connection)) }
    }

    pub async fn snapshot(&self) -> Connection {
        self.inner.lock().await.clone()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.inner.lock().await
    }
}

/// Owns the link lifecycle: handshake, heartbeat, reconnection and teardown.
pub struct ConnectionSupervisor {
    config: LinkConfig,
    connection: ConnectionHandle,
    executor: Arc<CommandExecutor>,
    events: EventBus,
    // Serializes connect/cleanup so they never interleave
    lifecycle: Mutex<()>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    reconnecting: AtomicBool,
}

impl ConnectionSupervisor {
    pub fn new(
        config: LinkConfig,
        connection: ConnectionHandle,
        executor: Arc<CommandExecutor>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            connection,
            executor,
            events,
            lifecycle: Mutex::new(()),
            heartbeat: Mutex::new(None),
            reconnect_task: Mutex::new(None),
            reconnecting: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.connection.clone()
    }

    pub async fn state(&self) -> ConnectionState {
        self.connection.lock().await.state
    }

    /// Open the link, read the initial battery and start the heartbeat.
    ///
    /// Returns immediately if the link is already up.
    pub async fn connect(self: &Arc<Self>) -> Result<(), FlightError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.connect_locked().await
    }

    async fn connect_locked(self: &Arc<Self>) -> Result<(), FlightError> {
        {
            let mut connection = self.connection.lock().await;
            match connection.state {
                ConnectionState::Connected | ConnectionState::Degraded => return Ok(()),
                _ => connection.state = ConnectionState::Connecting,
            }
        }
        info!("Connecting to {}", self.executor.link_name());

        if let Err(e) = self.executor.open_link(self.config.connect_timeout()).await {
            warn!("Handshake failed: {}", e.reason());
            self.set_disconnected().await;
            return Err(e);
        }

        let battery = match self.executor.query_battery().await {
            Ok(battery) => battery,
            Err(e) => {
                warn!("Initial battery read failed: {}", e.reason());
                self.executor.close_link().await;
                self.set_disconnected().await;
                return Err(FlightError::Connection(format!("battery read failed: {}", e.reason())));
            }
        };

        if let Err(e) = self.executor.sync_flight_state().await {
            debug!("Flight state resync skipped: {}", e.reason());
        }

        {
            let mut connection = self.connection.lock().await;
            connection.state = ConnectionState::Connected;
            connection.battery_level = battery;
            connection.consecutive_failed_pings = 0;
            connection.last_heartbeat_at = Some(Instant::now());
            connection.drop_signalled = false;
        }
        self.start_heartbeat().await;

        info!("Connected to {} (battery {}%)", self.executor.link_name(), battery);
        self.events.emit(ObserverEvent::BatteryUpdate { battery });
        Ok(())
    }

    async fn set_disconnected(&self) {
        let mut connection = self.connection.lock().await;
        connection.state = ConnectionState::Disconnected;
        connection.consecutive_failed_pings = 0;
        connection.last_heartbeat_at = None;
    }

    async fn start_heartbeat(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let task = tokio::spawn(this.heartbeat_loop());
        if let Some(previous) = self.heartbeat.lock().await.replace(task) {
            previous.abort();
        }
    }

    // Boxed: the loop spawns reconnects, which spawn a fresh heartbeat
    fn heartbeat_loop(self: Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let period = self.config.ping_interval();
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_battery_check = Instant::now();

            loop {
                ticker.tick().await;

                let battery_due = last_battery_check.elapsed() >= self.config.battery_check_interval();
                let probe = if battery_due {
                    self.executor.query_battery().await.map(Some)
                } else {
                    self.executor.query_height().await.map(|_| None)
                };

                match probe {
                    Ok(battery) => {
                        {
                            let mut connection = self.connection.lock().await;
                            if connection.consecutive_failed_pings > 0 {
                                info!("Heartbeat recovered after {} missed pings", connection.consecutive_failed_pings);
                            }
                            connection.consecutive_failed_pings = 0;
                            connection.last_heartbeat_at = Some(Instant::now());
                            if let Some(level) = battery {
                                connection.battery_level = level;
                            }
                        }
                        if let Some(level) = battery {
                            last_battery_check = Instant::now();
                            debug!("Battery check: {}%", level);
                            self.events.emit(ObserverEvent::BatteryUpdate { battery: level });
                        }
                    }
                    Err(e) => {
                        let lost = {
                            let mut connection = self.connection.lock().await;
                            connection.consecutive_failed_pings += 1;
                            warn!(
                                "Heartbeat failed ({}/{}): {}",
                                connection.consecutive_failed_pings,
                                self.config.max_failed_pings,
                                e.reason()
                            );
                            // Misses below the threshold leave the link usable
                            if connection.consecutive_failed_pings >= self.config.max_failed_pings
                                && !connection.drop_signalled
                            {
                                connection.state = ConnectionState::Degraded;
                                connection.drop_signalled = true;
                                Some(e.reason().to_string())
                            } else {
                                None
                            }
                        };

                        if let Some(reason) = lost {
                            self.signal_connection_lost(reason).await;
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn signal_connection_lost(self: &Arc<Self>, reason: String) {
        let drops = self
            .executor
            .with_metrics(|m| {
                m.record_connection_drop();
                m.snapshot().connection_drops
            })
            .await;
        error!("Connection lost after {} missed pings: {}", self.config.max_failed_pings, reason);
        self.events.emit(ObserverEvent::ConnectionLost {
            reason,
            connection_drops: drops,
        });

        // Reconnect on its own task: cleanup stops the heartbeat we are running on
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            if let Err(e) = this.reconnect().await {
                error!("Reconnect gave up: {}", e.reason());
            }
        });
        if let Some(previous) = self.reconnect_task.lock().await.replace(task) {
            previous.abort();
        }
    }

    /// Tear down and reconnect with exponential backoff, up to `max_retries` attempts.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), FlightError> {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return Err(FlightError::Connection("reconnect already in progress".into()));
        }
        // Cleared on drop so an aborted reconnect task does not wedge the flag
        let _in_progress = InProgress(&self.reconnecting);
        self.reconnect_with_backoff().await
    }

    async fn reconnect_with_backoff(self: &Arc<Self>) -> Result<(), FlightError> {
        self.cleanup().await;

        let mut last_error = FlightError::Connection("no reconnect attempts configured".into());
        for attempt in 0..self.config.max_retries {
            let delay = self.config.backoff_delay(attempt);
            {
                let mut connection = self.connection.lock().await;
                connection.retry_count = attempt + 1;
                connection.backoff_interval = delay;
            }
            info!("Reconnect attempt {}/{} in {:?}", attempt + 1, self.config.max_retries, delay);
            tokio::time::sleep(delay).await;

            let result = {
                let _lifecycle = self.lifecycle.lock().await;
                self.connect_locked().await
            };
            match result {
                Ok(()) => {
                    let mut connection = self.connection.lock().await;
                    connection.retry_count = 0;
                    connection.backoff_interval = Duration::ZERO;
                    info!("Reconnected after {} attempt(s)", attempt + 1);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt + 1, e.reason());
                    last_error = e;
                }
            }
        }

        let attempts = self.config.max_retries;
        error!("Link unrecoverable after {} attempts", attempts);
        self.set_disconnected().await;
        self.events.emit(ObserverEvent::LinkFailure {
            attempts,
            reason: last_error.reason().to_string(),
        });
        Err(FlightError::Connection(format!(
            "link unrecoverable after {} attempts: {}",
            attempts,
            last_error.reason()
        )))
    }

    /// Stop the heartbeat, land if airborne, release the link and reset state.
    ///
    /// Never fails and may be called any number of times.
    pub async fn cleanup(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        if let Some(task) = self.heartbeat.lock().await.take() {
            task.abort();
        }

        if self.executor.flight_state().await.is_flying {
            info!("Landing before releasing the link");
            if let Err(e) = self.executor.best_effort_land().await {
                warn!("Best-effort landing failed: {}", e.reason());
            }
        }

        self.executor.close_link().await;
        self.set_disconnected().await;
        debug!("Link cleanup complete");
    }

    /// Cancel any pending reconnect and tear the link down for good.
    pub async fn shutdown(&self) {
        if let Some(task) = self.reconnect_task.lock().await.take() {
            task.abort();
        }
        self.cleanup().await;
    }
}

struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_trusted_only_when_connected() {
        let mut connection = Connection::new();
        connection.battery_level = 70;
        assert_eq!(connection.trusted_battery(), None);

        connection.state = ConnectionState::Connected;
        assert_eq!(connection.trusted_battery(), Some(70));

        connection.state = ConnectionState::Degraded;
        assert_eq!(connection.trusted_battery(), None);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::Degraded.as_str(), "degraded");
        let json = serde_json::to_string(&ConnectionState::Connected).unwrap();
        assert_eq!(json, "\"connected\"");
    }
}
