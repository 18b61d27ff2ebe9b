//! Simulated aircraft implementing [`LinkTransport`].
//!
//! Used by the simulator binary and by the test suite. Besides modelling
//! height, heading and battery drain, it supports two kinds of faults:
//!
//! - **Scripted faults** set through [`SimControl`] (refused handshake, link
//!   down, rejected commands, a hung emergency stop)
//! - **Probabilistic faults** drawn from a deterministic LCG so a run with the
//!   same seed fails the same way every time

use crate::error::TransportError;
use crate::transport::{LinkTransport, MoveDirection, RotateDirection};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const DEFAULT_BATTERY_PERCENT: u8 = 85;
const TAKEOFF_HEIGHT_CM: u32 = 80;
const DEFAULT_LATENCY_MS: u64 = 10;
const DRAIN_PER_MOTION_PERCENT: f32 = 0.25;
const RNG_SEED: u64 = 0x1234_5678_9ABC_DEF0;

/// Probabilistic fault injection, disabled by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFaultConfig {
    pub enabled: bool,
    pub query_drop_percent: f32,
    pub command_reject_percent: f32,
}

impl Default for SimFaultConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            query_drop_percent: 2.0,
            command_reject_percent: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimStats {
    pub total_calls: u32,
    pub rejected_commands: u32,
    pub dropped_queries: u32,
    pub emergency_stops: u32,
}

#[derive(Debug)]
struct SimState {
    link_open: bool,
    flying: bool,
    height_cm: u32,
    heading_deg: i32,
    battery: f32,
    latency: Duration,

    refuse_handshake: bool,
    fail_battery_read: bool,
    link_down: bool,
    hang_emergency: bool,
    rejected: HashSet<&'static str>,

    fault_config: SimFaultConfig,
    stats: SimStats,
    calls: Vec<String>,
    rng_state: u64,
}

impl SimState {
    fn new(battery: u8) -> Self {
        Self {
            link_open: false,
            flying: false,
            height_cm: 0,
            heading_deg: 0,
            battery: battery.min(100) as f32,
            latency: Duration::from_millis(DEFAULT_LATENCY_MS),
            refuse_handshake: false,
            fail_battery_read: false,
            link_down: false,
            hang_emergency: false,
            rejected: HashSet::new(),
            fault_config: SimFaultConfig::default(),
            stats: SimStats::default(),
            calls: Vec::new(),
            rng_state: RNG_SEED,
        }
    }

    fn record(&mut self, call: String) {
        self.stats.total_calls += 1;
        self.calls.push(call);
    }

    fn check_link(&self, what: &'static str) -> Result<(), TransportError> {
        if !self.link_open {
            return Err(TransportError::NotConnected);
        }
        if self.link_down {
            return Err(TransportError::Timeout(what));
        }
        Ok(())
    }

    fn check_command(&mut self, name: &'static str) -> Result<(), TransportError> {
        self.check_link(name)?;
        if self.rejected.contains(name) {
            self.stats.rejected_commands += 1;
            return Err(TransportError::Rejected(format!("{} refused by aircraft", name)));
        }
        if self.fault_config.enabled && self.roll(self.fault_config.command_reject_percent) {
            self.stats.rejected_commands += 1;
            return Err(TransportError::Rejected(format!("{} lost on link", name)));
        }
        Ok(())
    }

    fn check_query(&mut self, name: &'static str) -> Result<(), TransportError> {
        self.check_link(name)?;
        if self.fault_config.enabled && self.roll(self.fault_config.query_drop_percent) {
            self.stats.dropped_queries += 1;
            return Err(TransportError::Timeout(name));
        }
        Ok(())
    }

    fn require_flying(&self, name: &str) -> Result<(), TransportError> {
        if self.flying {
            Ok(())
        } else {
            Err(TransportError::Rejected(format!("{}: aircraft not flying", name)))
        }
    }

    fn drain(&mut self) {
        self.battery = (self.battery - DRAIN_PER_MOTION_PERCENT).max(0.0);
    }

    // Linear Congruential Generator (Numerical Recipes parameters)
    fn next_random(&mut self) -> u64 {
        self.rng_state = self.rng_state.wrapping_mul(1664525).wrapping_add(1013904223);
        self.rng_state
    }

    fn roll(&mut self, rate_percent: f32) -> bool {
        let value = (self.next_random() as f32) / (u64::MAX as f32);
        value < rate_percent / 100.0
    }
}

/// Shared handle for scripting faults and inspecting the simulated aircraft
/// after it has been boxed into the executor.
#[derive(Debug, Clone)]
pub struct SimControl {
    state: Arc<Mutex<SimState>>,
}

impl SimControl {
    pub async fn set_battery(&self, percent: u8) {
        self.state.lock().await.battery = percent.min(100) as f32;
    }

    pub async fn set_link_down(&self, down: bool) {
        self.state.lock().await.link_down = down;
    }

    pub async fn set_refuse_handshake(&self, refuse: bool) {
        self.state.lock().await.refuse_handshake = refuse;
    }

    pub async fn set_fail_battery_read(&self, fail: bool) {
        self.state.lock().await.fail_battery_read = fail;
    }

    /// Make the aircraft hang forever on the emergency command.
    pub async fn set_hang_emergency(&self, hang: bool) {
        self.state.lock().await.hang_emergency = hang;
    }

    /// Reject every future call of `command` ("takeoff", "land", "move", "rotate", "emergency").
    pub async fn reject(&self, command: &'static str) {
        self.state.lock().await.rejected.insert(command);
    }

    pub async fn accept(&self, command: &'static str) {
        self.state.lock().await.rejected.remove(command);
    }

    pub async fn set_latency(&self, latency: Duration) {
        self.state.lock().await.latency = latency;
    }

    pub async fn set_fault_config(&self, config: SimFaultConfig) {
        self.state.lock().await.fault_config = config;
    }

    pub async fn is_flying(&self) -> bool {
        self.state.lock().await.flying
    }

    pub async fn height(&self) -> u32 {
        self.state.lock().await.height_cm
    }

    pub async fn is_link_open(&self) -> bool {
        self.state.lock().await.link_open
    }

    pub async fn stats(&self) -> SimStats {
        self.state.lock().await.stats.clone()
    }

    /// Every call made on the transport, in order.
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    /// Calls that command the aircraft, excluding telemetry queries and link management.
    pub async fn motion_calls(&self) -> Vec<String> {
        self.calls()
            .await
            .into_iter()
            .filter(|c| {
                c == "takeoff"
                    || c == "land"
                    || c == "emergency"
                    || c.starts_with("move ")
                    || c.starts_with("rotate ")
            })
            .collect()
    }

    pub async fn count(&self, prefix: &str) -> usize {
        self.state.lock().await.calls.iter().filter(|c| c.starts_with(prefix)).count()
    }
}

pub struct SimulatedDrone {
    name: String,
    control: SimControl,
}

impl SimulatedDrone {
    pub fn new() -> Self {
        Self::with_battery(DEFAULT_BATTERY_PERCENT)
    }

    pub fn with_battery(percent: u8) -> Self {
        Self {
            name: "sim".to_string(),
            control: SimControl {
                state: Arc::new(Mutex::new(SimState::new(percent))),
            },
        }
    }

    pub fn control(&self) -> SimControl {
        self.control.clone()
    }

    async fn settle(&self) {
        let latency = self.control.state.lock().await.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for SimulatedDrone {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LinkTransport for SimulatedDrone {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        {
            let mut s = self.control.state.lock().await;
            s.record("connect".into());
            if s.refuse_handshake || s.link_down {
                return Err(TransportError::Handshake("no response from aircraft".into()));
            }
            s.link_open = true;
        }
        self.settle().await;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut s = self.control.state.lock().await;
        s.record("disconnect".into());
        s.link_open = false;
        Ok(())
    }

    async fn takeoff(&mut self) -> Result<(), TransportError> {
        {
            let mut s = self.control.state.lock().await;
            s.record("takeoff".into());
            s.check_command("takeoff")?;
            if s.flying {
                return Err(TransportError::Rejected("takeoff: already flying".into()));
            }
            s.flying = true;
            s.height_cm = TAKEOFF_HEIGHT_CM;
            s.drain();
        }
        self.settle().await;
        Ok(())
    }

    async fn land(&mut self) -> Result<(), TransportError> {
        {
            let mut s = self.control.state.lock().await;
            s.record("land".into());
            s.check_command("land")?;
            s.require_flying("land")?;
            s.flying = false;
            s.height_cm = 0;
            s.drain();
        }
        self.settle().await;
        Ok(())
    }

    async fn move_by(&mut self, direction: MoveDirection, distance_cm: u32) -> Result<(), TransportError> {
        {
            let mut s = self.control.state.lock().await;
            s.record(format!("move {} {}", direction.as_str(), distance_cm));
            s.check_command("move")?;
            s.require_flying("move")?;
            match direction {
                MoveDirection::Up => s.height_cm += distance_cm,
                MoveDirection::Down => s.height_cm = s.height_cm.saturating_sub(distance_cm),
                _ => {}
            }
            s.drain();
        }
        self.settle().await;
        Ok(())
    }

    async fn rotate(&mut self, direction: RotateDirection, degrees: u32) -> Result<(), TransportError> {
        {
            let mut s = self.control.state.lock().await;
            s.record(format!("rotate {} {}", direction.as_str(), degrees));
            s.check_command("rotate")?;
            s.require_flying("rotate")?;
            let delta = (degrees % 360) as i32;
            s.heading_deg = match direction {
                RotateDirection::Clockwise => (s.heading_deg + delta).rem_euclid(360),
                RotateDirection::CounterClockwise => (s.heading_deg - delta).rem_euclid(360),
            };
            s.drain();
        }
        self.settle().await;
        Ok(())
    }

    async fn emergency(&mut self) -> Result<(), TransportError> {
        let hang = {
            let mut s = self.control.state.lock().await;
            s.record("emergency".into());
            s.stats.emergency_stops += 1;
            s.hang_emergency
        };
        if hang {
            return std::future::pending().await;
        }
        let mut s = self.control.state.lock().await;
        s.check_command("emergency")?;
        s.flying = false;
        s.height_cm = 0;
        Ok(())
    }

    async fn battery(&mut self) -> Result<u8, TransportError> {
        let mut s = self.control.state.lock().await;
        s.record("battery".into());
        s.check_query("battery")?;
        if s.fail_battery_read {
            return Err(TransportError::Io("battery read returned garbage".into()));
        }
        Ok(s.battery.round() as u8)
    }

    async fn height(&mut self) -> Result<u32, TransportError> {
        let mut s = self.control.state.lock().await;
        s.record("height".into());
        s.check_query("height")?;
        Ok(s.height_cm)
    }

    async fn heading(&mut self) -> Result<i32, TransportError> {
        let mut s = self.control.state.lock().await;
        s.record("heading".into());
        s.check_query("heading")?;
        Ok(s.heading_deg)
    }

    async fn is_flying(&mut self) -> Result<bool, TransportError> {
        let mut s = self.control.state.lock().await;
        s.record("is_flying".into());
        s.check_query("is_flying")?;
        Ok(s.flying)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_flight_model() {
        let mut drone = SimulatedDrone::new();
        let control = drone.control();

        drone.connect().await.unwrap();
        assert_eq!(drone.battery().await.unwrap(), 85);
        drone.takeoff().await.unwrap();
        assert_eq!(drone.height().await.unwrap(), 80);

        drone.move_by(MoveDirection::Up, 120).await.unwrap();
        assert_eq!(drone.height().await.unwrap(), 200);
        drone.rotate(RotateDirection::CounterClockwise, 90).await.unwrap();
        assert_eq!(drone.heading().await.unwrap(), 270);

        drone.land().await.unwrap();
        assert!(!control.is_flying().await);
        assert_eq!(control.motion_calls().await.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_faults() {
        let mut drone = SimulatedDrone::new();
        let control = drone.control();

        control.set_refuse_handshake(true).await;
        assert!(matches!(drone.connect().await, Err(TransportError::Handshake(_))));
        control.set_refuse_handshake(false).await;
        drone.connect().await.unwrap();

        control.reject("takeoff").await;
        assert!(matches!(drone.takeoff().await, Err(TransportError::Rejected(_))));
        assert_eq!(control.stats().await.rejected_commands, 1);

        control.set_link_down(true).await;
        assert!(matches!(drone.height().await, Err(TransportError::Timeout("height"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_require_open_link() {
        let mut drone = SimulatedDrone::new();
        assert_eq!(drone.takeoff().await, Err(TransportError::NotConnected));
    }

    #[test]
    fn test_random_rolls_are_deterministic() {
        let mut a = SimState::new(50);
        let mut b = SimState::new(50);
        let rolls_a: Vec<bool> = (0..32).map(|_| a.roll(50.0)).collect();
        let rolls_b: Vec<bool> = (0..32).map(|_| b.roll(50.0)).collect();
        assert_eq!(rolls_a, rolls_b);
        assert!(rolls_a.iter().any(|r| *r));
        assert!(rolls_a.iter().any(|r| !*r));
    }
}
