use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// Link supervision defaults
const PING_INTERVAL_MS: u64 = 2000;
const BATTERY_CHECK_INTERVAL_MS: u64 = 30_000;
const STANDARD_MAX_FAILED_PINGS: u32 = 3;
const TOLERANT_MAX_FAILED_PINGS: u32 = 10;
const MAX_RETRIES: u32 = 5;
const BACKOFF_BASE_MS: u64 = 1000;
const BACKOFF_CAP_MS: u64 = 15_000;
const CONNECT_TIMEOUT_MS: u64 = 10_000;

// Command executor defaults
const MIN_BATTERY_PERCENT: u8 = 20;
const MIN_HEIGHT_CM: u32 = 20;
const MAX_HEIGHT_CM: u32 = 500;
const GROUND_CLEARANCE_CM: u32 = 10;
const COMMAND_COOLDOWN_MS: u64 = 100;
const COMMAND_TIMEOUT_MS: u64 = 15_000;
const EMERGENCY_TIMEOUT_MS: u64 = 5000;

// Patrol defaults (parameters in meters, geometry in centimeters)
const DEFAULT_PATROL_HEIGHT_M: f32 = 2.0;
const DEFAULT_SIDE_LENGTH_M: f32 = 3.0;
const MIN_PATROL_HEIGHT_M: f32 = 0.2;
const MAX_PATROL_HEIGHT_M: f32 = 5.0;
const MIN_SIDE_LENGTH_M: f32 = 1.0;
const MAX_SIDE_LENGTH_M: f32 = 8.0;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Heartbeat tolerance preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkProfile {
    /// Drop the link after 3 missed pings.
    Standard,
    /// Drop the link after 10 missed pings; for noisy outdoor links.
    Tolerant,
}

impl LinkProfile {
    pub fn max_failed_pings(self) -> u32 {
        match self {
            LinkProfile::Standard => STANDARD_MAX_FAILED_PINGS,
            LinkProfile::Tolerant => TOLERANT_MAX_FAILED_PINGS,
        }
    }
}

impl std::str::FromStr for LinkProfile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Ok(LinkProfile::Standard),
            "tolerant" => Ok(LinkProfile::Tolerant),
            other => Err(ConfigError::Invalid(format!("unknown link profile '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub ping_interval_ms: u64,
    pub battery_check_interval_ms: u64,
    pub max_failed_pings: u32,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: PING_INTERVAL_MS,
            battery_check_interval_ms: BATTERY_CHECK_INTERVAL_MS,
            max_failed_pings: STANDARD_MAX_FAILED_PINGS,
            max_retries: MAX_RETRIES,
            backoff_base_ms: BACKOFF_BASE_MS,
            backoff_cap_ms: BACKOFF_CAP_MS,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
        }
    }
}

impl LinkConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn battery_check_interval(&self) -> Duration {
        Duration::from_millis(self.battery_check_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Delay before reconnect attempt `attempt` (0-based): base × 1.5^attempt, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let scaled = self.backoff_base_ms as f64 * 1.5_f64.powi(attempt as i32);
        Duration::from_millis(scaled.min(self.backoff_cap_ms as f64) as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub min_battery: u8,
    pub min_height_cm: u32,
    pub max_height_cm: u32,
    pub ground_clearance_cm: u32,
    pub cooldown_ms: u64,
    pub command_timeout_ms: u64,
    pub emergency_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            min_battery: MIN_BATTERY_PERCENT,
            min_height_cm: MIN_HEIGHT_CM,
            max_height_cm: MAX_HEIGHT_CM,
            ground_clearance_cm: GROUND_CLEARANCE_CM,
            cooldown_ms: COMMAND_COOLDOWN_MS,
            command_timeout_ms: COMMAND_TIMEOUT_MS,
            emergency_timeout_ms: EMERGENCY_TIMEOUT_MS,
        }
    }
}

impl ExecutorConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn emergency_timeout(&self) -> Duration {
        Duration::from_millis(self.emergency_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatrolConfig {
    pub height_m: f32,
    pub side_length_m: f32,
    pub min_height_m: f32,
    pub max_height_m: f32,
    pub min_side_m: f32,
    pub max_side_m: f32,
    pub buffer_cm: i32,
    pub speed_cm_s: u32,
    pub rotation_speed_deg_s: u32,
    pub stabilization_ms: u64,
    pub min_move_cm: u32,
    pub low_safety_height_cm: u32,
    pub position_tolerance_cm: u32,
    pub scan_samples: u32,
    pub random_points_high_battery: usize,
    pub random_points_low_battery: usize,
    pub random_battery_threshold: u8,
}

impl Default for PatrolConfig {
    fn default() -> Self {
        Self {
            height_m: DEFAULT_PATROL_HEIGHT_M,
            side_length_m: DEFAULT_SIDE_LENGTH_M,
            min_height_m: MIN_PATROL_HEIGHT_M,
            max_height_m: MAX_PATROL_HEIGHT_M,
            min_side_m: MIN_SIDE_LENGTH_M,
            max_side_m: MAX_SIDE_LENGTH_M,
            buffer_cm: 15,
            speed_cm_s: 50,
            rotation_speed_deg_s: 45,
            stabilization_ms: 1000,
            min_move_cm: 20,
            low_safety_height_cm: 20,
            position_tolerance_cm: 20,
            scan_samples: 8,
            random_points_high_battery: 3,
            random_points_low_battery: 1,
            random_battery_threshold: 75,
        }
    }
}

impl PatrolConfig {
    pub fn stabilization(&self) -> Duration {
        Duration::from_millis(self.stabilization_ms)
    }

    /// Estimated time to cover `distance_cm` at the assumed speed, plus the settle margin.
    pub fn travel_time(&self, distance_cm: u32) -> Duration {
        let speed = self.speed_cm_s.max(1) as f64;
        Duration::from_secs_f64(distance_cm as f64 / speed) + self.stabilization()
    }

    /// Estimated time for a rotation of `degrees`, plus the settle margin.
    pub fn rotation_time(&self, degrees: u32) -> Duration {
        let speed = self.rotation_speed_deg_s.max(1) as f64;
        Duration::from_secs_f64(degrees as f64 / speed) + self.stabilization()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub report_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { report_interval_ms: PING_INTERVAL_MS }
    }
}

impl TelemetryConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

/// Complete runtime configuration for one flight session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub link: LinkConfig,
    pub executor: ExecutorConfig,
    pub patrol: PatrolConfig,
    pub telemetry: TelemetryConfig,
}

impl SessionConfig {
    pub fn with_profile(profile: LinkProfile) -> Self {
        let mut config = Self::default();
        config.apply_profile(profile);
        config
    }

    pub fn apply_profile(&mut self, profile: LinkProfile) {
        self.link.max_failed_pings = profile.max_failed_pings();
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.link.max_failed_pings == 0 {
            return Err(ConfigError::Invalid("link.max_failed_pings must be at least 1".into()));
        }
        if self.link.ping_interval_ms == 0 {
            return Err(ConfigError::Invalid("link.ping_interval_ms must be positive".into()));
        }
        if self.link.backoff_cap_ms < self.link.backoff_base_ms {
            return Err(ConfigError::Invalid("link.backoff_cap_ms is below backoff_base_ms".into()));
        }
        if self.executor.min_battery > 100 {
            return Err(ConfigError::Invalid("executor.min_battery is a percentage".into()));
        }
        if self.executor.min_height_cm >= self.executor.max_height_cm {
            return Err(ConfigError::Invalid("executor.min_height_cm must be below max_height_cm".into()));
        }
        let p = &self.patrol;
        if p.min_height_m > p.max_height_m || p.min_side_m > p.max_side_m {
            return Err(ConfigError::Invalid("patrol limits are inverted".into()));
        }
        if !(p.min_height_m..=p.max_height_m).contains(&p.height_m) {
            return Err(ConfigError::Invalid("patrol.height_m outside its limits".into()));
        }
        if !(p.min_side_m..=p.max_side_m).contains(&p.side_length_m) {
            return Err(ConfigError::Invalid("patrol.side_length_m outside its limits".into()));
        }
        if p.speed_cm_s == 0 || p.rotation_speed_deg_s == 0 {
            return Err(ConfigError::Invalid("patrol speeds must be positive".into()));
        }
        if p.max_height_m * 100.0 > self.executor.max_height_cm as f32 {
            return Err(ConfigError::Invalid("patrol.max_height_m exceeds executor.max_height_cm".into()));
        }
        Ok(())
    }
}
