//! # Dronewatch
//!
//! Flight-session and patrol orchestration for a small quadcopter reached
//! over a lossy wireless command link.
//!
//! ## Features
//!
//! - **Connection supervision**: handshake, heartbeat, degradation and bounded reconnection
//! - **Gated command execution**: battery and altitude checks, cooldown, per-command timeouts
//! - **Autonomous patrols**: square, reverse, single-corner and random routes with 360° scans
//! - **Observer protocol**: JSON commands with typed responses and a pushed event stream
//! - **Airborne safety**: low battery lands, link loss triggers an emergency stop
//!
//! ## Quick Start
//!
//! ```no_run
//! use dronewatch::{FlightAgent, SessionConfig, SimulatedDrone};
//! use dronewatch::vision::{BlankVideoSource, NullDetector};
//! use std::sync::Arc;
//!
//! # async fn run() {
//! let agent = FlightAgent::new(
//!     SessionConfig::default(),
//!     Box::new(SimulatedDrone::new()),
//!     Arc::new(BlankVideoSource::new()),
//!     Arc::new(NullDetector),
//! );
//! agent.start().await;
//!
//! let reply = agent.handle_line(r#"{"id":1,"command_type":{"type":"connect"}}"#).await;
//! println!("{}", reply);
//!
//! agent.shutdown().await;
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`agent`] - Application context and command routing
//! - [`connection`] - Link lifecycle, heartbeat and reconnection
//! - [`executor`] - Serialized, safety-gated flight commands
//! - [`patrol`] - Route planning and the patrol state machine
//! - [`telemetry`] - Periodic status reports and the airborne safety watchdog
//! - [`protocol`] - Observer command/response wire format
//! - [`transport`] - The link abstraction; [`sim`] provides an in-process drone

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod agent;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod executor;
pub mod patrol;
pub mod protocol;
pub mod safety;
pub mod sim;
pub mod telemetry;
pub mod transport;
pub mod vision;

// Re-export main public types for convenience
pub use agent::FlightAgent;
pub use config::SessionConfig;
pub use error::{ErrorKind, FlightError, TransportError};
pub use events::{EventBus, ObserverEvent};
pub use protocol::{Command, CommandResponse, CommandType};
pub use sim::SimulatedDrone;
pub use transport::LinkTransport;
