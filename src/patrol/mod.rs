//! Autonomous patrol: route geometry, run bookkeeping and the state machine
//! that drives the command executor through a run.

pub mod engine;
pub mod route;
pub mod run;

pub use engine::{PatrolEngine, PatrolParameters, PatrolReport, PatrolStatus};
pub use route::{Corner, PatrolKind, Route, RouteGeometry, Waypoint};
pub use run::{CompletionStatus, PatrolHistory, PatrolRun};
