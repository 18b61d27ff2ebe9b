//! Patrol geometry.
//!
//! The patrol square lives in a local frame anchored at the home corner
//! (`bottom_right`). Positive x is to the aircraft's left, positive y is
//! forward. There is no localization: positions are bookkeeping derived from
//! the commanded displacements.

use crate::transport::MoveDirection;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// Largest single move the SDK accepts
const MAX_SINGLE_MOVE_CM: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Corner {
    BottomRight,
    TopRight,
    TopLeft,
    BottomLeft,
}

impl Corner {
    pub const HOME: Corner = Corner::BottomRight;

    pub fn name(self) -> &'static str {
        match self {
            Corner::BottomRight => "bottom_right",
            Corner::TopRight => "top_right",
            Corner::TopLeft => "top_left",
            Corner::BottomLeft => "bottom_left",
        }
    }

    /// Position before any buffer inset.
    pub fn raw_position(self, side_cm: i32) -> (i32, i32) {
        match self {
            Corner::BottomRight => (0, 0),
            Corner::TopRight => (0, side_cm),
            Corner::TopLeft => (side_cm, side_cm),
            Corner::BottomLeft => (side_cm, 0),
        }
    }
}

impl FromStr for Corner {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bottom_right" => Ok(Corner::BottomRight),
            "top_right" => Ok(Corner::TopRight),
            "top_left" => Ok(Corner::TopLeft),
            "bottom_left" => Ok(Corner::BottomLeft),
            other => Err(format!("unknown corner '{}'", other)),
        }
    }
}

/// Patrol strategy. Serialized as `clockwise`, `counterclockwise`,
/// `specific:<corner>` or `random`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PatrolKind {
    Clockwise,
    Counterclockwise,
    Specific(Corner),
    Random,
}

impl PatrolKind {
    /// Ordered corners for the fixed strategies. Empty for `Random`.
    pub fn corner_sequence(self) -> Vec<Corner> {
        match self {
            PatrolKind::Clockwise => vec![Corner::TopRight, Corner::TopLeft, Corner::BottomLeft, Corner::BottomRight],
            PatrolKind::Counterclockwise => {
                vec![Corner::BottomLeft, Corner::TopLeft, Corner::TopRight, Corner::BottomRight]
            }
            PatrolKind::Specific(corner) => vec![corner],
            PatrolKind::Random => Vec::new(),
        }
    }
}

impl fmt::Display for PatrolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatrolKind::Clockwise => write!(f, "clockwise"),
            PatrolKind::Counterclockwise => write!(f, "counterclockwise"),
            PatrolKind::Specific(corner) => write!(f, "specific:{}", corner.name()),
            PatrolKind::Random => write!(f, "random"),
        }
    }
}

impl FromStr for PatrolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clockwise" | "square" => Ok(PatrolKind::Clockwise),
            "counterclockwise" => Ok(PatrolKind::Counterclockwise),
            "random" => Ok(PatrolKind::Random),
            other => match other.strip_prefix("specific:") {
                Some(corner) => Ok(PatrolKind::Specific(corner.parse()?)),
                None => Err(format!("unknown patrol type '{}'", other)),
            },
        }
    }
}

impl TryFrom<String> for PatrolKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PatrolKind> for String {
    fn from(kind: PatrolKind) -> Self {
        kind.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Waypoint {
    pub name: String,
    pub x_cm: i32,
    pub y_cm: i32,
    pub height_cm: u32,
}

impl Waypoint {
    pub fn new(name: impl Into<String>, x_cm: i32, y_cm: i32, height_cm: u32) -> Self {
        Self { name: name.into(), x_cm, y_cm, height_cm }
    }

    pub fn home(height_cm: u32) -> Self {
        Self::new(Corner::HOME.name(), 0, 0, height_cm)
    }

    pub fn displacement_to(&self, other: &Waypoint) -> (i32, i32) {
        (other.x_cm - self.x_cm, other.y_cm - self.y_cm)
    }

    pub fn same_position(&self, other: &Waypoint) -> bool {
        self.x_cm == other.x_cm && self.y_cm == other.y_cm
    }
}

/// Inputs for planning one route.
#[derive(Debug, Clone, Copy)]
pub struct RouteGeometry {
    pub side_cm: i32,
    pub height_cm: u32,
    pub buffer_cm: i32,
    pub random_points: usize,
}

/// Ordered waypoints for one run. Fixed once the run starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    kind: PatrolKind,
    home: Waypoint,
    waypoints: Vec<Waypoint>,
}

impl Route {
    pub fn plan<R: Rng + ?Sized>(kind: PatrolKind, geometry: &RouteGeometry, rng: &mut R) -> Self {
        match kind {
            PatrolKind::Random => Self::random(geometry, rng),
            _ => Self::corners(kind, geometry.side_cm, geometry.height_cm).with_buffer(geometry.buffer_cm),
        }
    }

    /// Corner route without the buffer inset.
    pub fn corners(kind: PatrolKind, side_cm: i32, height_cm: u32) -> Self {
        let waypoints = kind
            .corner_sequence()
            .into_iter()
            .map(|corner| {
                let (x, y) = corner.raw_position(side_cm);
                Waypoint::new(corner.name(), x, y, height_cm)
            })
            .collect();

        Self {
            kind,
            home: Waypoint::home(height_cm),
            waypoints,
        }
    }

    /// Pull every non-zero coordinate in by `buffer_cm` so the aircraft stays
    /// inside the square's edges.
    pub fn with_buffer(mut self, buffer_cm: i32) -> Self {
        let inset = |v: i32| if v > 0 { (v - buffer_cm).max(0) } else { v };
        for waypoint in &mut self.waypoints {
            waypoint.x_cm = inset(waypoint.x_cm);
            waypoint.y_cm = inset(waypoint.y_cm);
        }
        self
    }

    /// Uniformly random interior points, already inside the buffer.
    pub fn random<R: Rng + ?Sized>(geometry: &RouteGeometry, rng: &mut R) -> Self {
        let low = geometry.buffer_cm.max(0);
        let high = (geometry.side_cm - geometry.buffer_cm).max(low);
        let waypoints = (1..=geometry.random_points)
            .map(|i| {
                let x = rng.gen_range(low..=high);
                let y = rng.gen_range(low..=high);
                Waypoint::new(format!("random_{}", i), x, y, geometry.height_cm)
            })
            .collect();

        Self {
            kind: PatrolKind::Random,
            home: Waypoint::home(geometry.height_cm),
            waypoints,
        }
    }

    pub fn kind(&self) -> PatrolKind {
        self.kind
    }

    pub fn home(&self) -> &Waypoint {
        &self.home
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }
}

/// Horizontal move commands covering `(dx, dy)`. Components shorter than
/// `min_move_cm` are skipped.
pub fn horizontal_moves(dx: i32, dy: i32, min_move_cm: u32) -> Vec<(MoveDirection, u32)> {
    let mut moves = Vec::new();

    let x_direction = if dx > 0 { MoveDirection::Left } else { MoveDirection::Right };
    push_split(&mut moves, x_direction, dx.unsigned_abs(), min_move_cm);

    let y_direction = if dy > 0 { MoveDirection::Forward } else { MoveDirection::Back };
    push_split(&mut moves, y_direction, dy.unsigned_abs(), min_move_cm);

    moves
}

/// Vertical move from `current_cm` to `target_cm`, if the change is large enough.
pub fn vertical_move(current_cm: u32, target_cm: u32, min_move_cm: u32) -> Option<(MoveDirection, u32)> {
    let delta = current_cm.abs_diff(target_cm);
    if delta < min_move_cm.max(1) {
        return None;
    }
    let direction = if target_cm > current_cm { MoveDirection::Up } else { MoveDirection::Down };
    Some((direction, delta))
}

fn push_split(moves: &mut Vec<(MoveDirection, u32)>, direction: MoveDirection, distance: u32, min_move_cm: u32) {
    if distance < min_move_cm.max(1) {
        return;
    }
    // Equal legs so no leg falls under the SDK minimum
    let legs = (distance + MAX_SINGLE_MOVE_CM - 1) / MAX_SINGLE_MOVE_CM;
    let base = distance / legs;
    let remainder = distance % legs;
    for leg in 0..legs {
        moves.push((direction, base + u32::from(leg < remainder)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_first_clockwise_leg_before_and_after_buffer() {
        let raw = Route::corners(PatrolKind::Clockwise, 300, 200);
        let home = raw.home().clone();
        let first = &raw.waypoints()[0];
        assert_eq!(first.name, "top_right");
        assert_eq!(home.displacement_to(first), (0, 300));

        let buffered = raw.with_buffer(15);
        assert_eq!(home.displacement_to(&buffered.waypoints()[0]), (0, 285));
        assert_eq!(buffered.waypoints()[1].x_cm, 285);
        assert_eq!(buffered.waypoints()[3], Waypoint::home(200));
    }

    #[test]
    fn test_sequences() {
        let names = |kind: PatrolKind| -> Vec<&'static str> {
            kind.corner_sequence().into_iter().map(Corner::name).collect()
        };
        assert_eq!(names(PatrolKind::Clockwise), ["top_right", "top_left", "bottom_left", "bottom_right"]);
        assert_eq!(
            names(PatrolKind::Counterclockwise),
            ["bottom_left", "top_left", "top_right", "bottom_right"]
        );
        assert_eq!(names(PatrolKind::Specific(Corner::TopLeft)), ["top_left"]);
    }

    #[test]
    fn test_kind_parsing_and_serde() {
        assert_eq!("specific:top_left".parse::<PatrolKind>().unwrap(), PatrolKind::Specific(Corner::TopLeft));
        assert_eq!("square".parse::<PatrolKind>().unwrap(), PatrolKind::Clockwise);
        assert!("specific:middle".parse::<PatrolKind>().is_err());
        assert!("zigzag".parse::<PatrolKind>().is_err());

        let json = serde_json::to_string(&PatrolKind::Specific(Corner::BottomLeft)).unwrap();
        assert_eq!(json, "\"specific:bottom_left\"");
        let back: PatrolKind = serde_json::from_str("\"counterclockwise\"").unwrap();
        assert_eq!(back, PatrolKind::Counterclockwise);
    }

    #[test]
    fn test_move_planning() {
        assert_eq!(horizontal_moves(0, 285, 20), vec![(MoveDirection::Forward, 285)]);
        assert_eq!(
            horizontal_moves(-285, -10, 20),
            vec![(MoveDirection::Right, 285)],
            "10cm component is below the jitter threshold"
        );
        assert_eq!(
            horizontal_moves(770, 0, 20),
            vec![(MoveDirection::Left, 385), (MoveDirection::Left, 385)]
        );

        assert_eq!(vertical_move(80, 200, 20), Some((MoveDirection::Up, 120)));
        assert_eq!(vertical_move(200, 20, 20), Some((MoveDirection::Down, 180)));
        assert_eq!(vertical_move(200, 190, 20), None);
    }

    #[test]
    fn test_random_points_stay_inside_buffer() {
        let geometry = RouteGeometry { side_cm: 300, height_cm: 150, buffer_cm: 15, random_points: 3 };
        let mut rng = StdRng::seed_from_u64(7);
        let route = Route::plan(PatrolKind::Random, &geometry, &mut rng);

        assert_eq!(route.waypoints().len(), 3);
        for waypoint in route.waypoints() {
            assert!((15..=285).contains(&waypoint.x_cm));
            assert!((15..=285).contains(&waypoint.y_cm));
            assert_eq!(waypoint.height_cm, 150);
        }
        assert_eq!(route.waypoints()[2].name, "random_3");
    }
}
