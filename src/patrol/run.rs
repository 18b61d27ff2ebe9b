use super::route::PatrolKind;
use crate::protocol::current_timestamp_ms;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

const MAX_HISTORY_RUNS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    Stopped,
    Emergency,
    Error,
}

/// A finished patrol run. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatrolRun {
    pub id: u32,
    pub patrol_type: PatrolKind,
    pub start_time: u64,
    pub end_time: u64,
    pub duration_s: f32,
    pub corners_visited: Vec<String>,
    pub scans_completed: u32,
    pub distance_traveled_cm: u32,
    pub battery_start: u8,
    pub battery_end: Option<u8>,
    pub battery_used: Option<u8>,
    pub errors_encountered: Vec<String>,
    pub completion_status: CompletionStatus,
    pub detection_count: u32,
    pub threat_count: u32,
    pub avg_height_deviation_cm: Option<f32>,
    pub avg_scan_duration_s: Option<f32>,
    pub patrol_size_m: f32,
    pub patrol_height_m: f32,
}

/// Mutable bookkeeping for the run in progress, owned by the patrol worker.
#[derive(Debug)]
pub(crate) struct ActiveRun {
    pub id: u32,
    kind: PatrolKind,
    start_time: u64,
    started: Instant,
    battery_start: u8,
    patrol_size_m: f32,
    patrol_height_m: f32,
    corners_visited: Vec<String>,
    scans_completed: u32,
    distance_traveled_cm: u32,
    errors: Vec<String>,
    detection_count: u32,
    threat_count: u32,
    height_deviations_cm: Vec<u32>,
    scan_durations: Vec<Duration>,
    pub stopped_early: bool,
}

impl ActiveRun {
    pub fn new(id: u32, kind: PatrolKind, battery_start: u8, patrol_size_m: f32, patrol_height_m: f32) -> Self {
        Self {
            id,
            kind,
            start_time: current_timestamp_ms(),
            started: Instant::now(),
            battery_start,
            patrol_size_m,
            patrol_height_m,
            corners_visited: Vec::new(),
            scans_completed: 0,
            distance_traveled_cm: 0,
            errors: Vec::new(),
            detection_count: 0,
            threat_count: 0,
            height_deviations_cm: Vec::new(),
            scan_durations: Vec::new(),
            stopped_early: false,
        }
    }

    pub fn visit(&mut self, waypoint: &str) {
        self.corners_visited.push(waypoint.to_string());
    }

    pub fn distance_traveled_cm(&self) -> u32 {
        self.distance_traveled_cm
    }

    pub fn add_distance(&mut self, distance_cm: u32) {
        self.distance_traveled_cm = self.distance_traveled_cm.saturating_add(distance_cm);
    }

    pub fn record_scan(&mut self, duration: Duration) {
        self.scans_completed += 1;
        self.scan_durations.push(duration);
    }

    pub fn record_detection(&mut self, is_threat: bool) {
        self.detection_count += 1;
        if is_threat {
            self.threat_count += 1;
        }
    }

    pub fn record_height_deviation(&mut self, deviation_cm: u32) {
        self.height_deviations_cm.push(deviation_cm);
    }

    pub fn record_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn finalize(self, status: CompletionStatus, battery_end: Option<u8>) -> PatrolRun {
        let avg_height_deviation_cm = average(self.height_deviations_cm.iter().map(|&d| d as f32));
        let avg_scan_duration_s = average(self.scan_durations.iter().map(Duration::as_secs_f32));

        PatrolRun {
            id: self.id,
            patrol_type: self.kind,
            start_time: self.start_time,
            end_time: current_timestamp_ms(),
            duration_s: self.started.elapsed().as_secs_f32(),
            corners_visited: self.corners_visited,
            scans_completed: self.scans_completed,
            distance_traveled_cm: self.distance_traveled_cm,
            battery_start: self.battery_start,
            battery_end,
            battery_used: battery_end.map(|end| self.battery_start.saturating_sub(end)),
            errors_encountered: self.errors,
            completion_status: status,
            detection_count: self.detection_count,
            threat_count: self.threat_count,
            avg_height_deviation_cm,
            avg_scan_duration_s,
            patrol_size_m: self.patrol_size_m,
            patrol_height_m: self.patrol_height_m,
        }
    }
}

fn average(values: impl Iterator<Item = f32>) -> Option<f32> {
    let (sum, count) = values.fold((0.0, 0u32), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f32)
}

/// Finished runs, oldest first. Readers get copies; only the patrol engine appends.
#[derive(Debug, Clone, Default)]
pub struct PatrolHistory {
    runs: Arc<RwLock<VecDeque<PatrolRun>>>,
}

impl PatrolHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn push(&self, run: PatrolRun) {
        let mut runs = self.runs.write().await;
        if runs.len() >= MAX_HISTORY_RUNS {
            runs.pop_front();
        }
        runs.push_back(run);
    }

    pub async fn snapshot(&self) -> Vec<PatrolRun> {
        self.runs.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_finalize_computes_summary() {
        let mut run = ActiveRun::new(1, PatrolKind::Clockwise, 90, 3.0, 2.0);
        run.visit("top_right");
        run.add_distance(285);
        run.record_height_deviation(4);
        run.record_height_deviation(8);
        run.record_scan(Duration::from_secs(9));
        run.record_detection(false);
        run.record_detection(true);
        tokio::time::advance(Duration::from_secs(30)).await;

        let finished = run.finalize(CompletionStatus::Completed, Some(82));
        assert_eq!(finished.corners_visited, vec!["top_right"]);
        assert_eq!(finished.battery_used, Some(8));
        assert_eq!(finished.avg_height_deviation_cm, Some(6.0));
        assert_eq!(finished.avg_scan_duration_s, Some(9.0));
        assert_eq!(finished.detection_count, 2);
        assert_eq!(finished.threat_count, 1);
        assert!(finished.duration_s >= 30.0);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let history = PatrolHistory::new();
        for id in 0..(MAX_HISTORY_RUNS as u32 + 5) {
            let run = ActiveRun::new(id, PatrolKind::Random, 80, 3.0, 2.0);
            history.push(run.finalize(CompletionStatus::Stopped, None)).await;
        }
        assert_eq!(history.len().await, MAX_HISTORY_RUNS);
        assert_eq!(history.snapshot().await[0].id, 5);
        assert_eq!(history.snapshot().await.last().unwrap().battery_used, None);
    }
}
