use super::traj::{Trajectory, TrajectoryPoint};
use super::viterbi::{HmmState, SequenceState};
use crate::algorithm::{DistanceFunction, Point};
use crate::graph::{EdgePosition, RoutePath};
use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/**
 * 定义mm需要的一些结构体
 * */

// 坐标点在某个路段上的投影, position为空表示没有候选
#[derive(Debug, Clone, PartialEq)]
pub struct PointMatch {
    pub point: Point,    // 投影点
    pub road_id: String, // 所属道路
    pub position: Option<EdgePosition>,
    pub distance: f64,       // gps点到路段的距离
    pub segment_length: f64, // 路段长度
}

impl PointMatch {
    /// the "no candidate" match, anchored at the raw observation
    pub fn empty(observation: Point) -> Self {
        PointMatch {
            point: observation,
            road_id: String::new(),
            position: None,
            distance: f64::INFINITY,
            segment_length: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_none()
    }
}

impl HmmState for PointMatch {
    fn sort_key(&self) -> f64 {
        self.segment_length
    }

    fn checksum(&self, buf: &mut String) {
        match &self.position {
            Some(p) => {
                let _ = write!(buf, "{}#{}@{:.3}|", self.road_id, p.segment, p.offset);
            }
            None => buf.push_str("-|"),
        }
    }
}

/// One observation of the trajectory being matched.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// index inside the trajectory
    pub index: usize,
    pub point: TrajectoryPoint,
}

pub type MatchedState = SequenceState<PointMatch, Observation, RoutePath>;

/// Why matching could not simply continue at a trajectory index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakType {
    /// the observation has no candidate
    NoCandidate,
    /// no candidate is reachable from the previous matched observation
    BrokenTransition,
    /// a broken transition that became the start of a new matching run
    RestartAfterBreak,
}

#[derive(Debug, Clone)]
pub struct RankedMatch {
    /// one state per trajectory point, fillers included
    pub sequence: Vec<MatchedState>,
    pub road_ids: Vec<String>,
    pub log_probability: f64,
    /// `exp(log_probability / trajectory length)`
    pub probability: f64,
}

impl RankedMatch {
    pub fn matched_points(&self) -> Vec<&PointMatch> {
        self.sequence.iter().map(|s| &s.state).collect()
    }
}

#[derive(Debug, Clone)]
pub struct TrajectoryMatchingResult {
    pub trajectory_id: String,
    /// at most `rank_length` entries, most likely first
    pub ranks: Vec<RankedMatch>,
    pub break_points: BTreeMap<usize, BreakType>,
    pub statistics: MatchStatistics,
}

impl TrajectoryMatchingResult {
    pub fn best(&self) -> Option<&RankedMatch> {
        self.ranks.first()
    }
}

/// Output of matching one trajectory.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub result: TrajectoryMatchingResult,
    pub unmatched: Vec<Trajectory>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchStatistics {
    pub runs: usize,
    pub no_candidate_points: usize,
    pub broken_transitions: usize,
    pub restarts_after_break: usize,
    pub time_gap_restarts: usize,
    pub bridged_points: usize,
    pub unmatched_sub_trajectories: usize,
}

impl MatchStatistics {
    pub fn absorb(&mut self, other: &MatchStatistics) {
        self.runs += other.runs;
        self.no_candidate_points += other.no_candidate_points;
        self.broken_transitions += other.broken_transitions;
        self.restarts_after_break += other.restarts_after_break;
        self.time_gap_restarts += other.time_gap_restarts;
        self.bridged_points += other.bridged_points;
        self.unmatched_sub_trajectories += other.unmatched_sub_trajectories;
    }

    pub fn has_breaks(&self) -> bool {
        self.no_candidate_points + self.broken_transitions + self.restarts_after_break > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStatistics {
    pub trajectories: usize,
    pub matched_trajectories: usize,
    /// trajectories with at least one breakpoint
    pub broken_trajectories: usize,
    /// trajectories whose matching returned an error
    pub failed_trajectories: usize,
    /// trajectories skipped after cancellation
    pub skipped_trajectories: usize,
    pub totals: MatchStatistics,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub candidate_radius: f64,    // 候选半径 米
    pub gap_extension_range: f64, // 未匹配区间的扩展阈值 米
    pub rank_length: usize,       // 输出的匹配数量 K
    pub max_time_gap: f64,        // 相邻点最大时间间隔 秒
    pub sigma: f64,
    pub beta: f64,
    pub max_speed: f64,    // 最大速度 米/秒
    pub route_factor: f64, // 路径长度相对直线距离的上限倍数
    pub max_candidates: Option<usize>,
    pub max_skipped_points: usize,
    pub reverse_tolerance: f64, // 反向公差 米
    pub grid_cell_factor: f64,
    pub compaction_interval: usize,
    pub distance: DistanceFunction,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            candidate_radius: 50.0,
            gap_extension_range: 15.0,
            rank_length: 3,
            max_time_gap: 180.0,
            sigma: 4.07,
            beta: 1.0,
            max_speed: 50.0,
            route_factor: 8.0,
            max_candidates: None,
            max_skipped_points: 1,
            reverse_tolerance: 5.0,
            grid_cell_factor: 2.0,
            compaction_interval: 16,
            distance: DistanceFunction::GreatCircle,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if !(self.candidate_radius > 0.0) {
            anyhow::bail!("candidate radius must be positive");
        }
        if !(self.gap_extension_range > 0.0 && self.gap_extension_range < self.candidate_radius) {
            anyhow::bail!(
                "gap extension range {} must be positive and below the candidate radius {}",
                self.gap_extension_range,
                self.candidate_radius
            );
        }
        if self.rank_length == 0 {
            anyhow::bail!("rank length must be at least 1");
        }
        if !(self.max_time_gap > 0.0) {
            anyhow::bail!("max time gap must be positive");
        }
        if !(self.sigma > 0.0 && self.beta > 0.0) {
            anyhow::bail!("sigma and beta must be positive");
        }
        if !(self.max_speed > 0.0 && self.route_factor > 0.0) {
            anyhow::bail!("max speed and route factor must be positive");
        }
        if self.max_candidates == Some(0) {
            anyhow::bail!("max candidates must be at least 1");
        }
        if !(self.reverse_tolerance >= 0.0) {
            anyhow::bail!("reverse tolerance must not be negative");
        }
        if self.grid_cell_factor < 2.0 {
            anyhow::bail!("grid cell factor must be at least 2");
        }
        if self.compaction_interval == 0 {
            anyhow::bail!("compaction interval must be at least 1");
        }
        Ok(())
    }
}
