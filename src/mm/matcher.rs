use super::index::GridIndex;
use super::merge::{unmatched_intervals, MergeContext, RankAccumulator};
use super::model::{
    BatchStatistics, BreakType, Config, MatchOutcome, MatchStatistics, Observation, PointMatch,
    TrajectoryMatchingResult,
};
use super::probability::HmmProbabilities;
use super::traj::Trajectory;
use super::viterbi::{RankedViterbi, TimeStep};
use crate::graph::{EdgePosition, Network, RoutePath, RoutingGraph};
use anyhow::Result;
use log::{debug, info, warn};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

type Decoder = RankedViterbi<PointMatch, Observation, RoutePath>;

/// One Viterbi run over a contiguous stretch of the trajectory.
struct Run {
    decoder: Decoder,
    last: usize,
}

enum Phase {
    /// start a run at the first index `>= at` that has candidates
    Seek { at: usize },
    Matching(Run),
    Done,
}

/// What the step handler wants the control loop to do next.
enum Instruction {
    Continue(Run),
    /// finalize the run and seek from `at`
    Restart { run: Run, at: usize },
    Finish(Run),
}

/// Matches of a batch of trajectories.
#[derive(Debug, Clone, Default)]
pub struct BatchOutput {
    /// one result per matched trajectory, input order
    pub results: Vec<TrajectoryMatchingResult>,
    pub unmatched: Vec<Trajectory>,
    pub statistics: BatchStatistics,
}

/// Per trajectory state owned by one matching call.
struct Session<'a> {
    trajectory: &'a Trajectory,
    candidates: Vec<Vec<PointMatch>>,
    break_points: BTreeMap<usize, BreakType>,
    statistics: MatchStatistics,
}

impl<'a> Session<'a> {
    fn mark(&mut self, index: usize, kind: BreakType) {
        debug!(
            "trajectory {} breakpoint {:?} at {}",
            self.trajectory.id(),
            kind,
            index
        );
        self.break_points.insert(index, kind);
    }

    fn time_diff(&self, from: usize, to: usize) -> f64 {
        (self.trajectory[to].time_stamp - self.trajectory[from].time_stamp) as f64
    }
}

/// HMM map matcher. The routing graph and the grid index are built once and
/// only read afterwards, so one matcher can serve many threads.
pub struct MapMatcher {
    graph: RoutingGraph,
    index: GridIndex,
    probabilities: HmmProbabilities,
    config: Config,
}

impl MapMatcher {
    pub fn new(network: &Network, config: Config) -> Result<Self> {
        config.validate()?;
        let bbox = network.bounding_box()?;
        let graph = RoutingGraph::new(network, config.distance)?
            .with_reverse_tolerance(config.reverse_tolerance);
        let index = GridIndex::build(
            &bbox,
            graph.segments(),
            config.candidate_radius,
            config.grid_cell_factor,
            config.distance,
        )?;
        let probabilities =
            HmmProbabilities::new(config.sigma, config.beta, config.max_speed, config.route_factor);
        info!("construct map matching success... ");
        Ok(MapMatcher {
            graph,
            index,
            probabilities,
            config,
        })
    }

    // 查询候选者
    pub fn candidates(&self, observation: &crate::algorithm::Point) -> Vec<PointMatch> {
        let mut candidates = self.index.query(observation, self.config.candidate_radius);
        if let Some(limit) = self.config.max_candidates {
            candidates.truncate(limit);
        }
        candidates
    }

    fn observation(trajectory: &Trajectory, index: usize) -> Observation {
        Observation {
            index,
            point: trajectory[index].clone(),
        }
    }

    fn emissions(&self, candidates: &[PointMatch]) -> Vec<f64> {
        candidates
            .iter()
            .map(|c| self.probabilities.emission_log_probability(c.distance))
            .collect()
    }

    fn build_step(
        &self,
        session: &Session,
        prev: usize,
        cur: usize,
    ) -> TimeStep<PointMatch, Observation, RoutePath> {
        let trajectory = session.trajectory;
        let time_diff = session.time_diff(prev, cur);
        let linear = self
            .config
            .distance
            .distance(&trajectory[prev].point, &trajectory[cur].point);
        // 给出两个轨迹点最大路径长度限制
        let max_distance = self
            .probabilities
            .max_route_length(linear.max(self.config.candidate_radius), time_diff);
        let candidates = session.candidates[cur].clone();
        let emissions = self.emissions(&candidates);
        let (slots, targets): (Vec<usize>, Vec<EdgePosition>) = candidates
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.position.map(|p| (i, p)))
            .unzip();
        let mut step = TimeStep::new(Self::observation(trajectory, cur), candidates, emissions);
        for (pi, prev_candidate) in session.candidates[prev].iter().enumerate() {
            let Some(from) = prev_candidate.position else {
                continue;
            };
            let routes = self.graph.shortest_distances(from, &targets, max_distance);
            for (ci, route) in slots.iter().copied().zip(routes) {
                if let Some(route) = route {
                    let log_probability = self.probabilities.transition_log_probability(
                        route.distance,
                        linear,
                        time_diff,
                    );
                    step.add_transition(pi, ci, log_probability, Some(route));
                }
            }
        }
        step
    }

    fn start_run(&self, session: &Session, at: usize) -> Run {
        let mut decoder = Decoder::new(self.config.rank_length, self.config.compaction_interval);
        let candidates = session.candidates[at].clone();
        let emissions = self.emissions(&candidates);
        decoder.start_with_initial_observation(
            Self::observation(session.trajectory, at),
            candidates,
            emissions,
        );
        Run { decoder, last: at }
    }

    /// Feeds the next observation to the run and decides how to continue.
    fn advance(&self, session: &mut Session, mut run: Run) -> Instruction {
        let len = session.trajectory.len();
        let next = run.last + 1;
        if next >= len {
            return Instruction::Finish(run);
        }
        if session.candidates[next].is_empty() {
            return Instruction::Restart { run, at: next };
        }
        if session.time_diff(run.last, next) > self.config.max_time_gap {
            session.statistics.time_gap_restarts += 1;
            debug!(
                "trajectory {} time gap restart at {}",
                session.trajectory.id(),
                next
            );
            return Instruction::Restart { run, at: next };
        }

        run.decoder.next_step(self.build_step(session, run.last, next));
        if !run.decoder.is_broken() {
            run.last = next;
            return Instruction::Continue(run);
        }
        session.mark(next, BreakType::BrokenTransition);
        session.statistics.broken_transitions += 1;

        // 尝试跳过离群点, 从断点前的message继续
        let bridge_end = (next + self.config.max_skipped_points).min(len - 1);
        for target in next + 1..=bridge_end {
            if session.candidates[target].is_empty()
                || session.time_diff(run.last, target) > self.config.max_time_gap
            {
                break;
            }
            run.decoder.set_to_unbroken();
            run.decoder
                .next_step(self.build_step(session, run.last, target));
            if !run.decoder.is_broken() {
                for skipped in next + 1..target {
                    session.mark(skipped, BreakType::BrokenTransition);
                    session.statistics.broken_transitions += 1;
                }
                session.statistics.bridged_points += target - next;
                run.last = target;
                return Instruction::Continue(run);
            }
        }

        // the break point itself becomes the start of the next run
        session.mark(next, BreakType::RestartAfterBreak);
        session.statistics.broken_transitions -= 1;
        session.statistics.restarts_after_break += 1;
        Instruction::Restart { run, at: next }
    }

    pub fn match_trajectory(&self, trajectory: &Trajectory) -> Result<MatchOutcome> {
        let len = trajectory.len();
        let mut session = Session {
            trajectory,
            candidates: trajectory
                .points()
                .iter()
                .map(|p| self.candidates(&p.point))
                .collect(),
            break_points: BTreeMap::new(),
            statistics: MatchStatistics::default(),
        };
        let mut accumulator = RankAccumulator::new(self.config.rank_length);
        let mut empty_decode = false;

        let mut phase = Phase::Seek { at: 0 };
        loop {
            phase = match phase {
                Phase::Seek { at } => {
                    if let Some(last) = accumulator.last_index() {
                        debug_assert!(at > last, "seek at {} inside merged span", at);
                    }
                    let mut start = at;
                    while start < len && session.candidates[start].is_empty() {
                        session.mark(start, BreakType::NoCandidate);
                        session.statistics.no_candidate_points += 1;
                        start += 1;
                    }
                    if start >= len {
                        Phase::Done
                    } else {
                        let run = self.start_run(&session, start);
                        if run.decoder.is_broken() {
                            session.mark(start, BreakType::BrokenTransition);
                            session.statistics.broken_transitions += 1;
                            Phase::Seek { at: start + 1 }
                        } else {
                            session.statistics.runs += 1;
                            Phase::Matching(run)
                        }
                    }
                }
                Phase::Matching(run) => match self.advance(&mut session, run) {
                    Instruction::Continue(run) => Phase::Matching(run),
                    Instruction::Restart { run, at } => {
                        if self.finalize(&session, &mut accumulator, run) {
                            Phase::Seek { at }
                        } else {
                            empty_decode = true;
                            Phase::Done
                        }
                    }
                    Instruction::Finish(run) => {
                        empty_decode = !self.finalize(&session, &mut accumulator, run);
                        Phase::Done
                    }
                },
                Phase::Done => break,
            };
        }

        if empty_decode || accumulator.is_empty() {
            session.statistics.unmatched_sub_trajectories = 1;
            return Ok(MatchOutcome {
                result: TrajectoryMatchingResult {
                    trajectory_id: trajectory.id().to_string(),
                    ranks: Vec::new(),
                    break_points: session.break_points,
                    statistics: session.statistics,
                },
                unmatched: vec![trajectory.clone()],
            });
        }

        let ranks = accumulator.finish(&self.merge_context(&session));
        let nearest: Vec<f64> = session
            .candidates
            .iter()
            .map(|c| c.first().map_or(f64::INFINITY, |m| m.distance))
            .collect();
        let mut unmatched = Vec::new();
        for (begin, end) in unmatched_intervals(
            session.break_points.keys().copied(),
            &nearest,
            self.config.gap_extension_range,
        ) {
            unmatched.push(trajectory.sub(begin, end + 1)?);
        }
        session.statistics.unmatched_sub_trajectories = unmatched.len();
        debug!(
            "trajectory {} matched with {} ranks, {} breakpoints",
            trajectory.id(),
            ranks.len(),
            session.break_points.len()
        );
        Ok(MatchOutcome {
            result: TrajectoryMatchingResult {
                trajectory_id: trajectory.id().to_string(),
                ranks,
                break_points: session.break_points,
                statistics: session.statistics,
            },
            unmatched,
        })
    }

    /// Decodes a finished run into the accumulator, false on an empty decode.
    fn finalize(&self, session: &Session, accumulator: &mut RankAccumulator, run: Run) -> bool {
        let sequences = run.decoder.compute_most_likely_sequence();
        if sequences.is_empty() {
            warn!(
                "trajectory {} produced an empty decode at {}",
                session.trajectory.id(),
                run.last
            );
            return false;
        }
        accumulator.result_merge(&self.merge_context(session), sequences);
        true
    }

    fn merge_context<'s>(&'s self, session: &'s Session) -> MergeContext<'s> {
        MergeContext {
            trajectory: session.trajectory,
            candidates: &session.candidates,
            probabilities: &self.probabilities,
            candidate_radius: self.config.candidate_radius,
            distance: self.config.distance,
        }
    }

    /// Matches one trajectory; a failure turns it into one unmatched entry.
    fn match_isolated(&self, trajectory: &Trajectory) -> (MatchOutcome, bool) {
        match self.match_trajectory(trajectory) {
            Ok(outcome) => (outcome, false),
            Err(e) => {
                warn!("match trajectory {} failed: {:#}", trajectory.id(), e);
                let outcome = MatchOutcome {
                    result: TrajectoryMatchingResult {
                        trajectory_id: trajectory.id().to_string(),
                        ranks: Vec::new(),
                        break_points: BTreeMap::new(),
                        statistics: MatchStatistics {
                            unmatched_sub_trajectories: 1,
                            ..MatchStatistics::default()
                        },
                    },
                    unmatched: vec![trajectory.clone()],
                };
                (outcome, true)
            }
        }
    }

    fn collect(outcomes: Vec<Option<(MatchOutcome, bool)>>) -> BatchOutput {
        let mut output = BatchOutput::default();
        for outcome in outcomes {
            output.statistics.trajectories += 1;
            let Some((outcome, failed)) = outcome else {
                output.statistics.skipped_trajectories += 1;
                continue;
            };
            let stats = &mut output.statistics;
            if failed {
                stats.failed_trajectories += 1;
            }
            if !outcome.result.ranks.is_empty() {
                stats.matched_trajectories += 1;
            }
            if outcome.result.statistics.has_breaks() {
                stats.broken_trajectories += 1;
            }
            stats.totals.absorb(&outcome.result.statistics);
            output.results.push(outcome.result);
            output.unmatched.extend(outcome.unmatched);
        }
        info!(
            "batch finished: {} trajectories, {} matched, {} broken, {} failed, {} skipped",
            output.statistics.trajectories,
            output.statistics.matched_trajectories,
            output.statistics.broken_trajectories,
            output.statistics.failed_trajectories,
            output.statistics.skipped_trajectories
        );
        output
    }

    /// Sequential batch, results in input order.
    pub fn match_trajectories(&self, trajectories: &[Trajectory]) -> BatchOutput {
        let outcomes = trajectories
            .iter()
            .map(|t| Some(self.match_isolated(t)))
            .collect();
        Self::collect(outcomes)
    }

    /// Sequential batch that stops picking up trajectories once `cancel` is set.
    pub fn match_trajectories_with_cancel(
        &self,
        trajectories: &[Trajectory],
        cancel: &AtomicBool,
    ) -> BatchOutput {
        let outcomes = trajectories
            .iter()
            .map(|t| {
                if cancel.load(Ordering::Relaxed) {
                    None
                } else {
                    Some(self.match_isolated(t))
                }
            })
            .collect();
        Self::collect(outcomes)
    }

    /// Batch over the rayon pool. `cancel` is checked before each trajectory.
    pub fn match_trajectories_parallel(
        &self,
        trajectories: &[Trajectory],
        cancel: Option<&AtomicBool>,
    ) -> BatchOutput {
        let outcomes = trajectories
            .par_iter()
            .map(|t| {
                if cancel.map_or(false, |c| c.load(Ordering::Relaxed)) {
                    None
                } else {
                    Some(self.match_isolated(t))
                }
            })
            .collect();
        Self::collect(outcomes)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::algorithm::{DistanceFunction, Point};
    use crate::mm::traj::TrajectoryPoint;
    use crate::utils::log::log_init;

    fn config() -> Config {
        Config {
            candidate_radius: 20.0,
            gap_extension_range: 8.0,
            rank_length: 3,
            beta: 1.0,
            distance: DistanceFunction::Euclidean,
            ..Config::default()
        }
    }

    // w1: (0,0) -> (100,0) -> (200,0), w2: (200,0) -> (300,0)
    // w3: (0,200) -> (300,200), not connected to the others
    fn network() -> Network {
        let mut network = Network::new();
        network.add_node("a", Point(0.0, 0.0)).unwrap();
        network.add_node("b", Point(100.0, 0.0)).unwrap();
        network.add_node("c", Point(200.0, 0.0)).unwrap();
        network.add_node("d", Point(300.0, 0.0)).unwrap();
        network.add_node("e", Point(0.0, 200.0)).unwrap();
        network.add_node("f", Point(300.0, 200.0)).unwrap();
        network.add_way("w1", &["a", "b", "c"]).unwrap();
        network.add_way("w2", &["c", "d"]).unwrap();
        network.add_way("w3", &["e", "f"]).unwrap();
        network
    }

    fn trajectory(points: &[(f64, f64, i64)]) -> Trajectory {
        Trajectory::new(
            "t",
            points
                .iter()
                .map(|(x, y, t)| TrajectoryPoint::new(*x, *y, *t))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_clean_trajectory_recovers_ways() {
        log_init();
        let matcher = MapMatcher::new(&network(), config()).unwrap();
        let traj = trajectory(&[
            (10.0, 0.0, 0),
            (60.0, 0.0, 5),
            (140.0, 0.0, 13),
            (190.0, 0.0, 18),
            (250.0, 0.0, 24),
            (290.0, 0.0, 28),
        ]);
        let outcome = matcher.match_trajectory(&traj).unwrap();
        let best = outcome.result.best().unwrap();
        assert_eq!(best.road_ids, vec!["w1", "w2"]);
        assert!(best.probability > 0.0);
        assert_eq!(best.sequence.len(), traj.len());
        assert!(outcome.result.break_points.is_empty());
        assert!(outcome.unmatched.is_empty());
        assert!(outcome.result.ranks.len() <= 3);
    }

    #[test]
    fn test_ranks_are_distinct() {
        let matcher = MapMatcher::new(&network(), config()).unwrap();
        // close to w1 and to the start of w2 around c
        let traj = trajectory(&[(150.0, 2.0, 0), (198.0, 3.0, 5), (205.0, 3.0, 6)]);
        let outcome = matcher.match_trajectory(&traj).unwrap();
        let ranks = &outcome.result.ranks;
        assert!(!ranks.is_empty());
        for i in 0..ranks.len() {
            for j in i + 1..ranks.len() {
                let a: Vec<_> = ranks[i].matched_points().into_iter().cloned().collect();
                let b: Vec<_> = ranks[j].matched_points().into_iter().cloned().collect();
                assert_ne!(a, b);
            }
            if i > 0 {
                assert!(ranks[i - 1].log_probability >= ranks[i].log_probability);
            }
        }
    }

    #[test]
    fn test_point_without_candidate_is_unmatched() {
        let matcher = MapMatcher::new(&network(), config()).unwrap();
        let traj = trajectory(&[
            (10.0, 0.0, 0),
            (50.0, 2.0, 5),
            (90.0, 100.0, 10),
            (130.0, 1.0, 15),
            (170.0, 0.0, 20),
        ]);
        let outcome = matcher.match_trajectory(&traj).unwrap();
        assert_eq!(
            outcome.result.break_points.get(&2),
            Some(&BreakType::NoCandidate)
        );
        assert_eq!(outcome.unmatched.len(), 1);
        assert_eq!(outcome.unmatched[0].len(), 1);
        assert_eq!(outcome.unmatched[0][0].time_stamp, 10);
        let best = outcome.result.best().unwrap();
        assert_eq!(best.sequence.len(), 5);
        assert!(best.sequence[2].state.is_empty());
        assert_eq!(best.road_ids, vec!["w1"]);
        assert_eq!(outcome.result.statistics.runs, 2);
    }

    #[test]
    fn test_disconnected_jump_restarts() {
        let matcher = MapMatcher::new(&network(), config()).unwrap();
        let traj = trajectory(&[
            (10.0, 0.0, 0),
            (60.0, 0.0, 5),
            (100.0, 195.0, 10),
            (150.0, 195.0, 15),
        ]);
        let outcome = matcher.match_trajectory(&traj).unwrap();
        assert_eq!(
            outcome.result.break_points.get(&2),
            Some(&BreakType::RestartAfterBreak)
        );
        let best = outcome.result.best().unwrap();
        assert_eq!(best.road_ids, vec!["w1", "w3"]);
        assert_eq!(best.sequence[2].state.road_id, "w3");
        assert_eq!(outcome.result.statistics.restarts_after_break, 1);
        assert_eq!(outcome.result.statistics.broken_transitions, 0);
    }

    #[test]
    fn test_restart_point_on_road_not_unmatched() {
        let matcher = MapMatcher::new(&network(), config()).unwrap();
        let traj = trajectory(&[
            (10.0, 0.0, 0),
            (60.0, 0.0, 5),
            (100.0, 195.0, 10),
            (150.0, 195.0, 15),
        ]);
        let outcome = matcher.match_trajectory(&traj).unwrap();
        // the restart point is 5 m from w3 and matched by the second run
        assert!(outcome.result.break_points.contains_key(&2));
        assert!(outcome.unmatched.is_empty());
        assert_eq!(outcome.result.statistics.unmatched_sub_trajectories, 0);
    }

    #[test]
    fn test_backward_jitter_stays_matched() {
        let matcher = MapMatcher::new(&network(), config()).unwrap();
        let traj = trajectory(&[
            (10.0, 0.0, 0),
            (60.0, 0.0, 5),
            (59.0, 0.0, 10),
            (60.5, 0.0, 15),
            (100.0, 0.0, 20),
        ]);
        let outcome = matcher.match_trajectory(&traj).unwrap();
        assert!(outcome.result.break_points.is_empty());
        assert!(outcome.unmatched.is_empty());
        assert_eq!(outcome.result.statistics.bridged_points, 0);
        assert_eq!(outcome.result.statistics.runs, 1);
        let best = outcome.result.best().unwrap();
        assert_eq!(best.road_ids, vec!["w1"]);
        let jitter = best.sequence[2].state.position.unwrap();
        assert_eq!(jitter.segment, 0);
        assert!((jitter.offset - 59.0).abs() < 1e-9);
        let route = best.sequence[2].transition_descriptor.as_ref().unwrap();
        assert_eq!(route.distance, 0.0);
    }

    #[test]
    fn test_max_candidates_keeps_nearest() {
        let point = Point(198.0, 3.0);
        let matcher = MapMatcher::new(&network(), config()).unwrap();
        assert_eq!(matcher.candidates(&point).len(), 2);
        let capped = MapMatcher::new(
            &network(),
            Config {
                max_candidates: Some(1),
                ..config()
            },
        )
        .unwrap();
        let candidates = capped.candidates(&point);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].position.unwrap().segment, 1);
        assert!((candidates[0].distance - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_outlier_is_bridged() {
        let matcher = MapMatcher::new(&network(), config()).unwrap();
        let traj = trajectory(&[
            (10.0, 0.0, 0),
            (60.0, 0.0, 5),
            (80.0, 190.0, 7),
            (110.0, 0.0, 10),
            (160.0, 0.0, 15),
        ]);
        let outcome = matcher.match_trajectory(&traj).unwrap();
        assert_eq!(
            outcome.result.break_points.get(&2),
            Some(&BreakType::BrokenTransition)
        );
        assert_eq!(outcome.result.statistics.bridged_points, 1);
        assert_eq!(outcome.result.statistics.runs, 1);
        let best = outcome.result.best().unwrap();
        assert_eq!(best.road_ids, vec!["w1"]);
        // filler keeps the nearest candidate of the outlier
        assert_eq!(best.sequence[2].state.road_id, "w3");
        assert_eq!(best.sequence[2].transition_descriptor, None);
    }

    #[test]
    fn test_time_gap_forces_restart() {
        let matcher = MapMatcher::new(&network(), config()).unwrap();
        let traj = trajectory(&[(10.0, 0.0, 0), (60.0, 0.0, 5), (140.0, 0.0, 500), (190.0, 0.0, 505)]);
        let outcome = matcher.match_trajectory(&traj).unwrap();
        assert_eq!(outcome.result.statistics.time_gap_restarts, 1);
        assert_eq!(outcome.result.statistics.runs, 2);
        assert!(outcome.result.break_points.is_empty());
        assert_eq!(outcome.result.best().unwrap().road_ids, vec!["w1"]);
    }

    #[test]
    fn test_far_trajectory_entirely_unmatched() {
        let matcher = MapMatcher::new(&network(), config()).unwrap();
        let traj = trajectory(&[(150.0, 100.0, 0), (160.0, 100.0, 5)]);
        let outcome = matcher.match_trajectory(&traj).unwrap();
        assert!(outcome.result.ranks.is_empty());
        assert_eq!(outcome.unmatched.len(), 1);
        assert_eq!(outcome.unmatched[0].len(), 2);
    }

    #[test]
    fn test_batch_keeps_order_and_counts() {
        let matcher = MapMatcher::new(&network(), config()).unwrap();
        let good = trajectory(&[(10.0, 0.0, 0), (60.0, 0.0, 5)]);
        let far = Trajectory::new(
            "far",
            vec![TrajectoryPoint::new(150.0, 100.0, 0)],
        )
        .unwrap();
        let batch = vec![good.clone(), far, good];
        let sequential = matcher.match_trajectories(&batch);
        let parallel = matcher.match_trajectories_parallel(&batch, None);
        assert_eq!(sequential.statistics, parallel.statistics);
        assert_eq!(sequential.statistics.trajectories, 3);
        assert_eq!(sequential.statistics.matched_trajectories, 2);
        assert_eq!(sequential.results[1].trajectory_id, "far");
        assert_eq!(sequential.unmatched.len(), 1);

        let cancel = AtomicBool::new(true);
        let cancelled = matcher.match_trajectories_with_cancel(&batch, &cancel);
        assert!(cancelled.results.is_empty());
        assert_eq!(cancelled.statistics.skipped_trajectories, 3);
    }

    #[test]
    fn test_parallel_batch_honors_cancel() {
        let matcher = MapMatcher::new(&network(), config()).unwrap();
        let good = trajectory(&[(10.0, 0.0, 0), (60.0, 0.0, 5)]);
        let batch = vec![good.clone(), good.clone(), good];

        let running = AtomicBool::new(false);
        let parallel = matcher.match_trajectories_parallel(&batch, Some(&running));
        assert_eq!(parallel.results.len(), 3);
        assert_eq!(parallel.statistics.matched_trajectories, 3);
        assert_eq!(parallel.statistics.skipped_trajectories, 0);

        let cancel = AtomicBool::new(true);
        let cancelled = matcher.match_trajectories_parallel(&batch, Some(&cancel));
        assert!(cancelled.results.is_empty());
        assert!(cancelled.unmatched.is_empty());
        assert_eq!(cancelled.statistics.trajectories, 3);
        assert_eq!(cancelled.statistics.skipped_trajectories, 3);
    }
}
