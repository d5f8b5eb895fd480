use super::model::{MatchedState, Observation, PointMatch, RankedMatch};
use super::probability::HmmProbabilities;
use super::traj::Trajectory;
use super::viterbi::{RankedSequence, SequenceState};
use crate::algorithm::DistanceFunction;
use crate::graph::RoutePath;

pub type MatchedSequence = RankedSequence<PointMatch, Observation, RoutePath>;

/// Log probability of two concatenated partial matches joined by `bridge`.
pub fn merge_log_probability(accumulated: f64, merged: f64, bridge: f64) -> f64 {
    if accumulated == f64::NEG_INFINITY || merged == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    accumulated + merged + bridge
}

fn push_road(road_ids: &mut Vec<String>, road_id: &str) {
    if !road_id.is_empty() && road_ids.last().map(|r| r.as_str()) != Some(road_id) {
        road_ids.push(road_id.to_string());
    }
}

/// Everything needed to fill the trajectory indices no run covers.
pub struct MergeContext<'a> {
    pub trajectory: &'a Trajectory,
    pub candidates: &'a [Vec<PointMatch>],
    pub probabilities: &'a HmmProbabilities,
    pub candidate_radius: f64,
    pub distance: DistanceFunction,
}

impl<'a> MergeContext<'a> {
    pub fn observation(&self, index: usize) -> Observation {
        Observation {
            index,
            point: self.trajectory[index].clone(),
        }
    }

    /// nearest candidate of the observation, or the empty match
    pub fn filler(&self, index: usize) -> MatchedState {
        let observation = self.observation(index);
        let state = match self.candidates[index].first() {
            Some(nearest) => nearest.clone(),
            None => PointMatch::empty(observation.point.point),
        };
        SequenceState {
            state,
            observation,
            transition_descriptor: None,
        }
    }

    /// pessimistic emission of a filler
    pub fn filler_log_probability(&self) -> f64 {
        self.probabilities
            .emission_log_probability(self.candidate_radius)
    }

    /// best case transition between two observations
    pub fn skip_log_probability(&self, from: usize, to: usize) -> f64 {
        let a = &self.trajectory[from];
        let b = &self.trajectory[to];
        let linear = self.distance.distance(&a.point, &b.point);
        let time_diff = (b.time_stamp - a.time_stamp) as f64;
        self.probabilities
            .max_transition_log_probability(linear, time_diff)
    }

    /// Fillers strictly between `last` and `first` (from the trajectory start
    /// when `last` is `None`) and the log probability of crossing them.
    pub fn bridge(&self, last: Option<usize>, first: usize) -> (Vec<MatchedState>, f64) {
        let begin = last.map_or(0, |l| l + 1);
        let fillers: Vec<MatchedState> = (begin..first).map(|i| self.filler(i)).collect();
        let mut log_probability = fillers.len() as f64 * self.filler_log_probability();
        let chain_start = last.unwrap_or(begin);
        for k in chain_start..first {
            log_probability += self.skip_log_probability(k, k + 1);
        }
        (fillers, log_probability)
    }
}

#[derive(Debug, Clone)]
struct Track {
    states: Vec<MatchedState>,
    road_ids: Vec<String>,
    log_probability: f64,
}

/// Per rank accumulation of the partial matches of successive runs.
pub struct RankAccumulator {
    rank_length: usize,
    tracks: Vec<Track>,
    last_index: Option<usize>,
}

impl RankAccumulator {
    pub fn new(rank_length: usize) -> Self {
        RankAccumulator {
            rank_length,
            tracks: Vec::new(),
            last_index: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last_index.is_none()
    }

    /// last trajectory index covered by a merged run
    pub fn last_index(&self) -> Option<usize> {
        self.last_index
    }

    /// Appends the ranked paths of a finished run. Rank `i` of the
    /// accumulator is joined with rank `i` of the run; the side with fewer
    /// ranks repeats its last one. Gaps inside and before the run are
    /// filled with [`MergeContext::filler`].
    pub fn result_merge(&mut self, ctx: &MergeContext, run: Vec<MatchedSequence>) {
        let Some(first) = run.first().and_then(|s| s.states.first()) else {
            return;
        };
        let first_index = first.observation.index;
        if let Some(last) = self.last_index {
            assert!(
                first_index > last,
                "run starting at {} overlaps merged span ending at {}",
                first_index,
                last
            );
        }
        let (fillers, bridge) = ctx.bridge(self.last_index, first_index);
        let parts: Vec<Track> = run.into_iter().map(|s| Self::fill_run(ctx, s)).collect();
        let last_index = parts[0].states.last().map(|s| s.observation.index);

        let empty = vec![Track {
            states: Vec::new(),
            road_ids: Vec::new(),
            log_probability: 0.0,
        }];
        let accumulated = if self.tracks.is_empty() {
            &empty
        } else {
            &self.tracks
        };
        let size = accumulated.len().max(parts.len()).min(self.rank_length);
        let mut merged: Vec<Track> = (0..size)
            .map(|i| {
                let acc = &accumulated[i.min(accumulated.len() - 1)];
                let part = &parts[i.min(parts.len() - 1)];
                let mut states = acc.states.clone();
                states.extend(fillers.iter().cloned());
                states.extend(part.states.iter().cloned());
                let mut road_ids = acc.road_ids.clone();
                for road_id in &part.road_ids {
                    push_road(&mut road_ids, road_id);
                }
                Track {
                    states,
                    road_ids,
                    log_probability: merge_log_probability(
                        acc.log_probability,
                        part.log_probability,
                        bridge,
                    ),
                }
            })
            .collect();
        merged.sort_by(|a, b| b.log_probability.total_cmp(&a.log_probability));
        self.tracks = merged;
        self.last_index = last_index;
    }

    // fills the indices a run skipped over as outliers. the transition of the
    // bridged step already covers the crossing, so only the filler emission is
    // added here, unlike `MergeContext::bridge` which also pays skip transitions
    fn fill_run(ctx: &MergeContext, sequence: MatchedSequence) -> Track {
        let mut states = Vec::with_capacity(sequence.states.len());
        let mut road_ids = Vec::new();
        let mut log_probability = sequence.log_probability;
        for state in sequence.states {
            if let Some(prev) = states.last().map(|s: &MatchedState| s.observation.index) {
                for i in prev + 1..state.observation.index {
                    states.push(ctx.filler(i));
                    log_probability += ctx.filler_log_probability();
                }
            }
            match &state.transition_descriptor {
                Some(route) => {
                    for road_id in &route.road_ids {
                        push_road(&mut road_ids, road_id);
                    }
                }
                None => push_road(&mut road_ids, &state.state.road_id),
            }
            states.push(state);
        }
        Track {
            states,
            road_ids,
            log_probability,
        }
    }

    /// Fills the tail of the trajectory and returns the ranked matches.
    pub fn finish(mut self, ctx: &MergeContext) -> Vec<RankedMatch> {
        let Some(last) = self.last_index else {
            return Vec::new();
        };
        let len = ctx.trajectory.len();
        let mut tail_log_probability = 0.0;
        let mut tail = Vec::new();
        for i in last + 1..len {
            tail.push(ctx.filler(i));
            tail_log_probability += ctx.filler_log_probability() + ctx.skip_log_probability(i - 1, i);
        }
        for track in self.tracks.iter_mut() {
            track.states.extend(tail.iter().cloned());
            track.log_probability =
                merge_log_probability(track.log_probability, 0.0, tail_log_probability);
        }
        self.tracks
            .into_iter()
            .map(|track| RankedMatch {
                probability: (track.log_probability / len as f64).exp(),
                sequence: track.states,
                road_ids: track.road_ids,
                log_probability: track.log_probability,
            })
            .collect()
    }
}

/// Closed index intervals of unmatched points.
///
/// Only breakpoints whose own nearest candidate is farther than
/// `gap_extension_range` seed an interval. Each seed grows in both directions
/// while the neighbor's nearest candidate is farther than
/// `gap_extension_range`; overlapping or adjacent intervals are merged.
pub fn unmatched_intervals(
    break_points: impl IntoIterator<Item = usize>,
    nearest_distances: &[f64],
    gap_extension_range: f64,
) -> Vec<(usize, usize)> {
    let mut intervals: Vec<(usize, usize)> = break_points
        .into_iter()
        .filter(|b| *b < nearest_distances.len() && nearest_distances[*b] > gap_extension_range)
        .map(|b| {
            let mut begin = b;
            while begin > 0 && nearest_distances[begin - 1] > gap_extension_range {
                begin -= 1;
            }
            let mut end = b;
            while end + 1 < nearest_distances.len()
                && nearest_distances[end + 1] > gap_extension_range
            {
                end += 1;
            }
            (begin, end)
        })
        .collect();
    intervals.sort_unstable();
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(intervals.len());
    for (begin, end) in intervals {
        match merged.last_mut() {
            Some(last) if begin <= last.1 + 1 => last.1 = last.1.max(end),
            _ => merged.push((begin, end)),
        }
    }
    merged
}
