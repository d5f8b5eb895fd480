use log::trace;
use std::cmp::{Ordering, Reverse};
use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::{BinaryHeap, HashMap};
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// A hidden state of the decoder.
pub trait HmmState: Clone + PartialEq {
    /// stable key, only used to break probability ties deterministically
    fn sort_key(&self) -> f64;
    /// appends this state's contribution to a path checksum
    fn checksum(&self, buf: &mut String);
}

/// One observation with its candidates and the probabilities that link it to
/// the previous step. Transition keys are `(previous candidate, candidate)`
/// indices; a missing key means there is no transition edge.
#[derive(Debug, Clone)]
pub struct TimeStep<S, O, D> {
    pub observation: O,
    pub candidates: Vec<S>,
    pub emission_log_probabilities: Vec<f64>,
    pub transition_log_probabilities: HashMap<(usize, usize), f64>,
    pub transition_descriptors: HashMap<(usize, usize), D>,
}

impl<S, O, D> TimeStep<S, O, D> {
    pub fn new(observation: O, candidates: Vec<S>, emission_log_probabilities: Vec<f64>) -> Self {
        assert_eq!(
            candidates.len(),
            emission_log_probabilities.len(),
            "one emission probability per candidate"
        );
        TimeStep {
            observation,
            candidates,
            emission_log_probabilities,
            transition_log_probabilities: HashMap::new(),
            transition_descriptors: HashMap::new(),
        }
    }

    pub fn add_transition(
        &mut self,
        prev: usize,
        cur: usize,
        log_probability: f64,
        descriptor: Option<D>,
    ) {
        self.transition_log_probabilities
            .insert((prev, cur), log_probability);
        if let Some(descriptor) = descriptor {
            self.transition_descriptors.insert((prev, cur), descriptor);
        }
    }
}

/// Node of the back-pointer graph. Back-pointers are slots of the previous
/// generation, ordered from the most to the least likely predecessor.
#[derive(Debug, Clone)]
pub struct ExtendedState<S, D> {
    pub state: S,
    back_pointers: Vec<usize>,
    transition_descriptors: Vec<Option<D>>,
    probabilities: Vec<f64>,
}

impl<S, D> ExtendedState<S, D> {
    /// # Panics
    /// when the three per back-pointer lists differ in length
    pub fn new(
        state: S,
        back_pointers: Vec<usize>,
        transition_descriptors: Vec<Option<D>>,
        probabilities: Vec<f64>,
    ) -> Self {
        assert!(
            back_pointers.len() == transition_descriptors.len()
                && back_pointers.len() == probabilities.len(),
            "back pointers, descriptors and probabilities must have the same length"
        );
        ExtendedState {
            state,
            back_pointers,
            transition_descriptors,
            probabilities,
        }
    }

    fn leaf(state: S, probability: f64) -> Self {
        ExtendedState {
            state,
            back_pointers: Vec::new(),
            transition_descriptors: Vec::new(),
            probabilities: vec![probability],
        }
    }

    /// cumulative log probability through the best predecessor
    pub fn best_probability(&self) -> f64 {
        self.probabilities[0]
    }

    pub fn back_pointers(&self) -> &[usize] {
        &self.back_pointers
    }
}

struct Generation<S, O, D> {
    observation: O,
    states: Vec<ExtendedState<S, D>>,
}

/// Best cumulative log probability per candidate of the latest step.
#[derive(Debug, Clone, PartialEq)]
pub struct Message<S> {
    pub candidates: Vec<S>,
    pub log_probabilities: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceState<S, O, D> {
    pub state: S,
    pub observation: O,
    /// transition from the predecessor, `None` for the first state
    pub transition_descriptor: Option<D>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedSequence<S, O, D> {
    pub states: Vec<SequenceState<S, O, D>>,
    pub log_probability: f64,
}

struct Scored<T> {
    score: f64,
    key: f64,
    checksum: u64,
    item: T,
}

impl<T> Scored<T> {
    fn rank(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.key.total_cmp(&self.key))
            .then_with(|| other.checksum.cmp(&self.checksum))
    }
}

impl<T> PartialEq for Scored<T> {
    fn eq(&self, other: &Self) -> bool {
        self.rank(other) == Ordering::Equal
    }
}

impl<T> Eq for Scored<T> {}

impl<T> PartialOrd for Scored<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Scored<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank(other)
    }
}

/// Keeps the `k` best entries with distinct checksums, best first.
fn top_k_distinct<T>(items: impl IntoIterator<Item = Scored<T>>, k: usize) -> Vec<Scored<T>> {
    let mut best: HashMap<u64, Scored<T>> = HashMap::new();
    for item in items {
        match best.entry(item.checksum) {
            Entry::Occupied(mut e) => {
                if item > *e.get() {
                    e.insert(item);
                }
            }
            Entry::Vacant(e) => {
                e.insert(item);
            }
        }
    }
    let mut heap = BinaryHeap::with_capacity(k + 1);
    for item in best.into_values() {
        heap.push(Reverse(item));
        if heap.len() > k {
            heap.pop();
        }
    }
    let mut out: Vec<Scored<T>> = heap.into_iter().map(|Reverse(s)| s).collect();
    out.sort_by(|a, b| b.cmp(a));
    out
}

fn fold_checksum<S: HmmState>(prev: u64, state: &S) -> u64 {
    let mut buf = String::new();
    state.checksum(&mut buf);
    let mut hasher = DefaultHasher::new();
    prev.hash(&mut hasher);
    buf.hash(&mut hasher);
    hasher.finish()
}

// decoded suffix of a path, oldest link first
struct Link {
    generation: usize,
    slot: usize,
    choice: usize,
    next: Option<Rc<Link>>,
}

struct Partial {
    head: usize,
    tail: Option<Rc<Link>>,
}

/// Rank-K Viterbi decoder.
///
/// Keeps a single best value per candidate in the message and up to K
/// back-pointers per extended state, so the K most likely distinct paths can
/// be recovered at the end. Extended states live in an arena with one
/// generation per accepted step; states no longer reachable from the latest
/// generation are swept every `compaction_interval` steps.
pub struct RankedViterbi<S, O, D> {
    rank_length: usize,
    compaction_interval: usize,
    generations: Vec<Generation<S, O, D>>,
    message: Option<Message<S>>,
    frontier: Vec<Option<usize>>,
    broken: bool,
    steps_since_compaction: usize,
    compacted_below: usize,
}

impl<S: HmmState, O: Clone, D: Clone> RankedViterbi<S, O, D> {
    pub fn new(rank_length: usize, compaction_interval: usize) -> Self {
        assert!(rank_length > 0, "rank length must be at least 1");
        RankedViterbi {
            rank_length,
            compaction_interval: compaction_interval.max(1),
            generations: Vec::new(),
            message: None,
            frontier: Vec::new(),
            broken: false,
            steps_since_compaction: 0,
            compacted_below: 0,
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Clears the broken flag. The message is still the one of the last
    /// accepted step, so matching resumes from there with a later step.
    pub fn set_to_unbroken(&mut self) {
        self.broken = false;
    }

    pub fn message(&self) -> Option<&Message<S>> {
        self.message.as_ref()
    }

    /// extended states currently held by the arena
    pub fn live_states(&self) -> usize {
        self.generations.iter().map(|g| g.states.len()).sum()
    }

    /// # Panics
    /// when the decoder was already started
    pub fn start_with_initial_observation(
        &mut self,
        observation: O,
        candidates: Vec<S>,
        emission_log_probabilities: Vec<f64>,
    ) {
        assert!(self.message.is_none(), "decoder already started");
        assert_eq!(
            candidates.len(),
            emission_log_probabilities.len(),
            "one emission probability per candidate"
        );
        let mut states = Vec::new();
        let mut frontier = Vec::with_capacity(candidates.len());
        for (candidate, probability) in candidates.iter().zip(&emission_log_probabilities) {
            if *probability == f64::NEG_INFINITY {
                frontier.push(None);
                continue;
            }
            frontier.push(Some(states.len()));
            states.push(ExtendedState::leaf(candidate.clone(), *probability));
        }
        self.broken = states.is_empty();
        self.generations.push(Generation {
            observation,
            states,
        });
        self.frontier = frontier;
        self.message = Some(Message {
            candidates,
            log_probabilities: emission_log_probabilities,
        });
    }

    /// Advances by one step. When no candidate can be reached the step is
    /// rejected, the decoder becomes broken and the message is left as is.
    ///
    /// # Panics
    /// when called before the initial observation or while broken
    pub fn next_step(&mut self, step: TimeStep<S, O, D>) {
        assert!(!self.broken, "next_step called on a broken decoder");
        let Some(message) = self.message.as_ref() else {
            panic!("next_step called before start_with_initial_observation");
        };
        let TimeStep {
            observation,
            candidates,
            emission_log_probabilities,
            transition_log_probabilities,
            mut transition_descriptors,
        } = step;
        assert_eq!(
            candidates.len(),
            emission_log_probabilities.len(),
            "one emission probability per candidate"
        );

        let prev_checksums: Vec<u64> = message
            .candidates
            .iter()
            .map(|c| fold_checksum(0, c))
            .collect();
        // 当前候选 -> 入边 (前一候选, 转移概率)
        let mut inbound: Vec<Vec<(usize, f64)>> = vec![Vec::new(); candidates.len()];
        for (&(prev, cur), &log_probability) in &transition_log_probabilities {
            if prev >= message.candidates.len() || cur >= candidates.len() {
                continue;
            }
            if self.frontier[prev].is_none() {
                continue;
            }
            let score = message.log_probabilities[prev] + log_probability;
            if score > f64::NEG_INFINITY {
                inbound[cur].push((prev, score));
            }
        }

        let mut log_probabilities = vec![f64::NEG_INFINITY; candidates.len()];
        let mut best_inbound = Vec::with_capacity(candidates.len());
        for (cur, edges) in inbound.into_iter().enumerate() {
            let ranked = top_k_distinct(
                edges.into_iter().map(|(prev, score)| Scored {
                    score,
                    key: message.candidates[prev].sort_key(),
                    checksum: prev_checksums[prev],
                    item: prev,
                }),
                self.rank_length,
            );
            let emission = emission_log_probabilities[cur];
            if let Some(best) = ranked.first() {
                log_probabilities[cur] = best.score + emission;
            }
            best_inbound.push(ranked);
        }

        if log_probabilities.iter().all(|p| *p == f64::NEG_INFINITY) {
            trace!("no candidate reachable, decoder broken");
            self.broken = true;
            return;
        }

        let mut states = Vec::new();
        let mut frontier = Vec::with_capacity(candidates.len());
        for (cur, ranked) in best_inbound.into_iter().enumerate() {
            if log_probabilities[cur] == f64::NEG_INFINITY {
                frontier.push(None);
                continue;
            }
            let emission = emission_log_probabilities[cur];
            let mut back_pointers = Vec::with_capacity(ranked.len());
            let mut descriptors = Vec::with_capacity(ranked.len());
            let mut probabilities = Vec::with_capacity(ranked.len());
            for entry in ranked {
                let prev = entry.item;
                back_pointers.push(self.frontier[prev].unwrap_or_default());
                descriptors.push(transition_descriptors.remove(&(prev, cur)));
                probabilities.push(entry.score + emission);
            }
            frontier.push(Some(states.len()));
            states.push(ExtendedState::new(
                candidates[cur].clone(),
                back_pointers,
                descriptors,
                probabilities,
            ));
        }

        self.generations.push(Generation {
            observation,
            states,
        });
        self.frontier = frontier;
        self.message = Some(Message {
            candidates,
            log_probabilities,
        });
        self.steps_since_compaction += 1;
        if self.steps_since_compaction >= self.compaction_interval {
            self.compact();
            self.steps_since_compaction = 0;
        }
    }

    /// Drops extended states that no path from the latest generation can
    /// reach and remaps the back-pointers of their successors.
    pub fn compact(&mut self) {
        if self.generations.len() < 2 {
            return;
        }
        let last = self.generations.len() - 1;
        let mut changed = true;
        for g in (1..=last).rev() {
            if !changed && g < self.compacted_below {
                break;
            }
            let (older, newer) = self.generations.split_at_mut(g);
            let prev = &mut older[g - 1];
            let cur = &mut newer[0];
            let mut keep = vec![false; prev.states.len()];
            for state in &cur.states {
                for bp in &state.back_pointers {
                    keep[*bp] = true;
                }
            }
            changed = keep.iter().any(|k| !k);
            if !changed {
                continue;
            }
            let mut remap = vec![usize::MAX; keep.len()];
            let mut next = 0;
            for (slot, kept) in keep.iter().enumerate() {
                if *kept {
                    remap[slot] = next;
                    next += 1;
                }
            }
            let mut slot = 0;
            prev.states.retain(|_| {
                let kept = keep[slot];
                slot += 1;
                kept
            });
            for state in cur.states.iter_mut() {
                for bp in state.back_pointers.iter_mut() {
                    *bp = remap[*bp];
                }
            }
        }
        self.compacted_below = last;
        trace!("arena compacted, {} live states", self.live_states());
    }

    /// Up to `rank_length` most likely distinct paths ending at the latest
    /// accepted step, most likely first. Empty before the first step.
    pub fn compute_most_likely_sequence(&self) -> Vec<RankedSequence<S, O, D>> {
        let (Some(message), Some(last)) = (self.message.as_ref(), self.generations.len().checked_sub(1))
        else {
            return Vec::new();
        };
        let finals = top_k_distinct(
            message
                .candidates
                .iter()
                .zip(&message.log_probabilities)
                .zip(&self.frontier)
                .filter_map(|((candidate, probability), slot)| {
                    let slot = (*slot)?;
                    if *probability == f64::NEG_INFINITY {
                        return None;
                    }
                    // equal probabilities collapse into one final state
                    Some(Scored {
                        score: *probability,
                        key: candidate.sort_key(),
                        checksum: probability.to_bits(),
                        item: (
                            Partial {
                                head: slot,
                                tail: None,
                            },
                            fold_checksum(0, candidate),
                        ),
                    })
                }),
            self.rank_length,
        );
        let mut partials: Vec<Scored<Partial>> = finals
            .into_iter()
            .map(|s| Scored {
                score: s.score,
                key: s.key,
                checksum: s.item.1,
                item: s.item.0,
            })
            .collect();

        for g in (1..=last).rev() {
            let generation = &self.generations[g];
            let previous = &self.generations[g - 1];
            let mut expanded = Vec::new();
            for partial in &partials {
                let head = &generation.states[partial.item.head];
                let best = head.best_probability();
                for (choice, bp) in head.back_pointers.iter().enumerate() {
                    let prev_state = &previous.states[*bp];
                    expanded.push(Scored {
                        score: partial.score - best + head.probabilities[choice],
                        key: partial.key + prev_state.state.sort_key(),
                        checksum: fold_checksum(partial.checksum, &prev_state.state),
                        item: Partial {
                            head: *bp,
                            tail: Some(Rc::new(Link {
                                generation: g,
                                slot: partial.item.head,
                                choice,
                                next: partial.item.tail.clone(),
                            })),
                        },
                    });
                }
            }
            partials = top_k_distinct(expanded, self.rank_length);
        }

        partials
            .into_iter()
            .map(|partial| {
                let first = &self.generations[0];
                let mut states = vec![SequenceState {
                    state: first.states[partial.item.head].state.clone(),
                    observation: first.observation.clone(),
                    transition_descriptor: None,
                }];
                let mut link = partial.item.tail.as_deref();
                while let Some(l) = link {
                    let generation = &self.generations[l.generation];
                    let extended = &generation.states[l.slot];
                    states.push(SequenceState {
                        state: extended.state.clone(),
                        observation: generation.observation.clone(),
                        transition_descriptor: extended.transition_descriptors[l.choice].clone(),
                    });
                    link = l.next.as_deref();
                }
                RankedSequence {
                    states,
                    log_probability: partial.score,
                }
            })
            .collect()
    }
}
