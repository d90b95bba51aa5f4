use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, Weak};

use crate::env::{ActionId, ObservationId, Pomdp, StateId};
use crate::infra::ModelError;

/// Tolerance on the total mass of a belief handed to us from outside.
pub const NORMALIZATION_TOLERANCE: f64 = 1e-6;

/// Entries below this after an update are treated as numerical noise.
const PRUNE_THRESHOLD: f64 = 1e-12;

/// Probabilities are compared at this resolution when canonicalising.
const KEY_RESOLUTION: f64 = 1e12;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct BeliefKey {
    model_id: u64,
    entries: Vec<(StateId, u64)>,
}

impl BeliefKey {
    fn new(model_id: u64, entries: &[(StateId, f64)]) -> Self {
        Self {
            model_id,
            entries: entries
                .iter()
                .map(|&(s, p)| (s, (p * KEY_RESOLUTION).round() as u64))
                .collect(),
        }
    }
}

type SuccessorMemo = HashMap<(ActionId, ObservationId), Option<Weak<BeliefData>>>;

struct BeliefData {
    key: BeliefKey,
    entries: Vec<(StateId, f64)>,
    arena: Option<Arc<BeliefArena>>,
    successors: Mutex<SuccessorMemo>,
}

/// Immutable probability distribution over the states of one model.
///
/// Only non-zero entries are stored, sorted by state. Cloning is cheap.
/// Equality and hashing are by content, so two beliefs reached along
/// different paths compare equal.
#[derive(Clone)]
pub struct BeliefState {
    data: Arc<BeliefData>,
}

impl BeliefState {
    /// Build a belief from raw entries. Duplicate states are merged and the
    /// result is renormalised; a total outside [`NORMALIZATION_TOLERANCE`] is
    /// reported with a warning.
    pub fn from_entries(
        model_id: u64,
        entries: impl IntoIterator<Item = (StateId, f64)>,
        arena: Option<Arc<BeliefArena>>,
    ) -> Result<Self, ModelError> {
        let mut merged: BTreeMap<StateId, f64> = BTreeMap::new();
        for (state, p) in entries {
            if p > 0.0 {
                *merged.entry(state).or_insert(0.0) += p;
            }
        }
        let total: f64 = merged.values().sum();
        if total <= 0.0 {
            return Err(ModelError::EmptyBelief);
        }
        if (total - 1.0).abs() > NORMALIZATION_TOLERANCE {
            tracing::warn!(
                "Belief mass {:.9} outside tolerance, renormalising {} entries",
                total,
                merged.len()
            );
        }
        Ok(Self::normalized(model_id, merged, total, arena))
    }

    pub fn point(model_id: u64, state: StateId, arena: Option<Arc<BeliefArena>>) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(state, 1.0);
        Self::normalized(model_id, entries, 1.0, arena)
    }

    /// The model's own initial belief.
    pub fn initial(env: &dyn Pomdp, arena: Option<Arc<BeliefArena>>) -> Result<Self, ModelError> {
        Self::from_entries(env.model_id(), env.initial_belief(), arena)
    }

    fn normalized(
        model_id: u64,
        mass: BTreeMap<StateId, f64>,
        total: f64,
        arena: Option<Arc<BeliefArena>>,
    ) -> Self {
        let mut entries: Vec<(StateId, f64)> = mass
            .into_iter()
            .map(|(s, p)| (s, p / total))
            .filter(|(_, p)| *p >= PRUNE_THRESHOLD)
            .collect();
        let kept: f64 = entries.iter().map(|(_, p)| p).sum();
        if kept != 1.0 {
            for (_, p) in entries.iter_mut() {
                *p /= kept;
            }
        }

        match &arena {
            Some(a) => a.intern(model_id, entries, arena.clone()),
            None => Self::fresh(BeliefKey::new(model_id, &entries), entries, None),
        }
    }

    fn fresh(key: BeliefKey, entries: Vec<(StateId, f64)>, arena: Option<Arc<BeliefArena>>) -> Self {
        Self {
            data: Arc::new(BeliefData {
                key,
                entries,
                arena,
                successors: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn model_id(&self) -> u64 {
        self.data.key.model_id
    }

    pub fn value_at(&self, state: StateId) -> f64 {
        self.data
            .entries
            .binary_search_by_key(&state, |(s, _)| *s)
            .map(|i| self.data.entries[i].1)
            .unwrap_or(0.0)
    }

    pub fn non_zero_entries(&self) -> &[(StateId, f64)] {
        &self.data.entries
    }

    pub fn support(&self) -> impl Iterator<Item = StateId> + '_ {
        self.data.entries.iter().map(|(s, _)| *s)
    }

    pub fn len(&self) -> usize {
        self.data.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.entries.is_empty()
    }

    pub fn is_certain(&self) -> bool {
        self.data.entries.len() == 1
    }

    pub fn total(&self) -> f64 {
        self.data.entries.iter().map(|(_, p)| p).sum()
    }

    /// Highest-probability state, lowest index on ties.
    pub fn most_likely(&self) -> Option<StateId> {
        let mut best: Option<(StateId, f64)> = None;
        for &(s, p) in &self.data.entries {
            if best.is_none_or(|(_, bp)| p > bp) {
                best = Some((s, p));
            }
        }
        best.map(|(s, _)| s)
    }

    pub fn entropy(&self) -> f64 {
        -self
            .data
            .entries
            .iter()
            .map(|(_, p)| p * p.ln())
            .sum::<f64>()
    }

    /// Next-state distribution after `action`, before any observation.
    pub fn predict(&self, env: &dyn Pomdp, action: ActionId) -> BTreeMap<StateId, f64> {
        let mut predicted = BTreeMap::new();
        for &(s, p) in &self.data.entries {
            for (next, t) in env.transitions(s, action) {
                *predicted.entry(next).or_insert(0.0) += p * t;
            }
        }
        predicted
    }

    /// Probability of observing `observation` after `action`.
    pub fn observation_probability(
        &self,
        env: &dyn Pomdp,
        action: ActionId,
        observation: ObservationId,
    ) -> f64 {
        self.predict(env, action)
            .into_iter()
            .map(|(next, p)| p * env.observation_prob(action, next, observation))
            .sum()
    }

    /// Every observation with non-zero probability after `action`, with its
    /// probability, ordered by observation index.
    pub fn possible_observations(
        &self,
        env: &dyn Pomdp,
        action: ActionId,
    ) -> Vec<(ObservationId, f64)> {
        let mut observations: BTreeMap<ObservationId, f64> = BTreeMap::new();
        for (next, p) in self.predict(env, action) {
            for (o, po) in env.observations(action, next) {
                *observations.entry(o).or_insert(0.0) += p * po;
            }
        }
        observations.into_iter().filter(|(_, p)| *p > 0.0).collect()
    }

    /// Bayesian update. `None` when the observation is impossible under this
    /// belief. Results are memoised per (action, observation).
    pub fn next(
        &self,
        env: &dyn Pomdp,
        action: ActionId,
        observation: ObservationId,
    ) -> Option<BeliefState> {
        debug_assert_eq!(env.model_id(), self.model_id());

        if let Ok(memo) = self.data.successors.lock()
            && let Some(entry) = memo.get(&(action, observation))
        {
            match entry {
                None => return None,
                Some(weak) => {
                    if let Some(data) = weak.upgrade() {
                        return Some(BeliefState { data });
                    }
                }
            }
        }

        let mut mass: BTreeMap<StateId, f64> = BTreeMap::new();
        for &(s, p) in &self.data.entries {
            for (next, t) in env.transitions(s, action) {
                let o = env.observation_prob(action, next, observation);
                if o > 0.0 {
                    *mass.entry(next).or_insert(0.0) += p * t * o;
                }
            }
        }
        let total: f64 = mass.values().sum();
        let successor = if total > 0.0 {
            Some(Self::normalized(
                self.model_id(),
                mass,
                total,
                self.data.arena.clone(),
            ))
        } else {
            None
        };

        if let Ok(mut memo) = self.data.successors.lock() {
            memo.insert(
                (action, observation),
                successor.as_ref().map(|b| Arc::downgrade(&b.data)),
            );
        }
        successor
    }

    /// Human-readable form using the model's state labels.
    pub fn describe(&self, env: &dyn Pomdp) -> String {
        let parts: Vec<String> = self
            .data
            .entries
            .iter()
            .map(|(s, p)| format!("{}={:.3}", env.state_label(*s), p))
            .collect();
        format!("[{}]", parts.join(", "))
    }

    pub fn ptr_eq(&self, other: &BeliefState) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl PartialEq for BeliefState {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data) || self.data.key == other.data.key
    }
}

impl Eq for BeliefState {}

impl Hash for BeliefState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.key.hash(state);
    }
}

impl fmt::Debug for BeliefState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BeliefState({}) {}", self.model_id(), self)
    }
}

impl fmt::Display for BeliefState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (s, p)) in self.data.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "s{}={:.3}", s, p)?;
        }
        write!(f, "]")
    }
}

// ============================================================================
// Arena
// ============================================================================

/// Canonicalising pool for beliefs, shared by every agent.
///
/// Entries are weak: a belief disappears from the arena as soon as its last
/// holder drops it.
#[derive(Default)]
pub struct BeliefArena {
    entries: Mutex<HashMap<BeliefKey, Weak<BeliefData>>>,
}

impl BeliefArena {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn intern(
        &self,
        model_id: u64,
        entries: Vec<(StateId, f64)>,
        arena: Option<Arc<BeliefArena>>,
    ) -> BeliefState {
        let key = BeliefKey::new(model_id, &entries);
        let Ok(mut map) = self.entries.lock() else {
            return BeliefState::fresh(key, entries, arena);
        };

        if let Some(data) = map.get(&key).and_then(Weak::upgrade) {
            return BeliefState { data };
        }

        let belief = BeliefState::fresh(key.clone(), entries, arena);
        map.insert(key, Arc::downgrade(&belief.data));

        // Sweep dead entries once the table has grown noticeably.
        if map.len() > 1024 && map.len().is_power_of_two() {
            map.retain(|_, weak| weak.strong_count() > 0);
        }
        belief
    }

    /// Number of beliefs still held by someone.
    pub fn live(&self) -> usize {
        self.entries
            .lock()
            .map(|map| map.values().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }

    /// Drop table slots whose belief has been released.
    pub fn purge(&self) -> usize {
        let Ok(mut map) = self.entries.lock() else {
            return 0;
        };
        let before = map.len();
        map.retain(|_, weak| weak.strong_count() > 0);
        before - map.len()
    }
}
