use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

pub type StateId = usize;
pub type ActionId = usize;
pub type ObservationId = usize;

/// Coarse classification of an action. The expansion engine uses it to count
/// "moving" steps and planners use it to pick which actions they optimise
/// over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Move,
    Stay,
    Sense,
    Done,
}

/// Discrete POMDP seen by beliefs, planners and agents.
///
/// `transitions` and `observations` only list outcomes with non-zero
/// probability; each list sums to one.
pub trait Pomdp: Send + Sync {
    /// Unique per model instance. Beliefs are bound to the model they were
    /// created for.
    fn model_id(&self) -> u64;

    fn state_count(&self) -> usize;
    fn action_count(&self) -> usize;
    fn observation_count(&self) -> usize;
    fn discount(&self) -> f64;

    fn transitions(&self, state: StateId, action: ActionId) -> Vec<(StateId, f64)>;

    /// Observation distribution after taking `action` and landing in `next_state`.
    fn observations(&self, action: ActionId, next_state: StateId) -> Vec<(ObservationId, f64)>;

    fn observation_prob(
        &self,
        action: ActionId,
        next_state: StateId,
        observation: ObservationId,
    ) -> f64 {
        self.observations(action, next_state)
            .into_iter()
            .find(|(o, _)| *o == observation)
            .map(|(_, p)| p)
            .unwrap_or(0.0)
    }

    fn reward(&self, state: StateId, action: ActionId, next_state: StateId) -> f64;

    fn is_terminal(&self, state: StateId) -> bool;

    /// States the model itself rules out, e.g. two members of a joint model
    /// sharing a cell. Planners treat them like forbidden states.
    fn is_blocked(&self, _state: StateId) -> bool {
        false
    }

    fn action_kind(&self, action: ActionId) -> ActionKind;

    fn initial_belief(&self) -> Vec<(StateId, f64)>;

    fn state_label(&self, state: StateId) -> String {
        format!("s{}", state)
    }

    fn action_label(&self, action: ActionId) -> String {
        format!("a{}", action)
    }
}

static NEXT_MODEL_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_model_id() -> u64 {
    NEXT_MODEL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Draw one index from a weighted outcome list. Weights need not be
/// normalised; `None` only for an empty or weightless list.
pub fn sample_weighted<R: Rng>(outcomes: &[(usize, f64)], rng: &mut R) -> Option<usize> {
    let total: f64 = outcomes.iter().map(|(_, p)| *p).sum();
    if outcomes.is_empty() || total <= 0.0 {
        return None;
    }
    let mut threshold = rng.random::<f64>() * total;
    for &(value, p) in outcomes {
        if threshold < p {
            return Some(value);
        }
        threshold -= p;
    }
    outcomes.iter().rev().find(|(_, p)| *p > 0.0).map(|(v, _)| *v)
}

pub fn sample_transition<R: Rng>(
    env: &dyn Pomdp,
    state: StateId,
    action: ActionId,
    rng: &mut R,
) -> Option<StateId> {
    sample_weighted(&env.transitions(state, action), rng)
}

pub fn sample_observation<R: Rng>(
    env: &dyn Pomdp,
    action: ActionId,
    next_state: StateId,
    rng: &mut R,
) -> Option<ObservationId> {
    sample_weighted(&env.observations(action, next_state), rng)
}
