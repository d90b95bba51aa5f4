use std::sync::Arc;

use crate::env::{ActionId, Pomdp, StateId};
use crate::state::BeliefState;

/// A solved policy: maps beliefs to actions and states to values.
pub trait Policy: Send + Sync {
    fn name(&self) -> &str;

    /// Action to take at `belief`, `None` if the policy has nothing to offer.
    fn act(&self, belief: &BeliefState) -> Option<ActionId>;

    /// Value estimate of a fully known state.
    fn value(&self, state: StateId) -> f64;

    fn belief_value(&self, belief: &BeliefState) -> f64 {
        belief
            .non_zero_entries()
            .iter()
            .map(|&(s, p)| p * self.value(s))
            .sum()
    }

    fn has_converged(&self) -> bool {
        true
    }
}

/// Always declares done. Used for agents that have nothing left to do.
pub struct NullPolicy {
    done_action: ActionId,
}

impl NullPolicy {
    pub fn new(done_action: ActionId) -> Self {
        Self { done_action }
    }
}

impl Policy for NullPolicy {
    fn name(&self) -> &str {
        "null"
    }

    fn act(&self, _belief: &BeliefState) -> Option<ActionId> {
        Some(self.done_action)
    }

    fn value(&self, _state: StateId) -> f64 {
        0.0
    }
}

/// Sensing-only policy: picks the sensing action with the lowest expected
/// posterior entropy.
pub struct LocalizePolicy {
    env: Arc<dyn Pomdp>,
    sensing: Vec<ActionId>,
}

impl LocalizePolicy {
    pub fn new(env: Arc<dyn Pomdp>, sensing: Vec<ActionId>) -> Self {
        Self { env, sensing }
    }

    /// Expected entropy of the belief after `action` and its observation.
    pub fn expected_entropy(&self, belief: &BeliefState, action: ActionId) -> f64 {
        belief
            .possible_observations(self.env.as_ref(), action)
            .into_iter()
            .filter_map(|(o, p)| {
                belief
                    .next(self.env.as_ref(), action, o)
                    .map(|next| p * next.entropy())
            })
            .sum()
    }
}

impl Policy for LocalizePolicy {
    fn name(&self) -> &str {
        "localize"
    }

    fn act(&self, belief: &BeliefState) -> Option<ActionId> {
        let mut best: Option<(ActionId, f64)> = None;
        for &action in &self.sensing {
            let entropy = self.expected_entropy(belief, action);
            if best.is_none_or(|(_, e)| entropy < e - 1e-12) {
                best = Some((action, entropy));
            }
        }
        best.map(|(a, _)| a)
    }

    fn value(&self, _state: StateId) -> f64 {
        0.0
    }
}
