use std::collections::{BTreeSet, HashSet};

use crate::env::{ActionKind, Pomdp, StateId};
use crate::planners::Policy;
use crate::state::BeliefState;

/// Whether a lookahead step counts toward the moving budget when the policy
/// did not move at any frontier belief.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpansionMode {
    #[default]
    EveryStep,
    /// Count a step only if some frontier belief took a move action.
    MovesOnly,
}

#[derive(Debug, Clone)]
pub struct ExpansionConfig {
    pub mode: ExpansionMode,
    /// Frontier size cap; beliefs beyond it are dropped.
    pub max_frontier: usize,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            mode: ExpansionMode::EveryStep,
            max_frontier: 256,
        }
    }
}

/// Result of expanding a frontier by one decision step.
#[derive(Debug, Clone)]
pub struct ExpansionStep {
    pub frontier: Vec<BeliefState>,
    /// Union of non-terminal support states over the new frontier.
    pub possible_states: BTreeSet<StateId>,
    pub moved: bool,
    pub counted: bool,
}

fn possible_states(env: &dyn Pomdp, frontier: &[BeliefState]) -> BTreeSet<StateId> {
    frontier
        .iter()
        .flat_map(|b| b.support())
        .filter(|&s| !env.is_terminal(s))
        .collect()
}

/// Expand every belief of `frontier` by the policy's action and every
/// observation that action can produce. Beliefs whose support is entirely
/// terminal drop out.
pub fn expand_step(
    env: &dyn Pomdp,
    policy: &dyn Policy,
    frontier: &[BeliefState],
    config: &ExpansionConfig,
) -> ExpansionStep {
    let mut next: Vec<BeliefState> = Vec::new();
    let mut seen: HashSet<BeliefState> = HashSet::new();
    let mut moved = false;
    let mut truncated = 0;

    for belief in frontier {
        let Some(action) = policy.act(belief) else {
            // nothing to do here, the belief stays where it is
            if seen.insert(belief.clone()) {
                next.push(belief.clone());
            }
            continue;
        };
        if env.action_kind(action) == ActionKind::Move {
            moved = true;
        }
        for (observation, _) in belief.possible_observations(env, action) {
            let Some(successor) = belief.next(env, action, observation) else {
                continue;
            };
            if successor.support().all(|s| env.is_terminal(s)) {
                continue;
            }
            if next.len() >= config.max_frontier {
                truncated += 1;
                continue;
            }
            if seen.insert(successor.clone()) {
                next.push(successor);
            }
        }
    }

    if truncated > 0 {
        tracing::debug!(
            "Expansion: frontier capped at {} ({} successors dropped)",
            config.max_frontier,
            truncated
        );
    }

    let possible_states = possible_states(env, &next);
    let counted = match config.mode {
        ExpansionMode::EveryStep => true,
        ExpansionMode::MovesOnly => moved,
    };
    ExpansionStep {
        frontier: next,
        possible_states,
        moved,
        counted,
    }
}

/// Possible states of one agent at each lookahead depth, depth 0 being the
/// current belief.
#[derive(Debug, Clone)]
pub struct Lookahead {
    layers: Vec<BTreeSet<StateId>>,
    /// Counted steps taken to reach each depth.
    moves: Vec<usize>,
}

impl Lookahead {
    pub fn compute(
        env: &dyn Pomdp,
        policy: &dyn Policy,
        belief: &BeliefState,
        horizon: usize,
        config: &ExpansionConfig,
    ) -> Self {
        let mut frontier = vec![belief.clone()];
        let mut layers = vec![possible_states(env, &frontier)];
        let mut moves = vec![0];

        for _ in 0..horizon {
            if frontier.is_empty() {
                break;
            }
            let step = expand_step(env, policy, &frontier, config);
            let counted = moves.last().copied().unwrap_or(0) + usize::from(step.counted);
            layers.push(step.possible_states);
            moves.push(counted);
            frontier = step.frontier;
        }

        tracing::trace!(
            model = env.model_id(),
            depth = layers.len() - 1,
            "lookahead computed"
        );
        Self { layers, moves }
    }

    /// Lookahead over precomputed layers, every step counted.
    pub fn from_layers(layers: Vec<BTreeSet<StateId>>) -> Self {
        let moves = (0..layers.len()).collect();
        Self { layers, moves }
    }

    /// Deepest layer computed. Shallower than requested if every branch
    /// terminated.
    pub fn depth(&self) -> usize {
        self.layers.len() - 1
    }

    /// Possible states at `depth`; empty past the computed depth.
    pub fn states_at(&self, depth: usize) -> &BTreeSet<StateId> {
        static EMPTY: BTreeSet<StateId> = BTreeSet::new();
        self.layers.get(depth).unwrap_or(&EMPTY)
    }

    /// Counted moves up to `depth`, saturating at the last computed layer.
    pub fn moves_at(&self, depth: usize) -> usize {
        self.moves
            .get(depth)
            .or(self.moves.last())
            .copied()
            .unwrap_or(0)
    }

    /// Union of possible states over depths `0..=depth`.
    pub fn states_up_to(&self, depth: usize) -> BTreeSet<StateId> {
        self.layers
            .iter()
            .take(depth + 1)
            .flat_map(|layer| layer.iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::env::{BeaconGrid, GridParams};
    use crate::infra::Position;
    use crate::planners::{NullPolicy, PlanRequest, Planner, QmdpPlanner};
    use crate::state::{ForbiddenStates, GridMap};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn solved(slip: f64) -> (Arc<BeaconGrid>, Arc<dyn Policy>) {
        let params = GridParams {
            slip,
            ..GridParams::default()
        };
        let env = Arc::new(
            BeaconGrid::new(
                Arc::new(GridMap::open(5, 5)),
                Vec::new(),
                Position::new(0, 2),
                Position::new(4, 2),
                params,
            )
            .unwrap(),
        );
        let belief = BeliefState::initial(env.as_ref(), None).unwrap();
        let forbidden = ForbiddenStates::new();
        let request = PlanRequest {
            env: env.clone(),
            forbidden: &forbidden,
            belief: &belief,
            continuation: None,
        };
        let mut rng = StdRng::seed_from_u64(11);
        let policy = QmdpPlanner::default().plan(&request, &mut rng).unwrap().policy;
        (env, policy)
    }

    #[test]
    fn test_lookahead_deterministic_path() {
        let (env, policy) = solved(0.0);
        let belief = BeliefState::initial(env.as_ref(), None).unwrap();
        let lookahead = Lookahead::compute(env.as_ref(), policy.as_ref(), &belief, 4, &ExpansionConfig::default());
        assert_eq!(lookahead.depth(), 4);
        for d in 0..=4 {
            let cell = env.state_of(&Position::new(d as i32, 2)).unwrap();
            assert_eq!(lookahead.states_at(d), &BTreeSet::from([cell]));
        }
        assert_eq!(lookahead.moves_at(4), 4);
        assert_eq!(lookahead.states_up_to(2).len(), 3);
        assert!(lookahead.states_at(9).is_empty());
    }

    #[test]
    fn test_lookahead_from_layers_counts_every_step() {
        let lookahead = Lookahead::from_layers(vec![BTreeSet::from([1]), BTreeSet::from([1, 2])]);
        assert_eq!(lookahead.depth(), 1);
        assert_eq!(lookahead.moves_at(1), 1);
        assert_eq!(lookahead.moves_at(5), 1);
        assert_eq!(lookahead.states_up_to(1), BTreeSet::from([1, 2]));
    }

    #[test]
    fn test_lookahead_stops_after_terminal() {
        let (env, policy) = solved(0.0);
        let belief = BeliefState::initial(env.as_ref(), None).unwrap();
        let lookahead = Lookahead::compute(env.as_ref(), policy.as_ref(), &belief, 8, &ExpansionConfig::default());
        // four moves, one done action, then the frontier is empty
        assert_eq!(lookahead.depth(), 5);
        assert!(lookahead.states_at(5).is_empty());
        assert_eq!(lookahead.moves_at(7), 5);
    }

    #[test]
    fn test_expansion_spreads_with_slip() {
        let (env, policy) = solved(0.2);
        let belief = BeliefState::initial(env.as_ref(), None).unwrap();
        let step = expand_step(env.as_ref(), policy.as_ref(), &[belief], &ExpansionConfig::default());
        // moves give no observation, so a single spread-out successor
        assert_eq!(step.frontier.len(), 1);
        assert_eq!(step.possible_states.len(), 3);
        assert!(step.moved);
        assert!(step.counted);
    }

    #[test]
    fn test_expansion_moves_only_mode() {
        let (env, _) = solved(0.0);
        let belief = BeliefState::initial(env.as_ref(), None).unwrap();
        let idle = NullPolicy::new(env.action_count() - 1);
        let config = ExpansionConfig {
            mode: ExpansionMode::MovesOnly,
            ..ExpansionConfig::default()
        };
        let step = expand_step(env.as_ref(), &idle, std::slice::from_ref(&belief), &config);
        assert!(!step.moved);
        assert!(!step.counted);
        assert_eq!(step.frontier, vec![belief]);
    }
}
