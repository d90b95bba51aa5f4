use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;

use crate::env::{ActionId, ActionKind, Pomdp, StateId, sample_observation, sample_transition, sample_weighted};
use crate::infra::PlanError;
use crate::planners::Policy;
use crate::state::{BeliefState, ForbiddenStates};

/// Q-values closer than this are treated as ties; staying put wins, then the
/// lower action index.
const TIE_TOLERANCE: f64 = 1e-9;

// ============================================================================
// Planner interface
// ============================================================================

/// Everything a planner needs for one solve.
pub struct PlanRequest<'a> {
    pub env: Arc<dyn Pomdp>,
    pub forbidden: &'a ForbiddenStates,
    pub belief: &'a BeliefState,
    /// Value function used past the feasibility horizon. Escape policies pass
    /// the agent's main policy here since forbidden states expire.
    pub continuation: Option<Arc<dyn Policy>>,
}

pub struct PlanOutcome {
    pub policy: Arc<dyn Policy>,
    /// Average discounted reward over the feasibility rollouts.
    pub adr: f64,
    pub target_adr: f64,
    pub iterations: usize,
}

impl PlanOutcome {
    pub fn is_feasible(&self) -> bool {
        self.adr >= self.target_adr
    }
}

pub trait Planner: Send + Sync {
    fn plan(&self, request: &PlanRequest<'_>, rng: &mut StdRng) -> Result<PlanOutcome, PlanError>;
}

// ============================================================================
// QMDP
// ============================================================================

#[derive(Debug, Clone)]
pub struct QmdpConfig {
    pub max_iterations: usize,
    /// Stop once no state value changes by more than this.
    pub epsilon: f64,
    /// Worker threads for Bellman sweeps. 1 keeps everything on the caller.
    pub workers: usize,
    /// Value of an outcome landing in a forbidden or blocked state. 0 only
    /// removes that probability mass from the backup, which makes walking
    /// into a forbidden cell look better than waiting when no detour exists.
    pub forbidden_reward: f64,
    /// Score of a feasibility rollout that enters a forbidden or blocked state.
    pub collision_penalty: f64,
    pub trials: usize,
    pub feasibility_horizon: usize,
    /// A plan is feasible when its estimated ADR reaches this value.
    pub target_adr: f64,
}

impl Default for QmdpConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            epsilon: 1e-6,
            workers: 1,
            forbidden_reward: -10.0,
            collision_penalty: -10.0,
            trials: 16,
            feasibility_horizon: 12,
            target_adr: 0.0,
        }
    }
}

/// Value iteration on the underlying MDP, acting on beliefs through
/// `argmax_a sum_s b(s) Q(s, a)`.
pub struct QmdpPlanner {
    config: QmdpConfig,
}

impl QmdpPlanner {
    pub fn new(config: QmdpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QmdpConfig {
        &self.config
    }

    /// Solve the MDP with `excluded` states scored as `forbidden_reward`.
    pub fn solve(
        &self,
        env: &dyn Pomdp,
        excluded: &[bool],
    ) -> Result<(QmdpPolicy, usize), PlanError> {
        let start = Instant::now();
        // staying put comes first so it wins ties
        let mut actions: Vec<ActionId> = (0..env.action_count())
            .filter(|&a| env.action_kind(a) != ActionKind::Sense)
            .collect();
        actions.sort_by_key(|&a| (env.action_kind(a) != ActionKind::Stay, a));
        if actions.is_empty() {
            return Err(PlanError::NoActions);
        }

        let table = BackupTable::build(env, &actions, excluded, self.config.forbidden_reward);
        let gamma = env.discount();
        let n = env.state_count();
        let mut values = vec![0.0; n];
        let mut next_values = vec![0.0; n];
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.config.max_iterations {
            iterations += 1;
            self.sweep(&table, gamma, &values, &mut next_values);
            let delta = values
                .iter()
                .zip(&next_values)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max);
            std::mem::swap(&mut values, &mut next_values);
            if delta < self.config.epsilon {
                converged = true;
                break;
            }
        }

        if !converged {
            tracing::warn!(
                "QMDP: no convergence after {} iterations ({} states)",
                iterations,
                n
            );
        }

        let mut q = vec![0.0; n * actions.len()];
        for s in 0..n {
            for ai in 0..actions.len() {
                q[s * actions.len() + ai] = table.backup(s, ai, gamma, &values);
            }
        }

        tracing::debug!(
            "QMDP: {} states x {} actions solved in {} iterations ({:.1}ms)",
            n,
            actions.len(),
            iterations,
            start.elapsed().as_secs_f64() * 1000.0
        );

        Ok((
            QmdpPolicy {
                model_id: env.model_id(),
                actions,
                q,
                converged,
            },
            iterations,
        ))
    }

    fn sweep(&self, table: &BackupTable, gamma: f64, values: &[f64], next: &mut [f64]) {
        let workers = self.config.workers.max(1);
        if workers == 1 || next.len() < 256 {
            for (s, v) in next.iter_mut().enumerate() {
                *v = table.best(s, gamma, values);
            }
            return;
        }

        let chunk = next.len().div_ceil(workers);
        std::thread::scope(|scope| {
            for (i, slice) in next.chunks_mut(chunk).enumerate() {
                scope.spawn(move || {
                    let offset = i * chunk;
                    for (j, v) in slice.iter_mut().enumerate() {
                        *v = table.best(offset + j, gamma, values);
                    }
                });
            }
        });
    }

    /// Monte-Carlo estimate of the policy's average discounted reward from
    /// `belief`. Entering an excluded state ends a rollout with the collision
    /// penalty; rollouts still running at the horizon are closed with the
    /// continuation value.
    pub fn estimate_adr(
        &self,
        env: &dyn Pomdp,
        policy: &dyn Policy,
        excluded: &[bool],
        belief: &BeliefState,
        continuation: Option<&dyn Policy>,
        rng: &mut StdRng,
    ) -> f64 {
        let trials = self.config.trials.max(1);
        let gamma = env.discount();
        let mut sum = 0.0;

        for _ in 0..trials {
            let Some(mut state) = sample_weighted(belief.non_zero_entries(), rng) else {
                return self.config.collision_penalty;
            };
            let mut current = belief.clone();
            let mut total = 0.0;
            let mut discount = 1.0;
            let mut open = true;

            for _ in 0..self.config.feasibility_horizon {
                if env.is_terminal(state) {
                    open = false;
                    break;
                }
                let next = policy
                    .act(&current)
                    .and_then(|a| sample_transition(env, state, a, rng).map(|n| (a, n)));
                let Some((action, next_state)) = next else {
                    total += discount * self.config.collision_penalty;
                    open = false;
                    break;
                };
                if excluded.get(next_state).copied().unwrap_or(false) {
                    total += discount * self.config.collision_penalty;
                    open = false;
                    break;
                }
                total += discount * env.reward(state, action, next_state);
                discount *= gamma;

                let updated = sample_observation(env, action, next_state, rng)
                    .and_then(|o| current.next(env, action, o));
                match updated {
                    Some(b) => current = b,
                    None => {
                        open = false;
                        break;
                    }
                }
                state = next_state;
            }

            if open && !env.is_terminal(state) {
                let tail = continuation.unwrap_or(policy).value(state);
                total += discount * tail;
            }
            sum += total;
        }

        sum / trials as f64
    }
}

impl Default for QmdpPlanner {
    fn default() -> Self {
        Self::new(QmdpConfig::default())
    }
}

impl Planner for QmdpPlanner {
    #[tracing::instrument(level = "trace", skip_all, fields(forbidden = request.forbidden.len()))]
    fn plan(&self, request: &PlanRequest<'_>, rng: &mut StdRng) -> Result<PlanOutcome, PlanError> {
        let env = request.env.as_ref();
        if request.belief.is_empty() {
            return Err(PlanError::EmptyBelief);
        }
        if request.belief.model_id() != env.model_id() {
            return Err(PlanError::ModelMismatch {
                expected: env.model_id(),
                actual: request.belief.model_id(),
            });
        }

        let excluded: Vec<bool> = (0..env.state_count())
            .map(|s| request.forbidden.contains(s) || env.is_blocked(s))
            .collect();
        let (policy, iterations) = self.solve(env, &excluded)?;
        let adr = self.estimate_adr(
            env,
            &policy,
            &excluded,
            request.belief,
            request.continuation.as_deref(),
            rng,
        );

        Ok(PlanOutcome {
            policy: Arc::new(policy),
            adr,
            target_adr: self.config.target_adr,
            iterations,
        })
    }
}

// ============================================================================
// Backup table
// ============================================================================

/// Per (state, action) constant reward term and the successor list that
/// still carries value. Precomputed once per solve.
struct BackupTable {
    actions: usize,
    terminal: Vec<bool>,
    base: Vec<f64>,
    successors: Vec<Vec<(StateId, f64)>>,
}

impl BackupTable {
    fn build(env: &dyn Pomdp, actions: &[ActionId], excluded: &[bool], forbidden_reward: f64) -> Self {
        let n = env.state_count();
        let mut terminal = Vec::with_capacity(n);
        let mut base = Vec::with_capacity(n * actions.len());
        let mut successors = Vec::with_capacity(n * actions.len());

        for s in 0..n {
            let is_terminal = env.is_terminal(s);
            terminal.push(is_terminal);
            for &a in actions {
                if is_terminal {
                    base.push(0.0);
                    successors.push(Vec::new());
                    continue;
                }
                let mut r = 0.0;
                let mut kept = Vec::new();
                for (next, p) in env.transitions(s, a) {
                    if excluded[next] {
                        r += p * forbidden_reward;
                    } else {
                        r += p * env.reward(s, a, next);
                        if !env.is_terminal(next) {
                            kept.push((next, p));
                        }
                    }
                }
                base.push(r);
                successors.push(kept);
            }
        }

        Self {
            actions: actions.len(),
            terminal,
            base,
            successors,
        }
    }

    fn backup(&self, s: StateId, ai: usize, gamma: f64, values: &[f64]) -> f64 {
        let i = s * self.actions + ai;
        self.base[i]
            + gamma
                * self.successors[i]
                    .iter()
                    .map(|&(next, p)| p * values[next])
                    .sum::<f64>()
    }

    fn best(&self, s: StateId, gamma: f64, values: &[f64]) -> f64 {
        if self.terminal[s] {
            return 0.0;
        }
        (0..self.actions)
            .map(|ai| self.backup(s, ai, gamma, values))
            .fold(f64::NEG_INFINITY, f64::max)
    }
}

// ============================================================================
// Policy
// ============================================================================

pub struct QmdpPolicy {
    model_id: u64,
    actions: Vec<ActionId>,
    q: Vec<f64>,
    converged: bool,
}

impl Policy for QmdpPolicy {
    fn name(&self) -> &str {
        "qmdp"
    }

    fn act(&self, belief: &BeliefState) -> Option<ActionId> {
        if belief.model_id() != self.model_id || belief.is_empty() {
            return None;
        }
        let width = self.actions.len();
        let mut best: Option<(ActionId, f64)> = None;
        for (ai, &action) in self.actions.iter().enumerate() {
            let score: f64 = belief
                .non_zero_entries()
                .iter()
                .map(|&(s, p)| p * self.q.get(s * width + ai).copied().unwrap_or(0.0))
                .sum();
            if best.is_none_or(|(_, b)| score > b + TIE_TOLERANCE) {
                best = Some((action, score));
            }
        }
        best.map(|(a, _)| a)
    }

    fn value(&self, state: StateId) -> f64 {
        let width = self.actions.len();
        self.q
            .get(state * width..(state + 1) * width)
            .map(|row| row.iter().copied().fold(f64::NEG_INFINITY, f64::max))
            .unwrap_or(0.0)
    }

    fn has_converged(&self) -> bool {
        self.converged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{BeaconGrid, GridAction, GridParams};
    use crate::infra::{Direction, Position};
    use crate::state::GridMap;
    use rand::SeedableRng;

    fn grid(start: Position, goal: Position, slip: f64) -> Arc<BeaconGrid> {
        let params = GridParams {
            slip,
            ..GridParams::default()
        };
        Arc::new(BeaconGrid::new(Arc::new(GridMap::open(5, 5)), Vec::new(), start, goal, params).unwrap())
    }

    /// Follow the policy from the initial belief, returning visited cells.
    fn rollout(env: &BeaconGrid, policy: &dyn Policy, steps: usize, rng: &mut StdRng) -> Vec<StateId> {
        let mut belief = BeliefState::initial(env, None).unwrap();
        let mut state = belief.most_likely().unwrap();
        let mut visited = vec![state];
        for _ in 0..steps {
            if env.is_terminal(state) {
                break;
            }
            let action = policy.act(&belief).unwrap();
            state = sample_transition(env, state, action, rng).unwrap();
            let obs = sample_observation(env, action, state, rng).unwrap();
            belief = belief.next(env, action, obs).unwrap();
            visited.push(state);
        }
        visited
    }

    #[test]
    fn test_qmdp_shortest_path() {
        let env = grid(Position::new(0, 2), Position::new(4, 2), 0.0);
        let belief = BeliefState::initial(env.as_ref(), None).unwrap();
        let forbidden = ForbiddenStates::new();
        let request = PlanRequest {
            env: env.clone(),
            forbidden: &forbidden,
            belief: &belief,
            continuation: None,
        };
        let mut rng = StdRng::seed_from_u64(3);
        let outcome = QmdpPlanner::default().plan(&request, &mut rng).unwrap();
        assert!(outcome.is_feasible());
        assert!(outcome.policy.has_converged());
        assert_eq!(
            outcome.policy.act(&belief),
            Some(env.action_id(GridAction::Move(Direction::East)))
        );

        let visited = rollout(env.as_ref(), outcome.policy.as_ref(), 20, &mut rng);
        // four moves, then done
        assert_eq!(visited.len(), 6);
        assert_eq!(*visited.last().unwrap(), env.done_state());
    }

    #[test]
    fn test_qmdp_avoids_forbidden_states() {
        let env = grid(Position::new(0, 2), Position::new(4, 2), 0.0);
        let belief = BeliefState::initial(env.as_ref(), None).unwrap();
        let mut forbidden = ForbiddenStates::new();
        forbidden.add_all(
            [Position::new(2, 1), Position::new(2, 2), Position::new(2, 3)]
                .iter()
                .filter_map(|p| env.state_of(p)),
        );
        let request = PlanRequest {
            env: env.clone(),
            forbidden: &forbidden,
            belief: &belief,
            continuation: None,
        };
        let mut rng = StdRng::seed_from_u64(5);
        let outcome = QmdpPlanner::default().plan(&request, &mut rng).unwrap();
        assert!(outcome.is_feasible());

        let visited = rollout(env.as_ref(), outcome.policy.as_ref(), 30, &mut rng);
        assert!(visited.iter().all(|s| !forbidden.contains(*s)));
        assert_eq!(*visited.last().unwrap(), env.done_state());
    }

    #[test]
    fn test_qmdp_forbidden_wall_is_infeasible() {
        let env = grid(Position::new(0, 2), Position::new(4, 2), 0.0);
        let belief = BeliefState::initial(env.as_ref(), None).unwrap();
        let mut forbidden = ForbiddenStates::new();
        forbidden.add_all((0..5).filter_map(|y| env.state_of(&Position::new(2, y))));
        let request = PlanRequest {
            env: env.clone(),
            forbidden: &forbidden,
            belief: &belief,
            continuation: None,
        };
        let mut rng = StdRng::seed_from_u64(5);
        let outcome = QmdpPlanner::default().plan(&request, &mut rng).unwrap();
        assert!(!outcome.is_feasible(), "adr {}", outcome.adr);
    }

    #[test]
    fn test_qmdp_waits_when_continuation_rewards_it() {
        let env = grid(Position::new(0, 2), Position::new(4, 2), 0.0);
        let belief = BeliefState::initial(env.as_ref(), None).unwrap();
        let free = ForbiddenStates::new();
        let planner = QmdpPlanner::default();
        let mut rng = StdRng::seed_from_u64(9);
        let main = planner
            .plan(
                &PlanRequest {
                    env: env.clone(),
                    forbidden: &free,
                    belief: &belief,
                    continuation: None,
                },
                &mut rng,
            )
            .unwrap();

        let mut wall = ForbiddenStates::new();
        wall.add_all((0..5).filter_map(|y| env.state_of(&Position::new(2, y))));
        let escape = planner
            .plan(
                &PlanRequest {
                    env: env.clone(),
                    forbidden: &wall,
                    belief: &belief,
                    continuation: Some(main.policy.clone()),
                },
                &mut rng,
            )
            .unwrap();
        assert!(escape.is_feasible(), "adr {}", escape.adr);
    }

    #[test]
    fn test_qmdp_threaded_sweeps_match() {
        let params = GridParams {
            slip: 0.2,
            ..GridParams::default()
        };
        let map = Arc::new(GridMap::open(20, 20));
        let env = BeaconGrid::new(map, Vec::new(), Position::new(0, 0), Position::new(17, 12), params).unwrap();
        let excluded = vec![false; env.state_count()];
        let single = QmdpPlanner::default();
        let threaded = QmdpPlanner::new(QmdpConfig {
            workers: 4,
            ..QmdpConfig::default()
        });
        let (a, _) = single.solve(&env, &excluded).unwrap();
        let (b, _) = threaded.solve(&env, &excluded).unwrap();
        for s in 0..env.state_count() {
            assert!((a.value(s) - b.value(s)).abs() < 1e-9);
        }
    }

    #[test]
    fn test_qmdp_rejects_foreign_belief() {
        let env = grid(Position::new(0, 0), Position::new(4, 4), 0.0);
        let other = grid(Position::new(0, 0), Position::new(4, 4), 0.0);
        let belief = BeliefState::initial(other.as_ref(), None).unwrap();
        let forbidden = ForbiddenStates::new();
        let request = PlanRequest {
            env,
            forbidden: &forbidden,
            belief: &belief,
            continuation: None,
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            QmdpPlanner::default().plan(&request, &mut rng),
            Err(PlanError::ModelMismatch { .. })
        ));
    }
}
