use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;

use crate::env::{ActionId, BeaconGrid, Pomdp, StateId, sample_observation, sample_transition, sample_weighted};
use crate::infra::{AStar, AgentError, ModelError, Position};
use crate::planners::{PlanOutcome, PlanRequest, Planner, Policy};
use crate::state::{BeliefArena, BeliefState, ForbiddenStates};

use super::expansion::{ExpansionConfig, Lookahead};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    Nominal,
    Escaping { remaining: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Active,
    ReachedGoal,
    Stalled,
    Failed,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Lookahead horizon is twice this.
    pub distance_threshold: usize,
    /// Consecutive steps in the same state before the agent is stalled.
    pub max_same_states: usize,
    pub expansion: ExpansionConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            distance_threshold: 2,
            max_same_states: 10,
            expansion: ExpansionConfig::default(),
        }
    }
}

pub struct Agent {
    id: usize,
    label: char,
    model: Arc<BeaconGrid>,
    arena: Option<Arc<BeliefArena>>,
    config: AgentConfig,
    belief: BeliefState,
    state: StateId,
    forbidden: ForbiddenStates,
    main_policy: Option<Arc<dyn Policy>>,
    escape_policy: Option<Arc<dyn Policy>>,
    mode: AgentMode,
    status: AgentStatus,
    needs_retrain: bool,
    total_reward: f64,
    discount: f64,
    steps: usize,
    same_state_steps: usize,
    last_action: Option<ActionId>,
}

impl Agent {
    pub fn new(
        id: usize,
        label: char,
        model: Arc<BeaconGrid>,
        config: AgentConfig,
        arena: Option<Arc<BeliefArena>>,
        rng: &mut StdRng,
    ) -> Result<Self, ModelError> {
        let belief = BeliefState::initial(model.as_ref(), arena.clone())?;
        let state = sample_weighted(belief.non_zero_entries(), rng).ok_or(ModelError::EmptyBelief)?;
        Ok(Self {
            id,
            label,
            model,
            arena,
            config,
            belief,
            state,
            forbidden: ForbiddenStates::new(),
            main_policy: None,
            escape_policy: None,
            mode: AgentMode::Nominal,
            status: AgentStatus::Active,
            needs_retrain: true,
            total_reward: 0.0,
            discount: 1.0,
            steps: 0,
            same_state_steps: 0,
            last_action: None,
        })
    }

    /// Start a new episode: fresh initial belief and sampled start state. The
    /// main policy is kept unless it was trained against forbidden states.
    pub fn reset(&mut self, rng: &mut StdRng) -> Result<(), ModelError> {
        self.belief = BeliefState::initial(self.model.as_ref(), self.arena.clone())?;
        self.state = sample_weighted(self.belief.non_zero_entries(), rng).ok_or(ModelError::EmptyBelief)?;
        if !self.forbidden.is_empty() {
            self.needs_retrain = true;
        }
        self.forbidden.reset();
        self.escape_policy = None;
        self.mode = AgentMode::Nominal;
        self.status = AgentStatus::Active;
        self.total_reward = 0.0;
        self.discount = 1.0;
        self.steps = 0;
        self.same_state_steps = 0;
        self.last_action = None;
        Ok(())
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn label(&self) -> char {
        self.label
    }

    pub fn model(&self) -> &Arc<BeaconGrid> {
        &self.model
    }

    pub fn arena(&self) -> Option<&Arc<BeliefArena>> {
        self.arena.as_ref()
    }

    pub fn belief(&self) -> &BeliefState {
        &self.belief
    }

    pub fn true_state(&self) -> StateId {
        self.state
    }

    pub fn position(&self) -> Option<Position> {
        self.model.position_of(self.state)
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }

    pub fn mode(&self) -> AgentMode {
        self.mode
    }

    pub fn is_escaping(&self) -> bool {
        matches!(self.mode, AgentMode::Escaping { .. })
    }

    pub fn is_timer_set(&self) -> bool {
        matches!(self.mode, AgentMode::Escaping { remaining } if remaining > 0)
    }

    pub fn total_reward(&self) -> f64 {
        self.total_reward
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn last_action(&self) -> Option<ActionId> {
        self.last_action
    }

    pub fn distance_threshold(&self) -> usize {
        self.config.distance_threshold
    }

    pub fn lookahead_horizon(&self) -> usize {
        2 * self.config.distance_threshold
    }

    pub fn needs_retrain(&self) -> bool {
        self.needs_retrain
    }

    // ------------------------------------------------------------------------
    // Forbidden states
    // ------------------------------------------------------------------------

    pub fn forbidden(&self) -> &ForbiddenStates {
        &self.forbidden
    }

    /// Direct access for snapshot/restore transactions. Does not flag the
    /// main policy for retraining.
    pub fn forbidden_mut(&mut self) -> &mut ForbiddenStates {
        &mut self.forbidden
    }

    pub fn add_forbidden_state(&mut self, state: StateId) {
        if self.forbidden.add(state) {
            self.needs_retrain = true;
        }
    }

    pub fn add_forbidden_states(&mut self, states: impl IntoIterator<Item = StateId>) {
        for state in states {
            self.add_forbidden_state(state);
        }
    }

    pub fn clear_forbidden_states(&mut self) {
        if !self.forbidden.is_empty() {
            self.forbidden.clear();
            self.needs_retrain = true;
        }
    }

    pub fn is_forbidden(&self, state: StateId) -> bool {
        self.forbidden.contains(state)
    }

    // ------------------------------------------------------------------------
    // Policies
    // ------------------------------------------------------------------------

    pub fn main_policy(&self) -> Option<&Arc<dyn Policy>> {
        self.main_policy.as_ref()
    }

    pub fn set_main_policy(&mut self, policy: Arc<dyn Policy>) {
        self.main_policy = Some(policy);
        self.needs_retrain = false;
    }

    /// Escape policy while escaping, main policy otherwise.
    pub fn active_policy(&self) -> Option<&Arc<dyn Policy>> {
        match self.mode {
            AgentMode::Nominal => self.main_policy.as_ref(),
            AgentMode::Escaping { .. } => self.escape_policy.as_ref().or(self.main_policy.as_ref()),
        }
    }

    /// Replan the main policy against the current forbidden set.
    pub fn retrain(&mut self, planner: &dyn Planner, rng: &mut StdRng) -> Result<PlanOutcome, AgentError> {
        let request = PlanRequest {
            env: self.model.clone(),
            forbidden: &self.forbidden,
            belief: &self.belief,
            continuation: None,
        };
        let outcome = planner.plan(&request, rng).map_err(|source| AgentError::Plan {
            agent: self.id,
            source,
        })?;
        if !outcome.is_feasible() {
            tracing::warn!(
                "Agent {}: main policy infeasible (adr {:.3} < {:.3})",
                self.label,
                outcome.adr,
                outcome.target_adr
            );
        }
        self.set_main_policy(outcome.policy.clone());
        Ok(outcome)
    }

    /// Plan an escape policy against the current forbidden set, bootstrapped
    /// with the main policy's values.
    pub fn plan_escape(&self, planner: &dyn Planner, rng: &mut StdRng) -> Result<PlanOutcome, AgentError> {
        let request = PlanRequest {
            env: self.model.clone(),
            forbidden: &self.forbidden,
            belief: &self.belief,
            continuation: self.main_policy.clone(),
        };
        planner.plan(&request, rng).map_err(|source| AgentError::Plan {
            agent: self.id,
            source,
        })
    }

    pub fn arm_escape(&mut self, policy: Arc<dyn Policy>, timer: u32) {
        self.escape_policy = Some(policy);
        self.mode = AgentMode::Escaping { remaining: timer };
    }

    /// Leave escape mode: main policy again, forbidden states dropped.
    pub fn release(&mut self) {
        self.mode = AgentMode::Nominal;
        self.escape_policy = None;
        self.forbidden.reset();
    }

    fn tick_escape_timer(&mut self) {
        if let AgentMode::Escaping { remaining } = self.mode {
            let remaining = remaining.saturating_sub(1);
            if remaining == 0 {
                tracing::debug!("Agent {}: escape expired", self.label);
                self.release();
            } else {
                self.mode = AgentMode::Escaping { remaining };
            }
        }
    }

    pub fn mark_failed(&mut self) {
        self.status = AgentStatus::Failed;
    }

    // ------------------------------------------------------------------------
    // Lookahead
    // ------------------------------------------------------------------------

    pub fn lookahead(&self) -> Option<Lookahead> {
        let policy = self.active_policy()?;
        Some(self.lookahead_with(policy.as_ref(), self.lookahead_horizon()))
    }

    /// Lookahead from the current belief under an arbitrary policy.
    pub fn lookahead_with(&self, policy: &dyn Policy, horizon: usize) -> Lookahead {
        Lookahead::compute(self.model.as_ref(), policy, &self.belief, horizon, &self.config.expansion)
    }

    /// Expected grid distance to the goal under the current belief,
    /// ignoring forbidden states.
    pub fn distance_to_goal(&self) -> f64 {
        let map = self.model.map();
        let goal = self.model.goal_position();
        self.belief
            .non_zero_entries()
            .iter()
            .map(|&(s, p)| {
                let distance = match self.model.position_of(s) {
                    Some(pos) => AStar::distance(map, pos, goal).map_or(map.len() as f64, f64::from),
                    None => 0.0,
                };
                p * distance
            })
            .sum()
    }

    // ------------------------------------------------------------------------
    // Stepping
    // ------------------------------------------------------------------------

    /// Act once with the active policy. Returns true once the agent is no
    /// longer active.
    pub fn step(&mut self, rng: &mut StdRng) -> Result<bool, AgentError> {
        if !self.is_active() {
            return Ok(true);
        }
        let Some(policy) = self.active_policy().cloned() else {
            self.status = AgentStatus::Failed;
            return Err(AgentError::NoPolicy { agent: self.id });
        };
        let Some(action) = policy.act(&self.belief) else {
            self.status = AgentStatus::Failed;
            return Err(AgentError::NoAction { agent: self.id });
        };
        Ok(self.step_with(action, rng))
    }

    /// Execute `action` in the environment, update the belief and reward
    /// accounting. Returns true once the agent is no longer active.
    pub fn step_with(&mut self, action: ActionId, rng: &mut StdRng) -> bool {
        if !self.is_active() {
            return true;
        }
        let model = self.model.clone();
        let env = model.as_ref();
        let previous = self.state;
        let next = sample_transition(env, previous, action, rng).unwrap_or(previous);
        let observation = sample_observation(env, action, next, rng);

        self.total_reward += self.discount * env.reward(previous, action, next);
        self.discount *= env.discount();
        self.steps += 1;
        self.last_action = Some(action);
        self.state = next;

        if next == previous {
            self.same_state_steps += 1;
        } else {
            self.same_state_steps = 0;
        }

        let next_belief = observation.and_then(|o| self.belief.next(env, action, o));
        self.tick_escape_timer();

        if env.is_terminal(next) {
            if let Some(belief) = next_belief {
                self.belief = belief;
            }
            tracing::info!("Agent {}: reached goal after {} steps", self.label, self.steps);
            self.status = AgentStatus::ReachedGoal;
            return true;
        }

        match next_belief {
            None => {
                tracing::warn!("Agent {}: belief update failed after {}", self.label, env.action_label(action));
                self.status = AgentStatus::Stalled;
            }
            Some(belief) if belief.value_at(next) <= 0.0 => {
                tracing::warn!(
                    "Agent {}: belief {} has no mass on true state {}",
                    self.label,
                    belief.describe(env),
                    env.state_label(next)
                );
                self.status = AgentStatus::Stalled;
            }
            Some(belief) => self.belief = belief,
        }

        if self.is_active() && self.same_state_steps > self.config.max_same_states {
            tracing::warn!(
                "Agent {}: stuck at {} for {} steps",
                self.label,
                env.state_label(next),
                self.same_state_steps
            );
            self.status = AgentStatus::Stalled;
        }

        !self.is_active()
    }

    /// Charge the failure penalty to an agent that did not reach its goal.
    pub fn apply_failure_penalty(&mut self, penalty: f64) -> bool {
        if self.status == AgentStatus::ReachedGoal {
            return false;
        }
        self.total_reward += self.discount * penalty;
        true
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env = self.model.as_ref();
        let mode = match self.mode {
            AgentMode::Nominal => "nominal".to_string(),
            AgentMode::Escaping { remaining } => format!("escaping({})", remaining),
        };
        write!(
            f,
            "{} [{:?}, {}] at {} belief {} forbidden {} reward {:.3}",
            self.label,
            self.status,
            mode,
            env.state_label(self.state),
            self.belief.describe(env),
            self.forbidden,
            self.total_reward
        )
    }
}
