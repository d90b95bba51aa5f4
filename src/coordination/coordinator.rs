use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, error, info, warn};

use crate::env::{JointGridConfig, Pomdp, StateId};
use crate::infra::{
    CoordinationError, CoordinationObserver, ModelError, ResolutionOutcome, SubsetOrder,
    TracingObserver,
};
use crate::planners::{LocalizePolicy, Planner, Policy};

use super::agent::{Agent, AgentStatus};
use super::collision::{CollisionDetector, DetectionMode, Participant, PotentialCollisionData};
use super::dominance::{ClosestToGoal, DominancePolicy};
use super::expansion::Lookahead;
use super::joint_agent::JointAgent;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Steps an agent follows its escape policy.
    pub escape_timer: u32,
    pub detection: DetectionMode,
    pub subset_order: SubsetOrder,
    pub max_resolutions_per_round: usize,
    /// Sensing rounds an agent may spend per episode.
    pub max_localization_rounds: usize,
    pub joint_fallback: bool,
    pub joint: JointGridConfig,
    pub joint_max_steps: usize,
    /// Charged, discounted, to agents that did not reach their goal.
    pub failure_penalty: f64,
    pub seed: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            escape_timer: 4,
            detection: DetectionMode::Subsets,
            subset_order: SubsetOrder::LargestFirst,
            max_resolutions_per_round: 8,
            max_localization_rounds: 4,
            joint_fallback: true,
            joint: JointGridConfig::default(),
            joint_max_steps: 12,
            failure_penalty: -10.0,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentReport {
    pub id: usize,
    pub label: char,
    pub status: AgentStatus,
    pub reward: f64,
    pub steps: usize,
}

impl AgentReport {
    fn of(agent: &Agent) -> Self {
        Self {
            id: agent.id(),
            label: agent.label(),
            status: agent.status(),
            reward: agent.total_reward(),
            steps: agent.steps(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EpisodeReport {
    pub episode: usize,
    pub rounds: usize,
    pub total_reward: f64,
    pub agents: Vec<AgentReport>,
    pub conflicts: usize,
    pub escapes: usize,
    pub localization_rounds: usize,
    pub joint_phases: usize,
    pub unresolved: usize,
    /// Conflicts that persisted after their members yielded and were left
    /// for the next round.
    pub accepted: usize,
    /// Rounds after which two active agents shared a cell.
    pub collisions: usize,
    /// Agent pairs whose beliefs overlapped after a round.
    pub belief_overlaps: usize,
    pub elapsed: Duration,
}

impl EpisodeReport {
    pub fn reached_goal(&self) -> usize {
        self.agents
            .iter()
            .filter(|a| a.status == AgentStatus::ReachedGoal)
            .count()
    }

    pub fn all_reached_goal(&self) -> bool {
        !self.agents.is_empty() && self.reached_goal() == self.agents.len()
    }
}

/// Runs agents step by step, resolving predicted conflicts before each step.
pub struct Coordinator {
    config: CoordinatorConfig,
    planner: Arc<dyn Planner>,
    detector: CollisionDetector,
    dominance: Box<dyn DominancePolicy>,
    observer: Box<dyn CoordinationObserver>,
    rng: StdRng,
    episode: usize,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, planner: Arc<dyn Planner>) -> Self {
        Self {
            detector: CollisionDetector::new(config.detection, config.subset_order),
            rng: StdRng::seed_from_u64(config.seed),
            config,
            planner,
            dominance: Box::new(ClosestToGoal),
            observer: Box::new(TracingObserver),
            episode: 0,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn CoordinationObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_dominance(mut self, dominance: Box<dyn DominancePolicy>) -> Self {
        self.dominance = dominance;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Reset `agents` and run them for at most `horizon_steps` rounds.
    /// Running out of rounds is not an error; unfinished agents are charged
    /// the failure penalty.
    pub fn run_episode(&mut self, agents: &mut [Agent], horizon_steps: usize) -> Result<EpisodeReport, CoordinationError> {
        check_shared_map(agents)?;
        let start = Instant::now();
        self.episode += 1;
        for agent in agents.iter_mut() {
            agent.reset(&mut self.rng)?;
        }
        self.observer.on_episode_start(self.episode, agents);

        let mut report = EpisodeReport {
            episode: self.episode,
            ..EpisodeReport::default()
        };
        let mut joint: Option<JointAgent> = None;
        let mut localizations = vec![0; agents.len()];

        for round in 0..horizon_steps {
            if agents.iter().all(|a| !a.is_active()) {
                break;
            }
            let tick = Instant::now();
            report.rounds += 1;
            self.observer.on_round_start(round, agents);

            self.retrain(agents)?;
            let localize = self.resolve(round, agents, &mut joint, &mut localizations, &mut report)?;
            self.step_agents(round, agents, &mut joint, &localize);
            self.account(round, agents, &mut report);

            let elapsed = tick.elapsed();
            if elapsed > Duration::from_millis(100) {
                warn!("Round {} took {:.1}ms", round, elapsed.as_secs_f64() * 1000.0);
            }
        }

        for agent in agents.iter_mut() {
            if agent.apply_failure_penalty(self.config.failure_penalty) {
                debug!("Agent {}: unfinished ({:?}), penalty applied", agent.label(), agent.status());
            }
        }
        report.agents = agents.iter().map(AgentReport::of).collect();
        report.total_reward = report.agents.iter().map(|a| a.reward).sum();
        report.elapsed = start.elapsed();
        self.observer.on_episode_finished(&report);
        Ok(report)
    }

    fn retrain(&mut self, agents: &mut [Agent]) -> Result<(), CoordinationError> {
        for agent in agents.iter_mut().filter(|a| a.is_active() && a.needs_retrain()) {
            let outcome = agent.retrain(self.planner.as_ref(), &mut self.rng)?;
            debug!(
                "Agent {}: main policy retrained in {} iterations (adr {:.3})",
                agent.label(),
                outcome.iterations,
                outcome.adr
            );
        }
        Ok(())
    }

    /// Detect and resolve conflicts until none is left or the round budget is
    /// spent. Returns the agents that sense this round.
    ///
    /// An agent yields at most once per conflict group and round. A group
    /// that comes back after yielding is accepted, an unresolvable one is
    /// given up; neither is checked again this round.
    fn resolve(
        &mut self,
        round: usize,
        agents: &mut [Agent],
        joint: &mut Option<JointAgent>,
        localizations: &mut [usize],
        report: &mut EpisodeReport,
    ) -> Result<BTreeSet<usize>, CoordinationError> {
        let mut localize = BTreeSet::new();
        let mut resolutions = 0;
        let mut yielded: HashSet<(usize, Vec<usize>)> = HashSet::new();
        let mut settled: HashSet<Vec<usize>> = HashSet::new();

        loop {
            let controlled: Vec<usize> = joint.as_ref().map_or_else(Vec::new, |j| j.members().to_vec());
            let lookaheads = collect_lookaheads(agents, joint.as_ref());
            let participants: Vec<Participant<'_>> = lookaheads
                .iter()
                .map(|(i, lookahead)| Participant {
                    agent: *i,
                    lookahead,
                    distance_threshold: agents[*i].distance_threshold(),
                })
                .collect();
            let mut conflict = self.detector.detect_skipping(&participants, |group| {
                settled.contains(group) || group.iter().all(|i| controlled.contains(i))
            });
            if conflict.is_empty() {
                break;
            }
            let key = conflict.members().to_vec();
            report.conflicts += 1;
            self.observer.on_conflict(round, &conflict, agents);

            if resolutions >= self.config.max_resolutions_per_round {
                warn!("Round {}: {} resolutions spent, moving forward", round, resolutions);
                self.give_up(round, report);
                break;
            }
            resolutions += 1;

            conflict.order_by(agents, self.dominance.as_ref());
            conflict.promote(&controlled);
            let mut resolved = false;
            let mut repeated = false;
            while let Some(candidate) = conflict.next_non_dominant() {
                if controlled.contains(&candidate) {
                    continue;
                }
                if yielded.contains(&(candidate, key.clone())) {
                    repeated = true;
                    continue;
                }
                if self.try_yield(round, agents, candidate, &conflict, &lookaheads)? {
                    yielded.insert((candidate, key.clone()));
                    report.escapes += 1;
                    resolved = true;
                    break;
                }
            }
            if resolved {
                continue;
            }

            let uncertain: Vec<usize> = key
                .iter()
                .copied()
                .filter(|&i| !controlled.contains(&i) && self.can_localize(&agents[i], localizations[i]))
                .collect();
            if !uncertain.is_empty() {
                for &i in &uncertain {
                    localizations[i] += 1;
                    localize.insert(i);
                }
                report.localization_rounds += 1;
                self.observer.on_resolution(
                    round,
                    ResolutionOutcome::Localizing {
                        agents: uncertain.len(),
                    },
                );
                break;
            }

            if self.config.joint_fallback
                && joint.is_none()
                && let Some(group) = self.build_joint(agents, &conflict)
            {
                for &i in group.members() {
                    agents[i].release();
                }
                self.observer.on_resolution(
                    round,
                    ResolutionOutcome::Joint {
                        agents: group.members().len(),
                        adr: group.adr(),
                    },
                );
                report.joint_phases += 1;
                *joint = Some(group);
                continue;
            }

            if repeated {
                debug!("Round {}: {} persists after yielding", round, conflict);
                report.accepted += 1;
                self.observer.on_resolution(round, ResolutionOutcome::Accepted { agents: key.len() });
            } else {
                warn!("Round {}: no resolution for {}, moving forward", round, conflict);
                self.give_up(round, report);
            }
            settled.insert(key);
        }
        Ok(localize)
    }

    fn give_up(&mut self, round: usize, report: &mut EpisodeReport) {
        report.unresolved += 1;
        self.observer.on_resolution(round, ResolutionOutcome::GaveUp);
    }

    /// Ask `candidate` to keep clear of every other member's possible states
    /// up to the conflict step. The escape is kept only if its own lookahead
    /// no longer meets theirs at any depth up to that step.
    fn try_yield(
        &mut self,
        round: usize,
        agents: &mut [Agent],
        candidate: usize,
        conflict: &PotentialCollisionData,
        lookaheads: &[(usize, Lookahead)],
    ) -> Result<bool, CoordinationError> {
        let others: Vec<&Lookahead> = lookaheads
            .iter()
            .filter(|(i, _)| *i != candidate && conflict.members().contains(i))
            .map(|(_, lookahead)| lookahead)
            .collect();
        let avoid: BTreeSet<StateId> = others
            .iter()
            .flat_map(|lookahead| lookahead.states_up_to(conflict.step()))
            .collect();

        let agent = &mut agents[candidate];
        agent.forbidden_mut().save();
        agent.forbidden_mut().clear();
        agent.forbidden_mut().add_all(avoid);

        let outcome = match agent.plan_escape(self.planner.as_ref(), &mut self.rng) {
            Ok(outcome) => outcome,
            Err(e) => {
                agent.forbidden_mut().restore();
                return Err(e.into());
            }
        };

        let clears = outcome.is_feasible() && {
            let escape = agent.lookahead_with(outcome.policy.as_ref(), conflict.step());
            (1..=conflict.step())
                .all(|d| others.iter().all(|other| escape.states_at(d).is_disjoint(other.states_at(d))))
        };

        if clears {
            agent.forbidden_mut().commit();
            agent.arm_escape(outcome.policy, self.config.escape_timer);
            debug!("Agent {}: escaping, forbidden {}", agent.label(), agent.forbidden());
            self.observer.on_resolution(
                round,
                ResolutionOutcome::Yielded {
                    agent: candidate,
                    adr: outcome.adr,
                    timer: self.config.escape_timer,
                },
            );
            Ok(true)
        } else {
            if outcome.is_feasible() {
                debug!("Agent {}: escape does not clear {}", agent.label(), conflict);
            }
            agent.forbidden_mut().restore();
            self.observer.on_resolution(
                round,
                ResolutionOutcome::Infeasible {
                    agent: candidate,
                    adr: outcome.adr,
                },
            );
            Ok(false)
        }
    }

    fn can_localize(&self, agent: &Agent, rounds: usize) -> bool {
        rounds < self.config.max_localization_rounds
            && !agent.belief().is_certain()
            && !agent.model().sensing_actions().is_empty()
    }

    fn build_joint(&mut self, agents: &[Agent], conflict: &PotentialCollisionData) -> Option<JointAgent> {
        match JointAgent::build(
            agents,
            conflict.members(),
            conflict.states(),
            self.planner.as_ref(),
            &self.config.joint,
            self.config.joint_max_steps,
            &mut self.rng,
        ) {
            Ok(group) if group.is_feasible() => Some(group),
            Ok(group) => {
                debug!("Joint: plan for {} infeasible (adr {:.3})", conflict, group.adr());
                None
            }
            Err(e) => {
                debug!("Joint: not built for {}: {}", conflict, e);
                None
            }
        }
    }

    fn step_agents(
        &mut self,
        round: usize,
        agents: &mut [Agent],
        joint: &mut Option<JointAgent>,
        localize: &BTreeSet<usize>,
    ) {
        for i in 0..agents.len() {
            if !agents[i].is_active() || joint.as_ref().is_some_and(|j| j.contains(i)) {
                continue;
            }
            let sensing = if localize.contains(&i) {
                let model = agents[i].model().clone();
                let env: Arc<dyn Pomdp> = model.clone();
                LocalizePolicy::new(env, model.sensing_actions()).act(agents[i].belief())
            } else {
                None
            };
            match sensing {
                Some(action) => {
                    agents[i].step_with(action, &mut self.rng);
                }
                None => {
                    if let Err(e) = agents[i].step(&mut self.rng) {
                        error!("Agent {}: {}", agents[i].label(), e);
                    }
                }
            }
            self.observer.on_agent_step(round, &agents[i]);
        }

        if let Some(group) = joint.as_mut() {
            let finished = match group.step(agents, &mut self.rng) {
                Ok(finished) => finished,
                Err(e) => {
                    error!("Joint: {}", e);
                    true
                }
            };
            for &i in group.members() {
                self.observer.on_agent_step(round, &agents[i]);
            }
            if finished {
                info!("Round {}: joint phase for {:?} over", round, group.members());
                *joint = None;
            }
        }
    }

    /// Count agents sharing a cell or belief support after the round.
    fn account(&mut self, round: usize, agents: &[Agent], report: &mut EpisodeReport) {
        let active: Vec<usize> = (0..agents.len()).filter(|&i| agents[i].is_active()).collect();
        for (k, &i) in active.iter().enumerate() {
            for &j in &active[k + 1..] {
                let (first, second) = (&agents[i], &agents[j]);
                if first.true_state() == second.true_state() {
                    report.collisions += 1;
                    self.observer.on_collision(round, first, second, first.true_state());
                }
                if first.belief().support().any(|s| second.belief().value_at(s) > 0.0) {
                    report.belief_overlaps += 1;
                }
            }
        }
    }
}

/// Lookaheads of active agents in index order. Agents under joint control
/// contribute the cells they may reach instead.
fn collect_lookaheads(agents: &[Agent], joint: Option<&JointAgent>) -> Vec<(usize, Lookahead)> {
    let mut lookaheads: Vec<(usize, Lookahead)> = agents
        .iter()
        .enumerate()
        .filter(|(i, agent)| agent.is_active() && joint.is_none_or(|j| !j.contains(*i)))
        .filter_map(|(i, agent)| agent.lookahead().map(|l| (i, l)))
        .collect();
    if let Some(group) = joint {
        lookaheads.extend(group.reachable(agents));
        lookaheads.sort_by_key(|(i, _)| *i);
    }
    lookaheads
}

/// Agents compare states across models, so they must number cells alike.
fn check_shared_map(agents: &[Agent]) -> Result<(), ModelError> {
    let Some(first) = agents.first() else {
        return Err(ModelError::InvalidScenario("no agents".to_string()));
    };
    let map = first.model().map();
    for agent in &agents[1..] {
        let other = agent.model().map();
        if !Arc::ptr_eq(map, other) && (map.width != other.width || map.height != other.height || map.len() != other.len()) {
            return Err(ModelError::InvalidScenario(format!(
                "agent {} does not share the map of agent {}",
                agent.label(),
                first.label()
            )));
        }
    }
    Ok(())
}
