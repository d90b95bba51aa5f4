use std::collections::BTreeSet;
use std::sync::Arc;

use rand::rngs::StdRng;

use crate::env::{GridAction, JointGrid, JointGridConfig, JointMember, Pomdp, StateId};
use crate::infra::{AgentError, JointError, ModelError, Position};
use crate::planners::{NullPolicy, PlanRequest, Planner, Policy};
use crate::state::{BeliefState, ForbiddenStates};

use super::agent::Agent;
use super::expansion::Lookahead;

/// A group of agents planned together on a joint sub-grid model. Each joint
/// action is decoded and forwarded to the member agents, which keep their
/// own beliefs and rewards.
pub struct JointAgent {
    members: Vec<usize>,
    grid: Arc<JointGrid>,
    policy: Arc<dyn Policy>,
    adr: f64,
    feasible: bool,
    steps: usize,
    max_steps: usize,
}

impl JointAgent {
    /// Build and solve the joint model for `members` around their belief
    /// supports and the colliding `states`.
    pub fn build(
        agents: &[Agent],
        members: &[usize],
        states: &BTreeSet<StateId>,
        planner: &dyn Planner,
        config: &JointGridConfig,
        max_steps: usize,
        rng: &mut StdRng,
    ) -> Result<Self, JointError> {
        let mut anchors: Vec<Position> = Vec::new();
        let mut joint_members = Vec::with_capacity(members.len());
        for &i in members {
            let agent = &agents[i];
            let model = agent.model();
            anchors.extend(agent.belief().support().filter_map(|s| model.position_of(s)));
            anchors.extend(states.iter().filter_map(|&s| model.position_of(s)));
            let value: Arc<dyn Policy> = match agent.main_policy() {
                Some(policy) => policy.clone(),
                None => Arc::new(NullPolicy::new(model.action_id(GridAction::Done))),
            };
            joint_members.push(JointMember {
                model: model.clone(),
                value,
            });
        }

        let grid = Arc::new(JointGrid::new(joint_members, &anchors, config)?);
        let belief = Self::belief_of(&grid, agents, members)?;
        let forbidden = ForbiddenStates::new();
        let request = PlanRequest {
            env: grid.clone(),
            forbidden: &forbidden,
            belief: &belief,
            continuation: None,
        };
        let outcome = planner.plan(&request, rng)?;
        tracing::info!(
            "Joint: {} members on {} ({} states), adr {:.3}",
            members.len(),
            grid.bounds(),
            grid.state_count(),
            outcome.adr
        );

        Ok(Self {
            members: members.to_vec(),
            grid,
            feasible: outcome.is_feasible(),
            adr: outcome.adr,
            policy: outcome.policy,
            steps: 0,
            max_steps,
        })
    }

    fn belief_of(grid: &JointGrid, agents: &[Agent], members: &[usize]) -> Result<BeliefState, ModelError> {
        let beliefs: Vec<BeliefState> = members.iter().map(|&i| agents[i].belief().clone()).collect();
        let arena = members.first().and_then(|&i| agents[i].arena().cloned());
        BeliefState::from_entries(grid.model_id(), grid.joint_belief_entries(&beliefs), arena)
    }

    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn contains(&self, agent: usize) -> bool {
        self.members.contains(&agent)
    }

    pub fn grid(&self) -> &Arc<JointGrid> {
        &self.grid
    }

    pub fn adr(&self) -> f64 {
        self.adr
    }

    pub fn is_feasible(&self) -> bool {
        self.feasible
    }

    /// Cells each active member may occupy at each depth of its lookahead
    /// horizon: every cell within `depth` moves of its belief support.
    /// Agents outside the group detect against these.
    pub fn reachable(&self, agents: &[Agent]) -> Vec<(usize, Lookahead)> {
        self.members
            .iter()
            .filter(|&&i| agents[i].is_active())
            .map(|&i| {
                let agent = &agents[i];
                let model = agent.model();
                let support: Vec<Position> = agent.belief().support().filter_map(|s| model.position_of(s)).collect();
                let layers = (0..=agent.lookahead_horizon())
                    .map(|depth| {
                        model
                            .map()
                            .iter()
                            .filter(|(_, cell)| support.iter().any(|p| p.distance(cell) <= depth as i32))
                            .map(|(state, _)| state)
                            .collect()
                    })
                    .collect();
                (i, Lookahead::from_layers(layers))
            })
            .collect()
    }

    fn true_state(&self, agents: &[Agent]) -> StateId {
        let locals: Vec<usize> = self
            .members
            .iter()
            .enumerate()
            .map(|(k, &i)| self.grid.to_local(k, agents[i].true_state()))
            .collect();
        self.grid.encode_state(&locals)
    }

    /// Members that are done inside the joint model step on their own.
    fn is_member_finished(&self, k: usize, agents: &[Agent]) -> bool {
        let local = self.grid.to_local(k, agents[self.members[k]].true_state());
        local == self.grid.single_done() || self.grid.is_absorbed(k, local)
    }

    /// Step every member once. Returns true when the joint phase is over.
    pub fn step(&mut self, agents: &mut [Agent], rng: &mut StdRng) -> Result<bool, AgentError> {
        let belief = match Self::belief_of(&self.grid, agents, &self.members) {
            Ok(belief) => belief,
            Err(e) => {
                tracing::warn!("Joint: no joint belief ({}), releasing members", e);
                return Ok(true);
            }
        };
        let action = self.policy.act(&belief).ok_or(AgentError::NoAction {
            agent: self.members[0],
        })?;
        let actions = self.grid.decode_action(action);
        tracing::debug!("Joint: step {} action {}", self.steps, self.grid.action_label(action));

        for (k, &i) in self.members.iter().enumerate() {
            if !agents[i].is_active() {
                continue;
            }
            if self.is_member_finished(k, agents) {
                agents[i].step(rng)?;
            } else {
                agents[i].step_with(actions[k], rng);
            }
        }
        self.steps += 1;

        let finished = self.grid.is_terminal(self.true_state(agents))
            || self.members.iter().all(|&i| !agents[i].is_active())
            || self.steps >= self.max_steps;
        Ok(finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::agent::{AgentConfig, AgentStatus};
    use crate::env::{GridParams, Scenario};
    use crate::planners::QmdpPlanner;
    use rand::SeedableRng;

    fn crossing_agents(rng: &mut StdRng) -> Vec<Agent> {
        let scenario = Scenario::crossing().unwrap();
        let params = GridParams {
            slip: 0.0,
            ..GridParams::default()
        };
        let planner = QmdpPlanner::default();
        scenario
            .build_models(&params)
            .unwrap()
            .into_iter()
            .zip(&scenario.agents)
            .enumerate()
            .map(|(i, (model, spec))| {
                let mut agent = Agent::new(i, spec.name, model, AgentConfig::default(), None, rng).unwrap();
                agent.retrain(&planner, rng).unwrap();
                agent
            })
            .collect()
    }

    #[test]
    fn test_joint_agent_crosses_without_collision() {
        let mut rng = StdRng::seed_from_u64(21);
        let mut agents = crossing_agents(&mut rng);
        let centre = agents[0].model().state_of(&Position::new(2, 2)).unwrap();
        let mut joint = JointAgent::build(
            &agents,
            &[0, 1],
            &BTreeSet::from([centre]),
            &QmdpPlanner::default(),
            &JointGridConfig::default(),
            20,
            &mut rng,
        )
        .unwrap();
        assert_eq!(joint.members(), &[0, 1]);
        assert!(joint.contains(1));
        assert!(joint.is_feasible());

        let mut done = false;
        for _ in 0..20 {
            done = joint.step(&mut agents, &mut rng).unwrap();
            assert_ne!(agents[0].true_state(), agents[1].true_state());
            if done {
                break;
            }
        }
        assert!(done);
        // the phase ends once one member can leave the sub-grid on its own
        let grid = joint.grid().clone();
        let finished = (0..2)
            .filter(|&k| {
                let local = grid.to_local(k, agents[k].true_state());
                local == grid.single_done() || grid.is_absorbed(k, local)
            })
            .count();
        assert!(finished >= 1);
        assert!(agents.iter().all(|a| a.status() == AgentStatus::Active));
    }

    #[test]
    fn test_joint_members_reachable_cells_grow() {
        let mut rng = StdRng::seed_from_u64(23);
        let agents = crossing_agents(&mut rng);
        let centre = agents[0].model().state_of(&Position::new(2, 2)).unwrap();
        let joint = JointAgent::build(
            &agents,
            &[0, 1],
            &BTreeSet::from([centre]),
            &QmdpPlanner::default(),
            &JointGridConfig::default(),
            20,
            &mut rng,
        )
        .unwrap();

        let reachable = joint.reachable(&agents);
        assert_eq!(reachable.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1]);
        let (_, first) = &reachable[0];
        assert_eq!(first.depth(), agents[0].lookahead_horizon());
        let start = agents[0].true_state();
        assert_eq!(first.states_at(0), &BTreeSet::from([start]));
        // west edge start: the cell itself plus three neighbours
        assert_eq!(first.states_at(1).len(), 4);
        assert!(first.states_at(2).contains(&centre));
        assert!(!first.states_at(1).contains(&centre));
    }

    #[test]
    fn test_joint_agent_rejects_single_member() {
        let mut rng = StdRng::seed_from_u64(22);
        let agents = crossing_agents(&mut rng);
        let result = JointAgent::build(
            &agents,
            &[0],
            &BTreeSet::new(),
            &QmdpPlanner::default(),
            &JointGridConfig::default(),
            20,
            &mut rng,
        );
        assert!(matches!(result, Err(JointError::TooFewMembers(1))));
    }
}
