use crate::coordination::{Agent, EpisodeReport, PotentialCollisionData};
use crate::env::StateId;

/// How the coordinator dealt with a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolutionOutcome {
    /// The agent accepted an escape policy.
    Yielded { agent: usize, adr: f64, timer: u32 },
    /// The agent found no feasible escape.
    Infeasible { agent: usize, adr: f64 },
    /// Members spend the round sensing.
    Localizing { agents: usize },
    /// Members handed to a joint planner.
    Joint { agents: usize, adr: f64 },
    /// The conflict came back after its members already yielded this
    /// round; it is left for the next round.
    Accepted { agents: usize },
    /// Nothing worked; agents move on regardless.
    GaveUp,
}

/// Trait for observing coordination events during an episode
pub trait CoordinationObserver {
    /// Called when an episode starts, after agents were reset
    fn on_episode_start(&mut self, episode: usize, agents: &[Agent]);

    /// Called before the conflict resolution of every round
    fn on_round_start(&mut self, _round: usize, _agents: &[Agent]) {}

    fn on_conflict(&mut self, round: usize, conflict: &PotentialCollisionData, agents: &[Agent]);

    fn on_resolution(&mut self, round: usize, outcome: ResolutionOutcome);

    /// Called after an agent executed its action for the round
    fn on_agent_step(&mut self, _round: usize, _agent: &Agent) {}

    /// Called when two agents share a cell after a round
    fn on_collision(&mut self, round: usize, first: &Agent, second: &Agent, state: StateId);

    fn on_episode_finished(&mut self, report: &EpisodeReport);
}
