use tracing::{debug, info, warn};

use crate::coordination::{Agent, EpisodeReport, PotentialCollisionData};
use crate::env::StateId;
use crate::infra::{CoordinationObserver, ResolutionOutcome};

/// Logs coordination events; the map is drawn at debug level.
pub struct TracingObserver;

fn draw(agents: &[Agent]) -> Option<String> {
    let marks: Vec<_> = agents
        .iter()
        .filter_map(|agent| agent.position().map(|pos| (pos, agent.label())))
        .collect();
    agents.first().map(|agent| agent.model().map().draw_ascii(&marks))
}

impl CoordinationObserver for TracingObserver {
    fn on_episode_start(&mut self, episode: usize, agents: &[Agent]) {
        info!("Episode {} started with {} agents", episode, agents.len());
        for agent in agents {
            info!("- {}", agent);
        }
        if let Some(map) = draw(agents) {
            debug!("\n{}", map);
        }
    }

    fn on_round_start(&mut self, round: usize, agents: &[Agent]) {
        debug!("round: {}", round);
        for agent in agents.iter().filter(|a| a.is_active()) {
            debug!("  {}", agent);
        }
    }

    fn on_conflict(&mut self, round: usize, conflict: &PotentialCollisionData, agents: &[Agent]) {
        let labels: String = conflict.members().iter().map(|&i| agents[i].label()).collect();
        debug!("Round {}: conflict between {} ({})", round, labels, conflict);
    }

    fn on_resolution(&mut self, round: usize, outcome: ResolutionOutcome) {
        match outcome {
            ResolutionOutcome::Yielded { agent, adr, timer } => {
                debug!("Round {}: agent {} yields for {} steps (adr {:.3})", round, agent, timer, adr)
            }
            ResolutionOutcome::Infeasible { agent, adr } => {
                debug!("Round {}: agent {} has no escape (adr {:.3})", round, agent, adr)
            }
            ResolutionOutcome::Localizing { agents } => {
                info!("Round {}: {} agents localize", round, agents)
            }
            ResolutionOutcome::Joint { agents, adr } => {
                info!("Round {}: {} agents planned jointly (adr {:.3})", round, agents, adr)
            }
            ResolutionOutcome::Accepted { agents } => {
                debug!("Round {}: conflict of {} agents persists after yielding, accepted", round, agents)
            }
            ResolutionOutcome::GaveUp => warn!("Round {}: conflict unresolved, moving on", round),
        }
    }

    fn on_collision(&mut self, round: usize, first: &Agent, second: &Agent, state: StateId) {
        warn!(
            "Round {}: agents {} and {} collide at {}",
            round,
            first.label(),
            second.label(),
            first.model().map().position(state).map_or("?".to_string(), |p| p.to_string())
        );
    }

    fn on_episode_finished(&mut self, report: &EpisodeReport) {
        info!(
            "Episode {} finished after {} rounds: reward {:.3}, {} conflicts, {} collisions",
            report.episode, report.rounds, report.total_reward, report.conflicts, report.collisions
        );
        for agent in &report.agents {
            info!("- {}: {:?} after {} steps, reward {:.3}", agent.label, agent.status, agent.steps, agent.reward);
        }
    }
}
