use crate::coordination::{Agent, EpisodeReport, PotentialCollisionData};
use crate::env::StateId;
use crate::infra::{CoordinationObserver, ResolutionOutcome};

pub struct CompositeObserver {
    observers: Vec<Box<dyn CoordinationObserver>>,
}

impl CompositeObserver {
    pub fn new(observers: Vec<Box<dyn CoordinationObserver>>) -> Self {
        Self { observers }
    }

    pub fn push(&mut self, observer: Box<dyn CoordinationObserver>) {
        self.observers.push(observer);
    }
}

impl CoordinationObserver for CompositeObserver {
    fn on_episode_start(&mut self, episode: usize, agents: &[Agent]) {
        for observer in &mut self.observers {
            observer.on_episode_start(episode, agents);
        }
    }

    fn on_round_start(&mut self, round: usize, agents: &[Agent]) {
        for observer in &mut self.observers {
            observer.on_round_start(round, agents);
        }
    }

    fn on_conflict(&mut self, round: usize, conflict: &PotentialCollisionData, agents: &[Agent]) {
        for observer in &mut self.observers {
            observer.on_conflict(round, conflict, agents);
        }
    }

    fn on_resolution(&mut self, round: usize, outcome: ResolutionOutcome) {
        for observer in &mut self.observers {
            observer.on_resolution(round, outcome);
        }
    }

    fn on_agent_step(&mut self, round: usize, agent: &Agent) {
        for observer in &mut self.observers {
            observer.on_agent_step(round, agent);
        }
    }

    fn on_collision(&mut self, round: usize, first: &Agent, second: &Agent, state: StateId) {
        for observer in &mut self.observers {
            observer.on_collision(round, first, second, state);
        }
    }

    fn on_episode_finished(&mut self, report: &EpisodeReport) {
        for observer in &mut self.observers {
            observer.on_episode_finished(report);
        }
    }
}
