use thiserror::Error;

/// Errors raised while building a grid model or a scenario.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Invalid scenario: {0}")]
    InvalidScenario(String),

    #[error("Agent '{0}' has a start cell but no goal cell")]
    MissingGoal(char),

    #[error("Agent '{0}' has a goal cell but no start cell")]
    MissingStart(char),

    #[error("Position {0} is not a free cell")]
    NotFree(crate::infra::Position),

    #[error("Belief has no probability mass")]
    EmptyBelief,
}

/// Errors raised by a planner.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Cannot plan from an empty belief")]
    EmptyBelief,

    #[error("Belief belongs to model {actual}, planner was given model {expected}")]
    ModelMismatch { expected: u64, actual: u64 },

    #[error("Model exposes no plannable actions")]
    NoActions,
}

/// Errors raised while stepping a single agent.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Agent {agent} has no policy to act with")]
    NoPolicy { agent: usize },

    #[error("Agent {agent}: policy returned no action")]
    NoAction { agent: usize },

    #[error("Agent {agent}: planning failed: {source}")]
    Plan {
        agent: usize,
        #[source]
        source: PlanError,
    },
}

/// Errors raised while building a joint grid.
#[derive(Error, Debug)]
pub enum JointError {
    #[error("Joint grid needs at least two members, got {0}")]
    TooFewMembers(usize),

    #[error("Joint grid for {members} members would have {states} states (limit {limit})")]
    TooLarge {
        members: usize,
        states: usize,
        limit: usize,
    },

    #[error("Joint sub-grid {0} contains no free cell")]
    NoCells(crate::infra::Bounds),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// Umbrella error surfaced to the driver.
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Joint(#[from] JointError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
