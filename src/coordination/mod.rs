mod agent;
mod collision;
mod coordinator;
mod dominance;
mod expansion;
mod joint_agent;

pub use agent::{Agent, AgentConfig, AgentMode, AgentStatus};
pub use collision::{CollisionDetector, DetectionMode, Participant, PotentialCollisionData};
pub use coordinator::{AgentReport, Coordinator, CoordinatorConfig, EpisodeReport};
pub use dominance::{ClosestToGoal, DominanceKey, DominancePolicy};
pub use expansion::{ExpansionConfig, ExpansionMode, ExpansionStep, Lookahead, expand_step};
pub use joint_agent::JointAgent;
