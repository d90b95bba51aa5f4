pub mod coordination;
pub mod env;
pub mod infra;
pub mod planners;
pub mod state;

// Re-export commonly used types for convenience
pub use coordination::{Agent, Coordinator, CoordinatorConfig, EpisodeReport};
pub use env::{BeaconGrid, Scenario};
pub use infra::{CoordinationError, Position};
pub use state::{BeliefState, ForbiddenStates};
