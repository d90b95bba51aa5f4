mod belief;
mod forbidden;
mod map;

pub use belief::{BeliefArena, BeliefState, NORMALIZATION_TOLERANCE};
pub use forbidden::ForbiddenStates;
pub use map::GridMap;
