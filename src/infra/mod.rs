mod cartesian;
mod combinations;
mod composite_observer;
mod error;
mod mixed_radix;
mod observer;
mod pathfinding;
mod track_file;
mod tracing_observer;
mod types;

pub use cartesian::CartesianProduct;
pub use combinations::{Combinations, SubsetOrder, subsets};
pub use composite_observer::CompositeObserver;
pub use error::{AgentError, CoordinationError, JointError, ModelError, PlanError};
pub use mixed_radix::MixedRadix;
pub use observer::{CoordinationObserver, ResolutionOutcome};
pub use pathfinding::AStar;
pub use track_file::{TrackFile, count_collisions};
pub use tracing_observer::TracingObserver;
pub use types::{Bounds, Direction, Position};
