mod beacon_grid;
mod joint_grid;
mod pomdp;
mod scenario;

pub use beacon_grid::{Beacon, BeaconGrid, GridAction, GridParams};
pub use joint_grid::{JointGrid, JointGridConfig, JointMember};
pub use pomdp::{
    ActionId, ActionKind, ObservationId, Pomdp, StateId, next_model_id, sample_observation,
    sample_transition, sample_weighted,
};
pub use scenario::{AgentSpec, Scenario};
