mod policy;
mod qmdp;

pub use policy::{LocalizePolicy, NullPolicy, Policy};
pub use qmdp::{PlanOutcome, PlanRequest, Planner, QmdpConfig, QmdpPlanner, QmdpPolicy};
