pub mod engine;
pub mod states;

pub use engine::{TransitionError, WorkflowEngine};
pub use states::{InstanceState, TransitionOutcome, WorkflowAction};
