mod coordinator;
pub mod engine;
pub mod states;

pub use coordinator::Gateway;
pub use engine::{GatewayFlow, TransitionError};
pub use states::{GatewayEvent, GatewayState, TransitionOutcome};
