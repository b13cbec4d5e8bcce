//! Top-level lifecycle: the state machine, the events it publishes and the
//! control loop that drives validation, connection, transfers and recovery.

pub mod engine;
pub mod events;
pub mod state;

pub use engine::{ControlError, Orchestrator, OrchestratorHandle, StatusSnapshot};
pub use events::{EventReceiver, EventSink, OrchestratorEvent, RetryStatus};
pub use state::{OrchestratorState, StateMachine, TransitionError};
