pub mod delegation;
pub mod dispatcher;
pub mod persona;
pub mod step_executor;
pub mod turn_loop;

pub use delegation::{DelegatingRouter, HelperAgent, RouteTarget, DELEGATE_TOOL};
pub use dispatcher::{StepDispatch, StepOutcome, WaveDispatcher, WaveReport};
pub use persona::Persona;
pub use step_executor::StepExecutor;
pub use turn_loop::{RegistryRouter, TurnLoop, TurnRouter};
