//! Container lifecycle: state machine, instances and the controller that
//! drives them.

mod controller;
mod instance;
mod state;

pub use controller::LifecycleController;
pub use instance::ContainerInstance;
pub use state::{InvalidTransition, LifecycleState};
