//! Execution engine for playbook runs.

mod cancellation;
mod executor;
mod scheduler;

pub use cancellation::CancellationRegistry;
pub use executor::{EdgeChoice, FlowExecutor, TriggerEvent};
pub use scheduler::WakeupScheduler;
