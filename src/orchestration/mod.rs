//! Scheduling, dispatch, and conflict arbitration.

pub mod dispatcher;
pub mod registry;
pub mod resolver;
pub mod scheduler;

pub use dispatcher::{Dispatcher, InvocationOutcome};
pub use registry::{AgentDescriptor, AgentRegistry, CapabilityError, TaskPayload, Worker};
pub use resolver::{arbitrate, Arbitration, Resolution};
pub use scheduler::{Dispatch, Scheduler};
