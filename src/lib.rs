pub mod bus;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod orchestrator;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::{EventStream, Orchestrator, ProjectSpec, ProjectStatus, TaskEvent, TaskSpec};
