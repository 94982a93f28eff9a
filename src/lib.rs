pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod store;
pub mod tmux;

pub use agent::AgentRole;
pub use config::Config;
pub use core::{Task, TaskId, TaskStatus, TaskTarget};
pub use error::{Error, Result};
pub use store::Store;
