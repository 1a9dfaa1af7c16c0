mod agent;
mod app;
mod config;
mod control;
mod transport;

pub use agent::AgentError;
pub use app::{AppError, AppResult};
pub use config::ConfigError;
pub use control::ControlError;
pub use transport::TransportError;
