use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Execution failed: {message}")]
    Execution { message: String },
    #[error("Command {command} is not supported by agents")]
    Unimplemented { command: String },
    #[error("Failed to prepare working directory {path}: {source}")]
    Workdir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Bad file payload {name}: {message}")]
    BadFilePayload { name: String, message: String },
    #[error("Run request is missing the {field} field")]
    MissingRunField { field: &'static str },
    #[error("No runner command configured")]
    NoRunner,
}
