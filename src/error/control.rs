use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Not enough agents: asked for {asked}, {available} available")]
    NotEnoughWorkers { asked: usize, available: usize },
    #[error("A broker is already running (pid {pid})")]
    DuplicateBroker { pid: u32 },
    #[error("Unknown command {command}")]
    UnknownCommand { command: String },
    #[error("{command} requires a {field} field")]
    MissingField {
        command: &'static str,
        field: &'static str,
    },
}
