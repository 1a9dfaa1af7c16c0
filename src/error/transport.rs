use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No reply within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("Broker {broker_pid} has no agent available")]
    NoWorker { broker_pid: u32 },
    #[error("I/O failure while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to connect to {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("Frame exceeds the {max_bytes} byte limit")]
    FrameTooLarge { max_bytes: usize },
    #[error("Frame is not valid UTF-8: {source}")]
    FrameInvalidUtf8 {
        #[source]
        source: std::str::Utf8Error,
    },
    #[error("Failed to serialize {context}: {source}")]
    Serialize {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to deserialize {context}: {source}")]
    Deserialize {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Remote error: {message}")]
    Remote { message: String },
    #[error("Reply carries neither result nor error")]
    MissingResult,
    #[error("Connection pool is closed")]
    PoolClosed,
}
