//! Run-completion observers.
//!
//! Observers are invoked with the aggregate view of a finished run; an
//! observer failure is logged and never blocks the others.

use serde_json::{Map, Value};
use tracing::info;

use crate::error::AppResult;

/// External observer seam: `observer(aggregate_result, run_args)`.
pub trait RunObserver: Send {
    fn name(&self) -> &str;

    /// # Errors
    ///
    /// Observer failures are reported to the caller, which logs them.
    fn run_ended(&self, aggregate: &Map<String, Value>, args: &Value) -> AppResult<()>;
}

/// Reference observer: logs the aggregate counts of the finished run.
pub struct LogObserver;

impl RunObserver for LogObserver {
    fn name(&self) -> &str {
        "log"
    }

    fn run_ended(&self, aggregate: &Map<String, Value>, _args: &Value) -> AppResult<()> {
        let run_id = aggregate
            .get("run_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let summary = Value::Object(aggregate.clone());
        info!("Run {} ended: {}", run_id, summary);
        Ok(())
    }
}
