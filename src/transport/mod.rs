//! Wire-level building blocks shared by the broker, the agents and the
//! clients: the JSON message envelope, line-framed socket I/O, the
//! heartbeat liveness channel and the request/reply client.

pub mod bundle;
pub mod client;
pub mod heartbeat;
pub mod message;
pub mod wire;

#[cfg(test)]
mod tests;
