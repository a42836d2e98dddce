//! Transports for running nodeflow executions
//!
//! A transport hides where the engine runs. Callers hand it a node tree and
//! a request and get an [`ExecutionResult`](nodeflow_engine::ExecutionResult)
//! back, whether the orchestrator lives in the same task
//! ([`InProcessTransport`]) or behind a message boundary
//! ([`WorkerTransport`]).

pub mod error;
pub mod in_process;
pub mod transport;
pub mod worker;

pub use error::TransportError;
pub use in_process::InProcessTransport;
pub use transport::{ExecutionTransport, TransportHealth, TransportRequest};
pub use worker::WorkerTransport;
