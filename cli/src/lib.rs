//! Library half of the `agent-bridge` binary: the process-backed engine
//! runner and its router.

pub mod process_engine;
