//! Master process: owns the durable send queue, the distribution engine,
//! and the dispatch loop. Talks to the worker fleet over HTTP+JSON.

pub mod api;
pub mod cli;
pub mod distributor;
pub mod processor;
pub mod senders;
pub mod state;
pub mod workers;
