// Lineup Kernel
//
// Versioned waiting queues: ordering, optimistic concurrency, and
// crash-recoverable snapshots.

pub mod adapters;
pub mod config;
pub mod queue;
pub mod registry;
pub mod service;
pub mod versioned;
