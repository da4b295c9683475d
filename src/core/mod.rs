// src/core/mod.rs

/// Pipeline stages and the helpers they share (HTTP client, renderer, hashing).
pub mod agents;

pub mod error;

/// Typed topics and the bus that dispatches them.
pub mod events;

/// Admission gate bounding how many probes run at once.
pub mod limiter;

/// Page records and the header classification table.
pub mod models;

pub mod ports;

/// HTML report rendering from a session snapshot.
pub mod report;

/// Per-run state: registry, stats, bus, limiter and output root.
pub mod session;

/// Structural signatures and greedy page clustering.
pub mod similarity;

pub mod stats;

/// Target extraction from raw input.
pub mod targets;
