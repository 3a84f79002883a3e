//! Gateway service for a fleet of plensor ultrasound sensors on a
//! single-master RS-485 bus.
//!
//! The service exchanges framed binary commands with each sensor, runs a
//! long-lived measurement scheduler (periodic probe/calibrate/measure cycles
//! with out-of-band interrupts), and persists measurement artifacts under
//! deterministic names.

pub mod artifact;
pub mod codec;
pub mod logger;
pub mod plan;
pub mod queue;
pub mod scheduler;
pub mod sensor;
pub mod transport;
pub mod watcher;
