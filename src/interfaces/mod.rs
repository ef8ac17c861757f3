//! Adapters between the queue and the outside world.
pub mod csv;
