//! Persistence
//!
//! Durable writes are applied to storage asynchronously, one at a time, in
//! the order the controller issued them.

pub mod sequencer;

pub use sequencer::PersistenceSequencer;
