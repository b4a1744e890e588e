//! Event distribution for workflow instances.

pub mod bus;

pub use bus::EventBus;
