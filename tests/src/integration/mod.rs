//! Integration flows across publisher, broker and subscriber.

pub mod fixtures;

mod delay;
mod delivery;
mod failures;
mod shutdown;
