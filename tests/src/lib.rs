//! # Message Bus Test Suite
//!
//! Cross-component flows run against the in-process broker.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── fixtures.rs    # Broker/subscriber harness
//!     ├── delivery.rs    # Fan-out, competing consumers, durability
//!     ├── delay.rs       # Delayed delivery and its absence
//!     ├── failures.rs    # Malformed payloads, startup failures
//!     └── shutdown.rs    # Coordinated stop
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p bus-tests
//! cargo test -p bus-tests integration::delay::
//!
//! # Benchmarks
//! cargo bench -p bus-tests
//! ```

#![allow(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod integration;
