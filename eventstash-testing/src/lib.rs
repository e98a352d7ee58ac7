//! Shared test support for `eventstash` storage engines.
//!
//! * [`contract`] - the behavioral suite every [`EventRepository`] must pass,
//!   wired into a crate's tests with [`repository_contract_tests!`].
//! * [`clock`] - deterministic clocks for clients under test.
//! * [`fixtures`] - a small ledger domain, record builders and stream names.
//! * [`collector`] - a handler that remembers what it was notified of.
//!
//! [`EventRepository`]: eventstash::EventRepository

#![forbid(unsafe_code)]

pub mod clock;
pub mod collector;
pub mod contract;
pub mod fixtures;

pub use clock::{FixedClock, SteppingClock};
pub use collector::EventCollector;
