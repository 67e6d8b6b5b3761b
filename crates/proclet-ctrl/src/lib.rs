//! Controller service (§4.4): the single linearizable source of truth for
//! LP membership, heap-segment allocation, and proclet location.

pub mod controller;

pub use controller::{Controller, GlobalView};
