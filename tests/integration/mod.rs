//! End-to-end healing scenarios against scripted remote doubles.
//!
//! Every test builds its own engine on an in-memory store and a frozen
//! clock, so no network or remote host is needed.

mod healing_flow_tests;
mod helpers;
mod supervision_tests;

pub use helpers::*;
