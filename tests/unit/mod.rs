//! Unit tests for wpheal components
//!
//! These tests cover individual modules without a remote host or network.

mod test_config;
mod test_learning;
mod test_safety;
mod test_scoring;
mod test_store;
