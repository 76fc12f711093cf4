//! Integration test harness.

mod mock_chain;
mod sweep_flow;
