//! Integration test suite for baton.
//!
//! These tests drive whole plans through the public [`baton::Orchestrator`]
//! interface with scripted agents and a recording alert port, and check the
//! state store, the scheduler event stream and the alerts that were raised.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: End-to-end plan execution, concurrency and cancellation
//! - `recovery`: Retry, fallback escalation and timeouts
//! - `approval`: Approval gates and rejection propagation
//! - `alerts`: Alert policy evaluation and action delivery
//! - `validation`: DAG validation, including property tests
//!
//! # CI Compatibility
//!
//! No test talks to a real agent. Timing-sensitive tests run on a paused
//! tokio clock, and the webhook test uses a loopback listener.

mod fixtures;

mod alerts;
mod approval;
