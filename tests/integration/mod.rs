//! Integration test suite for conductor.
//!
//! These tests exercise the orchestration core end to end: batch
//! submission through scheduling, dispatch, transitions, conflict
//! arbitration, and recovery from persisted state. Workers are
//! in-process mocks, so the suite is safe for CI.
//!
//! # Test Categories
//!
//! - `batch_e2e`: Full batch execution and review flows
//! - `scheduling`: Dispatch ordering and dependency gating
//! - `failure_recovery`: Timeouts, retries, and cascade cancellation
//! - `conflict_resolution`: Arbitration and idempotent event handling
//! - `persistence`: Checkpoints, recovery, and the random-DAG invariant

mod fixtures;

mod batch_e2e;
mod conflict_resolution;
mod failure_recovery;
mod scheduling;
