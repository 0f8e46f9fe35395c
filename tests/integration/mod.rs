//! Integration test suite for tempo.
//!
//! These tests drive the executor end to end with in-process runners, so
//! they make no external calls and are safe to run in CI.
//!
//! # Test Categories
//!
//! - `execution`: Run loop ordering, concurrency, retries and cancellation
//! - `mutation`: Dependency changes, before and during a run
//! - `admission`: Limit resolution and rate-limited dispatch
//! - `properties`: Invariants checked over generated plans


mod admission;
mod execution;
mod mutation;
mod properties;
