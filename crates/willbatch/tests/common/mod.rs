//! Shared test utilities for willbatch integration tests.
//!
//! This module provides:
//! - `TestHarness` wiring a store, controller and progress channel together
//! - Builders for submissions and record sets

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{FailingValidator, HookValidator, StallDelay, TestHarness};
