//! Shared test utilities for unpackd integration tests.
//!
//! - `TestHarness`: an isolated var directory with a file-backed store
//! - `FakeSevenZip`: a scripted `CommandRunner` standing in for 7-Zip
//! - builders for job drafts and submissions

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{FakeSevenZip, TestHarness};
