//! Kiln Core
//!
//! Core domain types, traits, and error handling for Kiln.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across the cache, runner, scheduler and CLI crates.

pub mod cache;
pub mod error;
pub mod filter;
pub mod ids;
pub mod job;
pub mod pipeline;
pub mod ports;
pub mod run;
pub mod workspace;

pub use error::{Error, Result};
pub use ids::*;
