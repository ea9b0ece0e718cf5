#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Common types and utilities for dagflow
//!
//! This crate provides shared functionality across all orchestrator components.

pub mod config;
pub mod error;
pub mod keys;
pub mod llm;
pub mod metrics;
pub mod params;
pub mod retry;
pub mod telemetry;
pub mod timeutil;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use timeutil::TimeInUtc;
pub use types::*;

/// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use uuid::Uuid;
