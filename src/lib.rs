//! Submission Orchestrator — the long-lived service that accepts a coding
//! agent's candidate solution, synchronises its workspace, drives a
//! build-then-test pipeline under strict deadlines, and streams progress
//! back to the submitting client.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use harness::{config::HarnessConfig, admission::AdmissionRegistry, http};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = Arc::new(HarnessConfig::from_env());
//! let registry = AdmissionRegistry::new();
//! let app = http::build_router(http::AppState::new(config, registry));
//! # let _ = app;
//! # }
//! ```

pub mod admission;
pub mod config;
pub mod error;
pub mod event;
pub mod http;
pub mod materializer;
pub mod models;
pub mod multiplexer;
pub mod pipeline;
pub mod process;

pub use admission::AdmissionRegistry;
pub use config::HarnessConfig;
pub use error::{Error, Result};
pub use event::OrchestratorEvent;
pub use models::{FinalVerdict, PhaseVerdict, SubmissionRequest};
