//! TaskMerge core library.
//!
//! This crate integrates independently built task branches back into a
//! shared integration branch: task registry, file timeline, symbol-aware
//! change analysis, conflict classification, automatic and agent-assisted
//! resolution, and the merge orchestrator that ties them together.

pub mod analyzer;
pub mod config;
pub mod conflict;
pub mod db;
pub mod errors;
pub mod git;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod report;
pub mod retry;
pub mod timeline;

// Re-exports for convenience.
pub use analyzer::SemanticAnalyzer;
pub use config::EngineConfig;
pub use db::Database;
pub use git::{GitClient, VersionedRepo};
pub use orchestrator::{MergeLock, MergeOrchestrator};
pub use registry::WorktreeRegistry;
pub use report::MergeReport;
pub use retry::RetryPolicy;
pub use timeline::TimelineTracker;
