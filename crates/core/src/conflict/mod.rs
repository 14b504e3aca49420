//! Conflict detection, automatic merging, and agent-assisted resolution.
//!
//! The conflict subsystem is responsible for:
//! 1. **Detection** -- classifying how two branches' change regions interact.
//! 2. **Merging** -- three-way merge, ordered concatenation and precedence.
//! 3. **Resolution** -- handing what is left to an external agent and
//!    validating its answer.

pub mod agent;
pub mod detector;
pub mod merger;
pub mod resolver;

pub use agent::{CommandAgent, ResolutionAgent, ResolutionContext};
pub use detector::{
    BranchRegion, Classification, ConflictDetector, ConflictKind, ConflictRecord, FileVersions,
    ResolutionStatus, ResolutionStrategy,
};
pub use merger::{AutoMerger, MergeResult, Merger};
pub use resolver::{AiResolver, Rejection, ResolutionDraft};
