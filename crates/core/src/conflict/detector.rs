//! Conflict detection logic.
//!
//! For every file changed on both the integration branch and a task branch,
//! the detector compares the two sets of change regions and decides how
//! hard the file is to merge: not at all ([`ConflictKind::None`]), only for
//! a line-based tool ([`ConflictKind::Textual`]), or genuinely overlapping
//! in a way that needs a smarter strategy ([`ConflictKind::Semantic`]) or
//! a human-grade resolution ([`ConflictKind::Structural`]).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::analyzer::{candidate_pairs, ChangeRegion, SemanticAnalyzer};
use crate::conflict::merger::Merger;
use crate::errors::ConflictError;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Classification of a file-level conflict, in increasing severity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// No change regions interact.
    None,
    /// Regions interact but a native three-way merge is clean.
    Textual,
    /// Regions interact without altering the same lines.
    Semantic,
    /// Both sides altered the same lines or the same declaration header, or
    /// both created the file with different content.
    Structural,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Textual => "textual",
            Self::Semantic => "semantic",
            Self::Structural => "structural",
        }
    }

    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "textual" => Some(Self::Textual),
            "semantic" => Some(Self::Semantic),
            "structural" => Some(Self::Structural),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a conflict record. Leaves `Pending` exactly once.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Pending,
    AutoResolved,
    AiResolved,
    Unresolved,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AutoResolved => "auto_resolved",
            Self::AiResolved => "ai_resolved",
            Self::Unresolved => "unresolved",
        }
    }

    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "auto_resolved" => Some(Self::AutoResolved),
            "ai_resolved" => Some(Self::AiResolved),
            "unresolved" => Some(Self::Unresolved),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::AutoResolved | Self::AiResolved)
    }
}

impl std::fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a conflict was resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    ThreeWay,
    OrderedConcatenation,
    Precedence,
    AiAgent,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ThreeWay => "three_way",
            Self::OrderedConcatenation => "ordered_concatenation",
            Self::Precedence => "precedence",
            Self::AiAgent => "ai_agent",
        }
    }

    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "three_way" => Some(Self::ThreeWay),
            "ordered_concatenation" => Some(Self::OrderedConcatenation),
            "precedence" => Some(Self::Precedence),
            "ai_agent" => Some(Self::AiAgent),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change region tagged with the branch it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRegion {
    pub branch: String,
    pub region: ChangeRegion,
}

/// A detected conflict in one file between the integration branch and a
/// task branch.
///
/// The file path and kind are fixed at detection; the resolution fields
/// change once, through [`ConflictRecord::settle`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: String,
    pub session_id: String,
    pub task_id: String,
    pub(crate) file_path: String,
    pub(crate) kind: ConflictKind,
    /// Interacting regions from each contributing branch.
    pub regions: Vec<BranchRegion>,
    pub confidence: f64,
    pub(crate) resolution_status: ResolutionStatus,
    pub resolution_strategy: Option<ResolutionStrategy>,
    /// SHA-256 of the merged file content.
    pub result_hash: Option<String>,
    /// Why the conflict stayed unresolved.
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    /// Create a pending record with a fresh UUID.
    pub fn new(
        session_id: impl Into<String>,
        task_id: impl Into<String>,
        file_path: impl Into<String>,
        kind: ConflictKind,
        confidence: f64,
        regions: Vec<BranchRegion>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            task_id: task_id.into(),
            file_path: file_path.into(),
            kind,
            regions,
            confidence: confidence.clamp(0.0, 1.0),
            resolution_status: ResolutionStatus::Pending,
            resolution_strategy: None,
            result_hash: None,
            detail: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn kind(&self) -> ConflictKind {
        self.kind
    }

    pub fn resolution_status(&self) -> ResolutionStatus {
        self.resolution_status
    }

    pub fn is_pending(&self) -> bool {
        self.resolution_status == ResolutionStatus::Pending
    }

    /// Record a resolution for the merged content `result`.
    pub fn resolve(
        &mut self,
        status: ResolutionStatus,
        strategy: ResolutionStrategy,
        result: &[u8],
    ) -> Result<(), ConflictError> {
        self.settle(
            status,
            Some(strategy),
            Some(crate::analyzer::content_hash(result)),
            None,
        )
    }

    /// Mark the conflict as needing attention outside the engine.
    pub fn give_up(&mut self, detail: impl Into<String>) -> Result<(), ConflictError> {
        self.settle(ResolutionStatus::Unresolved, None, None, Some(detail.into()))
    }

    /// Move out of `Pending`. Settled records never change again.
    pub fn settle(
        &mut self,
        status: ResolutionStatus,
        strategy: Option<ResolutionStrategy>,
        result_hash: Option<String>,
        detail: Option<String>,
    ) -> Result<(), ConflictError> {
        if !self.is_pending() {
            return Err(ConflictError::AlreadySettled(self.id.clone()));
        }
        if status == ResolutionStatus::Pending {
            return Err(ConflictError::MergeFailed(format!(
                "conflict {} cannot be settled as pending",
                self.id
            )));
        }
        self.resolution_status = status;
        self.resolution_strategy = strategy;
        self.result_hash = result_hash;
        self.detail = detail;
        self.resolved_at = Some(Utc::now());
        Ok(())
    }
}

/// The three versions of a file and the regions each side changed.
///
/// `ours` is the integration branch tip, `theirs` is the task branch.
#[derive(Debug, Clone)]
pub struct FileVersions {
    pub file_path: String,
    pub base: String,
    pub ours: String,
    pub theirs: String,
    pub ours_regions: Vec<ChangeRegion>,
    pub theirs_regions: Vec<ChangeRegion>,
}

impl FileVersions {
    pub fn analyze(
        analyzer: &SemanticAnalyzer,
        file_path: &str,
        base: String,
        ours: String,
        theirs: String,
    ) -> Self {
        let ours_regions = analyzer.analyze(&base, &ours, file_path);
        let theirs_regions = analyzer.analyze(&base, &theirs, file_path);
        Self {
            file_path: file_path.to_string(),
            base,
            ours,
            theirs,
            ours_regions,
            theirs_regions,
        }
    }

    /// Index pairs `(ours, theirs)` of regions that may interact.
    pub fn pairs(&self) -> Vec<(usize, usize)> {
        candidate_pairs(&self.ours_regions, &self.theirs_regions)
    }

    /// Indices of regions on each side that take part in any pair.
    pub fn paired_indices(&self, pairs: &[(usize, usize)]) -> (BTreeSet<usize>, BTreeSet<usize>) {
        (
            pairs.iter().map(|(i, _)| *i).collect(),
            pairs.iter().map(|(_, j)| *j).collect(),
        )
    }
}

/// Outcome of classifying one file.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub kind: ConflictKind,
    pub confidence: f64,
    pub pairs: Vec<(usize, usize)>,
}

/// Both-insertion pairs start from this confidence.
const INSERTION_CONFIDENCE: f64 = 0.7;
/// Pairs involving a modification or deletion start lower.
const MODIFICATION_CONFIDENCE: f64 = 0.45;
/// Confidence added as regions move apart, reached at [`DISTANCE_SATURATION`].
const DISTANCE_BONUS: f64 = 0.25;
const DISTANCE_SATURATION: usize = 8;
/// Confidence removed when the edits cover their whole enclosing scope.
const OVERLAP_PENALTY: f64 = 0.15;
pub const STRUCTURAL_CONFIDENCE: f64 = 0.2;

/// Stateless conflict classifier.
pub struct ConflictDetector;

impl ConflictDetector {
    /// Classify how the two sides of a file interact.
    pub fn classify(versions: &FileVersions) -> Classification {
        let pairs = versions.pairs();
        if pairs.is_empty() {
            return Classification {
                kind: ConflictKind::None,
                confidence: 1.0,
                pairs,
            };
        }

        if Merger::can_auto_merge(&versions.base, &versions.ours, &versions.theirs) {
            return Classification {
                kind: ConflictKind::Textual,
                confidence: 1.0,
                pairs,
            };
        }

        // Two independent versions of a new file; concatenating them would
        // duplicate every declaration.
        if versions.base.is_empty() {
            debug!(file = %versions.file_path, "file added on both sides");
            return Classification {
                kind: ConflictKind::Structural,
                confidence: STRUCTURAL_CONFIDENCE,
                pairs,
            };
        }

        let mut confidence: f64 = 1.0;
        for &(i, j) in &pairs {
            let a = &versions.ours_regions[i];
            let b = &versions.theirs_regions[j];
            if Self::is_structural(a, b) {
                debug!(
                    file = %versions.file_path,
                    ours = %a.symbol_path,
                    theirs = %b.symbol_path,
                    "structural overlap"
                );
                return Classification {
                    kind: ConflictKind::Structural,
                    confidence: STRUCTURAL_CONFIDENCE,
                    pairs,
                };
            }
            confidence = confidence.min(Self::pair_confidence(a, b));
        }

        Classification {
            kind: ConflictKind::Semantic,
            confidence,
            pairs,
        }
    }

    /// Both regions alter the same lines, or the same declaration header,
    /// or one of them is opaque.
    pub fn is_structural(a: &ChangeRegion, b: &ChangeRegion) -> bool {
        if a.is_whole_file() || b.is_whole_file() {
            return true;
        }
        let (ra, rb) = (&a.line_range, &b.line_range);
        let inside = |outer: &crate::analyzer::LineRange, point: &crate::analyzer::LineRange| {
            point.is_empty() && outer.start < point.start && point.start < outer.end
        };
        ra.shares_lines(rb)
            || inside(ra, rb)
            || inside(rb, ra)
            || (a.symbol_path == b.symbol_path && a.header && b.header)
    }

    /// Likelihood that applying both edits yields the intended result.
    pub fn pair_confidence(a: &ChangeRegion, b: &ChangeRegion) -> f64 {
        let base = if a.edit.is_insertion() && b.edit.is_insertion() {
            INSERTION_CONFIDENCE
        } else {
            MODIFICATION_CONFIDENCE
        };
        let gap = a.line_range.gap(&b.line_range).min(DISTANCE_SATURATION);
        let bonus = DISTANCE_BONUS * gap as f64 / DISTANCE_SATURATION as f64;
        let scope_len = a.scope_range.union(&b.scope_range).len().max(1);
        let altered = a.line_range.len() + b.line_range.len();
        let penalty = OVERLAP_PENALTY * (altered as f64 / scope_len as f64).min(1.0);
        (base + bonus - penalty).clamp(0.0, 1.0)
    }

    /// Classify a file and build its record. Returns `None` when nothing
    /// interacts.
    pub fn detect(
        session_id: &str,
        task_id: &str,
        integration_branch: &str,
        task_branch: &str,
        versions: &FileVersions,
    ) -> Option<ConflictRecord> {
        let classification = Self::classify(versions);
        if classification.kind == ConflictKind::None {
            return None;
        }
        let (ours_idx, theirs_idx) = versions.paired_indices(&classification.pairs);
        let regions = ours_idx
            .iter()
            .map(|&i| BranchRegion {
                branch: integration_branch.to_string(),
                region: versions.ours_regions[i].clone(),
            })
            .chain(theirs_idx.iter().map(|&j| BranchRegion {
                branch: task_branch.to_string(),
                region: versions.theirs_regions[j].clone(),
            }))
            .collect();
        debug!(
            file = %versions.file_path,
            kind = %classification.kind,
            confidence = classification.confidence,
            "conflict classified"
        );
        Some(ConflictRecord::new(
            session_id,
            task_id,
            &versions.file_path,
            classification.kind,
            classification.confidence,
            regions,
        ))
    }

    /// A structural record for a file that cannot be merged as text.
    pub fn opaque(session_id: &str, task_id: &str, file_path: &str, reason: &str) -> ConflictRecord {
        let mut record = ConflictRecord::new(
            session_id,
            task_id,
            file_path,
            ConflictKind::Structural,
            STRUCTURAL_CONFIDENCE,
            Vec::new(),
        );
        record.detail = Some(reason.to_string());
        record
    }
}
