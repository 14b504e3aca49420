//! Three-way merge engine and automatic resolution strategies.
//!
//! [`Merger`] wraps `diffy`'s line-based three-way merge. [`AutoMerger`]
//! layers the region-aware strategies on top of it and settles a conflict
//! record with the first strategy that applies.

use tracing::{debug, info};

use crate::analyzer::{apply_edits, split_lines, Edit, RegionKind};
use crate::config::MergeConfig;
use crate::conflict::detector::{
    ConflictKind, ConflictRecord, FileVersions, ResolutionStatus, ResolutionStrategy,
};
use crate::errors::ConflictError;

/// The result of a three-way merge attempt.
#[derive(Debug, Clone)]
pub struct MergeResult {
    /// The merged content (contains conflict markers if `has_conflicts` is true).
    pub merged_content: String,
    /// Whether the merge completed without conflicts.
    pub has_conflicts: bool,
    /// Locations of conflict markers within the merged content.
    pub conflict_markers: Vec<ConflictMarker>,
}

/// A single conflict block within merged output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictMarker {
    /// Starting line number (1-indexed) of the conflict marker block.
    pub start_line: usize,
    /// Ending line number (1-indexed) of the conflict marker block.
    pub end_line: usize,
}

/// Stateless three-way merge engine.
pub struct Merger;

impl Merger {
    /// Attempt a three-way merge of `base`, `ours`, and `theirs`.
    ///
    /// Returns a [`MergeResult`] that always contains merged content. If the
    /// merge is clean, `has_conflicts` will be `false`. If there are
    /// conflicts, diff3-style markers are inserted and `has_conflicts` is
    /// `true`.
    pub fn three_way_merge(base: &str, ours: &str, theirs: &str) -> MergeResult {
        // Fast path: if either side is identical to base, the other side wins cleanly.
        if ours == base || ours == theirs {
            debug!("ours matches base or theirs, theirs wins cleanly");
            return MergeResult::clean(theirs);
        }
        if theirs == base {
            debug!("theirs == base, ours wins cleanly");
            return MergeResult::clean(ours);
        }

        match diffy::merge(base, ours, theirs) {
            Ok(merged) => {
                debug!("clean three-way merge");
                MergeResult::clean(&merged)
            }
            Err(conflicted) => {
                debug!("three-way merge left conflict markers");
                let conflict_markers = find_conflict_markers(&conflicted);
                MergeResult {
                    merged_content: conflicted,
                    has_conflicts: true,
                    conflict_markers,
                }
            }
        }
    }

    /// Quick check: can these three versions be merged without conflicts?
    pub fn can_auto_merge(base: &str, ours: &str, theirs: &str) -> bool {
        if ours == base || theirs == base || ours == theirs {
            return true;
        }
        diffy::merge(base, ours, theirs).is_ok()
    }
}

impl MergeResult {
    fn clean(content: &str) -> Self {
        Self {
            merged_content: content.to_string(),
            has_conflicts: false,
            conflict_markers: Vec::new(),
        }
    }
}

/// Whether a line opens, separates or closes a conflict block.
pub fn is_conflict_marker_line(line: &str) -> bool {
    let line = line.trim_end_matches(['\n', '\r']);
    let marker = |prefix: &str| {
        line.strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(' '))
    };
    marker("<<<<<<<") || marker(">>>>>>>") || marker("|||||||") || line == "======="
}

/// Locate `<<<<<<<` ... `>>>>>>>` blocks in merged output.
fn find_conflict_markers(content: &str) -> Vec<ConflictMarker> {
    let mut markers = Vec::new();
    let mut open: Option<usize> = None;
    for (idx, line) in content.lines().enumerate() {
        if line.starts_with("<<<<<<<") {
            open = Some(idx + 1);
        } else if line.starts_with(">>>>>>>") {
            if let Some(start_line) = open.take() {
                markers.push(ConflictMarker {
                    start_line,
                    end_line: idx + 1,
                });
            }
        }
    }
    markers
}

/// Applies the automatic strategies in order: native three-way merge,
/// ordered concatenation, then region precedence.
#[derive(Debug, Clone)]
pub struct AutoMerger {
    semantic_threshold: f64,
    precedence_kinds: Vec<RegionKind>,
}

impl AutoMerger {
    pub fn new(config: &MergeConfig) -> Self {
        Self {
            semantic_threshold: config.semantic_threshold,
            precedence_kinds: config
                .precedence_kinds
                .iter()
                .filter_map(|k| RegionKind::from_str_val(k))
                .filter(|k| !matches!(k, RegionKind::WholeFile))
                .collect(),
        }
    }

    /// Merge a file whose change regions do not interact.
    ///
    /// Falls back to applying both edit sets independently when the native
    /// merge is stricter than the region analysis.
    pub fn merge_disjoint(&self, versions: &FileVersions) -> Option<String> {
        let result = Merger::three_way_merge(&versions.base, &versions.ours, &versions.theirs);
        if !result.has_conflicts {
            return Some(result.merged_content);
        }
        debug!(file = %versions.file_path, "native merge conflicted on disjoint regions, composing edits");
        compose(
            &versions.base,
            versions.ours_regions.iter().map(|r| &r.edit).collect(),
            versions.theirs_regions.iter().map(|r| &r.edit).collect(),
        )
    }

    /// Try each applicable strategy and settle `record` with the first that
    /// produces a merge. Returns the merged content, or `None` when the
    /// conflict needs the resolution agent.
    pub fn resolve(
        &self,
        record: &mut ConflictRecord,
        versions: &FileVersions,
    ) -> Result<Option<String>, ConflictError> {
        let attempt = match record.kind() {
            ConflictKind::None | ConflictKind::Textual => {
                let result =
                    Merger::three_way_merge(&versions.base, &versions.ours, &versions.theirs);
                (!result.has_conflicts)
                    .then(|| (ResolutionStrategy::ThreeWay, result.merged_content))
            }
            ConflictKind::Semantic => {
                let concatenated = if record.confidence >= self.semantic_threshold {
                    self.ordered_concatenation(versions)
                        .map(|m| (ResolutionStrategy::OrderedConcatenation, m))
                } else {
                    None
                };
                concatenated.or_else(|| {
                    self.precedence(versions)
                        .map(|m| (ResolutionStrategy::Precedence, m))
                })
            }
            ConflictKind::Structural => None,
        };

        let Some((strategy, merged)) = attempt else {
            debug!(
                file = %record.file_path(),
                kind = %record.kind(),
                confidence = record.confidence,
                "no automatic strategy applies"
            );
            return Ok(None);
        };
        record.resolve(ResolutionStatus::AutoResolved, strategy, merged.as_bytes())?;
        info!(
            file = %record.file_path(),
            strategy = %strategy,
            "conflict auto-resolved"
        );
        Ok(Some(merged))
    }

    /// Apply both sides' edits in base order; at the same position the
    /// integration branch goes first.
    pub fn ordered_concatenation(&self, versions: &FileVersions) -> Option<String> {
        compose(
            &versions.base,
            versions.ours_regions.iter().map(|r| &r.edit).collect(),
            versions.theirs_regions.iter().map(|r| &r.edit).collect(),
        )
    }

    /// Keep the task branch's side of every interacting pair, provided all
    /// interacting regions are of a whitelisted kind.
    pub fn precedence(&self, versions: &FileVersions) -> Option<String> {
        let pairs = versions.pairs();
        let (ours_idx, theirs_idx) = versions.paired_indices(&pairs);
        let whitelisted = ours_idx
            .iter()
            .map(|&i| &versions.ours_regions[i])
            .chain(theirs_idx.iter().map(|&j| &versions.theirs_regions[j]))
            .all(|r| self.precedence_kinds.contains(&r.kind));
        if !whitelisted {
            return None;
        }
        compose(
            &versions.base,
            versions
                .ours_regions
                .iter()
                .enumerate()
                .filter(|(i, _)| !ours_idx.contains(i))
                .map(|(_, r)| &r.edit)
                .collect(),
            versions.theirs_regions.iter().map(|r| &r.edit).collect(),
        )
    }
}

/// Apply two edit sets to `base`. An edit present identically on both
/// sides is applied once.
fn compose(base: &str, ours: Vec<&Edit>, theirs: Vec<&Edit>) -> Option<String> {
    let mut edits: Vec<(&Edit, u8)> = ours.iter().map(|e| (*e, 0)).collect();
    edits.extend(
        theirs
            .into_iter()
            .filter(|t| !ours.contains(t))
            .map(|e| (e, 1)),
    );
    edits.sort_by_key(|(e, side)| (e.base.start, e.base.end, *side));
    let ordered: Vec<&Edit> = edits.into_iter().map(|(e, _)| e).collect();
    apply_edits(&split_lines(base), &ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::SemanticAnalyzer;
    use crate::config::{AnalyzerConfig, MergeConfig};
    use crate::conflict::detector::ConflictDetector;

    fn versions(path: &str, base: &str, ours: &str, theirs: &str) -> FileVersions {
        let analyzer = SemanticAnalyzer::new(&AnalyzerConfig::default());
        FileVersions::analyze(
            &analyzer,
            path,
            base.to_string(),
            ours.to_string(),
            theirs.to_string(),
        )
    }

    #[test]
    fn test_identical_files() {
        let base = "line1\nline2\nline3\n";
        let result = Merger::three_way_merge(base, base, base);
        assert!(!result.has_conflicts);
        assert!(result.conflict_markers.is_empty());
    }

    #[test]
    fn test_only_one_side_changed() {
        let base = "line1\nline2\nline3\n";
        let changed = "line1\nmodified\nline3\n";
        assert_eq!(Merger::three_way_merge(base, changed, base).merged_content, changed);
        assert_eq!(Merger::three_way_merge(base, base, changed).merged_content, changed);
    }

    #[test]
    fn test_non_overlapping_changes() {
        let base = "aaa\nbbb\nccc\nddd\neee\n";
        let ours = "AAA\nbbb\nccc\nddd\neee\n";
        let theirs = "aaa\nbbb\nccc\nddd\nEEE\n";
        let result = Merger::three_way_merge(base, ours, theirs);
        assert!(!result.has_conflicts);
        assert_eq!(result.merged_content, "AAA\nbbb\nccc\nddd\nEEE\n");
    }

    #[test]
    fn test_conflicting_changes() {
        let base = "line1\noriginal\nline3\n";
        let ours = "line1\nours_version\nline3\n";
        let theirs = "line1\ntheirs_version\nline3\n";
        let result = Merger::three_way_merge(base, ours, theirs);
        assert!(result.has_conflicts);
        assert!(result.merged_content.contains("<<<<<<<"));
        assert!(result.merged_content.contains(">>>>>>>"));
        assert_eq!(result.conflict_markers.len(), 1);
        assert!(!Merger::can_auto_merge(base, ours, theirs));
    }

    #[test]
    fn test_marker_lines() {
        assert!(is_conflict_marker_line("<<<<<<< ours\n"));
        assert!(is_conflict_marker_line("=======\n"));
        assert!(is_conflict_marker_line(">>>>>>>"));
        assert!(is_conflict_marker_line("||||||| base"));
        assert!(!is_conflict_marker_line("// ======== section ========\n"));
        assert!(!is_conflict_marker_line("a <<<<<<< b"));
    }

    const BASE: &str = "\
fn build() -> Vec<u32> {
    let mut v = Vec::new();
    v.push(1);
    v
}
";

    #[test]
    fn test_semantic_insertions_are_concatenated_in_order() {
        let anchor = "    v.push(1);\n";
        let ours = BASE.replace(anchor, &format!("{}    v.push(2);\n", anchor));
        let theirs = BASE.replace(anchor, &format!("{}    v.push(3);\n", anchor));
        let v = versions("src/build.rs", BASE, &ours, &theirs);
        let mut record = ConflictDetector::detect("s", "t", "main", "task/a", &v).unwrap();
        assert_eq!(record.kind(), ConflictKind::Semantic);

        let merger = AutoMerger::new(&MergeConfig::default());
        let merged = merger.resolve(&mut record, &v).unwrap().unwrap();
        assert_eq!(
            merged,
            "fn build() -> Vec<u32> {\n    let mut v = Vec::new();\n    v.push(1);\n    v.push(2);\n    v.push(3);\n    v\n}\n"
        );
        assert_eq!(record.resolution_status(), ResolutionStatus::AutoResolved);
        assert_eq!(
            record.resolution_strategy,
            Some(ResolutionStrategy::OrderedConcatenation)
        );
        assert_eq!(
            record.result_hash.as_deref(),
            Some(crate::analyzer::content_hash(merged.as_bytes()).as_str())
        );
    }

    #[test]
    fn test_below_threshold_without_whitelist_is_left_pending() {
        let anchor = "    v.push(1);\n";
        let ours = BASE.replace(anchor, &format!("{}    v.push(2);\n", anchor));
        let theirs = BASE.replace(anchor, &format!("{}    v.push(3);\n", anchor));
        let v = versions("src/build.rs", BASE, &ours, &theirs);
        let mut record = ConflictDetector::detect("s", "t", "main", "task/a", &v).unwrap();

        let config = MergeConfig {
            semantic_threshold: 0.95,
            ..MergeConfig::default()
        };
        let merger = AutoMerger::new(&config);
        assert!(merger.resolve(&mut record, &v).unwrap().is_none());
        assert!(record.is_pending());
    }

    #[test]
    fn test_precedence_for_import_lines() {
        let base = "use a::One;\n\nfn f() {}\n";
        let ours = "use a::One;\nuse b::Two;\n\nfn f() {}\n";
        let theirs = "use a::One;\nuse c::Three;\n\nfn f() {}\n";
        let v = versions("src/lib.rs", base, ours, theirs);
        let mut record = ConflictDetector::detect("s", "t", "main", "task/a", &v).unwrap();
        assert_eq!(record.kind(), ConflictKind::Semantic);
        assert!(record
            .regions
            .iter()
            .all(|r| r.region.kind == RegionKind::Imports));

        let config = MergeConfig {
            semantic_threshold: 0.95,
            ..MergeConfig::default()
        };
        let merged = AutoMerger::new(&config)
            .resolve(&mut record, &v)
            .unwrap()
            .unwrap();
        assert_eq!(merged, theirs);
        assert_eq!(record.resolution_strategy, Some(ResolutionStrategy::Precedence));
    }

    #[test]
    fn test_structural_never_auto_resolves() {
        let ours = BASE.replace("fn build()", "fn build(seed: u32)");
        let theirs = BASE.replace("fn build()", "fn build(cap: usize)");
        let v = versions("src/build.rs", BASE, &ours, &theirs);
        let mut record = ConflictDetector::detect("s", "t", "main", "task/a", &v).unwrap();
        assert_eq!(record.kind(), ConflictKind::Structural);

        let config = MergeConfig {
            semantic_threshold: 0.0,
            precedence_kinds: vec!["imports".into(), "list_tail".into()],
            ..MergeConfig::default()
        };
        assert!(AutoMerger::new(&config)
            .resolve(&mut record, &v)
            .unwrap()
            .is_none());
        assert!(record.is_pending());
    }

    #[test]
    fn test_merge_disjoint() {
        let base = "fn a() {\n    1\n}\n\nfn b() {\n    2\n}\n";
        let ours = "fn a() {\n    10\n}\n\nfn b() {\n    2\n}\n";
        let theirs = "fn a() {\n    1\n}\n\nfn b() {\n    20\n}\n";
        let v = versions("src/lib.rs", base, ours, theirs);
        let merged = AutoMerger::new(&MergeConfig::default())
            .merge_disjoint(&v)
            .unwrap();
        assert_eq!(merged, "fn a() {\n    10\n}\n\nfn b() {\n    20\n}\n");
    }

    #[test]
    fn test_compose_applies_shared_edit_once() {
        let base = "a\nb\n";
        let edit = Edit {
            base: crate::analyzer::LineRange::new(1, 1),
            lines: vec!["x\n".to_string()],
        };
        assert_eq!(compose(base, vec![&edit], vec![&edit]).unwrap(), "a\nx\nb\n");
    }
}
