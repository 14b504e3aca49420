//! Agent-assisted conflict resolution.
//!
//! The [`AiResolver`] isolates the smallest contiguous block of base lines
//! that covers every interacting region of a file (the hull), applies all
//! other changes from both branches around it, and asks the configured
//! [`ResolutionAgent`] for a version of the file with the hull resolved.
//! A candidate is accepted only if
//!
//! 1. everything outside the hull is byte-identical to the draft,
//! 2. the file still parses, and
//! 3. no conflict markers remain.
//!
//! Anything else leaves the conflict unresolved.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::analyzer::{
    apply_edits, parse_check, split_lines, Edit, Language, LineRange, ParseFailure,
};
use crate::config::ResolverConfig;
use crate::conflict::agent::{CommandAgent, ResolutionAgent, ResolutionContext};
use crate::conflict::detector::{
    ConflictRecord, FileVersions, ResolutionStatus, ResolutionStrategy,
};
use crate::conflict::merger::is_conflict_marker_line;
use crate::errors::{AgentError, ConflictError};
use crate::retry::RetryPolicy;

/// Why a candidate resolution was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("content outside the conflicting region was modified")]
    OutsideRegionModified,

    #[error("candidate does not parse: {0}")]
    ParseFailed(ParseFailure),

    #[error("candidate still contains conflict markers")]
    ConflictMarkers,
}

/// A file split around its conflicting hull.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionDraft {
    /// Base lines covered by the conflicting regions.
    pub hull: LineRange,
    /// Merged content before the hull.
    pub prefix: String,
    /// Merged content after the hull.
    pub suffix: String,
    pub base_region: String,
    pub ours_region: String,
    pub theirs_region: String,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Side {
    Ours,
    Theirs,
}

fn shifted(edit: &Edit, offset: usize) -> Edit {
    Edit {
        base: LineRange::new(edit.base.start - offset, edit.base.end - offset),
        lines: edit.lines.clone(),
    }
}

/// An edit that cannot live entirely on one side of `hull`.
fn straddles(edit: &LineRange, hull: &LineRange) -> bool {
    edit.shares_lines(hull)
        || (edit.is_empty() && hull.start < edit.start && edit.start < hull.end)
        || (hull.is_empty() && edit.start < hull.start && hull.start < edit.end)
}

fn terminated(text: &str) -> String {
    if text.is_empty() || text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{}\n", text)
    }
}

impl ResolutionDraft {
    /// Split `versions` around the hull of its interacting regions.
    ///
    /// Returns `None` when nothing interacts or the edits outside the hull
    /// cannot be applied together.
    pub fn build(versions: &FileVersions) -> Option<Self> {
        let pairs = versions.pairs();
        let mut hull = pairs
            .iter()
            .map(|&(i, j)| {
                versions.ours_regions[i]
                    .line_range
                    .union(&versions.theirs_regions[j].line_range)
            })
            .reduce(|a, b| a.union(&b))?;
        let (ours_idx, theirs_idx) = versions.paired_indices(&pairs);

        let edits: Vec<(&Edit, Side, bool)> = versions
            .ours_regions
            .iter()
            .enumerate()
            .map(|(i, r)| (&r.edit, Side::Ours, ours_idx.contains(&i)))
            .chain(
                versions
                    .theirs_regions
                    .iter()
                    .enumerate()
                    .map(|(j, r)| (&r.edit, Side::Theirs, theirs_idx.contains(&j))),
            )
            .collect();
        let mut inside: Vec<bool> = edits.iter().map(|(_, _, paired)| *paired).collect();

        loop {
            let mut grew = false;
            for (k, (edit, _, _)) in edits.iter().enumerate() {
                if !inside[k] && straddles(&edit.base, &hull) {
                    hull = hull.union(&edit.base);
                    inside[k] = true;
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }

        let base_lines = split_lines(&versions.base);
        let hull = LineRange::new(hull.start.min(base_lines.len()), hull.end.min(base_lines.len()));

        let mut before: Vec<(Edit, Side)> = Vec::new();
        let mut after: Vec<(Edit, Side)> = Vec::new();
        let mut ours_inside: Vec<Edit> = Vec::new();
        let mut theirs_inside: Vec<Edit> = Vec::new();
        for (k, (edit, side, _)) in edits.iter().enumerate() {
            if inside[k] {
                let local = shifted(edit, hull.start);
                match side {
                    Side::Ours => ours_inside.push(local),
                    Side::Theirs => theirs_inside.push(local),
                }
            } else if edit.base.end <= hull.start {
                before.push(((*edit).clone(), *side));
            } else {
                after.push((shifted(edit, hull.end), *side));
            }
        }

        let apply = |lines: &[&str], mut set: Vec<(Edit, Side)>| {
            set.sort_by_key(|(e, side)| (e.base.start, e.base.end, *side));
            set.dedup_by(|a, b| a.0 == b.0);
            let refs: Vec<&Edit> = set.iter().map(|(e, _)| e).collect();
            apply_edits(lines, &refs)
        };
        let apply_side = |set: &[Edit]| {
            let refs: Vec<&Edit> = set.iter().collect();
            apply_edits(&base_lines[hull.start..hull.end], &refs)
        };

        Some(Self {
            hull,
            prefix: apply(&base_lines[..hull.start], before)?,
            suffix: apply(&base_lines[hull.end..], after)?,
            base_region: base_lines[hull.start..hull.end].concat(),
            ours_region: apply_side(&ours_inside)?,
            theirs_region: apply_side(&theirs_inside)?,
        })
    }

    /// The whole file with the hull shown as a diff3 conflict block.
    pub fn conflict_text(&self, ours_label: &str, theirs_label: &str) -> String {
        format!(
            "{}<<<<<<< {}\n{}||||||| base\n{}=======\n{}>>>>>>> {}\n{}",
            self.prefix,
            ours_label,
            terminated(&self.ours_region),
            terminated(&self.base_region),
            terminated(&self.theirs_region),
            theirs_label,
            self.suffix
        )
    }

    /// Check a candidate file against the draft.
    pub fn validate(&self, file_path: &str, candidate: &str) -> Result<(), Rejection> {
        let outside_len = self.prefix.len() + self.suffix.len();
        if candidate.len() < outside_len
            || !candidate.starts_with(&self.prefix)
            || !candidate.ends_with(&self.suffix)
        {
            return Err(Rejection::OutsideRegionModified);
        }
        parse_check(file_path, candidate).map_err(Rejection::ParseFailed)?;
        if candidate.lines().any(is_conflict_marker_line) {
            return Err(Rejection::ConflictMarkers);
        }
        Ok(())
    }
}

fn last_lines(text: &str, n: usize) -> String {
    let lines = split_lines(text);
    lines[lines.len().saturating_sub(n)..].concat()
}

fn first_lines(text: &str, n: usize) -> String {
    split_lines(text).into_iter().take(n).collect()
}

/// Resolves conflicts the automatic strategies could not, through an
/// external agent.
pub struct AiResolver {
    agent: Option<Arc<dyn ResolutionAgent>>,
    policy: RetryPolicy,
    context_lines: usize,
}

impl AiResolver {
    pub fn new(
        agent: Option<Arc<dyn ResolutionAgent>>,
        policy: RetryPolicy,
        context_lines: usize,
    ) -> Self {
        Self {
            agent,
            policy,
            context_lines,
        }
    }

    /// Use the command agent from the configuration, if one is set.
    pub fn from_config(config: &ResolverConfig) -> Self {
        let agent = CommandAgent::from_config(config)
            .map(|a| Arc::new(a) as Arc<dyn ResolutionAgent>);
        Self::new(agent, config.retry.policy(), config.context_lines)
    }

    pub fn has_agent(&self) -> bool {
        self.agent.is_some()
    }

    /// Build the context sent to the agent.
    pub fn context_for(
        &self,
        record: &ConflictRecord,
        versions: &FileVersions,
        draft: &ResolutionDraft,
    ) -> ResolutionContext {
        let ours_label = record.regions.first().map_or("ours", |r| r.branch.as_str());
        let theirs_label = record.regions.last().map_or("theirs", |r| r.branch.as_str());
        let mut symbols: Vec<String> = record
            .regions
            .iter()
            .map(|r| r.region.symbol_path.clone())
            .collect();
        symbols.dedup();
        ResolutionContext {
            file_path: versions.file_path.clone(),
            language: Language::from_path(&versions.file_path).map(|l| l.name().to_string()),
            conflict_kind: record.kind(),
            symbols,
            base_region: draft.base_region.clone(),
            ours_region: draft.ours_region.clone(),
            theirs_region: draft.theirs_region.clone(),
            context_before: last_lines(&draft.prefix, self.context_lines),
            context_after: first_lines(&draft.suffix, self.context_lines),
            draft: draft.conflict_text(ours_label, theirs_label),
        }
    }

    /// Ask the agent to resolve `record` and settle it. Returns the accepted
    /// file content, or `None` when the conflict stays unresolved.
    pub async fn resolve(
        &self,
        record: &mut ConflictRecord,
        versions: &FileVersions,
    ) -> Result<Option<String>, ConflictError> {
        let Some(agent) = &self.agent else {
            record.give_up("no resolution agent configured")?;
            return Ok(None);
        };
        let Some(draft) = ResolutionDraft::build(versions) else {
            record.give_up("conflicting regions could not be isolated")?;
            return Ok(None);
        };

        let context = Arc::new(self.context_for(record, versions, &draft));
        let agent = Arc::clone(agent);
        let timeout_ms = self.policy.timeout.as_millis() as u64;
        let file = versions.file_path.clone();
        let outcome = self
            .policy
            .run(
                "resolution agent",
                move |attempt| {
                    let agent = Arc::clone(&agent);
                    let context = Arc::clone(&context);
                    let file = file.clone();
                    async move {
                        debug!(file = %file, attempt, "requesting resolution");
                        agent.resolve(&context).await
                    }
                },
                || AgentError::Timeout(timeout_ms),
                AgentError::is_retryable,
            )
            .await;

        let candidate = match outcome {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(file = %record.file_path(), error = %e, "resolution agent gave no usable answer");
                record.give_up(e.to_string())?;
                return Ok(None);
            }
        };

        match draft.validate(&versions.file_path, &candidate) {
            Ok(()) => {
                record.resolve(
                    ResolutionStatus::AiResolved,
                    ResolutionStrategy::AiAgent,
                    candidate.as_bytes(),
                )?;
                info!(file = %record.file_path(), "conflict resolved by agent");
                Ok(Some(candidate))
            }
            Err(rejection) => {
                warn!(file = %record.file_path(), reason = %rejection, "agent candidate rejected");
                record.give_up(format!("candidate rejected: {}", rejection))?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::analyzer::SemanticAnalyzer;
    use crate::config::AnalyzerConfig;
    use crate::conflict::detector::{ConflictDetector, ConflictKind};

    const BASE: &str = "\
use std::fmt;

fn build(name: &str) -> String {
    name.to_string()
}

fn untouched() -> u32 {
    1
}

fn tail() -> u32 {
    2
}
";

    struct FixedAgent(String);

    #[async_trait]
    impl ResolutionAgent for FixedAgent {
        async fn resolve(&self, _context: &ResolutionContext) -> Result<String, AgentError> {
            Ok(self.0.clone())
        }
    }

    struct CountingAgent {
        calls: AtomicU32,
        error: fn() -> AgentError,
    }

    #[async_trait]
    impl ResolutionAgent for CountingAgent {
        async fn resolve(&self, _context: &ResolutionContext) -> Result<String, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err((self.error)())
        }
    }

    struct SlowAgent;

    #[async_trait]
    impl ResolutionAgent for SlowAgent {
        async fn resolve(&self, _context: &ResolutionContext) -> Result<String, AgentError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }

    fn structural() -> (ConflictRecord, FileVersions) {
        let analyzer = SemanticAnalyzer::new(&AnalyzerConfig::default());
        let ours = BASE
            .replace("fn build(name: &str)", "fn build(name: &str, loud: bool)")
            .replace("    2\n", "    20\n");
        let theirs = BASE
            .replace("fn build(name: &str)", "fn build(name: String)")
            .replace("use std::fmt;\n", "use std::fmt;\nuse std::io;\n");
        let versions = FileVersions::analyze(
            &analyzer,
            "src/build.rs",
            BASE.to_string(),
            ours,
            theirs,
        );
        let record = ConflictDetector::detect("s", "t", "main", "task/b", &versions).unwrap();
        assert_eq!(record.kind(), ConflictKind::Structural);
        (record, versions)
    }

    fn resolver(agent: Arc<dyn ResolutionAgent>) -> AiResolver {
        AiResolver::new(
            Some(agent),
            RetryPolicy::new(2, Duration::from_millis(10), Duration::from_secs(5)),
            3,
        )
    }

    fn resolved_file() -> String {
        "use std::fmt;\nuse std::io;\n\nfn build(name: String, loud: bool) -> String {\n    name.to_string()\n}\n\nfn untouched() -> u32 {\n    1\n}\n\nfn tail() -> u32 {\n    20\n}\n".to_string()
    }

    #[test]
    fn test_draft_isolates_hull() {
        let (_, versions) = structural();
        let draft = ResolutionDraft::build(&versions).unwrap();
        assert_eq!(draft.hull, LineRange::new(2, 3));
        assert_eq!(draft.prefix, "use std::fmt;\nuse std::io;\n\n");
        assert!(draft.suffix.ends_with("fn tail() -> u32 {\n    20\n}\n"));
        assert_eq!(draft.base_region, "fn build(name: &str) -> String {\n");
        assert_eq!(draft.ours_region, "fn build(name: &str, loud: bool) -> String {\n");
        assert_eq!(draft.theirs_region, "fn build(name: String) -> String {\n");

        let text = draft.conflict_text("main", "task/b");
        assert!(text.contains("<<<<<<< main\n"));
        assert!(text.contains(">>>>>>> task/b\n"));
    }

    #[tokio::test]
    async fn test_valid_candidate_is_accepted() {
        let (mut record, versions) = structural();
        let resolver = resolver(Arc::new(FixedAgent(resolved_file())));
        let merged = resolver.resolve(&mut record, &versions).await.unwrap();
        assert_eq!(merged.as_deref(), Some(resolved_file().as_str()));
        assert_eq!(record.resolution_status(), ResolutionStatus::AiResolved);
        assert_eq!(record.resolution_strategy, Some(ResolutionStrategy::AiAgent));
    }

    #[tokio::test]
    async fn test_candidate_touching_outside_is_rejected() {
        let (mut record, versions) = structural();
        let candidate = resolved_file().replace("    1\n", "    100\n");
        let resolver = resolver(Arc::new(FixedAgent(candidate)));
        assert!(resolver.resolve(&mut record, &versions).await.unwrap().is_none());
        assert_eq!(record.resolution_status(), ResolutionStatus::Unresolved);
        assert!(record
            .detail
            .as_deref()
            .unwrap()
            .contains("outside the conflicting region"));
    }

    #[tokio::test]
    async fn test_candidate_with_markers_is_rejected() {
        let (mut record, versions) = structural();
        let draft = ResolutionDraft::build(&versions).unwrap();
        let candidate = format!(
            "{}<<<<<<< main\nfn build(name: String) -> String {{\n=======\n>>>>>>> task/b\n{}",
            draft.prefix, draft.suffix
        );
        assert_eq!(
            draft.validate("src/build.rs", &candidate),
            Err(Rejection::ConflictMarkers)
        );
        let resolver = resolver(Arc::new(FixedAgent(candidate)));
        assert!(resolver.resolve(&mut record, &versions).await.unwrap().is_none());
        assert_eq!(record.resolution_status(), ResolutionStatus::Unresolved);
    }

    #[test]
    fn test_candidate_that_does_not_parse_is_rejected() {
        let (_, versions) = structural();
        let draft = ResolutionDraft::build(&versions).unwrap();
        let candidate = format!(
            "{}fn build(name: String -> String {{\n{}",
            draft.prefix, draft.suffix
        );
        assert!(matches!(
            draft.validate("src/build.rs", &candidate),
            Err(Rejection::ParseFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_no_agent_leaves_conflict_unresolved() {
        let (mut record, versions) = structural();
        let resolver = AiResolver::new(None, RetryPolicy::default(), 3);
        assert!(!resolver.has_agent());
        assert!(resolver.resolve(&mut record, &versions).await.unwrap().is_none());
        assert_eq!(record.resolution_status(), ResolutionStatus::Unresolved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_timeout_is_retried_then_unresolved() {
        let (mut record, versions) = structural();
        let resolver = AiResolver::new(
            Some(Arc::new(SlowAgent)),
            RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(100)),
            3,
        );
        assert!(resolver.resolve(&mut record, &versions).await.unwrap().is_none());
        assert_eq!(record.resolution_status(), ResolutionStatus::Unresolved);
        assert!(record.detail.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_depends_on_error_kind() {
        let (mut record, versions) = structural();
        let failing = Arc::new(CountingAgent {
            calls: AtomicU32::new(0),
            error: || AgentError::Failed("rate limited".into()),
        });
        resolver(failing.clone())
            .resolve(&mut record, &versions)
            .await
            .unwrap();
        assert_eq!(failing.calls.load(Ordering::SeqCst), 2);

        let (mut record, versions) = structural();
        let malformed = Arc::new(CountingAgent {
            calls: AtomicU32::new(0),
            error: || AgentError::Malformed("not a file".into()),
        });
        resolver(malformed.clone())
            .resolve(&mut record, &versions)
            .await
            .unwrap();
        assert_eq!(malformed.calls.load(Ordering::SeqCst), 1);
        assert_eq!(record.resolution_status(), ResolutionStatus::Unresolved);
    }

    #[test]
    fn test_context_window() {
        let (record, versions) = structural();
        let draft = ResolutionDraft::build(&versions).unwrap();
        let resolver = AiResolver::new(None, RetryPolicy::default(), 2);
        let context = resolver.context_for(&record, &versions, &draft);
        assert_eq!(context.context_before, "use std::io;\n\n");
        assert_eq!(context.context_after, "    name.to_string()\n}\n");
        assert_eq!(context.language.as_deref(), Some("rust"));
        assert_eq!(context.symbols, vec!["build.build".to_string()]);
    }
}
