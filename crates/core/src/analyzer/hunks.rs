//! Line-level diff hunks in base coordinates.

use serde::{Deserialize, Serialize};
use similar::{capture_diff_slices, Algorithm, DiffTag};

/// Split text into lines, keeping each line's terminator so that joining
/// the pieces reproduces the input byte for byte.
pub fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

/// Half-open range of 0-based line indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

impl LineRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Ranges overlap or sit directly next to each other. An empty range is
    /// an insertion point and touches the lines on both sides of it.
    pub fn touches(&self, other: &LineRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// At least one line is inside both ranges.
    pub fn shares_lines(&self, other: &LineRange) -> bool {
        self.start.max(other.start) < self.end.min(other.end)
    }

    /// Number of unchanged lines separating two ranges.
    pub fn gap(&self, other: &LineRange) -> usize {
        if self.end <= other.start {
            other.start - self.end
        } else if other.end <= self.start {
            self.start - other.end
        } else {
            0
        }
    }

    pub fn union(&self, other: &LineRange) -> LineRange {
        LineRange::new(self.start.min(other.start), self.end.max(other.end))
    }
}

/// One contiguous change: base lines `base` are replaced by `lines`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edit {
    pub base: LineRange,
    pub lines: Vec<String>,
}

impl Edit {
    /// Pure insertion; no base line is altered.
    pub fn is_insertion(&self) -> bool {
        self.base.is_empty()
    }

    pub fn is_deletion(&self) -> bool {
        self.lines.is_empty() && !self.base.is_empty()
    }
}

/// Compute the edits turning `base` into `variant`.
///
/// Adjacent delete/insert operations are folded into a single replacement
/// so every edit is separated from the next by at least one unchanged line.
pub fn line_edits(base: &str, variant: &str) -> Vec<Edit> {
    let old = split_lines(base);
    let new = split_lines(variant);
    let ops = capture_diff_slices(Algorithm::Myers, &old, &new);

    let mut edits: Vec<Edit> = Vec::new();
    let mut pending: Option<Edit> = None;

    for op in ops {
        if op.tag() == DiffTag::Equal {
            if let Some(edit) = pending.take() {
                edits.push(edit);
            }
            continue;
        }
        let old_range = op.old_range();
        let new_range = op.new_range();
        let inserted = new[new_range].iter().map(|l| l.to_string());
        match pending.as_mut() {
            Some(edit) if edit.base.end == old_range.start => {
                edit.base.end = old_range.end;
                edit.lines.extend(inserted);
            }
            _ => {
                if let Some(edit) = pending.take() {
                    edits.push(edit);
                }
                pending = Some(Edit {
                    base: LineRange::new(old_range.start, old_range.end),
                    lines: inserted.collect(),
                });
            }
        }
    }
    if let Some(edit) = pending {
        edits.push(edit);
    }
    edits
}

/// Apply non-overlapping edits to `base_lines`.
///
/// Edits are applied in slice order, which must be sorted by base position.
/// Returns `None` if two edits alter the same base line.
pub fn apply_edits(base_lines: &[&str], edits: &[&Edit]) -> Option<String> {
    let mut out = String::new();
    let mut cursor = 0;
    for edit in edits {
        if edit.base.start < cursor {
            return None;
        }
        for line in &base_lines[cursor..edit.base.start.min(base_lines.len())] {
            out.push_str(line);
        }
        for line in &edit.lines {
            out.push_str(line);
        }
        cursor = edit.base.end;
    }
    for line in base_lines.iter().skip(cursor) {
        out.push_str(line);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_lines_preserves_bytes() {
        let text = "a\nb\r\nc";
        let lines = split_lines(text);
        assert_eq!(lines, vec!["a\n", "b\r\n", "c"]);
        assert_eq!(lines.concat(), text);
    }

    #[test]
    fn test_insertion_edit() {
        let edits = line_edits("a\nb\nc\n", "a\nb\nx\nc\n");
        assert_eq!(edits.len(), 1);
        assert!(edits[0].is_insertion());
        assert_eq!(edits[0].base, LineRange::new(2, 2));
        assert_eq!(edits[0].lines, vec!["x\n"]);
    }

    #[test]
    fn test_replacement_is_folded() {
        let edits = line_edits("a\nb\nc\n", "a\nB\nc\n");
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].base, LineRange::new(1, 2));
        assert_eq!(edits[0].lines, vec!["B\n"]);
    }

    #[test]
    fn test_separate_edits() {
        let edits = line_edits("1\n2\n3\n4\n5\n", "one\n2\n3\n4\n");
        assert_eq!(edits.len(), 2);
        assert_eq!(edits[0].base, LineRange::new(0, 1));
        assert!(edits[1].is_deletion());
        assert_eq!(edits[1].base, LineRange::new(4, 5));
    }

    #[test]
    fn test_apply_edits_reproduces_variant() {
        let base = "fn a() {\n    x();\n}\n";
        let variant = "fn a() {\n    x();\n    y();\n}\n// end\n";
        let edits = line_edits(base, variant);
        let refs: Vec<&Edit> = edits.iter().collect();
        assert_eq!(apply_edits(&split_lines(base), &refs).unwrap(), variant);
    }

    #[test]
    fn test_apply_rejects_overlap() {
        let base = split_lines("a\nb\nc\n");
        let first = Edit {
            base: LineRange::new(0, 2),
            lines: vec!["x\n".into()],
        };
        let second = Edit {
            base: LineRange::new(1, 3),
            lines: vec!["y\n".into()],
        };
        assert!(apply_edits(&base, &[&first, &second]).is_none());
    }

    #[test]
    fn test_range_relations() {
        let insertion = LineRange::new(3, 3);
        let replaced = LineRange::new(3, 5);
        assert!(insertion.touches(&replaced));
        assert!(!insertion.shares_lines(&replaced));
        assert!(LineRange::new(1, 4).shares_lines(&replaced));
        assert_eq!(LineRange::new(0, 1).gap(&LineRange::new(4, 6)), 3);
        assert!(!LineRange::new(0, 1).touches(&LineRange::new(2, 3)));
    }
}
