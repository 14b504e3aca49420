//! Semantic analysis of file changes.
//!
//! A change between the base and a variant of a file is broken into line
//! edits, and each edit is attributed to the innermost declaration that
//! contains it. The resulting [`ChangeRegion`]s let the conflict detector
//! tell "two tasks touched the same function" apart from "two tasks edited
//! the same lines".

pub mod hunks;
pub mod scopes;

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::AnalyzerConfig;

pub use hunks::{apply_edits, line_edits, split_lines, Edit, LineRange};
pub use scopes::{Language, ParseFailure, ScopeKind, ScopeMap};

/// Symbol path of a region covering a whole file.
pub const WHOLE_FILE_SYMBOL: &str = "*";

/// Structural classification of a change region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    Function,
    Class,
    Imports,
    ListTail,
    TopLevel,
    WholeFile,
}

impl RegionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Imports => "imports",
            Self::ListTail => "list_tail",
            Self::TopLevel => "top_level",
            Self::WholeFile => "whole_file",
        }
    }

    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "function" => Some(Self::Function),
            "class" => Some(Self::Class),
            "imports" => Some(Self::Imports),
            "list_tail" => Some(Self::ListTail),
            "top_level" => Some(Self::TopLevel),
            "whole_file" => Some(Self::WholeFile),
            _ => None,
        }
    }
}

impl std::fmt::Display for RegionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ScopeKind> for RegionKind {
    fn from(kind: ScopeKind) -> Self {
        match kind {
            ScopeKind::Function => Self::Function,
            ScopeKind::Class => Self::Class,
        }
    }
}

/// One logical change of a file variant relative to the base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRegion {
    pub file_path: String,
    /// Dot-delimited path of the enclosing declaration, prefixed with the
    /// module name; [`WHOLE_FILE_SYMBOL`] for whole-file regions.
    pub symbol_path: String,
    /// Base lines altered (empty for a pure insertion).
    pub line_range: LineRange,
    /// SHA-256 of the variant's replacement text.
    pub content_hash: String,
    pub kind: RegionKind,
    /// The edit alters the declaration header of its scope.
    pub header: bool,
    /// Base lines of the enclosing scope, or the whole file.
    pub scope_range: LineRange,
    pub edit: Edit,
}

impl ChangeRegion {
    /// A region that replaces the entire base with `variant`.
    pub fn whole_file(file_path: &str, base: &str, variant: &str) -> Self {
        let base_len = split_lines(base).len();
        Self {
            file_path: file_path.to_string(),
            symbol_path: WHOLE_FILE_SYMBOL.to_string(),
            line_range: LineRange::new(0, base_len),
            content_hash: content_hash(variant.as_bytes()),
            kind: RegionKind::WholeFile,
            header: true,
            scope_range: LineRange::new(0, base_len),
            edit: Edit {
                base: LineRange::new(0, base_len),
                lines: split_lines(variant).into_iter().map(String::from).collect(),
            },
        }
    }

    pub fn is_whole_file(&self) -> bool {
        self.kind == RegionKind::WholeFile
    }

    /// Two regions from different branches may interact: they name the same
    /// symbol or their base line ranges overlap or touch.
    pub fn may_conflict_with(&self, other: &ChangeRegion) -> bool {
        self.symbol_path == other.symbol_path || self.line_range.touches(&other.line_range)
    }
}

/// Hex-encoded SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Index pairs `(ours, theirs)` of regions that may interact.
pub fn candidate_pairs(ours: &[ChangeRegion], theirs: &[ChangeRegion]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for (i, a) in ours.iter().enumerate() {
        for (j, b) in theirs.iter().enumerate() {
            if a.may_conflict_with(b) {
                pairs.push((i, j));
            }
        }
    }
    pairs
}

/// Check that `content` is well-formed for its language. Files in
/// languages without scope detection always pass.
pub fn parse_check(file_path: &str, content: &str) -> Result<(), ParseFailure> {
    match Language::from_path(file_path) {
        Some(language) => scopes::scan(language, content).map(|_| ()),
        None => Ok(()),
    }
}

/// Turns file variants into change regions.
#[derive(Debug, Clone)]
pub struct SemanticAnalyzer {
    whole_file_patterns: Vec<String>,
    max_file_bytes: usize,
}

impl SemanticAnalyzer {
    pub fn new(config: &AnalyzerConfig) -> Self {
        Self {
            whole_file_patterns: config.whole_file_patterns.clone(),
            max_file_bytes: config.max_file_bytes,
        }
    }

    /// Paths configured to always be treated as one opaque region.
    pub fn is_whole_file_path(&self, file_path: &str) -> bool {
        self.whole_file_patterns
            .iter()
            .any(|p| glob_match::glob_match(p, file_path))
    }

    /// Change regions of `variant` relative to `base`, in base order.
    ///
    /// Identical inputs yield no regions. Unsupported languages, oversized
    /// files and files that fail to parse on either side yield a single
    /// whole-file region.
    pub fn analyze(&self, base: &str, variant: &str, file_path: &str) -> Vec<ChangeRegion> {
        if base == variant {
            return Vec::new();
        }
        if self.is_whole_file_path(file_path)
            || base.len() > self.max_file_bytes
            || variant.len() > self.max_file_bytes
        {
            return vec![ChangeRegion::whole_file(file_path, base, variant)];
        }
        let Some(language) = Language::from_path(file_path) else {
            return vec![ChangeRegion::whole_file(file_path, base, variant)];
        };
        let base_map = match scopes::scan(language, base) {
            Ok(map) => map,
            Err(e) => {
                debug!(file = %file_path, error = %e, "base does not parse, treating as whole file");
                return vec![ChangeRegion::whole_file(file_path, base, variant)];
            }
        };
        if let Err(e) = scopes::scan(language, variant) {
            debug!(file = %file_path, error = %e, "variant does not parse, treating as whole file");
            return vec![ChangeRegion::whole_file(file_path, base, variant)];
        }

        let base_lines = split_lines(base);
        let module = module_name(file_path);
        line_edits(base, variant)
            .into_iter()
            .map(|edit| region_for(file_path, &module, &base_map, &base_lines, edit))
            .collect()
    }
}

fn module_name(file_path: &str) -> String {
    Path::new(file_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_path)
        .to_string()
}

fn region_for(
    file_path: &str,
    module: &str,
    map: &ScopeMap,
    base_lines: &[&str],
    edit: Edit,
) -> ChangeRegion {
    let scope = map.enclosing(&edit.base, &edit.lines);
    let scope_range = scope
        .map(|s| s.lines())
        .unwrap_or_else(|| LineRange::new(0, base_lines.len()));
    let prefix = match scope {
        Some(s) => format!("{}.{}", module, s.path),
        None => module.to_string(),
    };

    let (symbol_path, kind, header) = if is_list_tail(&edit, base_lines) {
        (prefix, RegionKind::ListTail, false)
    } else if scope.is_none() && is_import_edit(map, &edit) {
        (format!("{}.#imports", module), RegionKind::Imports, false)
    } else if let Some((name, decl_kind)) = introduced_declaration(map.language, &edit, base_lines)
    {
        (format!("{}.{}", prefix, name), decl_kind.into(), false)
    } else if let Some(s) = scope {
        let header = if edit.base.is_empty() {
            s.decl < edit.base.start && edit.base.start <= s.header_end
        } else {
            edit.base.shares_lines(&s.header())
        };
        (prefix, s.kind.into(), header)
    } else {
        (prefix, RegionKind::TopLevel, false)
    };

    ChangeRegion {
        file_path: file_path.to_string(),
        symbol_path,
        line_range: edit.base,
        content_hash: content_hash(edit.lines.concat().as_bytes()),
        kind,
        header,
        scope_range,
        edit,
    }
}

/// Pure insertion of comma-terminated entries just before a closing bracket.
fn is_list_tail(edit: &Edit, base_lines: &[&str]) -> bool {
    if !edit.is_insertion() {
        return false;
    }
    let mut entries = edit.lines.iter().map(|l| l.trim()).filter(|l| !l.is_empty());
    let mut any = false;
    let all_entries = entries.all(|l| {
        any = true;
        l.ends_with(',')
    });
    let closes = base_lines
        .get(edit.base.start)
        .map(|l| l.trim_start())
        .is_some_and(|l| l.starts_with(']') || l.starts_with('}') || l.starts_with(')'));
    any && all_entries && closes
}

/// Every altered or inserted line is an import statement or blank.
fn is_import_edit(map: &ScopeMap, edit: &Edit) -> bool {
    let mut any = false;
    for idx in edit.base.start..edit.base.end {
        if !map.is_import_line(idx) {
            return false;
        }
        any = true;
    }
    for line in &edit.lines {
        if line.trim().is_empty() {
            continue;
        }
        if !scopes::is_import(map.language, line) {
            return false;
        }
        any = true;
    }
    any
}

/// A new declaration added without touching existing code.
fn introduced_declaration(
    language: Language,
    edit: &Edit,
    base_lines: &[&str],
) -> Option<(String, ScopeKind)> {
    let replaces_code = (edit.base.start..edit.base.end)
        .any(|i| base_lines.get(i).is_some_and(|l| !l.trim().is_empty()));
    if replaces_code {
        return None;
    }
    let first = edit.lines.iter().map(|l| l.trim_start()).find(|l| {
        !(l.trim().is_empty()
            || l.starts_with('@')
            || l.starts_with('#')
            || l.starts_with("//")
            || l.starts_with("/*")
            || l.starts_with('*'))
    })?;
    scopes::declaration(language, first)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> SemanticAnalyzer {
        SemanticAnalyzer::new(&AnalyzerConfig::default())
    }

    const BASE: &str = "\
use std::fmt;

pub fn build(name: &str) -> String {
    let mut out = String::new();
    out.push_str(name);
    out
}

pub fn other() -> u32 {
    1
}

const NAMES: &[&str] = &[
    \"a\",
];
";

    #[test]
    fn test_identical_inputs_have_no_regions() {
        assert!(analyzer().analyze(BASE, BASE, "src/util.rs").is_empty());
    }

    #[test]
    fn test_body_insertion_is_function_region() {
        let variant = BASE.replace(
            "    out.push_str(name);\n",
            "    out.push_str(name);\n    out.push('!');\n",
        );
        let regions = analyzer().analyze(BASE, &variant, "src/util.rs");
        assert_eq!(regions.len(), 1);
        let region = &regions[0];
        assert_eq!(region.symbol_path, "util.build");
        assert_eq!(region.kind, RegionKind::Function);
        assert!(!region.header);
        assert_eq!(region.line_range, LineRange::new(5, 5));
        assert_eq!(region.scope_range, LineRange::new(2, 7));
    }

    #[test]
    fn test_signature_change_touches_header() {
        let variant = BASE.replace(
            "pub fn build(name: &str) -> String {",
            "pub fn build(name: &str, loud: bool) -> String {",
        );
        let regions = analyzer().analyze(BASE, &variant, "src/util.rs");
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].symbol_path, "util.build");
        assert!(regions[0].header);
    }

    #[test]
    fn test_import_and_list_tail_regions() {
        let variant = BASE
            .replace("use std::fmt;\n", "use std::fmt;\nuse std::io;\n")
            .replace("    \"a\",\n", "    \"a\",\n    \"b\",\n");
        let regions = analyzer().analyze(BASE, &variant, "src/util.rs");
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].kind, RegionKind::Imports);
        assert_eq!(regions[0].symbol_path, "util.#imports");
        assert_eq!(regions[1].kind, RegionKind::ListTail);
    }

    #[test]
    fn test_new_function_gets_its_own_symbol() {
        let variant = format!("{}\nfn added() {{}}\n", BASE);
        let regions = analyzer().analyze(BASE, &variant, "src/util.rs");
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].symbol_path, "util.added");
        assert_eq!(regions[0].kind, RegionKind::Function);
    }

    #[test]
    fn test_unsupported_and_broken_files_are_whole_file() {
        let regions = analyzer().analyze("a\n", "b\n", "notes.md");
        assert_eq!(regions.len(), 1);
        assert!(regions[0].is_whole_file());
        assert_eq!(regions[0].symbol_path, WHOLE_FILE_SYMBOL);

        let broken = BASE.replace("    1\n}\n", "    1\n");
        let regions = analyzer().analyze(BASE, &broken, "src/util.rs");
        assert_eq!(regions.len(), 1);
        assert!(regions[0].is_whole_file());

        let regions = analyzer().analyze("a\n", "b\n", "Cargo.lock");
        assert!(regions[0].is_whole_file());
    }

    #[test]
    fn test_candidate_pairs_by_symbol_and_proximity() {
        let a = analyzer();
        let ours = a.analyze(
            BASE,
            &BASE.replace("    out\n}", "    out.trim().to_string()\n}"),
            "src/util.rs",
        );
        let theirs = a.analyze(
            BASE,
            &BASE.replace("    let mut out", "    // buffer\n    let mut out"),
            "src/util.rs",
        );
        let far = a.analyze(BASE, &BASE.replace("    1\n", "    2\n"), "src/util.rs");
        assert_eq!(candidate_pairs(&ours, &theirs), vec![(0, 0)]);
        assert!(candidate_pairs(&ours, &far).is_empty());
    }

    #[test]
    fn test_parse_check() {
        assert!(parse_check("src/util.rs", BASE).is_ok());
        assert!(parse_check("src/util.rs", "fn a() {\n").is_err());
        assert!(parse_check("README.md", "{{{{").is_ok());
    }

    #[test]
    fn test_content_hash_is_stable_hex() {
        let h = content_hash(b"hello");
        assert_eq!(h.len(), 64);
        assert_eq!(h, content_hash(b"hello"));
        assert_ne!(h, content_hash(b"hello!"));
    }
}
