//! Language-aware scope boundaries.
//!
//! Scopes are found with a small lexer that skips strings and comments,
//! tracks bracket nesting and recognises declaration headers with
//! per-language patterns. Brace languages close a scope at its matching
//! `}`; Python scopes end at the first line dedented to the declaration's
//! level. The same pass doubles as a well-formedness check: unbalanced
//! brackets, unterminated literals and broken indentation are reported as
//! [`ParseFailure`].

use std::path::Path;
use std::sync::OnceLock;

use regex_lite::Regex;

use super::hunks::{split_lines, LineRange};

/// Languages with scope detection. Anything else is analyzed as an opaque
/// whole file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Rust,
    Python,
    Go,
    JavaScript,
    /// C, C++, Java, C#, Kotlin, Swift and Scala.
    CLike,
}

impl Language {
    pub fn from_path(path: &str) -> Option<Self> {
        let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "rs" => Some(Self::Rust),
            "py" | "pyi" => Some(Self::Python),
            "go" => Some(Self::Go),
            "js" | "jsx" | "mjs" | "cjs" | "ts" | "tsx" | "mts" | "cts" => Some(Self::JavaScript),
            "c" | "h" | "cc" | "cpp" | "cxx" | "hpp" | "hh" | "hxx" | "java" | "kt" | "kts"
            | "cs" | "swift" | "scala" => Some(Self::CLike),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Rust => "rust",
            Self::Python => "python",
            Self::Go => "go",
            Self::JavaScript => "javascript",
            Self::CLike => "c-like",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Function,
    Class,
}

/// A named declaration and the base lines it spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub name: String,
    /// Dot-separated path of enclosing declarations, ending in `name`.
    pub path: String,
    pub kind: ScopeKind,
    /// First line of the declaration, including decorators.
    pub decl: usize,
    /// Line holding the opening `{` or the header's `:`.
    pub header_end: usize,
    /// One past the last line of the body.
    pub end: usize,
    pub indent: usize,
}

impl Scope {
    pub fn lines(&self) -> LineRange {
        LineRange::new(self.decl, self.end)
    }

    pub fn header(&self) -> LineRange {
        LineRange::new(self.decl, self.header_end + 1)
    }
}

/// Why a file could not be structurally parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    /// 0-based line where the problem was detected.
    pub line: usize,
    pub reason: String,
}

impl std::fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line + 1, self.reason)
    }
}

impl std::error::Error for ParseFailure {}

/// Scopes and import lines of one file version.
#[derive(Debug, Clone)]
pub struct ScopeMap {
    pub language: Language,
    pub scopes: Vec<Scope>,
    import_lines: Vec<bool>,
}

impl ScopeMap {
    pub fn is_import_line(&self, idx: usize) -> bool {
        self.import_lines.get(idx).copied().unwrap_or(false)
    }

    /// Innermost scope containing an edit.
    ///
    /// A replaced range must lie entirely within the scope. An insertion
    /// point belongs to a scope when it falls after the declaration line
    /// and before the end of the body; for Python an insertion right after
    /// the body also belongs to it when the new lines are indented deeper
    /// than the declaration.
    pub fn enclosing(&self, range: &LineRange, inserted: &[String]) -> Option<&Scope> {
        let inserted_indent = inserted
            .iter()
            .find(|l| !l.trim().is_empty())
            .map(|l| indent_of(l));
        self.scopes
            .iter()
            .filter(|s| {
                if range.is_empty() {
                    let at = range.start;
                    let extends_body = self.language == Language::Python
                        && at == s.end
                        && inserted_indent.is_some_and(|i| i > s.indent);
                    s.decl < at && (at < s.end || extends_body)
                } else {
                    s.decl <= range.start && range.end <= s.end
                }
            })
            .min_by_key(|s| s.end - s.decl)
    }
}

// ---------------------------------------------------------------------------
// Declarations and imports
// ---------------------------------------------------------------------------

type Patterns = Vec<(Regex, ScopeKind)>;

fn compile(specs: &[(&str, ScopeKind)]) -> Patterns {
    specs
        .iter()
        .filter_map(|(p, kind)| Regex::new(p).ok().map(|re| (re, *kind)))
        .collect()
}

const RUST_PATTERNS: &[(&str, ScopeKind)] = &[
    (
        r#"^\s*(?:pub(?:\s*\([^)]*\))?\s+)?(?:default\s+)?(?:const\s+)?(?:async\s+)?(?:unsafe\s+)?(?:extern\s+"[^"]*"\s+)?fn\s+([A-Za-z_][A-Za-z0-9_]*)"#,
        ScopeKind::Function,
    ),
    (
        r"^\s*(?:pub(?:\s*\([^)]*\))?\s+)?(?:struct|enum|trait|union|mod)\s+([A-Za-z_][A-Za-z0-9_]*)",
        ScopeKind::Class,
    ),
    (
        r"^\s*(?:unsafe\s+)?impl(?:\s*<[^{]*?>)?\s+(?:[A-Za-z_][A-Za-z0-9_:<>, ']*\s+for\s+)?(?:[A-Za-z_][A-Za-z0-9_]*::)*([A-Za-z_][A-Za-z0-9_]*)",
        ScopeKind::Class,
    ),
];

const PYTHON_PATTERNS: &[(&str, ScopeKind)] = &[
    (
        r"^\s*(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)",
        ScopeKind::Function,
    ),
    (r"^\s*class\s+([A-Za-z_][A-Za-z0-9_]*)", ScopeKind::Class),
];

const GO_PATTERNS: &[(&str, ScopeKind)] = &[
    (
        r"^func\s+(?:\([^)]*\)\s*)?([A-Za-z_][A-Za-z0-9_]*)",
        ScopeKind::Function,
    ),
    (
        r"^type\s+([A-Za-z_][A-Za-z0-9_]*)\s+(?:struct|interface)",
        ScopeKind::Class,
    ),
];

const JS_PATTERNS: &[(&str, ScopeKind)] = &[
    (
        r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][A-Za-z0-9_$]*)",
        ScopeKind::Function,
    ),
    (
        r"^\s*(?:export\s+)?(?:default\s+)?(?:declare\s+)?(?:abstract\s+)?(?:class|interface|enum|namespace)\s+([A-Za-z_$][A-Za-z0-9_$]*)",
        ScopeKind::Class,
    ),
    (
        r"^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][A-Za-z0-9_$]*)\s*(?::[^=]+)?=\s*(?:async\s+)?(?:\([^)]*\)|[A-Za-z_$][A-Za-z0-9_$]*)\s*(?::[^=]+)?=>",
        ScopeKind::Function,
    ),
    (
        r"^\s*(?:(?:public|private|protected|static|async|readonly|override|get|set)\s+)*([A-Za-z_$][A-Za-z0-9_$]*)\s*(?:<[^>]*>)?\s*\([^;]*\)\s*(?::[^;{]*)?\{\s*$",
        ScopeKind::Function,
    ),
];

const CLIKE_PATTERNS: &[(&str, ScopeKind)] = &[
    (
        r"^\s*(?:(?:public|private|protected|internal|static|final|abstract|sealed|partial|open|data|export|inline)\s+)*(?:class|interface|enum|struct|record|object|protocol|extension|namespace|trait)\s+([A-Za-z_][A-Za-z0-9_]*)",
        ScopeKind::Class,
    ),
    (
        r"^\s*(?:(?:public|private|protected|internal|override|open|static|final|suspend|inline|mutating|@[A-Za-z]+)\s+)*(?:fun|func|def)\s+(?:<[^>]*>\s*)?(?:[A-Za-z_][A-Za-z0-9_]*\.)?([A-Za-z_][A-Za-z0-9_]*)",
        ScopeKind::Function,
    ),
    (
        r"^\s*(?:[A-Za-z_][A-Za-z0-9_<>\[\],.?*&~]*\s+)+\**&?(?:[A-Za-z_][A-Za-z0-9_]*::)*(~?[A-Za-z_][A-Za-z0-9_]*)\s*\([^;]*$",
        ScopeKind::Function,
    ),
];

/// Words that look like a call or control statement rather than a
/// declaration when they lead a line or stand in the name position.
const NOT_DECLARATIONS: &[&str] = &[
    "if", "for", "while", "switch", "catch", "return", "else", "new", "sizeof", "do", "throw",
    "case", "delete", "await", "yield", "goto", "function", "with", "typeof",
];

fn patterns(language: Language) -> &'static Patterns {
    static RUST: OnceLock<Patterns> = OnceLock::new();
    static PYTHON: OnceLock<Patterns> = OnceLock::new();
    static GO: OnceLock<Patterns> = OnceLock::new();
    static JS: OnceLock<Patterns> = OnceLock::new();
    static CLIKE: OnceLock<Patterns> = OnceLock::new();
    match language {
        Language::Rust => RUST.get_or_init(|| compile(RUST_PATTERNS)),
        Language::Python => PYTHON.get_or_init(|| compile(PYTHON_PATTERNS)),
        Language::Go => GO.get_or_init(|| compile(GO_PATTERNS)),
        Language::JavaScript => JS.get_or_init(|| compile(JS_PATTERNS)),
        Language::CLike => CLIKE.get_or_init(|| compile(CLIKE_PATTERNS)),
    }
}

/// Name and kind of the declaration starting on `line`, if any.
pub fn declaration(language: Language, line: &str) -> Option<(String, ScopeKind)> {
    let line = line.trim_end_matches(['\n', '\r']);
    let first_word = line
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .find(|w| !w.is_empty())
        .unwrap_or("");
    if NOT_DECLARATIONS.contains(&first_word) {
        return None;
    }
    for (re, kind) in patterns(language) {
        if let Some(name) = re.captures(line).and_then(|c| c.get(1)) {
            let name = name.as_str();
            if NOT_DECLARATIONS.contains(&name) {
                continue;
            }
            return Some((name.to_string(), *kind));
        }
    }
    None
}

/// Whether `line` starts an import-like statement.
pub fn is_import(language: Language, line: &str) -> bool {
    let t = line.trim_start();
    match language {
        Language::Rust => {
            let t = strip_rust_visibility(t);
            t.starts_with("use ")
                || t.starts_with("extern crate ")
                || (t.starts_with("mod ") && t.trim_end().ends_with(';'))
        }
        Language::Python => t.starts_with("import ") || t.starts_with("from "),
        Language::Go => t.starts_with("import ") || t.starts_with("import("),
        Language::JavaScript => {
            t.starts_with("import ")
                || t.starts_with("import{")
                || (t.starts_with("export ") && t.contains(" from "))
                || ((t.starts_with("const ") || t.starts_with("let ") || t.starts_with("var "))
                    && t.contains("require("))
        }
        Language::CLike => {
            t.starts_with("#include")
                || t.starts_with("#import")
                || t.starts_with("import ")
                || (t.starts_with("using ") && t.trim_end().ends_with(';'))
        }
    }
}

fn strip_rust_visibility(t: &str) -> &str {
    let Some(rest) = t.strip_prefix("pub") else {
        return t;
    };
    let rest = rest.trim_start();
    let rest = match rest.strip_prefix('(') {
        Some(inner) => match inner.find(')') {
            Some(close) => &inner[close + 1..],
            None => return t,
        },
        None => rest,
    };
    rest.trim_start()
}

/// Leading whitespace width; tabs advance to the next multiple of eight.
pub fn indent_of(line: &str) -> usize {
    let mut width = 0;
    for ch in line.chars() {
        match ch {
            ' ' => width += 1,
            '\t' => width = width / 8 * 8 + 8,
            _ => break,
        }
    }
    width
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quote {
    Double,
    Single,
    Backtick,
    TripleDouble,
    TripleSingle,
    /// Rust raw string with this many `#`.
    Raw(usize),
}

struct Lexer {
    language: Language,
    block_comment: bool,
    quote: Option<Quote>,
}

fn is_ident(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

impl Lexer {
    fn new(language: Language) -> Self {
        Self {
            language,
            block_comment: false,
            quote: None,
        }
    }

    fn in_code(&self) -> bool {
        !self.block_comment && self.quote.is_none()
    }

    /// Feed one line. `on_code` sees every character outside strings and
    /// comments.
    fn feed(
        &mut self,
        line: &str,
        mut on_code: impl FnMut(char) -> Result<(), String>,
    ) -> Result<(), String> {
        let chars: Vec<char> = line.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();

            if self.block_comment {
                if c == '*' && next == Some('/') {
                    self.block_comment = false;
                    i += 2;
                } else {
                    i += 1;
                }
                continue;
            }
            if let Some(quote) = self.quote {
                i += self.consume_quoted(quote, &chars, i);
                continue;
            }

            if self.language == Language::Python {
                if c == '#' {
                    break;
                }
            } else if c == '/' && next == Some('/') {
                break;
            } else if c == '/' && next == Some('*') {
                self.block_comment = true;
                i += 2;
                continue;
            }

            let triple = next == Some(c) && chars.get(i + 2) == Some(&c);
            match c {
                '"' if self.language == Language::Python && triple => {
                    self.quote = Some(Quote::TripleDouble);
                    i += 3;
                    continue;
                }
                '"' => {
                    self.quote = Some(Quote::Double);
                    i += 1;
                    continue;
                }
                '\'' if self.language == Language::Python && triple => {
                    self.quote = Some(Quote::TripleSingle);
                    i += 3;
                    continue;
                }
                '\'' if self.language == Language::Rust => {
                    // Char literal, otherwise a lifetime.
                    if next == Some('\\') || chars.get(i + 2) == Some(&'\'') {
                        self.quote = Some(Quote::Single);
                    }
                    i += 1;
                    continue;
                }
                '\'' => {
                    self.quote = Some(Quote::Single);
                    i += 1;
                    continue;
                }
                '`' if matches!(self.language, Language::Go | Language::JavaScript) => {
                    self.quote = Some(Quote::Backtick);
                    i += 1;
                    continue;
                }
                'r' if self.language == Language::Rust
                    && (i == 0 || !is_ident(chars[i - 1])) =>
                {
                    let hashes = chars[i + 1..].iter().take_while(|&&ch| ch == '#').count();
                    if chars.get(i + 1 + hashes) == Some(&'"') {
                        self.quote = Some(Quote::Raw(hashes));
                        i += 2 + hashes;
                        continue;
                    }
                }
                _ => {}
            }
            on_code(c)?;
            i += 1;
        }

        let continued = line.trim_end_matches(['\n', '\r']).ends_with('\\');
        match self.quote {
            Some(Quote::Single) if self.language == Language::Rust => {
                Err("unterminated character literal".to_string())
            }
            Some(Quote::Single) if !continued => Err("unterminated string literal".to_string()),
            Some(Quote::Double) if self.language != Language::Rust && !continued => {
                Err("unterminated string literal".to_string())
            }
            _ => Ok(()),
        }
    }

    /// Advance inside a string literal, returning the number of characters
    /// consumed.
    fn consume_quoted(&mut self, quote: Quote, chars: &[char], i: usize) -> usize {
        let c = chars[i];
        let raw = matches!(quote, Quote::Raw(_))
            || (quote == Quote::Backtick && self.language == Language::Go);
        if c == '\\' && !raw {
            return 2;
        }
        let closes = |ch: char, count: usize| (0..count).all(|k| chars.get(i + k) == Some(&ch));
        match quote {
            Quote::Double if c == '"' => {
                self.quote = None;
                1
            }
            Quote::Single if c == '\'' => {
                self.quote = None;
                1
            }
            Quote::Backtick if c == '`' => {
                self.quote = None;
                1
            }
            Quote::TripleDouble if closes('"', 3) => {
                self.quote = None;
                3
            }
            Quote::TripleSingle if closes('\'', 3) => {
                self.quote = None;
                3
            }
            Quote::Raw(hashes) if c == '"' && (1..=hashes).all(|k| chars.get(i + k) == Some(&'#')) => {
                self.quote = None;
                1 + hashes
            }
            _ => 1,
        }
    }
}

fn closing_for(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

/// Push or pop one bracket on `stack`.
fn track_bracket(stack: &mut Vec<(char, usize)>, c: char, line: usize) -> Result<(), String> {
    match c {
        '(' | '[' | '{' => {
            stack.push((c, line));
            Ok(())
        }
        ')' | ']' | '}' => match stack.pop() {
            Some((open, _)) if closing_for(open) == c => Ok(()),
            Some((open, opened_at)) => Err(format!(
                "`{}` closes `{}` opened on line {}",
                c,
                open,
                opened_at + 1
            )),
            None => Err(format!("unmatched `{}`", c)),
        },
        _ => Ok(()),
    }
}

fn finish(lexer: &Lexer, stack: &[(char, usize)], last_line: usize) -> Result<(), ParseFailure> {
    if lexer.block_comment {
        return Err(ParseFailure {
            line: last_line,
            reason: "unterminated block comment".to_string(),
        });
    }
    if lexer.quote.is_some() {
        return Err(ParseFailure {
            line: last_line,
            reason: "unterminated string literal".to_string(),
        });
    }
    if let Some((open, line)) = stack.last() {
        return Err(ParseFailure {
            line: *line,
            reason: format!("unclosed `{}`", open),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

/// Find the scopes and import lines of `text`.
pub fn scan(language: Language, text: &str) -> Result<ScopeMap, ParseFailure> {
    let lines = split_lines(text);
    match language {
        Language::Python => scan_indented(&lines),
        _ => scan_braced(language, &lines),
    }
}

struct Pending {
    name: String,
    kind: ScopeKind,
    decl: usize,
    depth: usize,
    waited: usize,
}

struct Open {
    name: String,
    kind: ScopeKind,
    decl: usize,
    header_end: usize,
    depth: usize,
    indent: usize,
}

/// Lines a declaration header may span before its `{`.
const MAX_HEADER_LINES: usize = 8;

fn scan_braced(language: Language, lines: &[&str]) -> Result<ScopeMap, ParseFailure> {
    let mut lexer = Lexer::new(language);
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut open: Vec<Open> = Vec::new();
    let mut scopes: Vec<Scope> = Vec::new();
    let mut pending: Option<Pending> = None;
    let mut import_lines = vec![false; lines.len()];
    let mut in_import = false;

    for (idx, line) in lines.iter().enumerate() {
        let starts_in_code = lexer.in_code();
        let depth_at_start = stack.len();

        if starts_in_code && depth_at_start == 0 && is_import(language, line) {
            import_lines[idx] = true;
            in_import = true;
        } else if in_import && depth_at_start > 0 {
            import_lines[idx] = true;
        } else {
            in_import = false;
        }

        if starts_in_code && pending.is_none() {
            if let Some((name, kind)) = declaration(language, line) {
                pending = Some(Pending {
                    name,
                    kind,
                    decl: idx,
                    depth: depth_at_start,
                    waited: 0,
                });
            }
        }

        lexer
            .feed(line, |c| {
                track_bracket(&mut stack, c, idx)?;
                match c {
                    '{' if pending.as_ref().is_some_and(|p| stack.len() == p.depth + 1) => {
                        if let Some(p) = pending.take() {
                            open.push(Open {
                                name: p.name,
                                kind: p.kind,
                                decl: p.decl,
                                header_end: idx,
                                depth: stack.len(),
                                indent: indent_of(lines[p.decl]),
                            });
                        }
                    }
                    '}' => {
                        if open.last().is_some_and(|o| o.depth == stack.len() + 1) {
                            if let Some(o) = open.pop() {
                                let path = open
                                    .iter()
                                    .map(|p| p.name.as_str())
                                    .chain(std::iter::once(o.name.as_str()))
                                    .collect::<Vec<_>>()
                                    .join(".");
                                scopes.push(Scope {
                                    name: o.name,
                                    path,
                                    kind: o.kind,
                                    decl: o.decl,
                                    header_end: o.header_end,
                                    end: idx + 1,
                                    indent: o.indent,
                                });
                            }
                        }
                    }
                    ';' => {
                        if pending.as_ref().is_some_and(|p| stack.len() == p.depth) {
                            pending = None;
                        }
                    }
                    _ => {}
                }
                Ok(())
            })
            .map_err(|reason| ParseFailure { line: idx, reason })?;

        if let Some(p) = pending.as_mut() {
            p.waited += 1;
            if p.waited > MAX_HEADER_LINES {
                pending = None;
            }
        }
    }

    finish(&lexer, &stack, lines.len().saturating_sub(1))?;
    scopes.sort_by_key(|s| (s.decl, std::cmp::Reverse(s.end)));
    Ok(ScopeMap {
        language,
        scopes,
        import_lines,
    })
}

const PYTHON_BLOCK_KEYWORDS: &[&str] = &[
    "def", "class", "if", "elif", "else", "for", "while", "try", "except", "finally", "with",
    "async", "match", "case",
];

struct PyLine {
    starts_in_code: bool,
    depth_at_start: usize,
    depth_at_end: usize,
    significant: bool,
    indent: usize,
    opens_block: bool,
    continues: bool,
}

fn scan_indented(lines: &[&str]) -> Result<ScopeMap, ParseFailure> {
    let mut lexer = Lexer::new(Language::Python);
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut info: Vec<PyLine> = Vec::with_capacity(lines.len());
    let mut import_lines = vec![false; lines.len()];
    let mut in_import = false;

    for (idx, line) in lines.iter().enumerate() {
        let starts_in_code = lexer.in_code();
        let depth_at_start = stack.len();
        let mut code = String::new();
        lexer
            .feed(line, |c| {
                code.push(c);
                track_bracket(&mut stack, c, idx)
            })
            .map_err(|reason| ParseFailure { line: idx, reason })?;
        let code = code.trim();

        if starts_in_code && depth_at_start == 0 && is_import(Language::Python, line) {
            import_lines[idx] = true;
            in_import = true;
        } else if in_import && depth_at_start > 0 {
            import_lines[idx] = true;
        } else {
            in_import = false;
        }

        let first_word = code
            .split(|c: char| !is_ident(c))
            .find(|w| !w.is_empty())
            .unwrap_or("");
        info.push(PyLine {
            starts_in_code,
            depth_at_start,
            depth_at_end: stack.len(),
            significant: starts_in_code && !line.trim().is_empty() && !line.trim_start().starts_with('#'),
            indent: indent_of(line),
            opens_block: stack.is_empty()
                && code.ends_with(':')
                && PYTHON_BLOCK_KEYWORDS.contains(&first_word),
            continues: code.ends_with('\\'),
        });
    }
    finish(&lexer, &stack, lines.len().saturating_sub(1))?;
    check_indentation(&info)?;

    let mut scopes: Vec<Scope> = Vec::new();
    let mut parents: Vec<(String, usize)> = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        let li = &info[idx];
        if !li.starts_in_code || li.depth_at_start != 0 {
            continue;
        }
        let Some((name, kind)) = declaration(Language::Python, line) else {
            continue;
        };

        let mut decl = idx;
        while decl > 0
            && info[decl - 1].indent == li.indent
            && info[decl - 1].starts_in_code
            && lines[decl - 1].trim_start().starts_with('@')
        {
            decl -= 1;
        }
        let header_end = (idx..lines.len())
            .find(|&j| info[j].depth_at_end == 0)
            .unwrap_or(idx);
        let mut end = (header_end + 1..lines.len())
            .find(|&k| {
                info[k].significant && info[k].depth_at_start == 0 && info[k].indent <= li.indent
            })
            .unwrap_or(lines.len());
        while end > header_end + 1 && lines[end - 1].trim().is_empty() {
            end -= 1;
        }

        parents.retain(|(_, parent_end)| *parent_end > idx);
        let path = parents
            .iter()
            .map(|(n, _)| n.as_str())
            .chain(std::iter::once(name.as_str()))
            .collect::<Vec<_>>()
            .join(".");
        parents.push((name.clone(), end));
        scopes.push(Scope {
            name,
            path,
            kind,
            decl,
            header_end,
            end,
            indent: li.indent,
        });
    }

    Ok(ScopeMap {
        language: Language::Python,
        scopes,
        import_lines,
    })
}

fn check_indentation(info: &[PyLine]) -> Result<(), ParseFailure> {
    let logical: Vec<usize> = (0..info.len())
        .filter(|&i| info[i].significant && info[i].depth_at_start == 0)
        .collect();
    for (pos, &i) in logical.iter().enumerate() {
        let next = logical.get(pos + 1).copied();
        if info[i].opens_block {
            match next {
                Some(n) if info[n].indent > info[i].indent => {}
                _ => {
                    return Err(ParseFailure {
                        line: i,
                        reason: "expected an indented block".to_string(),
                    })
                }
            }
        } else if let Some(n) = next {
            if info[n].indent > info[i].indent && !info[i].continues {
                return Err(ParseFailure {
                    line: n,
                    reason: "unexpected indent".to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(map: &ScopeMap) -> Vec<&str> {
        map.scopes.iter().map(|s| s.path.as_str()).collect()
    }

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(patterns(Language::Rust).len(), RUST_PATTERNS.len());
        assert_eq!(patterns(Language::Python).len(), PYTHON_PATTERNS.len());
        assert_eq!(patterns(Language::Go).len(), GO_PATTERNS.len());
        assert_eq!(patterns(Language::JavaScript).len(), JS_PATTERNS.len());
        assert_eq!(patterns(Language::CLike).len(), CLIKE_PATTERNS.len());
    }

    #[test]
    fn test_language_from_path() {
        assert_eq!(Language::from_path("src/main.rs"), Some(Language::Rust));
        assert_eq!(Language::from_path("app/View.TSX"), Some(Language::JavaScript));
        assert_eq!(Language::from_path("Main.java"), Some(Language::CLike));
        assert_eq!(Language::from_path("README.md"), None);
        assert_eq!(Language::from_path("Makefile"), None);
    }

    #[test]
    fn test_rust_scopes() {
        let src = "\
use std::fmt;

pub struct Server {
    port: u16,
}

impl Server {
    pub fn start(&self) -> Result<(), String> {
        let s = \"}\";
        let c = '{';
        Ok(())
    }
}

fn helper<'a>(x: &'a str) -> &'a str {
    x
}
";
        let map = scan(Language::Rust, src).unwrap();
        assert_eq!(paths(&map), vec!["Server", "Server", "Server.start", "helper"]);
        let start = &map.scopes[2];
        assert_eq!(start.decl, 7);
        assert_eq!(start.header_end, 7);
        assert_eq!(start.end, 12);
        assert!(map.is_import_line(0));
        assert!(!map.is_import_line(2));
    }

    #[test]
    fn test_multiline_header() {
        let src = "fn build(\n    a: u32,\n    b: u32,\n) -> u32 {\n    a + b\n}\n";
        let map = scan(Language::Rust, src).unwrap();
        assert_eq!(map.scopes.len(), 1);
        assert_eq!(map.scopes[0].header(), LineRange::new(0, 4));
        assert_eq!(map.scopes[0].end, 6);
    }

    #[test]
    fn test_trait_method_without_body_is_not_a_scope() {
        let src = "trait Shape {\n    fn area(&self) -> f64;\n    fn name(&self) -> &str {\n        \"shape\"\n    }\n}\n";
        let map = scan(Language::Rust, src).unwrap();
        assert_eq!(paths(&map), vec!["Shape", "Shape.name"]);
    }

    #[test]
    fn test_unbalanced_braces_fail() {
        let err = scan(Language::Rust, "fn a() {\n    if x {\n}\n").unwrap_err();
        assert!(err.reason.contains("unclosed"));
        assert!(scan(Language::JavaScript, "function f() { return [1, 2); }\n").is_err());
        assert!(scan(Language::Go, "func main() {\n}\n}\n").is_err());
    }

    #[test]
    fn test_block_comment_and_unterminated_string() {
        assert!(scan(Language::CLike, "/* { */\nint main() {\n  return 0;\n}\n").is_ok());
        assert!(scan(Language::CLike, "int main() {\n  char *s = \"oops;\n}\n").is_err());
        assert!(scan(Language::Rust, "/* never closed\nfn a() {}\n").is_err());
    }

    #[test]
    fn test_javascript_scopes() {
        let src = "\
import { a } from './a';

export class Cart {
  add(item) {
    this.items.push(item);
  }
}

export const total = (items) => {
  return items.length;
};
";
        let map = scan(Language::JavaScript, src).unwrap();
        assert_eq!(paths(&map), vec!["Cart", "Cart.add", "total"]);
        assert!(map.is_import_line(0));
    }

    #[test]
    fn test_go_import_block() {
        let src = "package main\n\nimport (\n\t\"fmt\"\n\t\"os\"\n)\n\nfunc main() {\n\tfmt.Println(os.Args)\n}\n";
        let map = scan(Language::Go, src).unwrap();
        assert!(map.is_import_line(2));
        assert!(map.is_import_line(3));
        assert!(map.is_import_line(5));
        assert!(!map.is_import_line(7));
        assert_eq!(paths(&map), vec!["main"]);
    }

    #[test]
    fn test_python_scopes() {
        let src = "\
import os


class Greeter:
    @staticmethod
    def hello(name):
        msg = \"\"\"hi
there\"\"\"
        return msg

    def bye(self):
        return 'bye'


def main():
    Greeter.hello('x')
";
        let map = scan(Language::Python, src).unwrap();
        assert_eq!(paths(&map), vec!["Greeter", "Greeter.hello", "Greeter.bye", "main"]);
        let hello = &map.scopes[1];
        assert_eq!(hello.decl, 4);
        assert_eq!(hello.header_end, 5);
        assert_eq!(hello.end, 9);
        let greeter = &map.scopes[0];
        assert_eq!(greeter.end, 12);
        assert!(map.is_import_line(0));
    }

    #[test]
    fn test_python_indentation_errors() {
        let missing_block = "def f():\nreturn 1\n";
        assert_eq!(
            scan(Language::Python, missing_block).unwrap_err().reason,
            "expected an indented block"
        );
        let stray_indent = "x = 1\n    y = 2\n";
        assert_eq!(
            scan(Language::Python, stray_indent).unwrap_err().reason,
            "unexpected indent"
        );
        assert!(scan(Language::Python, "items = [\n    1,\n    2,\n]\n").is_ok());
    }

    #[test]
    fn test_enclosing_scope() {
        let src = "fn a() {\n    one();\n}\n\nfn b() {\n    two();\n}\n";
        let map = scan(Language::Rust, src).unwrap();
        let inside = map.enclosing(&LineRange::new(2, 2), &[]).unwrap();
        assert_eq!(inside.name, "a");
        assert!(map.enclosing(&LineRange::new(3, 3), &[]).is_none());
        assert!(map.enclosing(&LineRange::new(2, 5), &[]).is_none());
        assert_eq!(map.enclosing(&LineRange::new(5, 6), &[]).unwrap().name, "b");
    }

    #[test]
    fn test_python_append_to_body() {
        let src = "def a():\n    one()\n\n\ndef b():\n    two()\n";
        let map = scan(Language::Python, src).unwrap();
        let indented = vec!["    extra()\n".to_string()];
        assert_eq!(
            map.enclosing(&LineRange::new(2, 2), &indented).unwrap().name,
            "a"
        );
        let dedented = vec!["x = 1\n".to_string()];
        assert!(map.enclosing(&LineRange::new(2, 2), &dedented).is_none());
    }

    #[test]
    fn test_control_flow_is_not_a_declaration() {
        assert_eq!(declaration(Language::CLike, "    if (ready) {"), None);
        assert_eq!(declaration(Language::CLike, "    return compute(a,"), None);
        assert_eq!(
            declaration(Language::CLike, "    public int compute(int a) {"),
            Some(("compute".to_string(), ScopeKind::Function))
        );
        assert_eq!(
            declaration(Language::Rust, "impl<T> fmt::Display for Wrapper<T> {"),
            Some(("Wrapper".to_string(), ScopeKind::Class))
        );
        assert_eq!(
            declaration(Language::Rust, "    pub(crate) async fn run(&self) {"),
            Some(("run".to_string(), ScopeKind::Function))
        );
    }
}
