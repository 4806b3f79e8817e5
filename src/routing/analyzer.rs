//! Source-code complexity analysis.
//!
//! Turns a code snippet into a [`ComplexityScore`] in `0.0..=1.0` using
//! cheap lexical heuristics only (no parsing). The score drives tier
//! selection in [`super::ModelRouter`].
//!
//! ## Signals
//!
//! | Signal      | Low → High      | Weight |
//! |-------------|-----------------|--------|
//! | nesting     | 1 → 5 levels    | 40%    |
//! | structural  | 2 → 25 weighted | 25%    |
//! | identifiers | 5 → 30 unique   | 17%    |
//! | keywords    | 1 → 5 hits      | 10%    |
//! | lines       | 10 → 50 lines   | 8%     |
//!
//! Each signal is linearly interpolated between its low and high threshold
//! and clamped to `[0.0, 1.0]`; the weighted total is clamped again.
//! Comments are stripped first so that prose never inflates the score.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::debug;

const LINE_WEIGHT: f64 = 0.08;
const IDENTIFIER_WEIGHT: f64 = 0.17;
const NESTING_WEIGHT: f64 = 0.40;
const STRUCTURAL_WEIGHT: f64 = 0.25;
const KEYWORD_WEIGHT: f64 = 0.10;

/// Spaces per indentation level; a tab counts as one full level.
const INDENT_WIDTH: usize = 4;

/// Short, ubiquitous names that say nothing about domain size.
const IDENTIFIER_STOPLIST: &[&str] = &[
    "if", "for", "while", "do", "try", "int", "str", "var", "let", "const", "new", "this",
    "self", "return", "break", "continue",
];

/// Keywords that indicate advanced language features.
const ADVANCED_KEYWORDS: &[&str] = &[
    "class",
    "interface",
    "extends",
    "implements",
    "abstract",
    "async",
    "await",
    "promise",
    "thread",
    "synchronized",
    "generic",
    "template",
    "lambda",
    "closure",
    "decorator",
    "reflection",
    "metaclass",
    "trait",
    "protocol",
];

struct Patterns {
    block_comment: Regex,
    single_quote_block: Regex,
    double_quote_block: Regex,
    line_comment: Regex,
    hash_comment: Regex,
    identifier: Regex,
    function: Regex,
    type_def: Regex,
    import: Regex,
    control_flow: Regex,
    async_pattern: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                block_comment: Regex::new(r"(?s)/\*.*?\*/").ok()?,
                single_quote_block: Regex::new(r"(?s)'''.*?'''").ok()?,
                double_quote_block: Regex::new(r#"(?s)""".*?""""#).ok()?,
                line_comment: Regex::new(r"(?m)//.*$").ok()?,
                hash_comment: Regex::new(r"(?m)#.*$").ok()?,
                identifier: Regex::new(r"\b[a-zA-Z_][a-zA-Z0-9_]*\b").ok()?,
                function: Regex::new(
                    r"\b(def|function|func|fn|void|public|private|protected)\s+\w+\s*\(",
                )
                .ok()?,
                type_def: Regex::new(r"\b(class|interface|struct|enum|trait)\s+\w+").ok()?,
                import: Regex::new(r"\b(import|from|include|require|use)\s+").ok()?,
                control_flow: Regex::new(
                    r"\b(if|else|elif|switch|case|for|while|do|try|catch|finally)\b",
                )
                .ok()?,
                async_pattern: Regex::new(r"\b(async|await|promise|future|thread)\b").ok()?,
            })
        })
        .as_ref()
}

/// Immutable result of one analysis.
///
/// Every sub-score is individually clamped to `[0.0, 1.0]`; `total` is the
/// fixed weighted blend of the five, clamped to `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComplexityScore {
    /// Weighted total.
    pub total: f64,
    /// Line-count signal.
    pub lines: f64,
    /// Unique-identifier signal.
    pub identifiers: f64,
    /// Nesting-depth signal.
    pub nesting: f64,
    /// Structural-density signal.
    pub structural: f64,
    /// Advanced-keyword signal.
    pub keywords: f64,
    /// Wall time spent analysing.
    pub duration: Duration,
}

impl ComplexityScore {
    /// The score for empty input.
    pub const ZERO: ComplexityScore = ComplexityScore {
        total: 0.0,
        lines: 0.0,
        identifiers: 0.0,
        nesting: 0.0,
        structural: 0.0,
        keywords: 0.0,
        duration: Duration::ZERO,
    };

    fn from_parts(
        lines: f64,
        identifiers: f64,
        nesting: f64,
        structural: f64,
        keywords: f64,
        duration: Duration,
    ) -> Self {
        let total = lines * LINE_WEIGHT
            + identifiers * IDENTIFIER_WEIGHT
            + nesting * NESTING_WEIGHT
            + structural * STRUCTURAL_WEIGHT
            + keywords * KEYWORD_WEIGHT;
        Self {
            total: clamp_unit(total),
            lines,
            identifiers,
            nesting,
            structural,
            keywords,
            duration,
        }
    }
}

impl std::fmt::Display for ComplexityScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "total={:.2} lines={:.2} identifiers={:.2} nesting={:.2} structural={:.2} keywords={:.2} ({}us)",
            self.total,
            self.lines,
            self.identifiers,
            self.nesting,
            self.structural,
            self.keywords,
            self.duration.as_micros()
        )
    }
}

/// Stateless lexical complexity analyzer.
///
/// Deterministic and I/O free; a 6 KB snippet analyses in well under the
/// 25 ms budget.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Clone, Default)]
pub struct ComplexityAnalyzer;

impl ComplexityAnalyzer {
    /// Create a new analyzer.
    pub fn new() -> Self {
        Self
    }

    /// Analyse `code` and return its complexity score.
    ///
    /// Empty or whitespace-only input returns [`ComplexityScore::ZERO`]
    /// without running the pipeline.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tokio_completion_orchestrator::routing::ComplexityAnalyzer;
    /// let score = ComplexityAnalyzer::new().analyze("x = 1");
    /// assert!(score.total < 0.3);
    /// ```
    pub fn analyze(&self, code: &str) -> ComplexityScore {
        if code.trim().is_empty() {
            return ComplexityScore::ZERO;
        }
        let Some(p) = patterns() else {
            return ComplexityScore::ZERO;
        };

        let start = Instant::now();
        let stripped = strip_comments(p, code);

        let score = ComplexityScore::from_parts(
            line_signal(&stripped),
            identifier_signal(p, &stripped),
            nesting_signal(&stripped),
            structural_signal(p, &stripped),
            keyword_signal(p, &stripped),
            start.elapsed(),
        );

        debug!(chars = code.len(), %score, "analysed complexity");
        score
    }
}

// ── Comment stripping ──────────────────────────────────────────────────

fn strip_comments(p: &Patterns, code: &str) -> String {
    // Block forms go first so a `//` inside `/* ... */` cannot cut the block.
    let code = p.block_comment.replace_all(code, "");
    let code = p.single_quote_block.replace_all(&code, "");
    let code = p.double_quote_block.replace_all(&code, "");
    let code = p.line_comment.replace_all(&code, "");
    let code = p.hash_comment.replace_all(&code, "");
    code.into_owned()
}

// ── Individual signals ─────────────────────────────────────────────────

fn line_signal(code: &str) -> f64 {
    let lines = code.trim_end_matches('\n').split('\n').count();
    interpolate(lines as f64, 10.0, 50.0)
}

fn identifier_signal(p: &Patterns, code: &str) -> f64 {
    let unique: HashSet<String> = p
        .identifier
        .find_iter(code)
        .map(|m| m.as_str())
        .filter(|id| id.len() > 2)
        .map(str::to_lowercase)
        .filter(|id| !IDENTIFIER_STOPLIST.contains(&id.as_str()))
        .collect();
    interpolate(unique.len() as f64, 5.0, 30.0)
}

fn nesting_signal(code: &str) -> f64 {
    interpolate(max_nesting_depth(code) as f64, 1.0, 5.0)
}

/// Greater of bracket depth and indentation depth.
pub(crate) fn max_nesting_depth(code: &str) -> usize {
    let mut depth = 0_usize;
    let mut bracket_max = 0_usize;
    for c in code.chars() {
        match c {
            '{' | '(' => {
                depth += 1;
                bracket_max = bracket_max.max(depth);
            }
            '}' | ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }

    let indent_max = code
        .lines()
        .map(|line| leading_indent(line) / INDENT_WIDTH)
        .max()
        .unwrap_or(0);

    bracket_max.max(indent_max)
}

fn leading_indent(line: &str) -> usize {
    let mut width = 0;
    for c in line.chars() {
        match c {
            ' ' => width += 1,
            '\t' => width += INDENT_WIDTH,
            _ => break,
        }
    }
    width
}

fn structural_signal(p: &Patterns, code: &str) -> f64 {
    let functions = p.function.find_iter(code).count();
    let types = p.type_def.find_iter(code).count();
    let imports = p.import.find_iter(code).count();
    let control = p.control_flow.find_iter(code).count();

    let weighted = functions * 2 + types * 4 + imports + control * 3;
    interpolate(weighted as f64, 2.0, 25.0)
}

fn keyword_signal(p: &Patterns, code: &str) -> f64 {
    let lower = code.to_lowercase();
    let present = ADVANCED_KEYWORDS
        .iter()
        .filter(|kw| lower.contains(*kw))
        .count();
    let async_hits = p.async_pattern.find_iter(code).count();
    interpolate((present + async_hits) as f64, 1.0, 5.0)
}

/// Linear map of `value` from `[low, high]` onto `[0, 1]`, clamped.
fn interpolate(value: f64, low: f64, high: f64) -> f64 {
    if value <= low {
        0.0
    } else if value >= high {
        1.0
    } else {
        (value - low) / (high - low)
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
