//! Prompt strategies applied to the raw snippet before tokenization.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

const FEW_SHOT_EXAMPLES: &str = "# Example 1: Python function
def calculate
def calculate_sum(a, b):
    return a + b

# Example 2: Java class
public class User
public class User {
    private String name;
}

# Your code:
";

/// How the snippet is framed for the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PromptStrategy {
    /// Raw code, no framing.
    None,
    /// `code completion: ` prefix.
    #[default]
    TaskPrefix,
    /// Natural-language instruction header.
    Instruction,
    /// Two worked examples before the snippet.
    FewShot,
    /// `Generate <language> code:` header.
    LanguageAware,
}

impl PromptStrategy {
    /// Frame `code`. `language` is the caller's hint; when absent,
    /// [`PromptStrategy::LanguageAware`] guesses it from the code.
    pub fn apply(self, code: &str, language: Option<&str>) -> String {
        match self {
            Self::None => code.to_string(),
            Self::TaskPrefix => format!("code completion: {code}"),
            Self::Instruction => format!("Complete the following code:\n\n{code}"),
            Self::FewShot => format!("{FEW_SHOT_EXAMPLES}{code}"),
            Self::LanguageAware => {
                let language = language
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .unwrap_or_else(|| detect_language(code));
                format!("Generate {language} code:\n{code}")
            }
        }
    }

    /// Parse a transport tag, falling back to [`PromptStrategy::TaskPrefix`]
    /// for unknown values.
    pub fn from_tag(tag: &str) -> Self {
        tag.parse().unwrap_or_else(|_| {
            warn!(tag = %tag, "unknown prompt strategy, using task_prefix");
            Self::TaskPrefix
        })
    }

    /// Canonical tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::TaskPrefix => "task_prefix",
            Self::Instruction => "instruction",
            Self::FewShot => "few_shot",
            Self::LanguageAware => "language_aware",
        }
    }
}

impl fmt::Display for PromptStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PromptStrategy {
    type Err = String;

    /// Case-insensitive; accepts `snake_case`, `SCREAMING_SNAKE` and
    /// `kebab-case` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "none" => Ok(Self::None),
            "task_prefix" => Ok(Self::TaskPrefix),
            "instruction" => Ok(Self::Instruction),
            "few_shot" => Ok(Self::FewShot),
            "language_aware" => Ok(Self::LanguageAware),
            other => Err(format!("unknown prompt strategy: {other}")),
        }
    }
}

/// Heuristic language guess from leading keywords and telltale tokens.
pub fn detect_language(code: &str) -> &'static str {
    let code = code.trim().to_lowercase();
    if code.starts_with("def ") || code.starts_with("import ") || code.contains("print(") {
        "Python"
    } else if code.starts_with("public ")
        || code.starts_with("private ")
        || code.contains("class ")
        || code.contains("void ")
    {
        "Java"
    } else if code.starts_with("function ")
        || code.starts_with("const ")
        || code.starts_with("let ")
        || code.contains("=>")
    {
        "JavaScript"
    } else if code.starts_with("func ") || code.contains(":=") {
        "Go"
    } else {
        "code"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixes() {
        assert_eq!(PromptStrategy::None.apply("x", None), "x");
        assert_eq!(PromptStrategy::TaskPrefix.apply("x", None), "code completion: x");
        assert_eq!(
            PromptStrategy::Instruction.apply("x", None),
            "Complete the following code:\n\nx"
        );
        let few = PromptStrategy::FewShot.apply("x", None);
        assert!(few.starts_with("# Example 1"));
        assert!(few.ends_with("# Your code:\nx"));
    }

    #[test]
    fn test_language_aware_prefers_hint() {
        assert_eq!(
            PromptStrategy::LanguageAware.apply("def f():", Some("Rust")),
            "Generate Rust code:\ndef f():"
        );
    }

    #[test]
    fn test_language_aware_detects_when_hint_blank() {
        assert_eq!(
            PromptStrategy::LanguageAware.apply("def f():", Some("  ")),
            "Generate Python code:\ndef f():"
        );
    }

    #[test]
    fn test_detect_language() {
        assert_eq!(detect_language("import os"), "Python");
        assert_eq!(detect_language("public class A {}"), "Java");
        assert_eq!(detect_language("const x = () => 1"), "JavaScript");
        assert_eq!(detect_language("x := 4"), "Go");
        assert_eq!(detect_language("SELECT 1"), "code");
    }

    #[test]
    fn test_parse_tags() {
        assert_eq!(PromptStrategy::from_tag("FEW_SHOT"), PromptStrategy::FewShot);
        assert_eq!(
            PromptStrategy::from_tag("language-aware"),
            PromptStrategy::LanguageAware
        );
        assert_eq!(PromptStrategy::from_tag("bogus"), PromptStrategy::TaskPrefix);
        assert_eq!(PromptStrategy::default(), PromptStrategy::TaskPrefix);
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        for s in [
            PromptStrategy::None,
            PromptStrategy::TaskPrefix,
            PromptStrategy::Instruction,
            PromptStrategy::FewShot,
            PromptStrategy::LanguageAware,
        ] {
            assert_eq!(s.to_string().parse::<PromptStrategy>(), Ok(s));
        }
    }
}
