//! Heuristics: which variable names look secret, and how strong a password is.

use regex::{Regex, RegexBuilder};
use serde::Serialize;

/// Built-in keywords; any case-insensitive occurrence marks a name sensitive.
pub const SENSITIVE_KEYWORDS: &[&str] = &[
    "password",
    "secret",
    "key",
    "token",
    "auth",
    "api_key",
    "private",
    "credential",
    "cert",
    "certificate",
];

/// Compiled sensitivity classifier.
#[derive(Debug, Clone, Default)]
pub struct SensitivityClassifier {
    extra: Vec<Pattern>,
}

#[derive(Debug, Clone)]
enum Pattern {
    Regex(Regex),
    /// Lowercased; used when the pattern is not a valid regex.
    Substring(String),
}

impl Pattern {
    fn compile(raw: &str) -> Self {
        match RegexBuilder::new(raw).case_insensitive(true).build() {
            Ok(re) => Self::Regex(re),
            Err(_) => Self::Substring(raw.to_lowercase()),
        }
    }

    fn matches(&self, text: &str, lowered: &str) -> bool {
        match self {
            Self::Regex(re) => re.is_match(text),
            Self::Substring(s) => lowered.contains(s.as_str()),
        }
    }
}

impl SensitivityClassifier {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        Self {
            extra: patterns
                .iter()
                .map(|p| p.as_ref())
                .filter(|p| !p.is_empty())
                .map(Pattern::compile)
                .collect(),
        }
    }

    /// Built-in keywords, configured patterns, then `additional`.
    pub fn is_sensitive(&self, text: &str, additional: &[&str]) -> bool {
        let lowered = text.to_lowercase();
        SENSITIVE_KEYWORDS.iter().any(|kw| lowered.contains(kw))
            || self.extra.iter().any(|p| p.matches(text, &lowered))
            || additional
                .iter()
                .filter(|p| !p.is_empty())
                .any(|p| Pattern::compile(p).matches(text, &lowered))
    }
}

// ---------------------------------------------------------------------------
// Password strength
// ---------------------------------------------------------------------------

/// Score at or above which a password counts as strong.
pub const STRONG_SCORE: u8 = 4;
pub const MAX_SCORE: u8 = 5;

const COMMON_FRAGMENTS: &[&str] = &[
    "password", "passwd", "123456", "12345678", "qwerty", "letmein", "welcome", "admin",
    "iloveyou", "abc123", "111111", "monkey", "dragon",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordStrength {
    pub is_strong: bool,
    pub score: u8,
    pub feedback: Vec<String>,
}

pub fn validate_password_strength(password: &str) -> PasswordStrength {
    let mut score: i32 = 0;
    let mut feedback = Vec::new();
    let len = password.chars().count();

    if len >= 8 {
        score += 1;
    } else {
        feedback.push("Use at least 8 characters".to_string());
    }
    if len >= 12 {
        score += 1;
    } else if len >= 8 {
        feedback.push("Use 12 or more characters for a stronger password".to_string());
    }

    let has_lower = password.chars().any(|c| c.is_lowercase());
    let has_upper = password.chars().any(|c| c.is_uppercase());
    if has_lower && has_upper {
        score += 1;
    } else {
        feedback.push("Mix uppercase and lowercase letters".to_string());
    }
    if password.chars().any(|c| c.is_ascii_digit()) {
        score += 1;
    } else {
        feedback.push("Add at least one number".to_string());
    }
    if password.chars().any(|c| !c.is_alphanumeric() && !c.is_whitespace()) {
        score += 1;
    } else {
        feedback.push("Add at least one special character".to_string());
    }

    let lowered = password.to_lowercase();
    if COMMON_FRAGMENTS.iter().any(|f| lowered.contains(f)) {
        score -= 1;
        feedback.push("Avoid common passwords and words".to_string());
    }
    if has_repeated_run(password, 3) {
        score -= 1;
        feedback.push("Avoid repeating the same character".to_string());
    }
    if has_sequential_run(&lowered, 4) {
        score -= 1;
        feedback.push("Avoid sequences such as abcd or 1234".to_string());
    }

    let score = score.clamp(0, MAX_SCORE as i32) as u8;
    PasswordStrength {
        is_strong: score >= STRONG_SCORE,
        score,
        feedback,
    }
}

fn has_repeated_run(s: &str, run: usize) -> bool {
    let chars: Vec<char> = s.chars().collect();
    chars.windows(run).any(|w| w.iter().all(|c| *c == w[0]))
}

fn has_sequential_run(s: &str, run: usize) -> bool {
    let chars: Vec<u32> = s.chars().map(u32::from).collect();
    chars.windows(run).any(|w| {
        w.windows(2).all(|p| p[1] == p[0] + 1) || w.windows(2).all(|p| p[0] == p[1] + 1)
    })
}
