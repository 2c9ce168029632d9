//! # Password Analyzer
//!
//! Deterministic strength scoring and policy enforcement for the passwords
//! that unlock user keys. The same input always produces the same report,
//! so callers can cache or display results without re-running analysis.
//!
//! Scoring is additive with explicit penalties, clamped to `[0, 100]`:
//!
//! | Signal | Points |
//! |---|---|
//! | length >= 12 (else >= 8) | +20 (+10) |
//! | each character class present | +15 |
//! | each common-password substring | -30 |
//! | sequential run (abc, 123) | -20 |
//! | triple repeated character | -15 |
//! | keyboard walk (qwerty, asdf) | -20 |
//!
//! Inputs are NFC-normalized before analysis so visually identical
//! passwords are scored identically.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Substrings that immediately mark a password as compromised
const COMMON_PASSWORDS: &[&str] = &[
    "password", "123456", "12345678", "qwerty", "letmein", "admin", "welcome", "monkey", "dragon",
    "master", "login", "abc123", "iloveyou", "sunshine", "princess", "football", "shadow",
    "superman", "trustno1", "baseball",
];

/// Keyboard rows checked for walks, forward and reverse
const KEYBOARD_ROWS: &[&str] = &["qwertyuiop", "asdfghjkl", "zxcvbnm", "1234567890"];

/// Minimum length of a detected keyboard walk
const WALK_LEN: usize = 4;

/// Character-class sizes used for the entropy estimate
const LOWER_SET: f64 = 26.0;
const UPPER_SET: f64 = 26.0;
const DIGIT_SET: f64 = 10.0;
const SYMBOL_SET: f64 = 32.0;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum PasswordError {
    /// Policy check failed. All violations are collected before returning,
    /// never just the first.
    #[error("password policy violated: {}", reasons.join("; "))]
    PolicyViolation { reasons: Vec<String> },
}

pub type Result<T> = std::result::Result<T, PasswordError>;

// ============================================================================
// REPORT TYPES
// ============================================================================

/// Strength band derived from the final score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strength {
    VeryWeak,
    Weak,
    Fair,
    Good,
    Strong,
    VeryStrong,
}

/// Crack-time band derived from the entropy estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrackTime {
    Hours,
    Days,
    Weeks,
    Months,
    Years,
    Centuries,
}

/// Full analysis report for one password
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordAnalysis {
    pub score: u8,
    pub strength: Strength,
    pub has_lower: bool,
    pub has_upper: bool,
    pub has_digit: bool,
    pub has_symbol: bool,
    pub length: usize,
    pub entropy_bits: f64,
    pub common_patterns: Vec<String>,
    pub suggestions: Vec<String>,
    pub estimated_crack_time: CrackTime,
}

/// Policy enforced at key creation time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub require_upper: bool,
    pub require_lower: bool,
    pub require_digit: bool,
    pub require_symbol: bool,
    pub forbidden_patterns: Vec<String>,
    pub min_strength_score: u8,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        PasswordPolicy {
            min_length: 12,
            require_upper: true,
            require_lower: true,
            require_digit: true,
            require_symbol: true,
            forbidden_patterns: Vec::new(),
            min_strength_score: 60,
        }
    }
}

// ============================================================================
// ANALYSIS
// ============================================================================

/// Analyze a password and produce a deterministic strength report.
pub fn analyze(password: &str) -> PasswordAnalysis {
    let normalized: String = password.nfc().collect();
    let lower = normalized.to_lowercase();
    let length = normalized.chars().count();

    let has_lower = normalized.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = normalized.chars().any(|c| c.is_ascii_uppercase());
    let has_digit = normalized.chars().any(|c| c.is_ascii_digit());
    let has_symbol = normalized
        .chars()
        .any(|c| !c.is_ascii_alphanumeric() && !c.is_whitespace());

    let mut score: i32 = 0;
    let mut common_patterns = Vec::new();

    if length >= 12 {
        score += 20;
    } else if length >= 8 {
        score += 10;
    }
    for present in [has_lower, has_upper, has_digit, has_symbol] {
        if present {
            score += 15;
        }
    }

    for candidate in COMMON_PASSWORDS {
        if lower.contains(candidate) {
            score -= 30;
            common_patterns.push(format!("common password: {candidate}"));
        }
    }
    if has_sequential_run(&lower) {
        score -= 20;
        common_patterns.push("sequential characters".to_string());
    }
    if has_triple_repeat(&lower) {
        score -= 15;
        common_patterns.push("repeated characters".to_string());
    }
    if has_keyboard_walk(&lower) {
        score -= 20;
        common_patterns.push("keyboard walk".to_string());
    }

    let score = score.clamp(0, 100) as u8;

    let mut charset = 0.0;
    if has_lower {
        charset += LOWER_SET;
    }
    if has_upper {
        charset += UPPER_SET;
    }
    if has_digit {
        charset += DIGIT_SET;
    }
    if has_symbol {
        charset += SYMBOL_SET;
    }
    let entropy_bits = if charset > 0.0 {
        length as f64 * charset.log2()
    } else {
        0.0
    };

    let strength = match score {
        80..=100 => Strength::VeryStrong,
        65..=79 => Strength::Strong,
        50..=64 => Strength::Good,
        35..=49 => Strength::Fair,
        20..=34 => Strength::Weak,
        _ => Strength::VeryWeak,
    };

    let estimated_crack_time = match entropy_bits {
        e if e >= 60.0 => CrackTime::Centuries,
        e if e >= 50.0 => CrackTime::Years,
        e if e >= 40.0 => CrackTime::Months,
        e if e >= 30.0 => CrackTime::Weeks,
        e if e >= 20.0 => CrackTime::Days,
        _ => CrackTime::Hours,
    };

    let suggestions = build_suggestions(
        length,
        has_lower,
        has_upper,
        has_digit,
        has_symbol,
        &common_patterns,
    );

    PasswordAnalysis {
        score,
        strength,
        has_lower,
        has_upper,
        has_digit,
        has_symbol,
        length,
        entropy_bits,
        common_patterns,
        suggestions,
        estimated_crack_time,
    }
}

/// Validate a password against a policy.
///
/// Collects every violation before failing; a caller sees the complete
/// list of problems, not just the first.
pub fn validate_policy(password: &str, policy: &PasswordPolicy) -> Result<()> {
    let normalized: String = password.nfc().collect();
    let lower = normalized.to_lowercase();
    let mut reasons = Vec::new();

    if normalized.chars().count() < policy.min_length {
        reasons.push(format!(
            "must be at least {} characters (got {})",
            policy.min_length,
            normalized.chars().count()
        ));
    }
    if policy.require_lower && !normalized.chars().any(|c| c.is_ascii_lowercase()) {
        reasons.push("must contain a lowercase letter".to_string());
    }
    if policy.require_upper && !normalized.chars().any(|c| c.is_ascii_uppercase()) {
        reasons.push("must contain an uppercase letter".to_string());
    }
    if policy.require_digit && !normalized.chars().any(|c| c.is_ascii_digit()) {
        reasons.push("must contain a digit".to_string());
    }
    if policy.require_symbol
        && !normalized
            .chars()
            .any(|c| !c.is_ascii_alphanumeric() && !c.is_whitespace())
    {
        reasons.push("must contain a symbol".to_string());
    }
    for forbidden in &policy.forbidden_patterns {
        if lower.contains(&forbidden.to_lowercase()) {
            reasons.push(format!("contains forbidden pattern: {forbidden}"));
        }
    }

    let analysis = analyze(password);
    if analysis.score < policy.min_strength_score {
        reasons.push(format!(
            "strength score {} below required {}",
            analysis.score, policy.min_strength_score
        ));
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(PasswordError::PolicyViolation { reasons })
    }
}

// ============================================================================
// PATTERN DETECTION
// ============================================================================

/// Three or more consecutive ascending characters: "abc", "123"
fn has_sequential_run(lower: &str) -> bool {
    let chars: Vec<char> = lower.chars().collect();
    chars.windows(3).any(|w| {
        w.iter().all(|c| c.is_ascii_alphanumeric())
            && (w[1] as u32) == (w[0] as u32) + 1
            && (w[2] as u32) == (w[1] as u32) + 1
    })
}

/// The same character three times in a row: "aaa"
fn has_triple_repeat(lower: &str) -> bool {
    let chars: Vec<char> = lower.chars().collect();
    chars.windows(3).any(|w| w[0] == w[1] && w[1] == w[2])
}

/// A run of adjacent keys from one keyboard row, either direction
fn has_keyboard_walk(lower: &str) -> bool {
    for row in KEYBOARD_ROWS {
        let reversed: String = row.chars().rev().collect();
        for start in 0..=row.len().saturating_sub(WALK_LEN) {
            let forward = &row[start..start + WALK_LEN];
            let backward = &reversed[start..start + WALK_LEN];
            if lower.contains(forward) || lower.contains(backward) {
                return true;
            }
        }
    }
    false
}

fn build_suggestions(
    length: usize,
    has_lower: bool,
    has_upper: bool,
    has_digit: bool,
    has_symbol: bool,
    common_patterns: &[String],
) -> Vec<String> {
    let mut suggestions = Vec::new();
    if length < 12 {
        suggestions.push("use at least 12 characters".to_string());
    }
    if !has_lower {
        suggestions.push("add lowercase letters".to_string());
    }
    if !has_upper {
        suggestions.push("add uppercase letters".to_string());
    }
    if !has_digit {
        suggestions.push("add digits".to_string());
    }
    if !has_symbol {
        suggestions.push("add symbols".to_string());
    }
    if !common_patterns.is_empty() {
        suggestions.push("avoid common words, sequences, and keyboard patterns".to_string());
    }
    suggestions
}

// ============================================================================
// TESTS
// ============================================================================
