use std::fmt;

use once_cell::sync::Lazy;
use regex::RegexSet;

pub const MAX_TONE_LENGTH: usize = 100;
pub const MAX_SPECIAL_CHAR_RATIO: f64 = 0.2;

static INJECTION_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)ignore\s+(all\s+)?previous",
        r"(?i)ignore\s+(all\s+)?instructions",
        r"(?i)disregard\s+(all\s+)?previous",
        r"(?i)instead[\s,]+output",
        r"(?i)return\s+only",
        r"(?i)override",
        r"(?i)bypass",
        r"(?i)jailbreak",
        r"```",
        r"(?i)</?[a-z]+>",
        r"\[\[",
        r"\]\]",
        r"\$\{",
        r"\{\{",
        r"\}\}",
    ])
    .expect("injection patterns")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToneRejection {
    Empty,
    TooLong,
    Injection,
    SpecialChars,
}

impl fmt::Display for ToneRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToneRejection::Empty => write!(f, "Tone cannot be empty"),
            ToneRejection::TooLong => {
                write!(f, "Tone must be {} characters or less", MAX_TONE_LENGTH)
            }
            ToneRejection::Injection => write!(f, "Invalid tone: contains restricted patterns"),
            ToneRejection::SpecialChars => write!(f, "Too many special characters"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToneValidation {
    pub is_valid: bool,
    pub error: Option<ToneRejection>,
}

impl ToneValidation {
    fn valid() -> Self {
        Self {
            is_valid: true,
            error: None,
        }
    }

    fn rejected(reason: ToneRejection) -> Self {
        Self {
            is_valid: false,
            error: Some(reason),
        }
    }
}

fn has_injection_pattern(text: &str) -> bool {
    INJECTION_PATTERNS.is_match(text)
}

/// Length in UTF-16 code units, the unit the chat client counts in.
fn utf16_len(text: &str) -> usize {
    text.encode_utf16().count()
}

/// Only ASCII letters and digits count as ordinary, so non-Latin scripts are
/// treated as special characters.
fn has_excessive_special_characters(text: &str) -> bool {
    let total = utf16_len(text);
    if total == 0 {
        return false;
    }
    let special: usize = text
        .chars()
        .filter(|c| !c.is_ascii_alphanumeric() && !c.is_whitespace())
        .map(char::len_utf16)
        .sum();
    special as f64 / total as f64 > MAX_SPECIAL_CHAR_RATIO
}

/// Checks free-text tone input before it is interpolated into a prompt.
pub fn validate_tone(tone: &str) -> ToneValidation {
    if tone.trim().is_empty() {
        return ToneValidation::rejected(ToneRejection::Empty);
    }
    if utf16_len(tone) > MAX_TONE_LENGTH {
        return ToneValidation::rejected(ToneRejection::TooLong);
    }
    if has_injection_pattern(tone) {
        return ToneValidation::rejected(ToneRejection::Injection);
    }
    if has_excessive_special_characters(tone) {
        return ToneValidation::rejected(ToneRejection::SpecialChars);
    }
    ToneValidation::valid()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tone {
    Happy,
    Formal,
    Casual,
    Angry,
    Playful,
    Sad,
    Custom(String),
}

impl Tone {
    pub const PRESETS: [Tone; 6] = [
        Tone::Happy,
        Tone::Formal,
        Tone::Casual,
        Tone::Angry,
        Tone::Playful,
        Tone::Sad,
    ];

    pub fn parse(s: &str) -> Tone {
        match s.trim().to_ascii_lowercase().as_str() {
            "happy" => Tone::Happy,
            "formal" => Tone::Formal,
            "casual" => Tone::Casual,
            "angry" => Tone::Angry,
            "playful" => Tone::Playful,
            "sad" => Tone::Sad,
            _ => Tone::Custom(s.to_string()),
        }
    }

    /// The register sent to the model, `None` when a custom tone is blank.
    pub fn effective(&self) -> Option<&str> {
        match self {
            Tone::Happy => Some("happy"),
            Tone::Formal => Some("formal"),
            Tone::Casual => Some("casual"),
            Tone::Angry => Some("angry"),
            Tone::Playful => Some("playful"),
            Tone::Sad => Some("sad"),
            Tone::Custom(text) => {
                let trimmed = text.trim();
                (!trimmed.is_empty()).then_some(trimmed)
            }
        }
    }

    /// Presets and a blank custom tone are always accepted.
    pub fn validate(&self) -> ToneValidation {
        match self {
            Tone::Custom(text) if !text.trim().is_empty() => validate_tone(text),
            _ => ToneValidation::valid(),
        }
    }
}

impl fmt::Display for Tone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.effective().unwrap_or("custom"))
    }
}
