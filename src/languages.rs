/// Languages the chat can be switched to, as `(code, display name)`.
pub const SUPPORTED_LANGUAGES: &[(&str, &str)] = &[
    ("en", "English"),
    ("zh", "Chinese"),
    ("th", "Thai"),
    ("vi", "Vietnamese"),
    ("ja", "Japanese"),
    ("ko", "Korean"),
    ("hu", "Hungarian"),
    ("ru", "Russian"),
    ("tl", "Tagalog"),
];

pub const DEFAULT_CUSTOMER_LANGUAGE: &str = "zh";
pub const DEFAULT_AGENT_LANGUAGE: &str = "en";

/// Display name used in prompts. Unknown codes are passed through as-is.
pub fn language_name(code: &str) -> &str {
    SUPPORTED_LANGUAGES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
        .unwrap_or(code)
}

pub fn is_supported(code: &str) -> bool {
    SUPPORTED_LANGUAGES.iter().any(|(c, _)| *c == code)
}
