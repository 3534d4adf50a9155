//! Assistant personas and response languages
//!
//! Both are closed enums so that lookup tables keyed by them (fallback
//! replies, voice selection) can be checked for completeness in tests.

use serde::{Deserialize, Serialize};

/// Personality the assistant speaks with
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persona {
    /// Plain, neutral assistant
    #[default]
    Neutral,
    /// Warm and chatty
    Friendly,
    /// Formal, deferential
    Butler,
    /// Terse, mechanical
    Robot,
}

impl Persona {
    /// All personas, in declaration order
    pub const ALL: [Persona; 4] = [
        Persona::Neutral,
        Persona::Friendly,
        Persona::Butler,
        Persona::Robot,
    ];
}

impl std::fmt::Display for Persona {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Persona::Neutral => write!(f, "neutral"),
            Persona::Friendly => write!(f, "friendly"),
            Persona::Butler => write!(f, "butler"),
            Persona::Robot => write!(f, "robot"),
        }
    }
}

/// Language used for generated replies and voice selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    English,
    Spanish,
    French,
    German,
}

impl Language {
    /// All supported languages
    pub const ALL: [Language; 4] = [
        Language::English,
        Language::Spanish,
        Language::French,
        Language::German,
    ];

    /// ISO 639-1 code
    pub fn code(&self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Spanish => "es",
            Language::French => "fr",
            Language::German => "de",
        }
    }

    /// Parse a BCP-47 style tag such as `en-US` or `de`
    ///
    /// Unknown tags yield `None`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let primary = tag
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        Language::ALL.into_iter().find(|l| l.code() == primary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_from_tag() {
        assert_eq!(Language::from_tag("en-US"), Some(Language::English));
        assert_eq!(Language::from_tag("es_MX"), Some(Language::Spanish));
        assert_eq!(Language::from_tag("DE"), Some(Language::German));
        assert_eq!(Language::from_tag("ja-JP"), None);
        assert_eq!(Language::from_tag(""), None);
    }

    #[test]
    fn test_persona_serde_names() {
        let json = serde_json::to_string(&Persona::Butler).unwrap();
        assert_eq!(json, "\"butler\"");
        let parsed: Persona = serde_json::from_str("\"robot\"").unwrap();
        assert_eq!(parsed, Persona::Robot);
    }
}
