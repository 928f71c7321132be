//! Locale detection
//!
//! Decides from user turns whether the answer must be in a specific
//! language. The default profile targets French.

use regex::Regex;

/// Detects whether a user turn asks for a given locale
pub trait LocaleDetector: Send + Sync {
    /// Short locale tag, e.g. `fr`
    fn locale(&self) -> &str;

    /// Whether `text` signals this locale.
    fn detect(&self, text: &str) -> bool;

    /// Lowercase marker; a system turn containing it already directs the locale.
    fn marker(&self) -> &str;

    /// System turn content injected on detection.
    fn directive(&self) -> &str;
}

/// Word lists and directive for one locale
#[derive(Debug, Clone, PartialEq)]
pub struct LocaleProfile {
    pub locale: String,
    pub marker: String,
    /// Explicit requests for the locale, matched as lowercase substrings
    pub request_phrases: Vec<String>,
    /// Characters specific to the locale
    pub characters: Vec<char>,
    /// Question words, matched as whole words
    pub question_words: Vec<String>,
    pub directive: String,
}

impl LocaleProfile {
    pub fn french() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            locale: "fr".to_string(),
            marker: "français".to_string(),
            request_phrases: owned(&[
                "en français",
                "répondez en français",
                "réponse française",
                "répondez uniquement en français",
                "expliquez en français",
            ]),
            characters: vec!['é', 'è', 'ê', 'à', 'ç', 'ù', 'ô', 'î', 'â', 'û', 'ë', 'ï'],
            question_words: owned(&[
                "qu'est-ce",
                "qu'est",
                "expliquez",
                "comment",
                "pourquoi",
                "combien",
                "quel",
                "quelle",
                "quels",
                "quelles",
                "où",
                "quand",
                "définissez",
            ]),
            directive: "Vous êtes un assistant financier expert. Répondez TOUJOURS en français, \
                        y compris dans votre raisonnement. Toutes vos réponses doivent être \
                        entièrement en français."
                .to_string(),
        }
    }
}

/// Detector driven by a [`LocaleProfile`]
///
/// Signals are checked in order: request phrases, locale characters, then
/// question words bounded as whole words.
pub struct LexicalLocaleDetector {
    profile: LocaleProfile,
    question_pattern: Option<Regex>,
}

impl LexicalLocaleDetector {
    pub fn new(profile: LocaleProfile) -> Result<Self, regex::Error> {
        let question_pattern = if profile.question_words.is_empty() {
            None
        } else {
            let alternatives = profile
                .question_words
                .iter()
                .map(|w| regex::escape(&w.to_lowercase()))
                .collect::<Vec<_>>()
                .join("|");
            Some(Regex::new(&format!(r"\b(?:{})\b", alternatives))?)
        };
        Ok(Self {
            profile,
            question_pattern,
        })
    }

    pub fn french() -> Result<Self, regex::Error> {
        Self::new(LocaleProfile::french())
    }
}

impl LocaleDetector for LexicalLocaleDetector {
    fn locale(&self) -> &str {
        &self.profile.locale
    }

    fn detect(&self, text: &str) -> bool {
        // Typographic apostrophes are common in pasted text
        let lower = text.to_lowercase().replace('\u{2019}', "'");

        if self
            .profile
            .request_phrases
            .iter()
            .any(|phrase| lower.contains(phrase.as_str()))
        {
            return true;
        }
        if lower.chars().any(|c| self.profile.characters.contains(&c)) {
            return true;
        }
        self.question_pattern
            .as_ref()
            .map(|pattern| pattern.is_match(&lower))
            .unwrap_or(false)
    }

    fn marker(&self) -> &str {
        &self.profile.marker
    }

    fn directive(&self) -> &str {
        &self.profile.directive
    }
}

/// Detector that never fires
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLocaleDetector;

impl LocaleDetector for NoLocaleDetector {
    fn locale(&self) -> &str {
        ""
    }

    fn detect(&self, _text: &str) -> bool {
        false
    }

    fn marker(&self) -> &str {
        ""
    }

    fn directive(&self) -> &str {
        ""
    }
}
