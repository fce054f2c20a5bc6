//! Raw trend string to canonical keyword plus ordered query expansions.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MIN_LENGTH: usize = 3;

/// News and sensitive-topic terms with no useful catalog matches.
pub const DEFAULT_DENYLIST: &[&str] = &[
    "election", "vote", "war", "attack", "shooting", "killed", "death", "died", "murder", "trial",
    "arrest", "lawsuit", "scandal", "news", "weather", "earthquake", "flood", "lottery", "vs",
    "results", "protest", "strike",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynonymRule {
    pub term: String,
    pub substitutes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizerConfig {
    pub min_length: usize,
    pub denylist: Vec<String>,
    /// Applied in order; expansion order follows rule order.
    pub synonyms: Vec<SynonymRule>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        let rule = |term: &str, substitutes: &[&str]| SynonymRule {
            term: term.to_string(),
            substitutes: substitutes.iter().map(|s| s.to_string()).collect(),
        };
        Self {
            min_length: DEFAULT_MIN_LENGTH,
            denylist: DEFAULT_DENYLIST.iter().map(|t| t.to_string()).collect(),
            synonyms: vec![
                rule("fidget", &["sensory"]),
                rule("figurine", &["figure", "statue"]),
                rule("keychain", &["keyring", "key chain"]),
                rule("mini", &["miniature"]),
                rule("organizer", &["organiser", "holder"]),
                rule("planter", &["plant pot"]),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedKeyword {
    pub source: String,
    pub normalized: String,
    pub expansions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct KeywordNormalizer {
    min_length: usize,
    denylist: Vec<String>,
    synonyms: Vec<SynonymRule>,
}

impl KeywordNormalizer {
    pub fn new(config: &NormalizerConfig) -> Self {
        let canonical_list = |items: &[String]| {
            items
                .iter()
                .map(|s| canonicalize(s))
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        };
        Self {
            min_length: config.min_length,
            denylist: canonical_list(&config.denylist),
            synonyms: config
                .synonyms
                .iter()
                .map(|rule| SynonymRule {
                    term: canonicalize(&rule.term),
                    substitutes: canonical_list(&rule.substitutes),
                })
                .filter(|rule| !rule.term.is_empty())
                .collect(),
        }
    }

    /// `None` when the trend is too short or hits the denylist.
    pub fn normalize(&self, raw: &str) -> Option<NormalizedKeyword> {
        let normalized = canonicalize(raw);
        if normalized.chars().count() < self.min_length.max(1) {
            return None;
        }
        if self.is_denied(&normalized) {
            return None;
        }
        let expansions = self.expansions(&normalized);
        Some(NormalizedKeyword {
            source: raw.trim().to_string(),
            normalized,
            expansions,
        })
    }

    fn is_denied(&self, normalized: &str) -> bool {
        self.denylist
            .iter()
            .any(|term| contains_phrase(normalized, term))
    }

    fn expansions(&self, normalized: &str) -> Vec<String> {
        let mut seen = HashSet::from([normalized.to_string()]);
        let mut out = Vec::new();
        let mut push = |candidate: String| {
            if !candidate.is_empty() && seen.insert(candidate.clone()) {
                out.push(candidate);
            }
        };

        if let Some(variant) = toggle_last_word_plural(normalized) {
            push(variant);
        }
        for rule in &self.synonyms {
            if !contains_phrase(normalized, &rule.term) {
                continue;
            }
            for substitute in &rule.substitutes {
                push(replace_phrase(normalized, &rule.term, substitute));
            }
        }
        out
    }
}

/// Trim, lowercase and collapse internal whitespace.
pub fn canonicalize(raw: &str) -> String {
    raw.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    format!(" {haystack} ").contains(&format!(" {phrase} "))
}

fn replace_phrase(haystack: &str, phrase: &str, substitute: &str) -> String {
    format!(" {haystack} ")
        .replacen(&format!(" {phrase} "), &format!(" {substitute} "), 1)
        .trim()
        .to_string()
}

fn toggle_last_word_plural(normalized: &str) -> Option<String> {
    let (head, last) = match normalized.rsplit_once(' ') {
        Some((head, last)) => (Some(head), last),
        None => (None, normalized),
    };
    let toggled = toggle_plural(last)?;
    Some(match head {
        Some(head) => format!("{head} {toggled}"),
        None => toggled,
    })
}

fn toggle_plural(word: &str) -> Option<String> {
    if word.chars().count() < 3 || !word.chars().all(char::is_alphabetic) {
        return None;
    }
    if let Some(stem) = word.strip_suffix("ies") {
        return Some(format!("{stem}y"));
    }
    for suffix in ["sses", "xes", "zes", "ches", "shes"] {
        if word.ends_with(suffix) {
            return Some(word[..word.len() - 2].to_string());
        }
    }
    if word.ends_with("ss") {
        return Some(format!("{word}es"));
    }
    if let Some(stem) = word.strip_suffix('s') {
        return Some(stem.to_string());
    }
    if let Some(stem) = word.strip_suffix('y') {
        if !stem.ends_with(|c: char| "aeiou".contains(c)) {
            return Some(format!("{stem}ies"));
        }
    }
    if ["x", "z", "ch", "sh"].iter().any(|s| word.ends_with(*s)) {
        return Some(format!("{word}es"));
    }
    Some(format!("{word}s"))
}
