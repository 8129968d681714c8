//! Profanity lexicon: versioned word lists compiled to detection patterns.
//!
//! A lexicon document groups entries by category and severity. Each entry
//! (and each of its variants) compiles to a case-insensitive word-boundary
//! pattern that tolerates common obfuscations (`f*ck`, `sh!t`) and optional
//! grammatical suffixes (`'`, `in`, `in'`, `er`, `ers`, `ed`, `ing`) unless
//! the entry already ends in one. Invalid patterns are skipped with a
//! warning — one bad entry never takes down the list.

pub mod replace;

use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{OpenCueError, Result};

/// The built-in word list shipped with the crate.
const BUILTIN_WORDLIST: &str = include_str!("wordlist.json");

/// One word entry in a lexicon document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntrySpec {
    /// Shorthand: just the word.
    Word(String),
    /// Full form with display/variants/context settings.
    Full {
        word: String,
        #[serde(default)]
        display: Option<String>,
        #[serde(default)]
        variants: Vec<String>,
        #[serde(default)]
        context_required: bool,
    },
}

/// A versioned lexicon document: `categories.<name>.<severity>` → entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LexiconDoc {
    pub version: String,
    #[serde(default)]
    pub categories: BTreeMap<String, BTreeMap<String, Vec<EntrySpec>>>,
}

/// Flat lookup record for transcription matching.
#[derive(Debug, Clone)]
pub struct FlatEntry {
    /// Canonical dictionary form.
    pub canonical: String,
    /// Dotted category, e.g. `language.profanity.severe`.
    pub category: String,
}

/// Parsed lexicon with a flat word index for token lookup.
pub struct Lexicon {
    doc: LexiconDoc,
    flat: HashMap<String, FlatEntry>,
}

impl Lexicon {
    /// The built-in list. Panics only if the embedded JSON is malformed,
    /// which is a build defect.
    pub fn builtin() -> Self {
        Self::from_json(BUILTIN_WORDLIST).expect("embedded wordlist is valid")
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let doc: LexiconDoc = serde_json::from_str(raw)
            .map_err(|e| OpenCueError::LexiconCorrupt(e.to_string()))?;
        Ok(Self::from_doc(doc))
    }

    pub fn from_doc(doc: LexiconDoc) -> Self {
        let mut flat = HashMap::new();

        for (category_name, severities) in &doc.categories {
            for (severity, entries) in severities {
                let category = format!("language.{category_name}.{severity}");
                for entry in entries {
                    let (word, variants) = match entry {
                        EntrySpec::Word(w) => (w.as_str(), &[][..]),
                        EntrySpec::Full { word, variants, .. } => {
                            (word.as_str(), variants.as_slice())
                        }
                    };
                    insert_with_inflections(&mut flat, word, word, &category);
                    for v in variants {
                        // Obfuscated variants ("f*ck") never appear in
                        // transcribed tokens; skip them in the flat index.
                        if v.contains('*') || v.contains('!') {
                            continue;
                        }
                        insert_with_inflections(&mut flat, v, word, &category);
                    }
                }
            }
        }

        Self { doc, flat }
    }

    pub fn doc(&self) -> &LexiconDoc {
        &self.doc
    }

    /// Look up a cleaned (lowercase alphanumeric) token.
    pub fn lookup_word(&self, token: &str) -> Option<&FlatEntry> {
        self.flat.get(token)
    }
}

/// Index `form` plus its generated inflections under `canonical`.
fn insert_with_inflections(
    flat: &mut HashMap<String, FlatEntry>,
    form: &str,
    canonical: &str,
    category: &str,
) {
    let mut add = |token: String| {
        flat.entry(token).or_insert_with(|| FlatEntry {
            canonical: canonical.to_string(),
            category: category.to_string(),
        });
    };

    let form = form.to_lowercase();
    add(form.clone());
    if form.ends_with('s') || form.ends_with('x') || form.ends_with("ch") || form.ends_with("sh") {
        add(format!("{form}es"));
    } else {
        add(format!("{form}s"));
    }

    if !ends_with_suffix(&form) {
        for suffix in ["ing", "in", "ed", "er", "ers"] {
            add(format!("{form}{suffix}"));
        }
        // Single trailing consonant doubles before -ing/-ed (shit → shitting).
        if let Some(last) = form.chars().last() {
            if !"aeiou".contains(last) && last.is_alphabetic() {
                add(format!("{form}{last}ing"));
                add(format!("{form}{last}in"));
                add(format!("{form}{last}ed"));
            }
        }
    }
}

fn ends_with_suffix(word: &str) -> bool {
    ["ing", "in", "er", "ers", "ed"]
        .iter()
        .any(|s| word.ends_with(s))
}

/// A single detection inside one subtitle text.
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    /// Canonical dictionary form.
    pub word: String,
    /// The surface text that actually matched.
    pub matched: String,
    /// Obfuscated display form (`f**k`).
    pub display: String,
    /// Deterministic syllable-matched replacement, case-mirrored.
    pub replacement: String,
    pub category: String,
    pub severity: String,
    pub confidence: f32,
    /// Fractional span within the subtitle text (0..1, char-based).
    pub position_start: f64,
    pub position_end: f64,
    /// Absolute character offsets.
    pub char_start: usize,
    pub char_end: usize,
    /// Whether this entry defers to the contextual advisor.
    pub context_required: bool,
}

struct CompiledEntry {
    pattern: Regex,
    word: String,
    display: String,
    category: String,
    severity: String,
    context_required: bool,
}

/// Regex-based detector compiled from a lexicon.
pub struct Detector {
    entries: Vec<CompiledEntry>,
}

impl Detector {
    pub fn from_lexicon(lexicon: &Lexicon) -> Self {
        let mut entries = Vec::new();

        for (category_name, severities) in &lexicon.doc().categories {
            for (severity, specs) in severities {
                for spec in specs {
                    let (word, display, variants, context_required) = match spec {
                        EntrySpec::Word(w) => (w.clone(), default_display(w), vec![], false),
                        EntrySpec::Full {
                            word,
                            display,
                            variants,
                            context_required,
                        } => (
                            word.clone(),
                            display.clone().unwrap_or_else(|| default_display(word)),
                            variants.clone(),
                            *context_required,
                        ),
                    };

                    let mut forms = vec![word.clone()];
                    forms.extend(variants);
                    for form in forms {
                        if form.is_empty() {
                            continue;
                        }
                        match compile_pattern(&form) {
                            Ok(pattern) => entries.push(CompiledEntry {
                                pattern,
                                word: word.clone(),
                                display: display.clone(),
                                category: format!("language.{category_name}.{severity}"),
                                severity: severity.clone(),
                                context_required,
                            }),
                            Err(e) => {
                                warn!(form = form.as_str(), "skipping invalid pattern: {e}");
                            }
                        }
                    }
                }
            }
        }

        debug!(patterns = entries.len(), "lexicon patterns compiled");
        Self { entries }
    }

    /// Detect lexicon hits in `text`.
    ///
    /// Duplicate surface forms within one call are suppressed after the
    /// first; results are ordered by position in the text.
    pub fn detect(&self, text: &str) -> Vec<Detection> {
        if text.is_empty() {
            return Vec::new();
        }

        let char_len = text.chars().count();
        let mut seen: Vec<String> = Vec::new();
        let mut detections = Vec::new();

        for entry in &self.entries {
            for m in entry.pattern.find_iter(text) {
                let matched = m.as_str().to_string();
                let key = matched.to_lowercase();
                if seen.contains(&key) {
                    continue;
                }

                if entry.context_required && !is_exclamation_context(text, &matched) {
                    continue;
                }

                seen.push(key);

                let char_start = text[..m.start()].chars().count();
                let char_end = char_start + matched.chars().count();
                let confidence = if entry.context_required { 0.75 } else { 0.95 };

                detections.push(Detection {
                    word: entry.word.clone(),
                    replacement: replace::replacement_mirroring_case(&matched),
                    display: entry.display.clone(),
                    category: entry.category.clone(),
                    severity: entry.severity.clone(),
                    confidence,
                    position_start: char_start as f64 / char_len as f64,
                    position_end: char_end as f64 / char_len as f64,
                    char_start,
                    char_end,
                    context_required: entry.context_required,
                    matched,
                });
            }
        }

        detections.sort_by_key(|d| d.char_start);
        detections
    }
}

/// Build the detection pattern for one word form.
///
/// `*` inside a form stands for one obfuscation character. Forms already
/// ending in a grammatical suffix only get the optional apostrophe.
fn compile_pattern(form: &str) -> std::result::Result<Regex, regex::Error> {
    let escaped = regex::escape(form).replace(r"\*", "[*@#$!]?");

    let pattern = if ends_with_suffix(&form.to_lowercase()) {
        format!(r"(?i)\b{escaped}'?\b")
    } else {
        format!(r"(?i)\b{escaped}(?:'|in'?|er|ers|ed|ing)?\b")
    };

    Regex::new(&pattern)
}

/// Exclamation heuristic for context-sensitive entries: the word used as an
/// interjection (`oh hell!`, `hell dammit`) rather than literally.
fn is_exclamation_context(text: &str, matched: &str) -> bool {
    let escaped = regex::escape(matched);
    let patterns = [
        format!(r"(?i)\b(oh\s+)?{escaped}[!]?\b"),
        format!(r"(?i)\b{escaped}\s+(damn|dammit)\b"),
    ];
    patterns
        .iter()
        .any(|p| Regex::new(p).map(|re| re.is_match(text)).unwrap_or(false))
}

fn default_display(word: &str) -> String {
    let chars: Vec<char> = word.chars().collect();
    if chars.len() <= 2 {
        return word.to_string();
    }
    let mut out = String::new();
    out.push(chars[0]);
    out.push(chars[1]);
    out.extend(std::iter::repeat('*').take(chars.len() - 2));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> Detector {
        Detector::from_lexicon(&Lexicon::builtin())
    }

    #[test]
    fn empty_text_detects_nothing() {
        assert!(detector().detect("").is_empty());
    }

    #[test]
    fn clean_text_detects_nothing() {
        assert!(detector()
            .detect("What a lovely day for a picnic")
            .is_empty());
    }

    #[test]
    fn detects_severe_profanity_with_positions() {
        let text = "What the fuck is going on?";
        let detections = detector().detect(text);
        assert_eq!(detections.len(), 1);

        let d = &detections[0];
        assert_eq!(d.word, "fuck");
        assert_eq!(d.matched, "fuck");
        assert_eq!(d.category, "language.profanity.severe");
        assert_eq!(d.severity, "severe");
        assert!((d.confidence - 0.95).abs() < 1e-6);
        assert_eq!(d.char_start, 9);
        assert_eq!(d.char_end, 13);
        assert!((d.position_start - 9.0 / 26.0).abs() < 1e-9);
        assert!((d.position_end - 13.0 / 26.0).abs() < 1e-9);
        assert!(["fudge", "flip", "frick", "frig"].contains(&d.replacement.as_str()));
    }

    #[test]
    fn detects_obfuscated_forms() {
        let detections = detector().detect("you piece of sh!t");
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].word, "shit");
        assert_eq!(detections[0].matched, "sh!t");
    }

    #[test]
    fn detects_suffixed_forms() {
        let detections = detector().detect("stop fuckin' around");
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].word, "fuck");
        assert!(detections[0].matched.starts_with("fuckin"));
    }

    #[test]
    fn duplicate_surface_forms_are_suppressed() {
        let detections = detector().detect("shit shit shit");
        assert_eq!(detections.len(), 1);
    }

    #[test]
    fn distinct_inflections_both_detected() {
        let detections = detector().detect("that fucker can fuck right off");
        let matched: Vec<&str> = detections.iter().map(|d| d.matched.as_str()).collect();
        assert!(matched.contains(&"fucker"));
        assert!(matched.contains(&"fuck"));
    }

    #[test]
    fn detections_are_position_ordered() {
        let detections = detector().detect("damn it, that shit again");
        assert!(detections.len() >= 2);
        assert!(detections
            .windows(2)
            .all(|w| w[0].char_start <= w[1].char_start));
    }

    #[test]
    fn context_required_entries_carry_reduced_confidence() {
        let detections = detector().detect("oh hell!");
        let hell = detections.iter().find(|d| d.word == "hell").unwrap();
        assert!(hell.context_required);
        assert!((hell.confidence - 0.75).abs() < 1e-6);
    }

    #[test]
    fn flat_lookup_finds_canonical_and_inflections() {
        let lexicon = Lexicon::builtin();
        assert_eq!(lexicon.lookup_word("fuck").unwrap().canonical, "fuck");
        assert_eq!(lexicon.lookup_word("fucking").unwrap().canonical, "fuck");
        assert_eq!(lexicon.lookup_word("shitting").unwrap().canonical, "shit");
        assert_eq!(
            lexicon.lookup_word("bullshit").unwrap().canonical,
            "shit"
        );
        assert!(lexicon.lookup_word("sunshine").is_none());
    }

    #[test]
    fn invalid_patterns_are_skipped_not_fatal() {
        let doc: LexiconDoc = serde_json::from_str(
            r#"{
                "version": "1.0",
                "categories": {
                    "profanity": {
                        "strong": [
                            {"word": "shit"},
                            {"word": "broken(", "variants": []}
                        ]
                    }
                }
            }"#,
        )
        .unwrap();
        let lexicon = Lexicon::from_doc(doc);
        let detector = Detector::from_lexicon(&lexicon);
        // The valid entry still works.
        assert_eq!(detector.detect("what a shit day").len(), 1);
    }
}
