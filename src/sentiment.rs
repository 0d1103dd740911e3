//! # Sentiment Analyzer
//! Lexicon-based polarity/subjectivity scoring over normalized text.
//!
//! The lexicon is parsed once per process from the embedded
//! `sentiment_lexicon.json` and only ever read afterwards. Scoring failures
//! (unsupported language, model unavailable) never escape [`SentimentAnalyzer`];
//! they become [`Analysis::Unscored`].

use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::error::AnalysisError;
use crate::model::SentimentScore;
use crate::normalize::NormalizedText;

static LEXICON: Lazy<Lexicon> = Lazy::new(|| {
    let raw = include_str!("../sentiment_lexicon.json");
    Lexicon::from_json(raw).expect("valid sentiment lexicon")
});

/// Languages the bundled lexicon can score.
const SUPPORTED_LANGUAGES: &[&str] = &["en"];

#[derive(Debug, Deserialize)]
struct LexiconFile {
    words: HashMap<String, (f64, f64)>,
    intensifiers: HashMap<String, f64>,
    negators: Vec<String>,
    stopwords: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy)]
struct WordScore {
    polarity: f64,
    subjectivity: f64,
}

/// Word scores, intensifiers, negators and per-language stopwords.
#[derive(Debug)]
pub struct Lexicon {
    words: HashMap<String, WordScore>,
    intensifiers: HashMap<String, f64>,
    negators: HashSet<String>,
    // BTreeMap: language guesses must not depend on hash order.
    stopwords: BTreeMap<String, HashSet<String>>,
}

impl Lexicon {
    /// The process-wide lexicon. Call once at startup to pay the parse cost early.
    pub fn global() -> &'static Lexicon {
        &LEXICON
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let f: LexiconFile = serde_json::from_str(raw)?;
        Ok(Self {
            words: f
                .words
                .into_iter()
                .map(|(w, (polarity, subjectivity))| {
                    (
                        w,
                        WordScore {
                            polarity,
                            subjectivity,
                        },
                    )
                })
                .collect(),
            intensifiers: f.intensifiers,
            negators: f.negators.into_iter().collect(),
            stopwords: f
                .stopwords
                .into_iter()
                .map(|(lang, ws)| (lang, ws.into_iter().collect()))
                .collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// True when `tok` is a stopword in any bundled language.
    pub fn is_stopword(&self, tok: &str) -> bool {
        self.stopwords.values().any(|ws| ws.contains(tok))
    }

    fn is_negator(&self, tok: &str) -> bool {
        self.negators.contains(tok)
    }

    /// Best-effort language guess from stopword hits. `None` means "no evidence".
    fn guess_language(&self, tokens: &[&str]) -> Option<&str> {
        let mut best: Option<(&str, usize)> = None;
        for (lang, words) in &self.stopwords {
            let hits = tokens.iter().filter(|t| words.contains(**t)).count();
            if hits > 0 && best.map_or(true, |(_, b)| hits > b) {
                best = Some((lang.as_str(), hits));
            }
        }
        best.map(|(l, _)| l)
    }
}

/// Unclamped model output. The analyzer clamps it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawScores {
    pub polarity: f64,
    pub subjectivity: f64,
}

/// A scoring backend. Implementations may return out-of-range values.
pub trait SentimentModel: Send + Sync {
    fn name(&self) -> &'static str;

    fn score(
        &self,
        text: &NormalizedText,
        language_hint: Option<&str>,
    ) -> Result<RawScores, AnalysisError>;
}

/// Default model over the global [`Lexicon`].
///
/// Per matched word: an intensifier right before it scales both values, a
/// negator within the three previous tokens flips and halves polarity. The
/// result is the mean over matched words; no matches score neutral.
#[derive(Debug, Clone, Copy)]
pub struct LexiconModel {
    lexicon: &'static Lexicon,
}

impl LexiconModel {
    pub fn new() -> Self {
        Self {
            lexicon: Lexicon::global(),
        }
    }

    fn check_language(&self, tokens: &[&str], hint: Option<&str>) -> Result<(), AnalysisError> {
        if let Some(h) = hint {
            let primary = h.split(['-', '_']).next().unwrap_or(h).to_ascii_lowercase();
            if primary != "und" && !SUPPORTED_LANGUAGES.contains(&primary.as_str()) {
                return Err(AnalysisError::UnsupportedLanguage(primary));
            }
        }

        let (mut letters, mut latin) = (0usize, 0usize);
        for c in tokens.iter().flat_map(|t| t.chars()).filter(|c| c.is_alphabetic()) {
            letters += 1;
            if is_latin(c) {
                latin += 1;
            }
        }
        if letters > 0 && latin * 2 < letters {
            return Err(AnalysisError::UnsupportedLanguage("non-latin script".into()));
        }

        match self.lexicon.guess_language(tokens) {
            Some(lang) if !SUPPORTED_LANGUAGES.contains(&lang) => {
                let other = self.lexicon.stopwords.get(lang).map_or(0, |ws| {
                    tokens.iter().filter(|t| ws.contains(**t)).count()
                });
                // A single stray stopword is not evidence.
                if other >= 2 {
                    return Err(AnalysisError::UnsupportedLanguage(lang.to_string()));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl Default for LexiconModel {
    fn default() -> Self {
        Self::new()
    }
}

impl SentimentModel for LexiconModel {
    fn name(&self) -> &'static str {
        "lexicon"
    }

    fn score(
        &self,
        text: &NormalizedText,
        language_hint: Option<&str>,
    ) -> Result<RawScores, AnalysisError> {
        let tokens: Vec<&str> = text.tokens().collect();
        self.check_language(&tokens, language_hint)?;

        let lex = self.lexicon;
        let (mut sum_p, mut sum_s, mut n) = (0.0f64, 0.0f64, 0usize);
        for (i, tok) in tokens.iter().enumerate() {
            let Some(ws) = lex.words.get(*tok) else {
                continue;
            };
            let (mut p, mut s) = (ws.polarity, ws.subjectivity);

            if let Some(m) = i.checked_sub(1).and_then(|j| lex.intensifiers.get(tokens[j])) {
                p *= m;
                s *= m;
            }

            let negated = (1..=3).any(|k| i >= k && lex.is_negator(tokens[i - k]));
            if negated {
                p *= -0.5;
            }

            sum_p += p;
            sum_s += s;
            n += 1;
        }

        if n == 0 {
            return Ok(RawScores {
                polarity: 0.0,
                subjectivity: 0.0,
            });
        }
        Ok(RawScores {
            polarity: sum_p / n as f64,
            subjectivity: sum_s / n as f64,
        })
    }
}

fn is_latin(c: char) -> bool {
    c.is_ascii_alphabetic()
        || matches!(c as u32, 0x00C0..=0x024F | 0x1E00..=0x1EFF)
}

/// Why a post ended up without sentiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnscoredReason {
    Empty,
    UnsupportedLanguage(String),
    ModelUnavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Analysis {
    Scored(SentimentScore),
    Unscored(UnscoredReason),
}

impl Analysis {
    pub fn score(&self) -> Option<SentimentScore> {
        match self {
            Self::Scored(s) => Some(*s),
            Self::Unscored(_) => None,
        }
    }
}

/// Cheap to clone; shares the model.
#[derive(Clone)]
pub struct SentimentAnalyzer {
    model: Arc<dyn SentimentModel>,
}

impl Default for SentimentAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl SentimentAnalyzer {
    pub fn new() -> Self {
        Self::with_model(Arc::new(LexiconModel::new()))
    }

    pub fn with_model(model: Arc<dyn SentimentModel>) -> Self {
        Self { model }
    }

    pub fn model_name(&self) -> &'static str {
        self.model.name()
    }

    /// Score `text`. Never fails; out-of-range model output is clamped.
    pub fn analyze(&self, text: &NormalizedText, language_hint: Option<&str>) -> Analysis {
        if text.is_empty() {
            return Analysis::Unscored(UnscoredReason::Empty);
        }
        match self.model.score(text, language_hint) {
            Ok(raw) if raw.polarity.is_finite() && raw.subjectivity.is_finite() => {
                Analysis::Scored(SentimentScore::new(raw.polarity, raw.subjectivity))
            }
            Ok(raw) => {
                tracing::debug!(model = self.model.name(), ?raw, "non-finite sentiment score");
                Analysis::Unscored(UnscoredReason::ModelUnavailable("non-finite score".into()))
            }
            Err(AnalysisError::UnsupportedLanguage(lang)) => {
                Analysis::Unscored(UnscoredReason::UnsupportedLanguage(lang))
            }
            Err(AnalysisError::Unavailable(msg)) => {
                tracing::debug!(model = self.model.name(), error = %msg, "sentiment model unavailable");
                Analysis::Unscored(UnscoredReason::ModelUnavailable(msg))
            }
        }
    }
}
