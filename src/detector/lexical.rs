use anyhow::Result;
use regex::Regex;
use std::collections::HashSet;
use unicode_normalization::UnicodeNormalization;

use super::{HallucinationModel, OutputFormat, RawPrediction};
use crate::schema::validation::char_slice;

const SUPPORTED_SCORE: f64 = 0.05;
const UNSUPPORTED_STOPWORD_SCORE: f64 = 0.35;
const UNSUPPORTED_SCORE: f64 = 0.95;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "in", "is",
    "it", "its", "of", "on", "or", "that", "the", "this", "to", "was", "were", "which", "with",
];

/// A piece of the answer with its character range.
#[derive(Debug, Clone, PartialEq)]
struct AnswerToken {
    text: String,
    start: usize,
    end: usize,
    score: f64,
}

/// Baseline detector: a word of the answer is supported when it occurs in any context.
///
/// Punctuation is always treated as supported. Unsupported stopwords get a low
/// score so they only extend spans when the words around them are unsupported too.
pub struct LexicalDetector {
    threshold: f64,
    word_pattern: Regex,
}

impl LexicalDetector {
    pub fn new(threshold: f64) -> Result<Self> {
        Ok(Self {
            threshold,
            word_pattern: Regex::new(r"\w+|[^\w\s]")?,
        })
    }

    fn normalize(word: &str) -> String {
        word.nfkc().collect::<String>().to_lowercase()
    }

    fn vocabulary(&self, contexts: &[String]) -> HashSet<String> {
        contexts
            .iter()
            .flat_map(|context| self.word_pattern.find_iter(context))
            .map(|m| Self::normalize(m.as_str()))
            .collect()
    }

    fn score_answer(&self, contexts: &[String], answer: &str) -> Vec<AnswerToken> {
        let vocabulary = self.vocabulary(contexts);

        let mut tokens = Vec::new();
        let mut chars_before = 0;
        let mut last_byte = 0;
        for m in self.word_pattern.find_iter(answer) {
            chars_before += answer[last_byte..m.start()].chars().count();
            let start = chars_before;
            let len = m.as_str().chars().count();
            chars_before += len;
            last_byte = m.end();

            let word = m.as_str();
            let is_punctuation = !word.chars().any(char::is_alphanumeric);
            let normalized = Self::normalize(word);
            let score = if is_punctuation || vocabulary.contains(&normalized) {
                SUPPORTED_SCORE
            } else if STOPWORDS.contains(&normalized.as_str()) {
                UNSUPPORTED_STOPWORD_SCORE
            } else {
                UNSUPPORTED_SCORE
            };

            tokens.push(AnswerToken {
                text: word.to_string(),
                start,
                end: start + len,
                score,
            });
        }
        tokens
    }

    fn merge_spans(&self, answer: &str, tokens: &[AnswerToken]) -> Vec<RawPrediction> {
        let mut spans = Vec::new();
        let mut current: Vec<&AnswerToken> = Vec::new();

        for token in tokens {
            let extends_run = token.score >= self.threshold
                || (!current.is_empty() && token.score == UNSUPPORTED_STOPWORD_SCORE);
            if extends_run {
                current.push(token);
            } else {
                flush_run(answer, &mut current, &mut spans);
            }
        }
        flush_run(answer, &mut current, &mut spans);

        spans
    }
}

fn flush_run(answer: &str, run: &mut Vec<&AnswerToken>, spans: &mut Vec<RawPrediction>) {
    // Trailing stopwords do not carry a span on their own.
    while run.last().is_some_and(|t| t.score < UNSUPPORTED_SCORE) {
        run.pop();
    }
    if let (Some(first), Some(last)) = (run.first(), run.last()) {
        let confidence = run.iter().map(|t| t.score).sum::<f64>() / run.len() as f64;
        spans.push(RawPrediction::Span {
            start: first.start,
            end: last.end,
            text: char_slice(answer, first.start, last.end)
                .unwrap_or_default()
                .to_string(),
            confidence,
        });
    }
    run.clear();
}

impl HallucinationModel for LexicalDetector {
    fn predict(
        &mut self,
        contexts: &[String],
        _question: &str,
        answer: &str,
        format: OutputFormat,
    ) -> Result<Vec<RawPrediction>> {
        let tokens = self.score_answer(contexts, answer);
        Ok(match format {
            OutputFormat::Tokens => tokens
                .into_iter()
                .map(|t| RawPrediction::Token {
                    token: t.text,
                    prob: t.score,
                })
                .collect(),
            OutputFormat::Spans => self.merge_spans(answer, &tokens),
        })
    }

    fn name(&self) -> &str {
        "lexical"
    }
}
