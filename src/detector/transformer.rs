use anyhow::{anyhow, Context, Result};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use tokenizers::{Encoding, Tokenizer, TruncationParams, TruncationStrategy};
use tracing::debug;

use super::models::find_model_file;
use super::{DetectorOptions, HallucinationModel, OutputFormat, RawPrediction};
use crate::config::defaults::TOKENIZER_FILENAME;
use crate::schema::validation::char_slice;

const LOGITS_OUTPUT: &str = "logits";
const HALLUCINATED_LABEL: usize = 1;

/// An answer token with its character range and hallucination probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredToken {
    pub start: usize,
    pub end: usize,
    pub prob: f64,
}

/// ONNX token classifier in the LettuceDetect layout.
///
/// The prompt (question plus passages) and the answer are encoded as a sequence pair;
/// each answer token is classified as supported or hallucinated.
pub struct TransformerDetector {
    session: Session,
    tokenizer: Tokenizer,
    threshold: f64,
}

impl TransformerDetector {
    pub fn load(model_dir: &Path, options: &DetectorOptions) -> Result<Self> {
        let model_path = find_model_file(model_dir)
            .ok_or_else(|| anyhow!("No ONNX model found in {}", model_dir.display()))?;
        let tokenizer_path = model_dir.join(TOKENIZER_FILENAME);
        if !tokenizer_path.is_file() {
            return Err(anyhow!("Tokenizer file missing: {}", tokenizer_path.display()));
        }

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            anyhow!("Failed to load tokenizer {}: {}", tokenizer_path.display(), e)
        })?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: options.max_length,
                strategy: TruncationStrategy::OnlyFirst,
                ..Default::default()
            }))
            .map_err(|e| anyhow!("Invalid truncation settings: {}", e))?;
        tokenizer.with_padding(None);

        debug!("Loading ONNX model from: {}", model_path.display());
        let threads = options.intra_threads.unwrap_or_else(num_cpus::get);
        let session = Session::builder()
            .map_err(|e| anyhow!("Failed to create ONNX session builder: {}", e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| anyhow!("Failed to set optimization level: {}", e))?
            .with_intra_threads(threads)
            .map_err(|e| anyhow!("Failed to set intra-op threads: {}", e))?
            .commit_from_file(&model_path)
            .map_err(|e| anyhow!("{}", e))
            .with_context(|| format!("Failed to create ONNX session from {}", model_path.display()))?;

        Ok(Self {
            session,
            tokenizer,
            threshold: options.threshold,
        })
    }

    fn score_tokens(&mut self, contexts: &[String], question: &str, answer: &str) -> Result<Vec<ScoredToken>> {
        let prompt = build_prompt(contexts, question);
        let encoding = self
            .tokenizer
            .encode_char_offsets((prompt.as_str(), answer), true)
            .map_err(|e| anyhow!("Tokenization failed: {}", e))?;

        let ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        let mask: Vec<i64> = encoding.get_attention_mask().iter().map(|&m| m as i64).collect();
        let dims = vec![1_i64, ids.len() as i64];

        let input_ids = TensorRef::from_array_view((dims.clone(), ids.as_slice()))
            .map_err(|e| anyhow!("Failed to build input_ids tensor: {}", e))?;
        let attention_mask = TensorRef::from_array_view((dims, mask.as_slice()))
            .map_err(|e| anyhow!("Failed to build attention_mask tensor: {}", e))?;

        let outputs = self
            .session
            .run(ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask
            ])
            .map_err(|e| anyhow!("ONNX Runtime inference failed: {}", e))?;

        let (shape, logits) = outputs[LOGITS_OUTPUT]
            .try_extract_tensor::<f32>()
            .map_err(|e| anyhow!("Failed to extract '{}' as f32: {}", LOGITS_OUTPUT, e))?;
        let shape: Vec<i64> = shape.iter().copied().collect();
        if shape.len() != 3 || shape[1] as usize != ids.len() || shape[2] <= HALLUCINATED_LABEL as i64 {
            return Err(anyhow!("Unexpected logits shape {:?} for {} tokens", shape, ids.len()));
        }
        Ok(score_answer_tokens(&encoding, logits, shape[2] as usize))
    }
}

/// Pick the answer tokens out of a (prompt, answer) pair encoding and score each
/// with the softmax probability of the hallucinated label.
///
/// `logits` is the row-major `[seq, num_labels]` block for the single batch item.
/// Offsets of the second sequence are relative to the answer.
pub fn score_answer_tokens(encoding: &Encoding, logits: &[f32], num_labels: usize) -> Vec<ScoredToken> {
    let sequence_ids = encoding.get_sequence_ids();
    let offsets = encoding.get_offsets();
    let mut tokens = Vec::new();
    for (idx, (sequence, &(start, end))) in sequence_ids.iter().zip(offsets).enumerate() {
        // Special tokens have no sequence id and empty offsets.
        if *sequence != Some(1) || start == end {
            continue;
        }
        let Some(row) = logits.get(idx * num_labels..(idx + 1) * num_labels) else {
            break;
        };
        tokens.push(ScoredToken {
            start,
            end,
            prob: softmax(row)[HALLUCINATED_LABEL],
        });
    }
    tokens
}

impl HallucinationModel for TransformerDetector {
    fn predict(
        &mut self,
        contexts: &[String],
        question: &str,
        answer: &str,
        format: OutputFormat,
    ) -> Result<Vec<RawPrediction>> {
        let tokens = self.score_tokens(contexts, question, answer)?;
        Ok(match format {
            OutputFormat::Tokens => tokens
                .iter()
                .map(|t| RawPrediction::Token {
                    token: char_slice(answer, t.start, t.end).unwrap_or_default().to_string(),
                    prob: t.prob,
                })
                .collect(),
            OutputFormat::Spans => merge_spans(answer, &tokens, self.threshold),
        })
    }

    fn name(&self) -> &str {
        "transformer"
    }
}

/// Render the QA prompt the classifier was trained on.
pub fn build_prompt(contexts: &[String], question: &str) -> String {
    let passages = contexts
        .iter()
        .enumerate()
        .map(|(i, passage)| format!("passage {}: {}", i + 1, passage))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Briefly answer the following question:\n{}\n\
         Bear in mind that your response should be strictly based on the following {} passages:\n{}\n\
         In case the passages do not contain the necessary information to answer the question, \
         please reply with: \"Unable to answer based on given passages.\"\noutput:",
        question,
        contexts.len(),
        passages
    )
}

/// Merge consecutive tokens scoring at or above `threshold` into spans scored by
/// their mean probability.
pub fn merge_spans(answer: &str, tokens: &[ScoredToken], threshold: f64) -> Vec<RawPrediction> {
    let mut spans = Vec::new();
    let mut run: Vec<&ScoredToken> = Vec::new();

    for token in tokens {
        if token.prob >= threshold {
            run.push(token);
        } else {
            close_run(answer, &mut run, &mut spans);
        }
    }
    close_run(answer, &mut run, &mut spans);

    spans
}

fn close_run(answer: &str, run: &mut Vec<&ScoredToken>, spans: &mut Vec<RawPrediction>) {
    if let (Some(first), Some(last)) = (run.first(), run.last()) {
        let confidence = run.iter().map(|t| t.prob).sum::<f64>() / run.len() as f64;
        spans.push(RawPrediction::Span {
            start: first.start,
            end: last.end,
            text: char_slice(answer, first.start, last.end).unwrap_or_default().to_string(),
            confidence,
        });
    }
    run.clear();
}

fn softmax(logits: &[f32]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let exps: Vec<f64> = logits.iter().map(|&l| (l as f64 - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
