use serde_json::error::Category;

use super::SpanDetectionItem;

/// Schema-level validation errors.
///
/// Raised when a payload cannot be turned into one of the wire shapes, and when a
/// span does not describe a substring of the answer it was produced for.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Malformed JSON payload: {message}")]
    MalformedJson { message: String },

    #[error("Invalid or missing field: {message}")]
    InvalidField { message: String },

    #[error("Span {start}..{end} is outside an answer of {len} characters")]
    SpanOutOfBounds { start: usize, end: usize, len: usize },

    #[error("Span {start}..{end} text {actual:?} does not match answer text {expected:?}")]
    SpanTextMismatch {
        start: usize,
        end: usize,
        expected: String,
        actual: String,
    },

    #[error("Failed to encode payload: {message}")]
    Encode { message: String },
}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        let message = err.to_string();
        match err.classify() {
            Category::Data => ValidationError::InvalidField { message },
            Category::Syntax | Category::Eof | Category::Io => {
                ValidationError::MalformedJson { message }
            }
        }
    }
}

/// Slice `text` by character offsets. Returns `None` when the range is out of bounds.
pub fn char_slice(text: &str, start: usize, end: usize) -> Option<&str> {
    if start > end {
        return None;
    }
    let mut boundaries = text
        .char_indices()
        .map(|(idx, _)| idx)
        .chain(std::iter::once(text.len()));
    let begin = boundaries.nth(start)?;
    let finish = if end == start {
        begin
    } else {
        boundaries.nth(end - start - 1)?
    };
    Some(&text[begin..finish])
}

/// Check that a span lies within `answer` and that its text matches its offsets.
pub fn check_span(item: &SpanDetectionItem, answer: &str) -> Result<(), ValidationError> {
    let len = answer.chars().count();
    if item.start > item.end || item.end > len {
        return Err(ValidationError::SpanOutOfBounds {
            start: item.start,
            end: item.end,
            len,
        });
    }

    let expected = char_slice(answer, item.start, item.end).unwrap_or_default();
    if expected != item.text {
        return Err(ValidationError::SpanTextMismatch {
            start: item.start,
            end: item.end,
            expected: expected.to_string(),
            actual: item.text.clone(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(start: usize, end: usize, text: &str) -> SpanDetectionItem {
        SpanDetectionItem {
            start,
            end,
            text: text.to_string(),
            hallucination_score: 0.9,
        }
    }

    #[test]
    fn test_char_slice_uses_character_offsets() {
        let text = "Zürich is größer";
        assert_eq!(char_slice(text, 0, 6), Some("Zürich"));
        assert_eq!(char_slice(text, 10, 16), Some("größer"));
        assert_eq!(char_slice(text, 16, 16), Some(""));
        assert_eq!(char_slice(text, 0, 17), None);
        assert_eq!(char_slice(text, 5, 4), None);
    }

    #[test]
    fn test_check_span_accepts_consistent_span() {
        let answer = "The capital of France is Paris.";
        assert!(check_span(&span(25, 30, "Paris"), answer).is_ok());
        assert!(check_span(&span(31, 31, ""), answer).is_ok());
    }

    #[test]
    fn test_check_span_rejects_out_of_bounds() {
        let answer = "Paris";
        let err = check_span(&span(3, 9, "is"), answer).unwrap_err();
        assert_eq!(err, ValidationError::SpanOutOfBounds { start: 3, end: 9, len: 5 });

        let err = check_span(&span(4, 2, ""), answer).unwrap_err();
        assert!(matches!(err, ValidationError::SpanOutOfBounds { .. }));
    }

    #[test]
    fn test_check_span_rejects_text_mismatch() {
        let answer = "The capital of France is Paris.";
        let err = check_span(&span(25, 30, "Lyon!"), answer).unwrap_err();
        assert!(matches!(err, ValidationError::SpanTextMismatch { .. }));
    }
}
