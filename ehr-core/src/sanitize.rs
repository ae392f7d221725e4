use serde_json::{Map, Value};

use crate::error::{EhrError, Result};

const FENCE: &str = "```";

/// Clean raw model output and parse the JSON object embedded in it.
///
/// Fenced-code delimiters (with or without a language tag) are removed wherever they appear,
/// then the span from the first `{` to the last `}` is parsed. The resulting mapping is returned
/// as-is; field-level validation belongs to the caller.
pub fn sanitize(raw_text: &str) -> Result<Map<String, Value>> {
    let cleaned = strip_code_fences(raw_text.trim());

    let start = cleaned.find('{');
    let end = cleaned.rfind('}');
    let candidate = match (start, end) {
        (Some(start), Some(end)) if end > start => &cleaned[start..=end],
        _ => {
            return Err(EhrError::Parse(
                "AI response did not contain a JSON object".to_string(),
            ));
        }
    };

    serde_json::from_str::<Map<String, Value>>(candidate)
        .map_err(|e| EhrError::Parse(format!("Could not parse JSON in AI response: {}", e)))
}

/// Remove every "```" fence together with a directly attached language tag and the whitespace
/// that follows it.
fn strip_code_fences(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(position) = rest.find(FENCE) {
        output.push_str(&rest[..position]);
        rest = &rest[position + FENCE.len()..];

        let tag_len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '+'))
            .unwrap_or(rest.len());
        rest = rest[tag_len..].trim_start();
    }
    output.push_str(rest);

    output
}
