use serde::de::DeserializeOwned;
use thiserror::Error;

/// A structured-output parse failure, including the text that failed so
/// the caller can feed it back to the model on retry (§4.1 "JSON-shape
/// validation failures... retry up to 3 attempts, feeding the prior parse
/// error back into the prompt").
#[derive(Debug, Error, Clone)]
pub enum StructuredParseError {
    #[error("response contains text outside the JSON object")]
    ExtraneousText,
    #[error("response is not a JSON object")]
    NotAnObject,
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
}

/// Extracts the single top-level JSON object from `text` and deserializes
/// it as `T`, rejecting any non-whitespace content outside the object
/// (§6: "Any text outside the JSON object is rejected").
///
/// Models frequently wrap JSON in markdown code fences or prose; this
/// function tolerates a fenced block but not free text alongside the
/// object itself.
pub fn parse_strict_json<T: DeserializeOwned>(text: &str) -> Result<T, StructuredParseError> {
    let candidate = strip_code_fence(text.trim());

    let start = candidate
        .find('{')
        .ok_or(StructuredParseError::NotAnObject)?;
    let end = candidate
        .rfind('}')
        .ok_or(StructuredParseError::NotAnObject)?;
    if end < start {
        return Err(StructuredParseError::NotAnObject);
    }

    let before = &candidate[..start];
    let after = &candidate[end + 1..];
    if !before.trim().is_empty() || !after.trim().is_empty() {
        return Err(StructuredParseError::ExtraneousText);
    }

    let object_text = &candidate[start..=end];
    serde_json::from_str::<T>(object_text)
        .map_err(|e| StructuredParseError::SchemaMismatch(e.to_string()))
}

fn strip_code_fence(text: &str) -> &str {
    let text = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .unwrap_or(text);
    text.strip_suffix("```").unwrap_or(text).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Payload {
        count: i32,
        items: Vec<String>,
    }

    #[test]
    fn parses_clean_object() {
        let text = r#"{"count": 2, "items": ["a", "b"]}"#;
        let parsed: Payload = parse_strict_json(text).unwrap();
        assert_eq!(parsed, Payload { count: 2, items: vec!["a".into(), "b".into()] });
    }

    #[test]
    fn strips_code_fence() {
        let text = "```json\n{\"count\": 0, \"items\": []}\n```";
        let parsed: Payload = parse_strict_json(text).unwrap();
        assert_eq!(parsed.count, 0);
    }

    #[test]
    fn rejects_leading_prose() {
        let text = "Here is the JSON: {\"count\": 1, \"items\": [\"x\"]}";
        assert!(matches!(
            parse_strict_json::<Payload>(text),
            Err(StructuredParseError::ExtraneousText)
        ));
    }

    #[test]
    fn rejects_schema_mismatch() {
        let text = r#"{"count": "not a number", "items": []}"#;
        assert!(matches!(
            parse_strict_json::<Payload>(text),
            Err(StructuredParseError::SchemaMismatch(_))
        ));
    }
}
