use serde_yaml::Value as YamlValue;
use thiserror::Error;

/// One structural defect in a candidate Sigma rule. The validator
/// collects all of them rather than failing fast, so the full error list
/// can be fed back to the model in one correction message (§4.1 "Sigma
/// validation failures... feeding validator errors back as a correction
/// message").
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SigmaValidationError {
    #[error("invalid YAML: {0}")]
    InvalidYaml(String),
    #[error("root document must be a YAML mapping")]
    NotAMapping,
    #[error("missing required field '{0}'")]
    MissingField(String),
    #[error("'logsource' must be a mapping")]
    InvalidLogsource,
    #[error("'detection' must contain at least one search identifier besides 'condition'")]
    NoDetectionIdentifiers,
    #[error("'detection.condition' is missing or not a string")]
    MissingCondition,
    #[error("'detection.condition' references unknown identifier '{0}'")]
    UnknownConditionIdentifier(String),
    #[error("'level' must be one of informational, low, medium, high, critical")]
    InvalidLevel,
}

const REQUIRED_FIELDS: [&str; 4] = ["title", "logsource", "detection", "level"];
const VALID_LEVELS: [&str; 5] = ["informational", "low", "medium", "high", "critical"];

/// Validates `yaml_text` against the structural subset of the Sigma
/// schema the engine cares about: required top-level keys, a mapping
/// `logsource`, a `detection` block with a resolvable `condition`, and a
/// known `level`. Returns every violation found, not just the first
/// (§2.6 "a pure function mapping rule text -> `{ok, errors[]}`").
pub fn validate_sigma_rule(yaml_text: &str) -> Vec<SigmaValidationError> {
    let doc: YamlValue = match serde_yaml::from_str(yaml_text) {
        Ok(v) => v,
        Err(e) => return vec![SigmaValidationError::InvalidYaml(e.to_string())],
    };

    let mapping = match doc.as_mapping() {
        Some(m) => m,
        None => return vec![SigmaValidationError::NotAMapping],
    };

    let mut errors = Vec::new();

    for field in REQUIRED_FIELDS {
        if !mapping.contains_key(YamlValue::String(field.to_string())) {
            errors.push(SigmaValidationError::MissingField(field.to_string()));
        }
    }

    if let Some(logsource) = mapping.get(YamlValue::String("logsource".to_string())) {
        if logsource.as_mapping().is_none() {
            errors.push(SigmaValidationError::InvalidLogsource);
        }
    }

    if let Some(level) = mapping.get(YamlValue::String("level".to_string())) {
        let ok = level
            .as_str()
            .map(|s| VALID_LEVELS.contains(&s))
            .unwrap_or(false);
        if !ok {
            errors.push(SigmaValidationError::InvalidLevel);
        }
    }

    if let Some(detection) = mapping.get(YamlValue::String("detection".to_string())) {
        validate_detection(detection, &mut errors);
    }

    errors
}

fn validate_detection(detection: &YamlValue, errors: &mut Vec<SigmaValidationError>) {
    let Some(detection_map) = detection.as_mapping() else {
        errors.push(SigmaValidationError::MissingCondition);
        return;
    };

    let identifiers: Vec<String> = detection_map
        .keys()
        .filter_map(|k| k.as_str())
        .filter(|k| *k != "condition")
        .map(String::from)
        .collect();

    if identifiers.is_empty() {
        errors.push(SigmaValidationError::NoDetectionIdentifiers);
    }

    let condition = detection_map
        .get(YamlValue::String("condition".to_string()))
        .and_then(YamlValue::as_str);

    match condition {
        None => errors.push(SigmaValidationError::MissingCondition),
        Some(condition_text) => {
            for token in tokenize_condition(condition_text) {
                if !identifiers.iter().any(|id| id == &token) {
                    errors.push(SigmaValidationError::UnknownConditionIdentifier(token));
                }
            }
        }
    }
}

/// Extracts identifier-like tokens from a condition expression, skipping
/// boolean keywords and the `1 of`/`all of` quantifier syntax.
fn tokenize_condition(condition: &str) -> Vec<String> {
    const KEYWORDS: [&str; 7] = ["and", "or", "not", "1", "of", "all", "them"];
    condition
        .split(|c: char| !c.is_alphanumeric() && c != '_' && c != '*')
        .filter(|tok| !tok.is_empty())
        .filter(|tok| !KEYWORDS.contains(&tok.to_ascii_lowercase().as_str()))
        .filter(|tok| !tok.contains('*'))
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_RULE: &str = r#"
title: Suspicious rundll32 LockWorkStation
logsource:
  category: process_creation
  product: windows
detection:
  selection:
    Image|endswith: '\rundll32.exe'
    CommandLine|contains: 'LockWorkStation'
  condition: selection
level: medium
"#;

    #[test]
    fn accepts_well_formed_rule() {
        assert!(validate_sigma_rule(VALID_RULE).is_empty());
    }

    #[test]
    fn rejects_malformed_yaml() {
        let errors = validate_sigma_rule("title: [unterminated");
        assert!(matches!(errors[0], SigmaValidationError::InvalidYaml(_)));
    }

    #[test]
    fn rejects_missing_fields() {
        let errors = validate_sigma_rule("title: only a title\n");
        assert!(errors.contains(&SigmaValidationError::MissingField("logsource".into())));
        assert!(errors.contains(&SigmaValidationError::MissingField("detection".into())));
        assert!(errors.contains(&SigmaValidationError::MissingField("level".into())));
    }

    #[test]
    fn rejects_condition_referencing_unknown_identifier() {
        let rule = r#"
title: Bad condition
logsource:
  category: process_creation
detection:
  selection:
    Image|endswith: '\rundll32.exe'
  condition: selection and missing_identifier
level: low
"#;
        let errors = validate_sigma_rule(rule);
        assert!(errors
            .iter()
            .any(|e| matches!(e, SigmaValidationError::UnknownConditionIdentifier(id) if id == "missing_identifier")));
    }

    #[test]
    fn rejects_invalid_level() {
        let rule = VALID_RULE.replace("level: medium", "level: extreme");
        let errors = validate_sigma_rule(&rule);
        assert!(errors.contains(&SigmaValidationError::InvalidLevel));
    }
}
