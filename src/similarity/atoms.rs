use std::collections::BTreeSet;

use serde_yaml::Value as YamlValue;

use crate::models::{NoveltyClass, SimilarityMetrics};

/// Extracts the set of detection "atoms" (field-op-value triples,
/// flattened to `field|modifier=value` strings) from a Sigma rule's
/// `detection` block, skipping the `condition` key itself.
pub fn detection_atoms(yaml_text: &str) -> BTreeSet<String> {
    let Ok(doc) = serde_yaml::from_str::<YamlValue>(yaml_text) else {
        return BTreeSet::new();
    };
    let Some(detection) = doc
        .as_mapping()
        .and_then(|m| m.get(YamlValue::String("detection".to_string())))
        .and_then(YamlValue::as_mapping)
    else {
        return BTreeSet::new();
    };

    let mut atoms = BTreeSet::new();
    for (key, value) in detection {
        let Some(selection_name) = key.as_str() else {
            continue;
        };
        if selection_name == "condition" {
            continue;
        }
        collect_atoms(selection_name, value, &mut atoms);
    }
    atoms
}

fn collect_atoms(selection: &str, value: &YamlValue, atoms: &mut BTreeSet<String>) {
    match value {
        YamlValue::Mapping(map) => {
            for (field, field_value) in map {
                let Some(field_name) = field.as_str() else {
                    continue;
                };
                for v in flatten_values(field_value) {
                    atoms.insert(format!("{selection}::{field_name}={v}"));
                }
            }
        }
        YamlValue::Sequence(seq) => {
            for item in seq {
                collect_atoms(selection, item, atoms);
            }
        }
        other => {
            for v in flatten_values(other) {
                atoms.insert(format!("{selection}={v}"));
            }
        }
    }
}

fn flatten_values(value: &YamlValue) -> Vec<String> {
    match value {
        YamlValue::Sequence(seq) => seq.iter().flat_map(flatten_values).collect(),
        YamlValue::String(s) => vec![s.clone()],
        YamlValue::Number(n) => vec![n.to_string()],
        YamlValue::Bool(b) => vec![b.to_string()],
        _ => Vec::new(),
    }
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Structural similarity of the `detection.condition` expression trees,
/// normalized so identifier names don't matter, only shape and order of
/// appearance.
///
/// Per the open-question resolution recorded in DESIGN.md: `None` when
/// the two rules' atom sets are identical (shape is moot — they are the
/// same detection), `Some(0.0)` when the atom sets are fully disjoint.
pub fn logic_shape_similarity(
    condition_a: &str,
    atoms_a: &BTreeSet<String>,
    condition_b: &str,
    atoms_b: &BTreeSet<String>,
) -> Option<f64> {
    if atoms_a == atoms_b {
        return None;
    }
    if atoms_a.is_disjoint(atoms_b) {
        return Some(0.0);
    }
    let shape_a = normalize_condition(condition_a);
    let shape_b = normalize_condition(condition_b);
    Some(token_sequence_similarity(&shape_a, &shape_b))
}

/// Reduces a condition expression to its structural skeleton: boolean
/// keywords and parens are kept verbatim, every other token (a selection
/// identifier) is replaced with the positional placeholder `ID`.
fn normalize_condition(condition: &str) -> Vec<String> {
    const STRUCTURAL: [&str; 6] = ["and", "or", "not", "(", ")", "of"];
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in condition.chars() {
        if ch == '(' || ch == ')' {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            tokens.push(ch.to_string());
        } else if ch.is_whitespace() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
        } else {
            current.push(ch);
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
        .into_iter()
        .map(|tok| {
            let lower = tok.to_ascii_lowercase();
            if STRUCTURAL.contains(&lower.as_str()) || lower.chars().all(|c| c.is_ascii_digit()) {
                lower
            } else {
                "ID".to_string()
            }
        })
        .collect()
}

/// Normalized similarity of two token sequences via the longest common
/// subsequence, length-normalized to `[0,1]`.
fn token_sequence_similarity(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let lcs = longest_common_subsequence(a, b);
    let denom = a.len().max(b.len());
    if denom == 0 {
        1.0
    } else {
        lcs as f64 / denom as f64
    }
}

fn longest_common_subsequence(a: &[String], b: &[String]) -> usize {
    let mut dp = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            dp[i][j] = if a[i - 1] == b[j - 1] {
                dp[i - 1][j - 1] + 1
            } else {
                dp[i - 1][j].max(dp[i][j - 1])
            };
        }
    }
    dp[a.len()][b.len()]
}

/// `weighted_similarity = 0.7*atom_jaccard + 0.3*logic_shape_similarity`
/// when logic shape is defined, else the atom Jaccard alone (§4.3.f).
pub fn weighted_similarity(atom_jaccard: f64, logic_shape_similarity: Option<f64>) -> f64 {
    match logic_shape_similarity {
        Some(shape) => 0.7 * atom_jaccard + 0.3 * shape,
        None => atom_jaccard,
    }
}

/// Computes the full similarity metrics between a candidate rule and one
/// corpus neighbor.
pub fn compute_metrics(candidate_yaml: &str, neighbor_yaml: &str) -> SimilarityMetrics {
    let atoms_a = detection_atoms(candidate_yaml);
    let atoms_b = detection_atoms(neighbor_yaml);
    let atom_jaccard = jaccard(&atoms_a, &atoms_b);

    let cond_a = condition_text(candidate_yaml);
    let cond_b = condition_text(neighbor_yaml);
    let logic_shape = logic_shape_similarity(&cond_a, &atoms_a, &cond_b, &atoms_b);
    let weighted = weighted_similarity(atom_jaccard, logic_shape);

    SimilarityMetrics {
        atom_jaccard,
        logic_shape_similarity: logic_shape,
        weighted_similarity: weighted,
    }
}

fn condition_text(yaml_text: &str) -> String {
    serde_yaml::from_str::<YamlValue>(yaml_text)
        .ok()
        .and_then(|doc| {
            doc.as_mapping()?
                .get(YamlValue::String("detection".to_string()))?
                .as_mapping()?
                .get(YamlValue::String("condition".to_string()))?
                .as_str()
                .map(String::from)
        })
        .unwrap_or_default()
}

/// `DUPLICATE: atom_jaccard > 0.95 AND logic_shape_similarity > 0.95`,
/// `SIMILAR: atom_jaccard > 0.80`, else `NOVEL` (§4.3.f). Enforces the
/// strict hierarchy `DUPLICATE => SIMILAR => !NOVEL` by construction.
pub fn classify(metrics: &SimilarityMetrics, duplicate_threshold: f64, similar_threshold: f64) -> NoveltyClass {
    let shape_duplicate = metrics.logic_shape_similarity.map(|s| s > duplicate_threshold).unwrap_or(true);
    if metrics.atom_jaccard > duplicate_threshold && shape_duplicate {
        NoveltyClass::Duplicate
    } else if metrics.atom_jaccard > similar_threshold {
        NoveltyClass::Similar
    } else {
        NoveltyClass::Novel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULE_A: &str = r#"
title: A
logsource: {category: process_creation}
detection:
  selection:
    Image|endswith: '\rundll32.exe'
    CommandLine|contains: 'LockWorkStation'
  condition: selection
level: medium
"#;

    const RULE_A_DUP: &str = r#"
title: A duplicate
logsource: {category: process_creation}
detection:
  selection:
    Image|endswith: '\rundll32.exe'
    CommandLine|contains: 'LockWorkStation'
  condition: selection
level: high
"#;

    const RULE_B_DISJOINT: &str = r#"
title: B
logsource: {category: network_connection}
detection:
  selection:
    DestinationPort: 4444
  condition: selection
level: medium
"#;

    #[test]
    fn identical_atoms_yield_null_shape_and_duplicate_classification() {
        let metrics = compute_metrics(RULE_A, RULE_A_DUP);
        assert_eq!(metrics.atom_jaccard, 1.0);
        assert!(metrics.logic_shape_similarity.is_none());
        assert_eq!(classify(&metrics, 0.95, 0.80), NoveltyClass::Duplicate);
    }

    #[test]
    fn disjoint_atoms_yield_zero_shape_and_novel_classification() {
        let metrics = compute_metrics(RULE_A, RULE_B_DISJOINT);
        assert_eq!(metrics.atom_jaccard, 0.0);
        assert_eq!(metrics.logic_shape_similarity, Some(0.0));
        assert_eq!(classify(&metrics, 0.95, 0.80), NoveltyClass::Novel);
    }

    #[test]
    fn hierarchy_is_strict() {
        let high = SimilarityMetrics { atom_jaccard: 0.97, logic_shape_similarity: Some(0.97), weighted_similarity: 0.97 };
        assert_eq!(classify(&high, 0.95, 0.80), NoveltyClass::Duplicate);
        let mid = SimilarityMetrics { atom_jaccard: 0.85, logic_shape_similarity: Some(0.5), weighted_similarity: 0.7 };
        assert_eq!(classify(&mid, 0.95, 0.80), NoveltyClass::Similar);
        let low = SimilarityMetrics { atom_jaccard: 0.1, logic_shape_similarity: Some(0.1), weighted_similarity: 0.1 };
        assert_eq!(classify(&low, 0.95, 0.80), NoveltyClass::Novel);
    }
}
