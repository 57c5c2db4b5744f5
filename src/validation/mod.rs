//! Structured-output validation: the strict JSON deserializer every
//! stage's LLM response goes through (§6 "LLM structured-output
//! contract") and the Sigma rule validator (§2.6, §4.3.e).
//!
//! Both are pure functions: text in, `Result`/`ValidationOutcome` out. The
//! retry-with-feedback loop lives in [`crate::engine::retry`]; this module
//! only ever answers "is this valid" and, if not, "why".

mod sigma;
mod structured;

pub use sigma::{validate_sigma_rule, SigmaValidationError};
pub use structured::{parse_strict_json, StructuredParseError};
