//! Novelty classification (§4.3.f): atom/logic-shape similarity scoring
//! between a generated Sigma rule and its k-NN neighbors in the Rule
//! Corpus Index, and the corpus index read surface itself.

mod atoms;
mod corpus;

pub use atoms::{classify, detection_atoms, logic_shape_similarity, weighted_similarity};
pub use corpus::{CorpusIndex, CorpusMatch, InMemoryCorpusIndex};
