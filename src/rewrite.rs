//! Corrective rewrite port
//!
//! Answers failing an `ad` or `off_topic` check cannot be fixed by
//! masking words; the aggregator hands them to a `Rewriter` (typically an
//! LLM) together with a description of what is wrong.

use crate::error::Result;
use crate::model::CheckKind;
use async_trait::async_trait;

/// Text used as the final answer when no rewrite could be produced
pub const DEFAULT_REWRITE_FALLBACK: &str =
    "The answer was withheld because it could not be safely rewritten.";

/// External capability producing a corrected answer
#[async_trait]
pub trait Rewriter: Send + Sync {
    /// Rewrite `text` so it no longer exhibits `problem`
    async fn rewrite(&self, text: &str, problem: &str) -> Result<String>;
}

/// Describe the failing corrective checks for the rewriter
pub fn describe_problems(kinds: &[CheckKind], question: Option<&str>) -> String {
    let mut description = String::from("Rewrite the answer to fix the following problems:");
    for kind in kinds {
        description.push_str(&format!("\n- {}: {}", kind, kind.problem()));
    }
    if let Some(question) = question.filter(|q| !q.is_empty()) {
        description.push_str(&format!(
            "\nThe rewritten answer must address the question: {}",
            question
        ));
    }
    description
}
