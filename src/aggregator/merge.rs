//! Merge/decision engine
//!
//! Turns a complete set of partial results into a verdict. Everything
//! here is synchronous; the only asynchronous step, the corrective
//! rewrite, is described by `MergePlan::rewrite` and carried out by the
//! aggregator afterwards.

use super::mask::compose_masks;
use crate::model::{CheckFamily, CheckKind, CheckSet, FinalVerdict, PartialResult, Severity, Violation};
use crate::rewrite::describe_problems;
use std::collections::BTreeMap;

/// Rewrite the aggregator must request before the verdict is final
#[derive(Debug, Clone, PartialEq)]
pub struct RewriteRequest {
    /// Failing corrective checks, in configured order
    pub kinds: Vec<CheckKind>,

    /// Text to rewrite, already redacted when a redaction check failed
    pub text: String,

    /// Human-readable description of what is wrong
    pub problem: String,
}

/// Outcome of the synchronous merge
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub overall_safe: bool,
    pub violations: Vec<Violation>,

    /// Answer after redaction composition, before any rewrite
    pub masked_answer: String,

    pub rewrite: Option<RewriteRequest>,
    pub all_checks: BTreeMap<CheckKind, PartialResult>,
}

impl MergePlan {
    /// Finalize with the answer produced by the rewrite step
    pub fn finish(self, masked_answer: String) -> FinalVerdict {
        FinalVerdict {
            overall_safe: self.overall_safe,
            violations: self.violations,
            masked_answer,
            all_checks: self.all_checks,
        }
    }

    /// Finalize with the redacted answer as-is
    pub fn into_verdict(self) -> FinalVerdict {
        let masked_answer = self.masked_answer.clone();
        self.finish(masked_answer)
    }
}

/// Merge the partial results of one request
///
/// Kinds are visited in the configured order so violations and fallbacks
/// are deterministic regardless of arrival order.
pub fn plan(checks: &CheckSet, parts: BTreeMap<CheckKind, PartialResult>) -> MergePlan {
    let ordered: Vec<(CheckKind, &PartialResult)> = checks
        .kinds()
        .iter()
        .filter_map(|kind| parts.get(kind).map(|part| (*kind, part)))
        .collect();

    let overall_safe = ordered.iter().all(|(_, part)| part.is_safe());

    let violations: Vec<Violation> = ordered
        .iter()
        .filter(|(_, part)| !part.is_safe())
        .map(|(kind, part)| Violation {
            kind: *kind,
            severity: Severity::from_score(part.score),
        })
        .collect();

    let failing = |family: CheckFamily| -> Vec<CheckKind> {
        violations
            .iter()
            .map(|v| v.kind)
            .filter(|kind| kind.family() == family)
            .collect()
    };
    let failing_redaction = failing(CheckFamily::Redaction);
    let failing_corrective = failing(CheckFamily::Corrective);

    let base = ordered
        .iter()
        .map(|(_, part)| part.masked_answer.as_str())
        .find(|answer| !answer.is_empty())
        .unwrap_or_default()
        .to_string();

    let masked_answer = if failing_redaction.is_empty() {
        base
    } else {
        redact(&ordered, &failing_redaction)
    };

    let rewrite = if failing_corrective.is_empty() {
        None
    } else {
        let question = ordered
            .iter()
            .find_map(|(_, part)| part.question.as_deref());
        Some(RewriteRequest {
            problem: describe_problems(&failing_corrective, question),
            kinds: failing_corrective,
            text: masked_answer.clone(),
        })
    };

    MergePlan {
        overall_safe,
        violations,
        masked_answer,
        rewrite,
        all_checks: parts,
    }
}

fn redact(ordered: &[(CheckKind, &PartialResult)], failing: &[CheckKind]) -> String {
    let sources: Vec<&str> = ordered
        .iter()
        .filter(|(kind, _)| kind.family() == CheckFamily::Redaction)
        .map(|(_, part)| part.masked_answer.as_str())
        .collect();

    if let Some(composed) = compose_masks(&sources) {
        return composed;
    }

    let fallback = failing
        .first()
        .and_then(|kind| ordered.iter().find(|(k, _)| k == kind))
        .map(|(_, part)| part.masked_answer.clone())
        .unwrap_or_default();
    tracing::warn!(
        sources = sources.len(),
        fallback_kind = ?failing.first(),
        "Redacted answers disagree on word count, using a single detector's mask"
    );
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANSWER: &str = "AI is artificial intelligence.";

    fn safe(score: f64, masked: &str) -> PartialResult {
        PartialResult::new(true, score, masked).with_question("What is AI?")
    }

    fn unsafe_(score: f64, masked: &str) -> PartialResult {
        PartialResult::new(false, score, masked).with_question("What is AI?")
    }

    fn parts(entries: Vec<(CheckKind, PartialResult)>) -> BTreeMap<CheckKind, PartialResult> {
        entries.into_iter().collect()
    }

    #[test]
    fn test_all_safe_passes_answer_through() {
        let plan = plan(
            &CheckSet::default(),
            parts(vec![
                (CheckKind::Pii, safe(0.0, ANSWER)),
                (CheckKind::Safety, safe(0.1, ANSWER)),
                (CheckKind::Ad, safe(0.0, ANSWER)),
                (CheckKind::OffTopic, safe(0.8, ANSWER)),
            ]),
        );

        assert!(plan.overall_safe);
        assert!(plan.violations.is_empty());
        assert!(plan.rewrite.is_none());

        let verdict = plan.into_verdict();
        assert_eq!(verdict.masked_answer, ANSWER);
        assert_eq!(verdict.all_checks.len(), 4);
    }

    #[test]
    fn test_pii_leak_masks_passport() {
        let answer = "Your passport is 4510 123456 issued in Moscow";
        let plan = plan(
            &CheckSet::default(),
            parts(vec![
                (CheckKind::Pii, unsafe_(0.97, "Your passport is **** ****** issued in Moscow")),
                (CheckKind::Safety, safe(0.0, answer)),
                (CheckKind::Ad, safe(0.0, answer)),
                (CheckKind::OffTopic, safe(0.9, answer)),
            ]),
        );

        assert!(!plan.overall_safe);
        assert_eq!(
            plan.violations,
            vec![Violation {
                kind: CheckKind::Pii,
                severity: Severity::High
            }]
        );
        assert!(plan.rewrite.is_none());
        assert!(!plan.masked_answer.contains("4510"));
        assert!(!plan.masked_answer.contains("123456"));
        assert_eq!(plan.masked_answer, "Your passport is issued in Moscow");
    }

    #[test]
    fn test_multiline_answer_keeps_layout_and_numbers() {
        let answer = "I have 22 cats.\nPassport 4510 123456";
        let plan = plan(
            &CheckSet::default(),
            parts(vec![
                (CheckKind::Pii, unsafe_(0.95, "I have 22 cats.\nPassport XXXX XXXXXX")),
                (CheckKind::Safety, safe(0.0, answer)),
                (CheckKind::Ad, safe(0.0, answer)),
                (CheckKind::OffTopic, safe(0.9, answer)),
            ]),
        );

        assert_eq!(plan.masked_answer, "I have 22 cats.\nPassport");
    }

    #[test]
    fn test_both_redaction_masks_are_composed() {
        let plan = plan(
            &CheckSet::default(),
            parts(vec![
                (CheckKind::Pii, unsafe_(0.9, "Иван *** живёт на ул. XXXXX")),
                (CheckKind::Safety, unsafe_(0.6, "Иван Петров *** на ул. Ленина")),
                (CheckKind::Ad, safe(0.0, "Иван Петров живёт на ул. Ленина")),
                (CheckKind::OffTopic, safe(0.9, "Иван Петров живёт на ул. Ленина")),
            ]),
        );

        assert_eq!(plan.masked_answer, "Иван на ул.");
        assert_eq!(plan.violations.len(), 2);
        assert_eq!(plan.violations[0].kind, CheckKind::Pii);
        assert_eq!(plan.violations[1].severity, Severity::Medium);
    }

    #[test]
    fn test_safe_redaction_source_still_contributes_markers() {
        let plan = plan(
            &CheckSet::default(),
            parts(vec![
                (CheckKind::Pii, unsafe_(0.9, "call *** now, idiot")),
                (CheckKind::Safety, safe(0.3, "call 555-0101 now, ***")),
                (CheckKind::Ad, safe(0.0, "call 555-0101 now, idiot")),
                (CheckKind::OffTopic, safe(0.9, "call 555-0101 now, idiot")),
            ]),
        );
        assert_eq!(plan.masked_answer, "call now,");
    }

    #[test]
    fn test_word_count_mismatch_falls_back_to_first_failing_mask() {
        let plan = plan(
            &CheckSet::default(),
            parts(vec![
                (CheckKind::Pii, unsafe_(0.9, "Ivan [NAME] lives here")),
                (CheckKind::Safety, unsafe_(0.9, "Ivan lives ***")),
                (CheckKind::Ad, safe(0.0, "Ivan Petrov lives here")),
                (CheckKind::OffTopic, safe(0.9, "Ivan Petrov lives here")),
            ]),
        );
        assert_eq!(plan.masked_answer, "Ivan [NAME] lives here");
    }

    #[test]
    fn test_corrective_failure_requests_rewrite() {
        let answer = "Buy at MegaStore, best prices!";
        let plan = plan(
            &CheckSet::default(),
            parts(vec![
                (CheckKind::Pii, safe(0.0, answer)),
                (CheckKind::Safety, safe(0.0, answer)),
                (CheckKind::Ad, unsafe_(0.7, answer)),
                (CheckKind::OffTopic, safe(0.9, answer)),
            ]),
        );

        let rewrite = plan.rewrite.clone().unwrap();
        assert_eq!(rewrite.kinds, vec![CheckKind::Ad]);
        assert_eq!(rewrite.text, answer);
        assert!(rewrite.problem.contains("ad"));
        assert!(rewrite.problem.contains("What is AI?"));

        let verdict = plan.finish("We cannot recommend specific stores.".into());
        assert_eq!(verdict.masked_answer, "We cannot recommend specific stores.");
        assert_eq!(
            verdict.violation(CheckKind::Ad).unwrap().severity,
            Severity::Medium
        );
    }

    #[test]
    fn test_rewrite_receives_redacted_text() {
        let plan = plan(
            &CheckSet::default(),
            parts(vec![
                (CheckKind::Pii, unsafe_(0.95, "Call *** at MegaStore")),
                (CheckKind::Safety, safe(0.0, "Call Ivan at MegaStore")),
                (CheckKind::Ad, unsafe_(0.4, "Call Ivan at MegaStore")),
                (CheckKind::OffTopic, unsafe_(0.9, "Call Ivan at MegaStore")),
            ]),
        );
        let rewrite = plan.rewrite.unwrap();
        assert_eq!(rewrite.text, "Call at MegaStore");
        assert_eq!(rewrite.kinds, vec![CheckKind::Ad, CheckKind::OffTopic]);
    }

    #[test]
    fn test_errored_partial_counts_as_low_violation() {
        let message = crate::model::Message::new("What is AI?", ANSWER);
        let plan = plan(
            &CheckSet::default(),
            parts(vec![
                (CheckKind::Pii, safe(0.0, ANSWER)),
                (CheckKind::Safety, PartialResult::errored(&message, "classifier crashed")),
                (CheckKind::Ad, safe(0.0, ANSWER)),
                (CheckKind::OffTopic, safe(0.9, ANSWER)),
            ]),
        );

        assert!(!plan.overall_safe);
        assert_eq!(
            plan.violations,
            vec![Violation {
                kind: CheckKind::Safety,
                severity: Severity::Low
            }]
        );
        assert_eq!(plan.masked_answer, ANSWER);
    }

    #[test]
    fn test_overall_safe_iff_no_unsafe_partial() {
        for mask in 0u8..16 {
            let entries = CheckKind::ALL
                .iter()
                .enumerate()
                .map(|(i, kind)| {
                    let part = if mask & (1 << i) != 0 {
                        unsafe_(0.6, ANSWER)
                    } else {
                        safe(0.6, ANSWER)
                    };
                    (*kind, part)
                })
                .collect();
            let plan = plan(&CheckSet::default(), parts(entries));
            assert_eq!(plan.overall_safe, mask == 0);
            assert_eq!(plan.violations.len(), mask.count_ones() as usize);
        }
    }

    #[test]
    fn test_severity_per_score() {
        for (score, severity) in [(0.9, Severity::High), (0.6, Severity::Medium), (0.3, Severity::Low)] {
            let checks = CheckSet::new([CheckKind::Ad]).unwrap();
            let plan = plan(&checks, parts(vec![(CheckKind::Ad, unsafe_(score, ANSWER))]));
            assert_eq!(plan.violations[0].severity, severity);
        }
    }
}
