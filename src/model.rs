//! Moderation data model
//!
//! Domain payloads use snake_case JSON so external check workers written
//! against the same topic contract can produce and consume them directly.

use crate::error::{ModerationError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Severity threshold above which an unsafe check is `High`
pub const HIGH_SEVERITY_THRESHOLD: f64 = 0.8;

/// Severity threshold above which an unsafe check is `Medium`
pub const MEDIUM_SEVERITY_THRESHOLD: f64 = 0.5;

/// A bot answer to screen, together with the question that prompted it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub question: String,
    pub answer: String,
}

impl Message {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
        }
    }
}

/// Opaque token scoping one moderation request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Mint a fresh correlation id (req-<uuid>)
    pub fn new() -> Self {
        Self(format!("req-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How an unsafe check is remedied during merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckFamily {
    /// The detector already embedded inline redaction markers in its masked answer
    Redaction,
    /// The whole answer is unsuitable and must be rewritten
    Corrective,
}

/// A named moderation dimension
///
/// The set is closed: every kind is known at compile time, and a name
/// that does not map to one of these fails at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Pii,
    Safety,
    Ad,
    OffTopic,
}

impl CheckKind {
    /// All known kinds, in baseline order
    pub const ALL: [CheckKind; 4] = [
        CheckKind::Pii,
        CheckKind::Safety,
        CheckKind::Ad,
        CheckKind::OffTopic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Pii => "pii",
            CheckKind::Safety => "safety",
            CheckKind::Ad => "ad",
            CheckKind::OffTopic => "off_topic",
        }
    }

    pub fn family(&self) -> CheckFamily {
        match self {
            CheckKind::Pii | CheckKind::Safety => CheckFamily::Redaction,
            CheckKind::Ad | CheckKind::OffTopic => CheckFamily::Corrective,
        }
    }

    /// Human-readable description of what an unsafe result of this kind means
    pub fn problem(&self) -> &'static str {
        match self {
            CheckKind::Pii => "the answer leaks personal data",
            CheckKind::Safety => "the answer contains toxic or unsafe language",
            CheckKind::Ad => "the answer contains advertising or competitor mentions",
            CheckKind::OffTopic => "the answer does not address the question",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckKind {
    type Err = ModerationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pii" => Ok(CheckKind::Pii),
            "safety" => Ok(CheckKind::Safety),
            "ad" => Ok(CheckKind::Ad),
            "off_topic" => Ok(CheckKind::OffTopic),
            other => Err(ModerationError::Config(format!(
                "Unknown check kind '{}' (expected one of pii, safety, ad, off_topic)",
                other
            ))),
        }
    }
}

/// The configured, validated set of check kinds every request must cover
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSet {
    kinds: Vec<CheckKind>,
}

impl CheckSet {
    /// Build a check set, rejecting empty and duplicate entries
    pub fn new(kinds: impl IntoIterator<Item = CheckKind>) -> Result<Self> {
        let mut unique = Vec::new();
        for kind in kinds {
            if unique.contains(&kind) {
                return Err(ModerationError::Config(format!(
                    "Check kind '{}' configured more than once",
                    kind
                )));
            }
            unique.push(kind);
        }
        if unique.is_empty() {
            return Err(ModerationError::Config(
                "At least one check kind must be configured".to_string(),
            ));
        }
        Ok(Self { kinds: unique })
    }

    /// Resolve check names into kinds, failing fast on unknown names
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let kinds = names
            .iter()
            .map(|name| name.as_ref().parse::<CheckKind>())
            .collect::<Result<Vec<_>>>()?;
        Self::new(kinds)
    }

    pub fn kinds(&self) -> &[CheckKind] {
        &self.kinds
    }

    pub fn contains(&self, kind: CheckKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Whether `parts` holds a result for every configured kind
    pub fn is_complete<V>(&self, parts: &BTreeMap<CheckKind, V>) -> bool {
        self.kinds.iter().all(|kind| parts.contains_key(kind))
    }
}

impl Default for CheckSet {
    fn default() -> Self {
        Self {
            kinds: CheckKind::ALL.to_vec(),
        }
    }
}

/// Output of one check worker for one (correlation id, check kind)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub safe: bool,

    /// Detector confidence in `[0, 1]`
    pub score: f64,

    /// Answer with the detector's inline redactions applied
    pub masked_answer: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub censored_entities: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PartialResult {
    pub fn new(safe: bool, score: f64, masked_answer: impl Into<String>) -> Self {
        Self {
            safe,
            score,
            masked_answer: masked_answer.into(),
            question: None,
            censored_entities: None,
            error: None,
        }
    }

    /// A failed detector run, recorded as present but unsafe
    pub fn errored(message: &Message, error: impl Into<String>) -> Self {
        Self {
            safe: false,
            score: 0.0,
            masked_answer: message.answer.clone(),
            question: Some(message.question.clone()),
            censored_entities: None,
            error: Some(error.into()),
        }
    }

    pub fn with_question(mut self, question: impl Into<String>) -> Self {
        self.question = Some(question.into());
        self
    }

    pub fn with_censored_entities(mut self, entities: Vec<String>) -> Self {
        self.censored_entities = Some(entities);
        self
    }

    /// Effective safety: an errored check never counts as safe
    pub fn is_safe(&self) -> bool {
        self.safe && self.error.is_none()
    }
}

/// Severity of a violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low = 1,
    Medium = 2,
    High = 3,
}

impl Severity {
    /// Map a detector score to a severity (strict thresholds)
    pub fn from_score(score: f64) -> Self {
        if score > HIGH_SEVERITY_THRESHOLD {
            Severity::High
        } else if score > MEDIUM_SEVERITY_THRESHOLD {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// A violation derived from one unsafe partial result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: CheckKind,
    pub severity: Severity,
}

/// Merged outcome of one moderation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalVerdict {
    pub overall_safe: bool,
    pub violations: Vec<Violation>,
    pub masked_answer: String,
    pub all_checks: BTreeMap<CheckKind, PartialResult>,
}

impl FinalVerdict {
    pub fn violation(&self, kind: CheckKind) -> Option<&Violation> {
        self.violations.iter().find(|v| v.kind == kind)
    }
}
