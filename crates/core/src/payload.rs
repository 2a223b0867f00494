//! Typed job payloads.
//!
//! Every job carries a `kind` plus a JSON payload whose shape is fixed per
//! kind. [`JobPayload`] is the tagged union over all shapes; it is built from
//! the raw `(kind, payload)` pair with [`JobPayload::from_parts`], which
//! rejects unknown kinds, malformed shapes, and empty identifiers before a job
//! ever reaches the queue.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// Discriminant of [`JobPayload`]; stored as text alongside every job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ParseResume,
    ScoreCandidate,
    RankCandidates,
    ScreenBatch,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::ParseResume,
        JobKind::ScoreCandidate,
        JobKind::RankCandidates,
        JobKind::ScreenBatch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::ParseResume => "parse_resume",
            JobKind::ScoreCandidate => "score_candidate",
            JobKind::RankCandidates => "rank_candidates",
            JobKind::ScreenBatch => "screen_batch",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("Unknown job kind '{s}'")))
    }
}

impl TryFrom<String> for JobKind {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ---------------------------------------------------------------------------
// Payload shapes
// ---------------------------------------------------------------------------

/// Extract structured data from an uploaded resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ParseResume {
    #[validate(length(min = 1))]
    pub candidate_id: String,
    #[validate(length(min = 1, max = 2048))]
    pub resume_uri: String,
}

/// Score one candidate against a hiring job's requirements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ScoreCandidate {
    #[validate(length(min = 1))]
    pub candidate_id: String,
    #[validate(length(min = 1))]
    pub hiring_job_id: String,
}

/// Produce an ordering over already-scored candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RankCandidates {
    #[validate(length(min = 1))]
    pub hiring_job_id: String,
    #[validate(length(min = 1))]
    pub candidate_ids: Vec<String>,
}

/// Parent of a screening flow; never executed by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ScreenBatch {
    #[validate(length(min = 1))]
    pub hiring_job_id: String,
    #[serde(default)]
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Tagged union
// ---------------------------------------------------------------------------

/// A validated job payload, tagged by kind.
///
/// Serialized form: `{"kind": "parse_resume", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum JobPayload {
    ParseResume(ParseResume),
    ScoreCandidate(ScoreCandidate),
    RankCandidates(RankCandidates),
    ScreenBatch(ScreenBatch),
}

impl JobPayload {
    /// Build and validate a payload from its raw `kind` and JSON body.
    pub fn from_parts(kind: &str, payload: serde_json::Value) -> Result<Self, CoreError> {
        let kind: JobKind = kind.parse()?;
        let tagged = serde_json::json!({ "kind": kind.as_str(), "payload": payload });
        let parsed: JobPayload = serde_json::from_value(tagged)
            .map_err(|e| CoreError::Validation(format!("Invalid {kind} payload: {e}")))?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::ParseResume(_) => JobKind::ParseResume,
            JobPayload::ScoreCandidate(_) => JobKind::ScoreCandidate,
            JobPayload::RankCandidates(_) => JobKind::RankCandidates,
            JobPayload::ScreenBatch(_) => JobKind::ScreenBatch,
        }
    }

    /// The untagged JSON body, as persisted in the job's `payload` column.
    pub fn body(&self) -> serde_json::Value {
        let value = match self {
            JobPayload::ParseResume(p) => serde_json::to_value(p),
            JobPayload::ScoreCandidate(p) => serde_json::to_value(p),
            JobPayload::RankCandidates(p) => serde_json::to_value(p),
            JobPayload::ScreenBatch(p) => serde_json::to_value(p),
        };
        // Plain structs of strings always serialize.
        value.unwrap_or(serde_json::Value::Null)
    }

    fn validate(&self) -> Result<(), CoreError> {
        let result = match self {
            JobPayload::ParseResume(p) => p.validate(),
            JobPayload::ScoreCandidate(p) => p.validate(),
            JobPayload::RankCandidates(p) => p.validate(),
            JobPayload::ScreenBatch(p) => p.validate(),
        };
        result.map_err(|e| CoreError::Validation(format!("Invalid {} payload: {e}", self.kind())))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_known_kind() {
        let payload = JobPayload::from_parts(
            "parse_resume",
            json!({"candidate_id": "c-1", "resume_uri": "s3://bucket/c-1.pdf"}),
        )
        .unwrap();

        assert_eq!(payload.kind(), JobKind::ParseResume);
        assert_eq!(payload.body()["candidate_id"], "c-1");
    }

    #[test]
    fn rejects_unknown_kind() {
        let err = JobPayload::from_parts("summon_recruiter", json!({})).unwrap_err();
        assert_matches!(err, CoreError::Validation(msg) if msg.contains("summon_recruiter"));
    }

    #[test]
    fn rejects_wrong_shape() {
        let err = JobPayload::from_parts("score_candidate", json!({"candidate_id": "c-1"}))
            .unwrap_err();
        assert_matches!(err, CoreError::Validation(msg) if msg.contains("hiring_job_id"));
    }

    #[test]
    fn rejects_empty_identifiers() {
        let err = JobPayload::from_parts(
            "rank_candidates",
            json!({"hiring_job_id": "h-1", "candidate_ids": []}),
        )
        .unwrap_err();
        assert_matches!(err, CoreError::Validation(_));

        let err = JobPayload::from_parts(
            "parse_resume",
            json!({"candidate_id": "", "resume_uri": "s3://x"}),
        )
        .unwrap_err();
        assert_matches!(err, CoreError::Validation(_));
    }

    #[test]
    fn screen_batch_description_is_optional() {
        let payload = JobPayload::from_parts("screen_batch", json!({"hiring_job_id": "h-9"})).unwrap();
        assert_matches!(payload, JobPayload::ScreenBatch(ScreenBatch { description: None, .. }));
    }

    #[test]
    fn kind_round_trips_through_text() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
    }
}
