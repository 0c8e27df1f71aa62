//! Admission control for concurrent expression matrix ingests.
//!
//! A matrix job validates cell names against matrices already ingested for
//! the study, so two unvalidated ingests of the same raw-ness must not run
//! side by side. Only `IngestExpression` is gated.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{Action, GateConfig, IngestRequest};
use crate::records::{ParseStatus, StudyFile};

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admit,
    Defer {
        retry_after: Duration,
        blocking_file_id: String,
    },
}

#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    config: GateConfig,
}

impl ConcurrencyGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    /// Decide whether `request` on `candidate` may launch now, given every
    /// file of the study.
    pub fn admit(
        &self,
        request: &IngestRequest,
        candidate: &StudyFile,
        study_files: &[StudyFile],
        now: DateTime<Utc>,
    ) -> Admission {
        if request.action() != Action::IngestExpression {
            return Admission::Admit;
        }

        let raw_counts = request
            .params
            .params()
            .raw_counts()
            .unwrap_or(candidate.raw_counts);
        let window = self.config.freshness_window();

        let blocker = study_files.iter().find(|other| {
            other.id != candidate.id
                && other.study_id == candidate.study_id
                && other.kind.is_matrix()
                && other.raw_counts == raw_counts
                && other.parse_status == ParseStatus::Parsing
                && !other.queued_for_deletion
                && !other.has_validated_output
                && other.created_at < candidate.created_at
                && now - other.created_at < window
        });

        match blocker {
            Some(file) => Admission::Defer {
                retry_after: self.config.requeue_delay(),
                blocking_file_id: file.id.clone(),
            },
            None => Admission::Admit,
        }
    }
}
