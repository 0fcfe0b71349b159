//! Run identity and outcome records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ComputationTaskId, ConfigurationId, DataStorageId, FailureKind, ServiceId};

/// Stable identity of the run instantiated for one configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComputationTaskIdent {
    /// Run identifier.
    pub id: ComputationTaskId,

    /// Data storage the run writes into, if persistence was requested.
    pub data_storage: Option<DataStorageId>,
}

impl ComputationTaskIdent {
    /// Create an ident with a fresh run id.
    pub fn new(data_storage: Option<DataStorageId>) -> Self {
        Self {
            id: ComputationTaskId::generate(),
            data_storage,
        }
    }
}

/// Failure recorded on a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Failure classification.
    pub kind: FailureKind,

    /// Human-readable message.
    pub message: String,

    /// Underlying cause, if one was reported.
    pub cause: Option<String>,
}

/// Outcome facts accumulated for one run.
///
/// Created when initialization starts and finalized when execution ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInformation {
    /// Run the information belongs to.
    pub task_id: ComputationTaskId,

    /// Configuration the run was created from.
    pub configuration_id: ConfigurationId,

    /// `Some(true)` once the run succeeded, `Some(false)` once it failed.
    pub success: Option<bool>,

    /// Failure details.
    pub failure: Option<RunFailure>,

    /// Host that executed the run (remote runs only).
    pub host: Option<ServiceId>,

    /// When initialization started.
    pub init_started_at: DateTime<Utc>,

    /// How long initialization took.
    pub init_duration_ms: Option<i64>,

    /// When execution started.
    pub run_started_at: Option<DateTime<Utc>>,

    /// How long execution took.
    pub run_duration_ms: Option<i64>,

    /// When the run was finalized.
    pub finished_at: Option<DateTime<Utc>>,

    /// Set when the run was handed over to resilience recovery; the outcome
    /// of this attempt is then not the outcome of the configuration.
    pub superseded: bool,
}

impl RunInformation {
    /// Start recording information for a run.
    pub fn new(task_id: ComputationTaskId, configuration_id: ConfigurationId) -> Self {
        Self {
            task_id,
            configuration_id,
            success: None,
            failure: None,
            host: None,
            init_started_at: Utc::now(),
            init_duration_ms: None,
            run_started_at: None,
            run_duration_ms: None,
            finished_at: None,
            superseded: false,
        }
    }

    /// Record the end of initialization.
    pub fn initialized(&mut self) {
        self.init_duration_ms = Some(elapsed_ms(self.init_started_at));
    }

    /// Record the start of execution.
    pub fn start(&mut self) {
        self.run_started_at = Some(Utc::now());
    }

    /// Mark the run as completed.
    pub fn complete(&mut self) {
        self.success = Some(true);
        self.failure = None;
        self.finish();
    }

    /// Mark the run as failed.
    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>, cause: Option<String>) {
        self.success = Some(false);
        self.failure = Some(RunFailure {
            kind,
            message: message.into(),
            cause,
        });
        self.finish();
    }

    /// Mark the attempt as handed over to recovery.
    pub fn supersede(&mut self) {
        self.superseded = true;
    }

    /// Whether the run failed.
    pub fn is_failed(&self) -> bool {
        self.success == Some(false)
    }

    /// Whether the run succeeded.
    pub fn is_success(&self) -> bool {
        self.success == Some(true)
    }

    /// Failure message, if any.
    pub fn error_message(&self) -> Option<&str> {
        self.failure.as_ref().map(|f| f.message.as_str())
    }

    /// Failure classification, if any.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    fn finish(&mut self) {
        let now = Utc::now();
        if self.init_duration_ms.is_none() {
            self.init_duration_ms = Some(elapsed_ms(self.init_started_at));
        }
        if let Some(started) = self.run_started_at {
            self.run_duration_ms = Some((now - started).num_milliseconds());
        }
        self.finished_at = Some(now);
    }
}

fn elapsed_ms(since: DateTime<Utc>) -> i64 {
    (Utc::now() - since).num_milliseconds()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> RunInformation {
        RunInformation::new(ComputationTaskId::new("t1"), ConfigurationId::new("c1"))
    }

    #[test]
    fn test_fresh_info_has_no_outcome() {
        let info = info();
        assert_eq!(info.success, None);
        assert!(!info.is_failed());
        assert!(!info.is_success());
    }

    #[test]
    fn test_fail_records_message_and_cause() {
        let mut info = info();
        info.fail(
            FailureKind::SetupFailure,
            "model missing",
            Some("file not found".to_string()),
        );
        assert!(info.is_failed());
        assert_eq!(info.error_message(), Some("model missing"));
        assert_eq!(info.failure_kind(), Some(FailureKind::SetupFailure));
        assert_eq!(
            info.failure.as_ref().and_then(|f| f.cause.as_deref()),
            Some("file not found")
        );
        assert!(info.finished_at.is_some());
    }

    #[test]
    fn test_complete_records_timings() {
        let mut info = info();
        info.initialized();
        info.start();
        info.complete();
        assert!(info.is_success());
        assert!(info.init_duration_ms.is_some());
        assert!(info.run_duration_ms.is_some());
    }
}
