use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_LOG_PAGE_LIMIT: u32 = 20;
pub const MAX_LOG_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("unknown sync type: {0}")]
    UnknownSyncType(String),
    #[error("unknown sync status: {0}")]
    UnknownSyncStatus(String),
    #[error("invalid sync target: {0}")]
    InvalidTarget(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncType {
    ClassSync,
    StudentSync,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::ClassSync => "CLASS_SYNC",
            SyncType::StudentSync => "STUDENT_SYNC",
        }
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncType {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "class_sync" | "class" => Ok(SyncType::ClassSync),
            "student_sync" | "student" => Ok(SyncType::StudentSync),
            other => Err(ContractError::UnknownSyncType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Success,
    Partial,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "SUCCESS",
            SyncStatus::Partial => "PARTIAL",
            SyncStatus::Failed => "FAILED",
        }
    }

    /// SUCCESS only for a clean run; otherwise PARTIAL when anything landed.
    pub fn from_counts(records_processed: u32, records_failed: u32, run_failed: bool) -> Self {
        if !run_failed && records_failed == 0 {
            SyncStatus::Success
        } else if records_processed > 0 {
            SyncStatus::Partial
        } else {
            SyncStatus::Failed
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "SUCCESS" => Ok(SyncStatus::Success),
            "PARTIAL" => Ok(SyncStatus::Partial),
            "FAILED" => Ok(SyncStatus::Failed),
            other => Err(ContractError::UnknownSyncStatus(other.to_string())),
        }
    }
}

/// Failure taxonomy shared by the gateway, store and orchestrator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    NotAuthenticated,
    UpstreamUnavailable,
    NotFound,
    EmptyResult,
    LocalStore,
    Cancelled,
}

impl SyncErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorKind::NotAuthenticated => "not_authenticated",
            SyncErrorKind::UpstreamUnavailable => "upstream_unavailable",
            SyncErrorKind::NotFound => "not_found",
            SyncErrorKind::EmptyResult => "empty_result",
            SyncErrorKind::LocalStore => "local_store",
            SyncErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a caller asks to synchronize. Wire form:
/// `{"type": "class", "targetId": "CTK47A"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "type",
    content = "targetId",
    rename_all = "lowercase",
    try_from = "SyncTargetWire"
)]
pub enum SyncTarget {
    Class(String),
    Student(String),
}

#[derive(Deserialize)]
#[serde(tag = "type", content = "targetId", rename_all = "lowercase")]
enum SyncTargetWire {
    Class(String),
    Student(String),
}

impl TryFrom<SyncTargetWire> for SyncTarget {
    type Error = ContractError;

    fn try_from(wire: SyncTargetWire) -> Result<Self, Self::Error> {
        match wire {
            SyncTargetWire::Class(id) => SyncTarget::class(&id),
            SyncTargetWire::Student(id) => SyncTarget::student(&id),
        }
    }
}

impl SyncTarget {
    pub fn class(id: &str) -> Result<Self, ContractError> {
        validated_id(id).map(SyncTarget::Class)
    }

    pub fn student(id: &str) -> Result<Self, ContractError> {
        validated_id(id).map(SyncTarget::Student)
    }

    pub fn id(&self) -> &str {
        match self {
            SyncTarget::Class(id) | SyncTarget::Student(id) => id,
        }
    }

    pub fn sync_type(&self) -> SyncType {
        match self {
            SyncTarget::Class(_) => SyncType::ClassSync,
            SyncTarget::Student(_) => SyncType::StudentSync,
        }
    }
}

fn validated_id(id: &str) -> Result<String, ContractError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(ContractError::InvalidTarget("target id is empty".to_string()));
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub target_id: String,
    pub succeeded: bool,
    pub error_message: Option<String>,
}

impl SyncOutcome {
    pub fn succeeded(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            succeeded: true,
            error_message: None,
        }
    }

    pub fn failed(target_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            succeeded: false,
            error_message: Some(message.into()),
        }
    }
}

/// Result of one sync run as returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunSummary {
    pub success: bool,
    pub status: SyncStatus,
    pub records_processed: u32,
    pub records_failed: u32,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_log_id: Option<String>,
    /// Set when the run as a whole was aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<SyncErrorKind>,
}

impl Default for SyncRunSummary {
    fn default() -> Self {
        Self {
            success: true,
            status: SyncStatus::Success,
            records_processed: 0,
            records_failed: 0,
            errors: Vec::new(),
            sync_log_id: None,
            failure: None,
        }
    }
}

impl SyncRunSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, outcome: SyncOutcome) {
        if outcome.succeeded {
            self.records_processed += 1;
        } else {
            self.records_failed += 1;
            let message = outcome
                .error_message
                .unwrap_or_else(|| "Unknown error".to_string());
            self.errors.push(format!("{}: {}", outcome.target_id, message));
        }
        self.refresh_status();
    }

    /// Abort the run. The first run-level failure wins.
    pub fn fail_run(&mut self, kind: SyncErrorKind, message: impl Into<String>) {
        if self.failure.is_none() {
            self.failure = Some(kind);
        }
        self.errors.push(message.into());
        self.refresh_status();
    }

    /// Record a run-level failure kind without adding another error line.
    pub fn flag_failure(&mut self, kind: SyncErrorKind) {
        if self.failure.is_none() {
            self.failure = Some(kind);
        }
        self.refresh_status();
    }

    pub fn requires_reauthentication(&self) -> bool {
        self.failure == Some(SyncErrorKind::NotAuthenticated)
    }

    fn refresh_status(&mut self) {
        self.status = SyncStatus::from_counts(
            self.records_processed,
            self.records_failed,
            self.failure.is_some(),
        );
        self.success = self.status == SyncStatus::Success;
    }
}

/// Persisted, immutable audit record of one sync run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    pub id: String,
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub message: Option<String>,
    pub records_processed: u32,
    pub records_failed: u32,
    pub target_class_id: Option<String>,
    pub target_student_id: Option<String>,
    pub triggered_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SyncLogEntry {
    /// Error lines recorded in `message`, in run order.
    pub fn errors(&self) -> Vec<String> {
        match self.message.as_deref() {
            None => Vec::new(),
            Some(raw) => serde_json::from_str::<Vec<String>>(raw)
                .unwrap_or_else(|_| vec![raw.to_string()]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSyncLogEntry {
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub errors: Vec<String>,
    pub records_processed: u32,
    pub records_failed: u32,
    pub target_class_id: Option<String>,
    pub target_student_id: Option<String>,
    pub triggered_by: Option<String>,
}

impl NewSyncLogEntry {
    pub fn from_summary(
        target: &SyncTarget,
        summary: &SyncRunSummary,
        triggered_by: Option<&str>,
    ) -> Self {
        let (target_class_id, target_student_id) = match target {
            SyncTarget::Class(id) => (Some(id.clone()), None),
            SyncTarget::Student(id) => (None, Some(id.clone())),
        };
        Self {
            sync_type: target.sync_type(),
            status: summary.status,
            errors: summary.errors.clone(),
            records_processed: summary.records_processed,
            records_failed: summary.records_failed,
            target_class_id,
            target_student_id,
            triggered_by: triggered_by.map(str::to_string),
        }
    }

    /// JSON array of the error lines, or `None` for a clean run.
    pub fn message(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        Some(serde_json::to_string(&self.errors).unwrap_or_else(|_| self.errors.join("\n")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncLogQuery {
    pub page: u32,
    pub limit: u32,
    pub sync_type: Option<SyncType>,
}

impl Default for SyncLogQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_LOG_PAGE_LIMIT,
            sync_type: None,
        }
    }
}

impl SyncLogQuery {
    pub fn normalized(&self) -> Self {
        Self {
            page: self.page.max(1),
            limit: self.limit.clamp(1, MAX_LOG_PAGE_LIMIT),
            sync_type: self.sync_type,
        }
    }

    pub fn offset(&self) -> u64 {
        let query = self.normalized();
        u64::from(query.page - 1) * u64::from(query.limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
}

impl Pagination {
    pub fn new(page: u32, limit: u32, total: u64) -> Self {
        let limit = limit.max(1);
        Self {
            page,
            limit,
            total,
            total_pages: total.div_ceil(u64::from(limit)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncLogPage {
    pub logs: Vec<SyncLogEntry>,
    pub pagination: Pagination,
}
