use crate::error::SyncError;
use crate::mapper::StudentRecordMapper;
use crate::store::LocalStore;
use crate::throttle::{FixedDelay, Throttle};
use roster_core::{
    system_clock, ClassMetadata, Clock, LocalClass, NewSyncLogEntry, SyncErrorKind, SyncLogPage,
    SyncLogQuery, SyncOutcome, SyncRunSummary, SyncTarget,
};
use roster_portal::{PortalGateway, Session, SessionProvider};
use roster_storage::UpsertOutcome;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Append a `STUDENT_SYNC` log entry for single-student runs.
    pub log_student_syncs: bool,
    /// Fill empty class columns from the first student synced into it.
    pub fill_class_metadata: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            log_student_syncs: true,
            fill_class_metadata: true,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn with_log_student_syncs(mut self, enabled: bool) -> Self {
        self.log_student_syncs = enabled;
        self
    }

    #[must_use]
    pub fn with_fill_class_metadata(mut self, enabled: bool) -> Self {
        self.fill_class_metadata = enabled;
        self
    }
}

struct SyncedStudent {
    outcome: UpsertOutcome,
    metadata: ClassMetadata,
}

/// Drives Portal -> local store synchronization for one student or one class.
///
/// Per-record failures never escape: they end up in the returned
/// [`SyncRunSummary`], prefixed with the student id, in roster order.
pub struct SyncOrchestrator {
    sessions: Arc<SessionProvider>,
    gateway: Arc<dyn PortalGateway>,
    store: Arc<dyn LocalStore>,
    mapper: StudentRecordMapper,
    throttle: Arc<dyn Throttle>,
    config: SyncConfig,
    clock: Clock,
}

impl SyncOrchestrator {
    pub fn new(
        sessions: Arc<SessionProvider>,
        gateway: Arc<dyn PortalGateway>,
        store: Arc<dyn LocalStore>,
    ) -> Self {
        Self {
            sessions,
            gateway,
            store,
            mapper: StudentRecordMapper::default(),
            throttle: Arc::new(FixedDelay::default()),
            config: SyncConfig::default(),
            clock: system_clock(),
        }
    }

    #[must_use]
    pub fn with_mapper(mut self, mapper: StudentRecordMapper) -> Self {
        self.mapper = mapper;
        self
    }

    #[must_use]
    pub fn with_throttle(mut self, throttle: Arc<dyn Throttle>) -> Self {
        self.throttle = throttle;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionProvider> {
        &self.sessions
    }

    /// Dispatch a caller request. `cancel` is only consulted by class runs.
    pub async fn sync(
        &self,
        target: &SyncTarget,
        triggered_by: Option<&str>,
        cancel: watch::Receiver<bool>,
    ) -> SyncRunSummary {
        match target {
            SyncTarget::Student(student_id) => self.sync_student(student_id, triggered_by).await,
            SyncTarget::Class(class_id) => {
                self.sync_class_with_cancel(class_id, triggered_by, cancel)
                    .await
            }
        }
    }

    #[instrument(skip_all, fields(student_id = %student_id))]
    pub async fn sync_student(
        &self,
        student_id: &str,
        triggered_by: Option<&str>,
    ) -> SyncRunSummary {
        let mut summary = SyncRunSummary::new();
        info!(event = "sync_student_started");

        match self.sessions.current_or_refresh().await {
            Err(err) => {
                warn!(event = "sync_session_unavailable", error = %err);
                summary.fail_run(err.kind(), err.to_string());
            }
            Ok(session) => match self.sync_one(student_id, &session, None).await {
                Ok(synced) => {
                    info!(event = "sync_student_upserted", outcome = ?synced.outcome);
                    summary.record(SyncOutcome::succeeded(student_id));
                }
                Err(err) => self.record_failure(&mut summary, student_id, err).await,
            },
        }

        if self.config.log_student_syncs {
            let target = SyncTarget::Student(student_id.to_string());
            self.append_log(&target, &mut summary, triggered_by).await;
        }

        info!(
            event = "sync_student_finished",
            status = %summary.status,
            processed = summary.records_processed,
            failed = summary.records_failed
        );
        summary
    }

    pub async fn sync_class(&self, class_id: &str, triggered_by: Option<&str>) -> SyncRunSummary {
        let (_never, cancel) = watch::channel(false);
        self.sync_class_with_cancel(class_id, triggered_by, cancel)
            .await
    }

    /// Class run that stops between roster entries once `cancel` turns true.
    /// Students already written stay written.
    #[instrument(skip_all, fields(class_id = %class_id))]
    pub async fn sync_class_with_cancel(
        &self,
        class_id: &str,
        triggered_by: Option<&str>,
        cancel: watch::Receiver<bool>,
    ) -> SyncRunSummary {
        let mut summary = SyncRunSummary::new();
        info!(event = "sync_class_started", triggered_by = triggered_by.unwrap_or("-"));

        if let Err(err) = self.run_class(class_id, &mut summary, &cancel).await {
            warn!(event = "sync_class_aborted", kind = %err.kind(), error = %err);
            summary.fail_run(err.kind(), err.to_string());
        }

        let target = SyncTarget::Class(class_id.to_string());
        self.append_log(&target, &mut summary, triggered_by).await;

        info!(
            event = "sync_class_finished",
            status = %summary.status,
            processed = summary.records_processed,
            failed = summary.records_failed
        );
        summary
    }

    pub async fn sync_logs(&self, query: &SyncLogQuery) -> Result<SyncLogPage, SyncError> {
        self.store.sync_logs(query.clone()).await
    }

    /// Errors returned from here abort the whole run; per-student failures
    /// are recorded into `summary` instead.
    async fn run_class(
        &self,
        class_id: &str,
        summary: &mut SyncRunSummary,
        cancel: &watch::Receiver<bool>,
    ) -> Result<(), SyncError> {
        let session = self.sessions.current_or_refresh().await?;
        let roster = self.gateway.fetch_class_roster(class_id, &session).await?;
        let class = self.store.ensure_class(class_id, (self.clock)()).await?;
        info!(event = "sync_class_roster", students = roster.len(), local_class_id = %class.id);

        let mut metadata_pending = self.config.fill_class_metadata;
        for (index, entry) in roster.iter().enumerate() {
            if index > 0 {
                self.throttle.pause().await;
            }
            if *cancel.borrow() {
                warn!(event = "sync_class_cancelled", completed = index, total = roster.len());
                summary.fail_run(
                    SyncErrorKind::Cancelled,
                    format!("sync cancelled after {index} of {} students", roster.len()),
                );
                return Ok(());
            }

            let session = match self.sessions.current_or_refresh().await {
                Ok(session) => session,
                Err(err) => {
                    warn!(event = "sync_session_unavailable", error = %err);
                    summary.fail_run(err.kind(), err.to_string());
                    return Ok(());
                }
            };

            match self
                .sync_one(&entry.student_id, &session, Some(&class))
                .await
            {
                Ok(synced) => {
                    summary.record(SyncOutcome::succeeded(&entry.student_id));
                    if metadata_pending && !synced.metadata.is_empty() {
                        metadata_pending = false;
                        self.fill_metadata(&class, synced.metadata).await;
                    }
                }
                Err(err) => {
                    self.record_failure(summary, &entry.student_id, err)
                        .await
                }
            }
        }
        Ok(())
    }

    async fn sync_one(
        &self,
        student_id: &str,
        session: &Session,
        class: Option<&LocalClass>,
    ) -> Result<SyncedStudent, SyncError> {
        let detail = self
            .gateway
            .fetch_student_detail(student_id, session)
            .await?;

        let mut record = detail.record.clone();
        record.student_id = student_id.to_string();
        let now = (self.clock)();
        let fields = self.mapper.map(&record, now);

        let outcome = self
            .store
            .upsert_student(fields, class.map(|c| c.id.clone()), now)
            .await?;
        Ok(SyncedStudent {
            outcome,
            metadata: ClassMetadata::from_detail(&detail),
        })
    }

    async fn record_failure(&self, summary: &mut SyncRunSummary, student_id: &str, err: SyncError) {
        let kind = err.kind();
        warn!(event = "sync_student_failed", student_id, kind = %kind, error = %err);
        summary.record(SyncOutcome::failed(student_id, err.to_string()));
        if kind == SyncErrorKind::NotAuthenticated {
            self.sessions.invalidate().await;
            // Service-backed providers log in again for the next entry.
            if !self.sessions.is_service_backed() {
                summary.flag_failure(kind);
            }
        }
    }

    async fn fill_metadata(&self, class: &LocalClass, metadata: ClassMetadata) {
        match self
            .store
            .fill_class_metadata(&class.class_student_id, metadata, (self.clock)())
            .await
        {
            Ok(changed) => info!(event = "sync_class_metadata", changed),
            Err(err) => warn!(event = "sync_class_metadata_failed", error = %err),
        }
    }

    async fn append_log(
        &self,
        target: &SyncTarget,
        summary: &mut SyncRunSummary,
        triggered_by: Option<&str>,
    ) {
        let entry = NewSyncLogEntry::from_summary(target, summary, triggered_by);
        match self.store.append_sync_log(entry, (self.clock)()).await {
            Ok(log) => summary.sync_log_id = Some(log.id),
            Err(err) => {
                warn!(event = "sync_log_append_failed", error = %err);
                summary.errors.push(format!("failed to record sync log: {err}"));
            }
        }
    }
}
