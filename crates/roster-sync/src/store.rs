use crate::error::SyncError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roster_core::{
    ClassMetadata, LocalClass, NewSyncLogEntry, PortalStudentFields, SyncLogEntry, SyncLogPage,
    SyncLogQuery,
};
use roster_storage::{RosterStore, StorageError, UpsertOutcome};
use std::sync::{Arc, Mutex};

/// Persistence operations the orchestrator needs.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn ensure_class(
        &self,
        class_student_id: &str,
        now: DateTime<Utc>,
    ) -> Result<LocalClass, SyncError>;

    async fn fill_class_metadata(
        &self,
        class_student_id: &str,
        metadata: ClassMetadata,
        now: DateTime<Utc>,
    ) -> Result<bool, SyncError>;

    /// Write Portal-owned columns only. `class_id = None` keeps the current link.
    async fn upsert_student(
        &self,
        fields: PortalStudentFields,
        class_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, SyncError>;

    async fn append_sync_log(
        &self,
        entry: NewSyncLogEntry,
        now: DateTime<Utc>,
    ) -> Result<SyncLogEntry, SyncError>;

    async fn sync_logs(&self, query: SyncLogQuery) -> Result<SyncLogPage, SyncError>;
}

/// [`RosterStore`] behind a mutex, driven from blocking tasks.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<RosterStore>>,
}

impl SharedStore {
    pub fn new(store: RosterStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Run `f` against the store on the blocking pool.
    pub async fn call<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&RosterStore) -> Result<T, StorageError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let store = inner.lock().map_err(|_| SyncError::Poisoned)?;
            f(&store).map_err(SyncError::from)
        })
        .await?
    }
}

#[async_trait]
impl LocalStore for SharedStore {
    async fn ensure_class(
        &self,
        class_student_id: &str,
        now: DateTime<Utc>,
    ) -> Result<LocalClass, SyncError> {
        let code = class_student_id.to_string();
        self.call(move |store| store.ensure_class(&code, now)).await
    }

    async fn fill_class_metadata(
        &self,
        class_student_id: &str,
        metadata: ClassMetadata,
        now: DateTime<Utc>,
    ) -> Result<bool, SyncError> {
        let code = class_student_id.to_string();
        self.call(move |store| store.fill_class_metadata(&code, &metadata, now))
            .await
    }

    async fn upsert_student(
        &self,
        fields: PortalStudentFields,
        class_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, SyncError> {
        self.call(move |store| {
            store.upsert_student_portal_fields(&fields, class_id.as_deref(), now)
        })
        .await
    }

    async fn append_sync_log(
        &self,
        entry: NewSyncLogEntry,
        now: DateTime<Utc>,
    ) -> Result<SyncLogEntry, SyncError> {
        self.call(move |store| store.append_sync_log(&entry, now))
            .await
    }

    async fn sync_logs(&self, query: SyncLogQuery) -> Result<SyncLogPage, SyncError> {
        self.call(move |store| store.sync_logs(&query)).await
    }
}
