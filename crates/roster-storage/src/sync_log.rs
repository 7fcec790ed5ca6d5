use crate::{conversion_error, format_timestamp, timestamp_column, RosterStore, StorageError};
use chrono::{DateTime, Utc};
use roster_core::{NewSyncLogEntry, Pagination, SyncLogEntry, SyncLogPage, SyncLogQuery};
use rusqlite::{params, OptionalExtension, Row};

const SYNC_LOG_COLUMNS: &str = "id, sync_type, status, message, records_processed, records_failed, \
     target_class_id, target_student_id, triggered_by, created_at";

impl RosterStore {
    /// Append one audit record. Rows are never updated or deleted afterwards.
    pub fn append_sync_log(
        &self,
        entry: &NewSyncLogEntry,
        now: DateTime<Utc>,
    ) -> Result<SyncLogEntry, StorageError> {
        let record = SyncLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            sync_type: entry.sync_type,
            status: entry.status,
            message: entry.message(),
            records_processed: entry.records_processed,
            records_failed: entry.records_failed,
            target_class_id: entry.target_class_id.clone(),
            target_student_id: entry.target_student_id.clone(),
            triggered_by: entry.triggered_by.clone(),
            created_at: now,
        };

        self.conn.execute(
            "
            INSERT INTO sync_logs (
                id, sync_type, status, message, records_processed, records_failed,
                target_class_id, target_student_id, triggered_by, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                record.id,
                record.sync_type.as_str(),
                record.status.as_str(),
                record.message,
                i64::from(record.records_processed),
                i64::from(record.records_failed),
                record.target_class_id,
                record.target_student_id,
                record.triggered_by,
                format_timestamp(record.created_at),
            ],
        )?;

        Ok(record)
    }

    pub fn sync_log(&self, id: &str) -> Result<Option<SyncLogEntry>, StorageError> {
        let sql = format!("SELECT {SYNC_LOG_COLUMNS} FROM sync_logs WHERE id = ?1");
        let entry = self
            .conn
            .query_row(&sql, [id], sync_log_from_row)
            .optional()?;
        Ok(entry)
    }

    /// Newest first. Ties on `created_at` fall back to insertion order.
    pub fn sync_logs(&self, query: &SyncLogQuery) -> Result<SyncLogPage, StorageError> {
        let query = query.normalized();
        let type_filter = query.sync_type.map(|sync_type| sync_type.as_str());
        let offset = i64::try_from(query.offset())
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        let total: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_logs WHERE ?1 IS NULL OR sync_type = ?1",
            [type_filter],
            |row| row.get(0),
        )?;

        let sql = format!(
            "
            SELECT {SYNC_LOG_COLUMNS}
            FROM sync_logs
            WHERE ?1 IS NULL OR sync_type = ?1
            ORDER BY created_at DESC, seq DESC
            LIMIT ?2 OFFSET ?3
            "
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(
            params![type_filter, i64::from(query.limit), offset],
            sync_log_from_row,
        )?;

        let mut logs = Vec::new();
        for row in rows {
            logs.push(row?);
        }

        Ok(SyncLogPage {
            logs,
            pagination: Pagination::new(query.page, query.limit, total.max(0) as u64),
        })
    }

    pub fn sync_log_count(&self) -> Result<i64, StorageError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM sync_logs", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn sync_log_from_row(row: &Row<'_>) -> rusqlite::Result<SyncLogEntry> {
    let sync_type = row
        .get::<_, String>("sync_type")?
        .parse()
        .map_err(|err| conversion_error("sync_type", err))?;
    let status = row
        .get::<_, String>("status")?
        .parse()
        .map_err(|err| conversion_error("status", err))?;

    Ok(SyncLogEntry {
        id: row.get("id")?,
        sync_type,
        status,
        message: row.get("message")?,
        records_processed: row.get("records_processed")?,
        records_failed: row.get("records_failed")?,
        target_class_id: row.get("target_class_id")?,
        target_student_id: row.get("target_student_id")?,
        triggered_by: row.get("triggered_by")?,
        created_at: timestamp_column(row, "created_at")?,
    })
}
