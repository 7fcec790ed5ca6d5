use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use roster_core::{
    ClassMetadata, LocalClass, LocalStudent, PortalStudentFields, StaffFields, StaffFieldsUpdate,
    PORTAL_OWNED_FIELDS,
};
use rusqlite::{named_params, params, Connection, OptionalExtension, Row};
use std::path::Path;
use thiserror::Error;

mod sync_log;

pub const ROSTER_SCHEMA_VERSION: i64 = 2;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

pub struct RosterStore {
    conn: Connection,
}

impl RosterStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let mut current = self.schema_version()?;
        if current > ROSTER_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: ROSTER_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_roster_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_sync_logs.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 2", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Create the class row for `class_student_id` unless it already exists.
    /// Existing rows are returned untouched.
    pub fn ensure_class(
        &self,
        class_student_id: &str,
        now: DateTime<Utc>,
    ) -> Result<LocalClass, StorageError> {
        let ts = format_timestamp(now);
        self.conn.execute(
            "
            INSERT INTO classes (id, class_student_id, class_name, created_at, updated_at)
            VALUES (?1, ?2, ?2, ?3, ?3)
            ON CONFLICT(class_student_id) DO NOTHING
            ",
            params![uuid::Uuid::new_v4().to_string(), class_student_id, ts],
        )?;

        self.class_by_code(class_student_id)?
            .ok_or_else(|| StorageError::NotFound {
                entity: "class",
                key: class_student_id.to_string(),
            })
    }

    /// Fill class columns that are still empty. The placeholder name (equal to
    /// the class code) counts as empty. Returns whether anything changed.
    pub fn fill_class_metadata(
        &self,
        class_student_id: &str,
        metadata: &ClassMetadata,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        if metadata.is_empty() {
            return Ok(false);
        }

        let changes = self.conn.execute(
            "
            UPDATE classes SET
                class_name = CASE
                    WHEN class_name = class_student_id AND :class_name IS NOT NULL THEN :class_name
                    ELSE class_name
                END,
                department_id = COALESCE(department_id, :department_id),
                department_name = COALESCE(department_name, :department_name),
                course_id = COALESCE(course_id, :course_id),
                course_name = COALESCE(course_name, :course_name),
                advisor_id = COALESCE(advisor_id, :advisor_id),
                advisor_name = COALESCE(advisor_name, :advisor_name),
                updated_at = :updated_at
            WHERE class_student_id = :class_student_id
              AND (
                (class_name = class_student_id AND :class_name IS NOT NULL)
                OR (department_id IS NULL AND :department_id IS NOT NULL)
                OR (department_name IS NULL AND :department_name IS NOT NULL)
                OR (course_id IS NULL AND :course_id IS NOT NULL)
                OR (course_name IS NULL AND :course_name IS NOT NULL)
                OR (advisor_id IS NULL AND :advisor_id IS NOT NULL)
                OR (advisor_name IS NULL AND :advisor_name IS NOT NULL)
              )
            ",
            named_params! {
                ":class_name": metadata.class_name,
                ":department_id": metadata.department_id,
                ":department_name": metadata.department_name,
                ":course_id": metadata.course_id,
                ":course_name": metadata.course_name,
                ":advisor_id": metadata.advisor_id,
                ":advisor_name": metadata.advisor_name,
                ":updated_at": format_timestamp(now),
                ":class_student_id": class_student_id,
            },
        )?;

        Ok(changes > 0)
    }

    pub fn class_by_code(&self, class_student_id: &str) -> Result<Option<LocalClass>, StorageError> {
        let class = self
            .conn
            .query_row(
                "
                SELECT id, class_student_id, class_name, department_id, department_name,
                       course_id, course_name, advisor_id, advisor_name, created_at, updated_at
                FROM classes
                WHERE class_student_id = ?1
                ",
                [class_student_id],
                class_from_row,
            )
            .optional()?;
        Ok(class)
    }

    pub fn class_student_count(&self, class_id: &str) -> Result<i64, StorageError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM students WHERE class_id = ?1",
            [class_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Write the Portal-owned columns of one student.
    ///
    /// A new row starts with empty staff fields. An existing row keeps every
    /// staff field, and keeps its class link when `class_id` is `None`.
    pub fn upsert_student_portal_fields(
        &self,
        fields: &PortalStudentFields,
        class_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StorageError> {
        let existed = self.has_student(&fields.student_id)?;
        let ts = format_timestamp(now);

        self.conn.execute(
            &student_upsert_sql(),
            named_params! {
                ":student_id": fields.student_id,
                ":last_name": fields.last_name,
                ":first_name": fields.first_name,
                ":full_name": fields.full_name,
                ":birthday": fields.birthday.map(format_date),
                ":birth_place": fields.birth_place,
                ":gender": fields.gender,
                ":ethnic_name": fields.ethnic_name,
                ":religion_name": fields.religion_name,
                ":id_card": fields.id_card,
                ":file_image": fields.file_image,
                ":course_id": fields.course_id,
                ":course_name": fields.course_name,
                ":department_id": fields.department_id,
                ":department_name": fields.department_name,
                ":ology_id": fields.ology_id,
                ":ology_name": fields.ology_name,
                ":class_student_id": fields.class_student_id,
                ":study_status_id": fields.study_status_id,
                ":study_status_name": fields.study_status_name,
                ":study_program_id": fields.study_program_id,
                ":specialty_code": fields.specialty_code,
                ":specialty_name": fields.specialty_name,
                ":enroll_year": fields.enroll_year,
                ":portal_phone": fields.portal_phone,
                ":portal_email": fields.portal_email,
                ":portal_address": fields.portal_address,
                ":father_name": fields.father_name,
                ":mother_name": fields.mother_name,
                ":contact_person_name": fields.contact_person_name,
                ":contact_person_phone": fields.contact_person_phone,
                ":school_email": fields.school_email,
                ":last_synced_at": format_timestamp(fields.last_synced_at),
                ":sync_source": fields.sync_source,
                ":class_id": class_id,
                ":now": ts,
            },
        )?;

        Ok(if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Created
        })
    }

    /// Staff edit path. Never called by sync.
    pub fn update_staff_fields(
        &self,
        student_id: &str,
        update: &StaffFieldsUpdate,
        now: DateTime<Utc>,
    ) -> Result<LocalStudent, StorageError> {
        let mut student = self.student(student_id)?.ok_or_else(|| StorageError::NotFound {
            entity: "student",
            key: student_id.to_string(),
        })?;
        if update.is_empty() {
            return Ok(student);
        }
        student.staff.apply(update);

        self.conn.execute(
            "
            UPDATE students SET
                custom_phone = :custom_phone,
                temporary_address = :temporary_address,
                permanent_address = :permanent_address,
                emergency_contact = :emergency_contact,
                emergency_phone = :emergency_phone,
                notes = :notes,
                updated_at = :updated_at
            WHERE student_id = :student_id
            ",
            named_params! {
                ":custom_phone": student.staff.custom_phone,
                ":temporary_address": student.staff.temporary_address,
                ":permanent_address": student.staff.permanent_address,
                ":emergency_contact": student.staff.emergency_contact,
                ":emergency_phone": student.staff.emergency_phone,
                ":notes": student.staff.notes,
                ":updated_at": format_timestamp(now),
                ":student_id": student_id,
            },
        )?;
        student.updated_at = now;
        Ok(student)
    }

    pub fn has_student(&self, student_id: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM students WHERE student_id = ?1 LIMIT 1",
                [student_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }

    pub fn student(&self, student_id: &str) -> Result<Option<LocalStudent>, StorageError> {
        let sql = format!("SELECT {} FROM students WHERE student_id = ?1", student_columns());
        let student = self
            .conn
            .query_row(&sql, [student_id], student_from_row)
            .optional()?;
        Ok(student)
    }

    pub fn students_in_class(&self, class_id: &str) -> Result<Vec<LocalStudent>, StorageError> {
        let sql = format!(
            "SELECT {} FROM students WHERE class_id = ?1 ORDER BY student_id ASC",
            student_columns()
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map([class_id], student_from_row)?;

        let mut students = Vec::new();
        for row in rows {
            students.push(row?);
        }
        Ok(students)
    }

    pub fn student_count(&self) -> Result<i64, StorageError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM students", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 LIMIT 1",
                [table_name],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }
}

fn student_upsert_sql() -> String {
    let mut columns = vec!["student_id"];
    columns.extend_from_slice(PORTAL_OWNED_FIELDS);
    columns.extend_from_slice(&["class_id", "created_at", "updated_at"]);

    let values = columns
        .iter()
        .map(|column| match *column {
            "created_at" | "updated_at" => ":now".to_string(),
            other => format!(":{other}"),
        })
        .collect::<Vec<_>>();

    let mut assignments = PORTAL_OWNED_FIELDS
        .iter()
        .map(|column| format!("{column} = excluded.{column}"))
        .collect::<Vec<_>>();
    assignments.push("class_id = COALESCE(excluded.class_id, students.class_id)".to_string());
    assignments.push("updated_at = excluded.updated_at".to_string());

    format!(
        "INSERT INTO students ({}) VALUES ({}) ON CONFLICT(student_id) DO UPDATE SET {}",
        columns.join(", "),
        values.join(", "),
        assignments.join(", ")
    )
}

fn student_columns() -> String {
    let mut columns = vec!["student_id"];
    columns.extend_from_slice(PORTAL_OWNED_FIELDS);
    columns.extend_from_slice(roster_core::STAFF_OWNED_FIELDS);
    columns.extend_from_slice(&["class_id", "created_at", "updated_at"]);
    columns.join(", ")
}

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<LocalStudent> {
    let birthday = row
        .get::<_, Option<String>>("birthday")?
        .map(|value| {
            NaiveDate::parse_from_str(&value, "%Y-%m-%d")
                .map_err(|err| conversion_error("birthday", err))
        })
        .transpose()?;

    let portal = PortalStudentFields {
        student_id: row.get("student_id")?,
        last_name: row.get("last_name")?,
        first_name: row.get("first_name")?,
        full_name: row.get("full_name")?,
        birthday,
        birth_place: row.get("birth_place")?,
        gender: row.get("gender")?,
        ethnic_name: row.get("ethnic_name")?,
        religion_name: row.get("religion_name")?,
        id_card: row.get("id_card")?,
        file_image: row.get("file_image")?,
        course_id: row.get("course_id")?,
        course_name: row.get("course_name")?,
        department_id: row.get("department_id")?,
        department_name: row.get("department_name")?,
        ology_id: row.get("ology_id")?,
        ology_name: row.get("ology_name")?,
        class_student_id: row.get("class_student_id")?,
        study_status_id: row.get("study_status_id")?,
        study_status_name: row.get("study_status_name")?,
        study_program_id: row.get("study_program_id")?,
        specialty_code: row.get("specialty_code")?,
        specialty_name: row.get("specialty_name")?,
        enroll_year: row.get("enroll_year")?,
        portal_phone: row.get("portal_phone")?,
        portal_email: row.get("portal_email")?,
        portal_address: row.get("portal_address")?,
        father_name: row.get("father_name")?,
        mother_name: row.get("mother_name")?,
        contact_person_name: row.get("contact_person_name")?,
        contact_person_phone: row.get("contact_person_phone")?,
        school_email: row.get("school_email")?,
        last_synced_at: timestamp_column(row, "last_synced_at")?,
        sync_source: row.get("sync_source")?,
    };

    let staff = StaffFields {
        custom_phone: row.get("custom_phone")?,
        temporary_address: row.get("temporary_address")?,
        permanent_address: row.get("permanent_address")?,
        emergency_contact: row.get("emergency_contact")?,
        emergency_phone: row.get("emergency_phone")?,
        notes: row.get("notes")?,
    };

    Ok(LocalStudent {
        portal,
        staff,
        class_id: row.get("class_id")?,
        created_at: timestamp_column(row, "created_at")?,
        updated_at: timestamp_column(row, "updated_at")?,
    })
}

fn class_from_row(row: &Row<'_>) -> rusqlite::Result<LocalClass> {
    Ok(LocalClass {
        id: row.get(0)?,
        class_student_id: row.get(1)?,
        class_name: row.get(2)?,
        department_id: row.get(3)?,
        department_name: row.get(4)?,
        course_id: row.get(5)?,
        course_name: row.get(6)?,
        advisor_id: row.get(7)?,
        advisor_name: row.get(8)?,
        created_at: timestamp_column(row, "created_at")?,
        updated_at: timestamp_column(row, "updated_at")?,
    })
}

pub(crate) fn timestamp_column(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    parse_timestamp(row.get::<_, String>(column)?).map_err(|err| conversion_error(column, err))
}

pub(crate) fn conversion_error(
    column: &str,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{column}: {err}"),
        )),
    )
}

pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}
