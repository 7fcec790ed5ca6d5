use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const SYNC_SOURCE_PORTAL: &str = "portal";

/// Column names written by a Portal sync. Must stay disjoint from
/// [`STAFF_OWNED_FIELDS`].
pub const PORTAL_OWNED_FIELDS: &[&str] = &[
    "last_name",
    "first_name",
    "full_name",
    "birthday",
    "birth_place",
    "gender",
    "ethnic_name",
    "religion_name",
    "id_card",
    "file_image",
    "course_id",
    "course_name",
    "department_id",
    "department_name",
    "ology_id",
    "ology_name",
    "class_student_id",
    "study_status_id",
    "study_status_name",
    "study_program_id",
    "specialty_code",
    "specialty_name",
    "enroll_year",
    "portal_phone",
    "portal_email",
    "portal_address",
    "father_name",
    "mother_name",
    "contact_person_name",
    "contact_person_phone",
    "school_email",
    "last_synced_at",
    "sync_source",
];

/// Column names maintained only by departmental staff.
pub const STAFF_OWNED_FIELDS: &[&str] = &[
    "custom_phone",
    "temporary_address",
    "permanent_address",
    "emergency_contact",
    "emergency_phone",
    "notes",
];

/// One row of the Portal class roster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterEntry {
    #[serde(rename = "StudentID", deserialize_with = "deserialize_id")]
    pub student_id: String,
    #[serde(rename = "StudentName", default)]
    pub student_name: Option<String>,
}

/// Student record exactly as the Portal returns it.
///
/// The upstream password hash (`PW`) is deliberately not decoded.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RawUpstreamStudent {
    #[serde(rename = "StudentID", deserialize_with = "deserialize_id")]
    pub student_id: String,
    #[serde(rename = "LastName")]
    pub last_name: Option<String>,
    #[serde(rename = "MiddleName")]
    pub middle_name: Option<String>,
    #[serde(rename = "FirstName")]
    pub first_name: Option<String>,
    #[serde(rename = "StudentName")]
    pub student_name: Option<String>,
    #[serde(rename = "FileImage")]
    pub file_image: Option<String>,
    #[serde(rename = "Birthday")]
    pub birthday: Option<String>,
    #[serde(rename = "BirthPlace")]
    pub birth_place: Option<String>,
    #[serde(rename = "Gender", deserialize_with = "deserialize_opt_bool")]
    pub gender: Option<bool>,
    #[serde(rename = "EthnicName")]
    pub ethnic_name: Option<String>,
    #[serde(rename = "ReligionName")]
    pub religion_name: Option<String>,
    #[serde(rename = "IDCard", deserialize_with = "deserialize_opt_text")]
    pub id_card: Option<String>,
    #[serde(rename = "HomePhone", deserialize_with = "deserialize_opt_text")]
    pub home_phone: Option<String>,
    #[serde(rename = "MobilePhone", deserialize_with = "deserialize_opt_text")]
    pub mobile_phone: Option<String>,
    #[serde(rename = "Email")]
    pub email: Option<String>,
    #[serde(rename = "ContactAddress")]
    pub contact_address: Option<String>,
    #[serde(rename = "FatherName")]
    pub father_name: Option<String>,
    #[serde(rename = "MotherName")]
    pub mother_name: Option<String>,
    #[serde(rename = "ContactPersonName")]
    pub contact_person_name: Option<String>,
    #[serde(rename = "ContactPersonPhone", deserialize_with = "deserialize_opt_text")]
    pub contact_person_phone: Option<String>,
    #[serde(rename = "CourseID", deserialize_with = "deserialize_opt_text")]
    pub course_id: Option<String>,
    #[serde(rename = "CourseName")]
    pub course_name: Option<String>,
    #[serde(rename = "DepartmentID", deserialize_with = "deserialize_opt_text")]
    pub department_id: Option<String>,
    #[serde(rename = "DepartmentName")]
    pub department_name: Option<String>,
    #[serde(rename = "OlogyID", deserialize_with = "deserialize_opt_text")]
    pub ology_id: Option<String>,
    #[serde(rename = "OlogyName")]
    pub ology_name: Option<String>,
    #[serde(rename = "ClassStudentID")]
    pub class_student_id: Option<String>,
    #[serde(rename = "ClassStudentName")]
    pub class_student_name: Option<String>,
    #[serde(rename = "StudyStatusID", deserialize_with = "deserialize_opt_text")]
    pub study_status_id: Option<String>,
    #[serde(rename = "StudyStatusName")]
    pub study_status_name: Option<String>,
    #[serde(rename = "StudyProgramID")]
    pub study_program_id: Option<String>,
    #[serde(rename = "StudyProgramName")]
    pub study_program_name: Option<String>,
    #[serde(rename = "EnrollYear", deserialize_with = "deserialize_opt_i32")]
    pub enroll_year: Option<i32>,
}

/// Advisor/contact block returned next to the student detail.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StudentContact {
    #[serde(rename = "StudentID", deserialize_with = "deserialize_id")]
    pub student_id: String,
    #[serde(rename = "ProfessorID", deserialize_with = "deserialize_opt_text")]
    pub professor_id: Option<String>,
    #[serde(rename = "ProfessorName")]
    pub professor_name: Option<String>,
    #[serde(rename = "Pro_MobilePhone", deserialize_with = "deserialize_opt_text")]
    pub professor_phone: Option<String>,
    #[serde(rename = "Pro_Email")]
    pub professor_email: Option<String>,
    #[serde(rename = "ClassStudentName")]
    pub class_student_name: Option<String>,
}

/// Wire shape of the Portal student-detail endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudentDetailResponse {
    #[serde(default, deserialize_with = "deserialize_null_vec")]
    pub obj1: Vec<RawUpstreamStudent>,
    #[serde(default, deserialize_with = "deserialize_null_vec")]
    pub obj2: Vec<StudentContact>,
}

/// A student detail after the upstream envelope has been unwrapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentDetail {
    pub record: RawUpstreamStudent,
    pub contact: Option<StudentContact>,
}

/// Portal-owned half of a local student. Produced by the mapper and written
/// verbatim on every successful sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortalStudentFields {
    pub student_id: String,
    pub last_name: String,
    pub first_name: String,
    pub full_name: String,
    pub birthday: Option<NaiveDate>,
    pub birth_place: Option<String>,
    pub gender: Option<bool>,
    pub ethnic_name: Option<String>,
    pub religion_name: Option<String>,
    pub id_card: Option<String>,
    pub file_image: Option<String>,
    pub course_id: Option<String>,
    pub course_name: Option<String>,
    pub department_id: Option<String>,
    pub department_name: Option<String>,
    pub ology_id: Option<String>,
    pub ology_name: Option<String>,
    pub class_student_id: Option<String>,
    pub study_status_id: Option<String>,
    pub study_status_name: Option<String>,
    pub study_program_id: Option<String>,
    pub specialty_code: Option<String>,
    pub specialty_name: Option<String>,
    pub enroll_year: Option<i32>,
    pub portal_phone: Option<String>,
    pub portal_email: Option<String>,
    pub portal_address: Option<String>,
    pub father_name: Option<String>,
    pub mother_name: Option<String>,
    pub contact_person_name: Option<String>,
    pub contact_person_phone: Option<String>,
    pub school_email: String,
    pub last_synced_at: DateTime<Utc>,
    pub sync_source: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StaffFields {
    pub custom_phone: Option<String>,
    pub temporary_address: Option<String>,
    pub permanent_address: Option<String>,
    pub emergency_contact: Option<String>,
    pub emergency_phone: Option<String>,
    pub notes: Option<String>,
}

impl StaffFields {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&mut self, update: &StaffFieldsUpdate) {
        let slots = [
            (&mut self.custom_phone, &update.custom_phone),
            (&mut self.temporary_address, &update.temporary_address),
            (&mut self.permanent_address, &update.permanent_address),
            (&mut self.emergency_contact, &update.emergency_contact),
            (&mut self.emergency_phone, &update.emergency_phone),
            (&mut self.notes, &update.notes),
        ];
        for (slot, value) in slots {
            if let Some(value) = value {
                let trimmed = value.trim();
                *slot = if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                };
            }
        }
    }
}

/// Partial edit of staff fields. `Some("")` clears a field, `None` leaves it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaffFieldsUpdate {
    pub custom_phone: Option<String>,
    pub temporary_address: Option<String>,
    pub permanent_address: Option<String>,
    pub emergency_contact: Option<String>,
    pub emergency_phone: Option<String>,
    pub notes: Option<String>,
}

impl StaffFieldsUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalStudent {
    #[serde(flatten)]
    pub portal: PortalStudentFields,
    #[serde(flatten)]
    pub staff: StaffFields,
    pub class_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocalStudent {
    pub fn student_id(&self) -> &str {
        &self.portal.student_id
    }

    /// Phone staff should call: the staff override first, then Portal's.
    pub fn effective_phone(&self) -> Option<&str> {
        self.staff
            .custom_phone
            .as_deref()
            .or(self.portal.portal_phone.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalClass {
    pub id: String,
    pub class_student_id: String,
    pub class_name: String,
    pub department_id: Option<String>,
    pub department_name: Option<String>,
    pub course_id: Option<String>,
    pub course_name: Option<String>,
    pub advisor_id: Option<String>,
    pub advisor_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Class attributes learned during a sync. Only fills columns that are
/// still empty locally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassMetadata {
    pub class_name: Option<String>,
    pub department_id: Option<String>,
    pub department_name: Option<String>,
    pub course_id: Option<String>,
    pub course_name: Option<String>,
    pub advisor_id: Option<String>,
    pub advisor_name: Option<String>,
}

impl ClassMetadata {
    pub fn from_detail(detail: &StudentDetail) -> Self {
        let record = &detail.record;
        let contact = detail.contact.as_ref();
        Self {
            class_name: non_blank(
                record
                    .class_student_name
                    .clone()
                    .or_else(|| contact.and_then(|c| c.class_student_name.clone())),
            ),
            department_id: non_blank(record.department_id.clone()),
            department_name: non_blank(record.department_name.clone()),
            course_id: non_blank(record.course_id.clone()),
            course_name: non_blank(record.course_name.clone()),
            advisor_id: non_blank(contact.and_then(|c| c.professor_id.clone())),
            advisor_name: non_blank(contact.and_then(|c| c.professor_name.clone())),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Deserialize an ID that can be either a string or a number into a String
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val = serde_json::Value::deserialize(deserializer)?;
    match val {
        serde_json::Value::String(s) => Ok(s.trim().to_string()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

fn deserialize_opt_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = serde_json::Value::deserialize(deserializer)?;
    Ok(match val {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn deserialize_opt_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = serde_json::Value::deserialize(deserializer)?;
    Ok(match val {
        serde_json::Value::Bool(b) => Some(b),
        serde_json::Value::Number(n) => n.as_i64().map(|n| n != 0),
        serde_json::Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

fn deserialize_opt_i32<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = serde_json::Value::deserialize(deserializer)?;
    Ok(match val {
        serde_json::Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
        serde_json::Value::String(s) => s.trim().parse::<i32>().ok(),
        _ => None,
    })
}

fn deserialize_null_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
