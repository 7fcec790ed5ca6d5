use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use roster_core::{PortalStudentFields, RawUpstreamStudent, SYNC_SOURCE_PORTAL};

pub const DEFAULT_EMAIL_DOMAIN: &str = "dlu.edu.vn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Specialty {
    pub code: &'static str,
    pub name: &'static str,
}

const SPECIALTIES: &[Specialty] = &[
    Specialty {
        code: "PM",
        name: "Kỹ thuật phần mềm",
    },
    Specialty {
        code: "MMT",
        name: "Mạng máy tính và truyền thông",
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapperConfig {
    pub email_domain: String,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            email_domain: DEFAULT_EMAIL_DOMAIN.to_string(),
        }
    }
}

impl MapperConfig {
    #[must_use]
    pub fn with_email_domain(mut self, domain: impl Into<String>) -> Self {
        self.email_domain = domain.into();
        self
    }
}

/// Turns one Portal record into the Portal-owned half of a local student.
/// Never fails: anything unparseable becomes `None`.
#[derive(Debug, Clone, Default)]
pub struct StudentRecordMapper {
    config: MapperConfig,
}

impl StudentRecordMapper {
    pub fn new(config: MapperConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    pub fn map(&self, raw: &RawUpstreamStudent, now: DateTime<Utc>) -> PortalStudentFields {
        let student_id = raw.student_id.trim().to_string();
        let study_program_id = clean(&raw.study_program_id);
        let specialty = specialty_for(study_program_id.as_deref());

        PortalStudentFields {
            school_email: self.school_email(&student_id),
            last_name: clean(&raw.last_name).unwrap_or_default(),
            first_name: clean(&raw.first_name).unwrap_or_default(),
            full_name: full_name(raw),
            birthday: parse_portal_date(raw.birthday.as_deref()),
            birth_place: clean(&raw.birth_place),
            gender: raw.gender,
            ethnic_name: clean(&raw.ethnic_name),
            religion_name: clean(&raw.religion_name),
            id_card: clean(&raw.id_card),
            file_image: clean(&raw.file_image),
            course_id: clean(&raw.course_id),
            course_name: clean(&raw.course_name),
            department_id: clean(&raw.department_id),
            department_name: clean(&raw.department_name),
            ology_id: clean(&raw.ology_id),
            ology_name: clean(&raw.ology_name),
            class_student_id: clean(&raw.class_student_id),
            study_status_id: clean(&raw.study_status_id),
            study_status_name: clean(&raw.study_status_name),
            study_program_id,
            specialty_code: specialty.map(|s| s.code.to_string()),
            specialty_name: specialty.map(|s| s.name.to_string()),
            enroll_year: raw.enroll_year,
            portal_phone: clean(&raw.mobile_phone).or_else(|| clean(&raw.home_phone)),
            portal_email: clean(&raw.email),
            portal_address: clean(&raw.contact_address),
            father_name: clean(&raw.father_name),
            mother_name: clean(&raw.mother_name),
            contact_person_name: clean(&raw.contact_person_name),
            contact_person_phone: clean(&raw.contact_person_phone),
            last_synced_at: now,
            sync_source: SYNC_SOURCE_PORTAL.to_string(),
            student_id,
        }
    }

    pub fn school_email(&self, student_id: &str) -> String {
        format!("{}@{}", student_id.trim(), self.config.email_domain)
    }
}

/// Specialty encoded as the `-CODE` suffix of a study program id.
pub fn specialty_for(study_program_id: Option<&str>) -> Option<&'static Specialty> {
    let program = study_program_id?.trim();
    SPECIALTIES
        .iter()
        .find(|specialty| program.ends_with(&format!("-{}", specialty.code)))
}

/// Portal dates come as `DD/MM/YYYY` or ISO-8601.
pub fn parse_portal_date(raw: Option<&str>) -> Option<NaiveDate> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }

    let parts = raw.split('/').collect::<Vec<_>>();
    if let [day, month, year] = parts.as_slice() {
        let day = day.trim().parse::<u32>().ok()?;
        let month = month.trim().parse::<u32>().ok()?;
        let year = year.trim().parse::<i32>().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|ts| ts.date_naive())
        })
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|ts| ts.date())
        })
}

fn full_name(raw: &RawUpstreamStudent) -> String {
    if let Some(name) = clean(&raw.student_name) {
        return name;
    }
    [&raw.last_name, &raw.middle_name, &raw.first_name]
        .into_iter()
        .filter_map(clean)
        .collect::<Vec<_>>()
        .join(" ")
}

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
