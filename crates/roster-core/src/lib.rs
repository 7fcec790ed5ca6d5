pub mod clock;
pub mod student;
pub mod sync;

pub use clock::{system_clock, Clock};
pub use student::{
    ClassMetadata, LocalClass, LocalStudent, PortalStudentFields, RawUpstreamStudent, RosterEntry,
    StaffFields, StaffFieldsUpdate, StudentContact, StudentDetail, StudentDetailResponse,
    PORTAL_OWNED_FIELDS, STAFF_OWNED_FIELDS, SYNC_SOURCE_PORTAL,
};
pub use sync::{
    ContractError, NewSyncLogEntry, Pagination, SyncErrorKind, SyncLogEntry, SyncLogPage,
    SyncLogQuery, SyncOutcome, SyncRunSummary, SyncStatus, SyncTarget, SyncType,
    DEFAULT_LOG_PAGE_LIMIT, MAX_LOG_PAGE_LIMIT,
};
