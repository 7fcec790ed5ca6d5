mod error;
mod mapper;
mod orchestrator;
mod store;
mod throttle;

pub use error::SyncError;
pub use mapper::{
    parse_portal_date, specialty_for, MapperConfig, Specialty, StudentRecordMapper,
    DEFAULT_EMAIL_DOMAIN,
};
pub use orchestrator::{SyncConfig, SyncOrchestrator};
pub use store::{LocalStore, SharedStore};
pub use throttle::{FixedDelay, NoThrottle, Throttle, DEFAULT_SYNC_DELAY};
