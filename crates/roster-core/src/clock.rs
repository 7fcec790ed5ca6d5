use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Source of "now" shared by the session cache and the sync engine.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}
