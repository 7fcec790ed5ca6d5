use crate::error::PortalError;
use crate::session::Session;
use async_trait::async_trait;
use roster_core::{RosterEntry, StudentDetail};

/// Typed access to the two Portal data endpoints. Implementations do not retry.
#[async_trait]
pub trait PortalGateway: Send + Sync {
    /// Students of one class in Portal order. An empty roster is
    /// [`PortalError::EmptyResult`].
    async fn fetch_class_roster(
        &self,
        class_id: &str,
        session: &Session,
    ) -> Result<Vec<RosterEntry>, PortalError>;

    /// One student record. An empty result set is [`PortalError::NotFound`].
    async fn fetch_student_detail(
        &self,
        student_id: &str,
        session: &Session,
    ) -> Result<StudentDetail, PortalError>;
}
