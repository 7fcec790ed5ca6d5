use roster_core::SyncErrorKind;
use roster_portal::PortalError;
use roster_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Portal(#[from] PortalError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("store lock poisoned")]
    Poisoned,
}

impl SyncError {
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            SyncError::Portal(err) => err.kind(),
            SyncError::Storage(_) | SyncError::Join(_) | SyncError::Poisoned => {
                SyncErrorKind::LocalStore
            }
        }
    }
}
