mod client;
mod config;
mod error;
mod gateway;
mod session;

pub use client::PortalClient;
pub use config::{
    PortalConfig, DEFAULT_PORTAL_BASE_URL, DEFAULT_PORTAL_CLIENT_ID, DEFAULT_REQUEST_TIMEOUT,
};
pub use error::PortalError;
pub use gateway::PortalGateway;
pub use session::{
    AuthGrant, Authenticator, Credentials, Session, SessionPolicy, SessionProvider, SessionStatus,
};
