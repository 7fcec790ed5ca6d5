use std::fmt;
use std::time::Duration;

pub const DEFAULT_PORTAL_BASE_URL: &str = "https://portal-api.dlu.edu.vn/api";
pub const DEFAULT_PORTAL_CLIENT_ID: &str = "vhu";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) const AUTHENTICATE_PATH: &str = "/authenticate/authpsc";
pub(crate) const CLASS_ROSTER_PATH: &str = "/professor/GetStudentInClassCVHT";
pub(crate) const STUDENT_DETAIL_PATH: &str = "/professor/StudentInfo";

/// Connection settings for the upstream Portal.
///
/// The API key is the only required value; everything else has a default.
#[derive(Clone)]
pub struct PortalConfig {
    pub base_url: String,
    pub api_key: String,
    pub client_id: String,
    pub request_timeout: Duration,
}

impl PortalConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_PORTAL_BASE_URL.to_string(),
            api_key: api_key.into(),
            client_id: DEFAULT_PORTAL_CLIENT_ID.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

impl fmt::Debug for PortalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("client_id", &self.client_id)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}
