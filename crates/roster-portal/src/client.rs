use crate::config::{PortalConfig, AUTHENTICATE_PATH, CLASS_ROSTER_PATH, STUDENT_DETAIL_PATH};
use crate::error::PortalError;
use crate::gateway::PortalGateway;
use crate::session::{AuthGrant, Authenticator, Credentials, Session};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use reqwest::StatusCode;
use roster_core::{system_clock, Clock, RosterEntry, StudentDetail, StudentDetailResponse};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use tracing::{debug, instrument};

/// HTTP client for the Portal API. Implements both the login and the data
/// endpoints.
#[derive(Clone)]
pub struct PortalClient {
    config: PortalConfig,
    http: reqwest::Client,
    clock: Clock,
}

impl fmt::Debug for PortalClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoginResponse {
    #[serde(rename = "Token", alias = "token")]
    token: Option<String>,
    #[serde(rename = "FullName")]
    full_name: Option<String>,
    #[serde(rename = "IsLogin")]
    is_login: Option<bool>,
    #[serde(rename = "Expire")]
    expire: Option<serde_json::Value>,
    #[serde(rename = "Message")]
    message: Option<String>,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
    #[serde(rename = "type")]
    login_type: u8,
}

impl PortalClient {
    pub fn new(config: PortalConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            config,
            http,
            clock: system_clock(),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    /// `request_timeout` is still applied to every request.
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Clock used to refuse sessions that are already past `expires_at`.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(self.config.endpoint(path))
            .timeout(self.config.request_timeout)
            .header("apikey", &self.config.api_key)
            .header("clientid", &self.config.client_id)
    }

    async fn post_authorized<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        body: serde_json::Value,
        session: &Session,
    ) -> Result<T, PortalError> {
        if session.is_expired_at((self.clock)()) {
            return Err(PortalError::AuthExpired);
        }

        let response = self
            .request(path)
            .bearer_auth(&session.token)
            .json(&body)
            .send()
            .await
            .map_err(|err| PortalError::transport(operation, err))?;
        debug!(event = "portal_response", operation, status = response.status().as_u16());

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(PortalError::AuthExpired);
        }
        let response = Self::ensure_success(response, operation).await?;
        response
            .json::<T>()
            .await
            .map_err(|err| PortalError::transport(operation, err))
    }

    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, PortalError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(PortalError::UpstreamUnavailable {
            operation,
            status: Some(status),
            detail: body,
        })
    }
}

#[async_trait]
impl Authenticator for PortalClient {
    #[instrument(skip_all, fields(username = %credentials.username))]
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthGrant, PortalError> {
        let response = self
            .request(AUTHENTICATE_PATH)
            .json(&LoginRequest {
                username: &credentials.username,
                password: &credentials.password,
                login_type: 0,
            })
            .send()
            .await
            .map_err(|err| PortalError::UpstreamAuth(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(PortalError::UpstreamAuth(format!("status {status}: {body}")));
        }

        let login = response
            .json::<LoginResponse>()
            .await
            .map_err(|err| PortalError::UpstreamAuth(err.to_string()))?;

        let token = login.token.filter(|token| !token.trim().is_empty());
        let token = match (token, login.is_login) {
            (Some(token), Some(true) | None) => token,
            _ => {
                return Err(PortalError::UpstreamAuth(
                    login
                        .message
                        .unwrap_or_else(|| "portal returned no token".to_string()),
                ))
            }
        };

        Ok(AuthGrant {
            token,
            display_name: login.full_name,
            expires_at: login.expire.as_ref().and_then(parse_expire),
        })
    }
}

#[async_trait]
impl PortalGateway for PortalClient {
    #[instrument(skip(self, session))]
    async fn fetch_class_roster(
        &self,
        class_id: &str,
        session: &Session,
    ) -> Result<Vec<RosterEntry>, PortalError> {
        let roster: Option<Vec<RosterEntry>> = self
            .post_authorized(
                "class roster",
                CLASS_ROSTER_PATH,
                json!({ "Id": class_id }),
                session,
            )
            .await?;

        let roster = roster
            .unwrap_or_default()
            .into_iter()
            .filter(|entry| !entry.student_id.is_empty())
            .collect::<Vec<_>>();
        if roster.is_empty() {
            return Err(PortalError::EmptyResult(class_id.to_string()));
        }
        Ok(roster)
    }

    #[instrument(skip(self, session))]
    async fn fetch_student_detail(
        &self,
        student_id: &str,
        session: &Session,
    ) -> Result<StudentDetail, PortalError> {
        let response: StudentDetailResponse = self
            .post_authorized(
                "student detail",
                STUDENT_DETAIL_PATH,
                json!({ "p1": student_id }),
                session,
            )
            .await?;

        let mut records = response.obj1.into_iter();
        let record = records
            .next()
            .ok_or_else(|| PortalError::NotFound(student_id.to_string()))?;
        Ok(StudentDetail {
            record,
            contact: response.obj2.into_iter().next(),
        })
    }
}

/// `Expire` arrives as an ISO string with or without offset, or as epoch
/// milliseconds.
fn parse_expire(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(raw) => {
            let raw = raw.trim();
            DateTime::parse_from_rfc3339(raw)
                .map(|ts| ts.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                        .ok()
                        .map(|naive| Utc.from_utc_datetime(&naive))
                })
        }
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}
