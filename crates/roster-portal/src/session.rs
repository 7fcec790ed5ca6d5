use crate::error::PortalError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use roster_core::{system_clock, Clock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What a successful upstream login hands back.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthGrant {
    pub token: String,
    pub display_name: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for AuthGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthGrant")
            .field("token_len", &self.token.len())
            .field("display_name", &self.display_name)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<AuthGrant, PortalError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Lifetime assumed when the Portal does not declare one.
    pub default_lifetime: Duration,
    /// Share of the lifetime during which a session is handed out, in percent.
    pub cache_percent: i32,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            default_lifetime: Duration::hours(2),
            cache_percent: 75,
        }
    }
}

impl SessionPolicy {
    #[must_use]
    pub fn with_default_lifetime(mut self, lifetime: Duration) -> Self {
        self.default_lifetime = lifetime;
        self
    }

    #[must_use]
    pub fn with_cache_percent(mut self, percent: i32) -> Self {
        self.cache_percent = percent.clamp(1, 99);
        self
    }

    pub fn session_from_grant(&self, grant: AuthGrant, now: DateTime<Utc>) -> Session {
        let expires_at = match grant.expires_at {
            Some(declared) if declared > now => declared,
            Some(declared) => {
                warn!(
                    event = "portal_declared_expiry_ignored",
                    declared = %declared
                );
                now + self.default_lifetime
            }
            None => now + self.default_lifetime,
        };
        let window = (expires_at - now) * self.cache_percent.clamp(1, 99) / 100;

        Session {
            token: grant.token,
            issued_at: now,
            expires_at,
            usable_until: now + window,
            display_name: grant.display_name,
        }
    }
}

/// Bearer credential for the upstream Portal.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Cache cutoff, strictly before `expires_at`.
    pub usable_until: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Session {
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        now < self.usable_until && now < self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token_len", &self.token.len())
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("usable_until", &self.usable_until)
            .field("display_name", &self.display_name)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub authenticated: bool,
    pub expired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

enum SessionSource {
    Service(Credentials),
    Interactive,
}

/// Owns the cached Portal session.
///
/// Service-backed providers log in on their own whenever the cache runs out.
/// Interactive providers only hold what a user supplied and report
/// `AuthExpired` once it lapses.
pub struct SessionProvider {
    authenticator: Arc<dyn Authenticator>,
    source: SessionSource,
    policy: SessionPolicy,
    clock: Clock,
    // Held across the upstream login so concurrent refreshes collapse into one.
    cached: Mutex<Option<Session>>,
}

impl SessionProvider {
    pub fn service(authenticator: Arc<dyn Authenticator>, credentials: Credentials) -> Self {
        Self::with_source(authenticator, SessionSource::Service(credentials))
    }

    pub fn interactive(authenticator: Arc<dyn Authenticator>) -> Self {
        Self::with_source(authenticator, SessionSource::Interactive)
    }

    fn with_source(authenticator: Arc<dyn Authenticator>, source: SessionSource) -> Self {
        Self {
            authenticator,
            source,
            policy: SessionPolicy::default(),
            clock: system_clock(),
            cached: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: SessionPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Seed the cache with a previously stored session.
    #[must_use]
    pub fn with_session(mut self, session: Session) -> Self {
        self.cached = Mutex::new(Some(session));
        self
    }

    pub fn is_service_backed(&self) -> bool {
        matches!(self.source, SessionSource::Service(_))
    }

    /// Log in upstream and cache the result. Without explicit credentials the
    /// service credentials are used.
    pub async fn authenticate(
        &self,
        credentials: Option<&Credentials>,
    ) -> Result<Session, PortalError> {
        let credentials = match (credentials, &self.source) {
            (Some(credentials), _) => credentials,
            (None, SessionSource::Service(credentials)) => credentials,
            (None, SessionSource::Interactive) => return Err(PortalError::NotAuthenticated),
        };

        let mut cached = self.cached.lock().await;
        let session = self.login(credentials).await?;
        *cached = Some(session.clone());
        Ok(session)
    }

    /// Cached session while it is inside its window, otherwise a fresh one.
    pub async fn current_or_refresh(&self) -> Result<Session, PortalError> {
        let mut cached = self.cached.lock().await;
        let now = (self.clock)();

        let lapsed = match cached.as_ref() {
            Some(session) if self.hands_out(session, now) => {
                debug!(event = "portal_session_cache_hit");
                return Ok(session.clone());
            }
            Some(session) => {
                warn!(
                    event = "portal_session_lapsed",
                    usable_until = %session.usable_until
                );
                true
            }
            None => false,
        };
        *cached = None;

        match &self.source {
            SessionSource::Service(credentials) => {
                let session = self.login(credentials).await?;
                *cached = Some(session.clone());
                Ok(session)
            }
            SessionSource::Interactive if lapsed => Err(PortalError::AuthExpired),
            SessionSource::Interactive => Err(PortalError::NotAuthenticated),
        }
    }

    /// Service sessions stop at the cache cutoff so a fresh login happens
    /// early. Interactive sessions cannot be renewed and run to `expires_at`.
    fn hands_out(&self, session: &Session, now: DateTime<Utc>) -> bool {
        match self.source {
            SessionSource::Service(_) => session.is_usable_at(now),
            SessionSource::Interactive => !session.is_expired_at(now),
        }
    }

    /// Store a session obtained elsewhere.
    pub async fn install(&self, session: Session) {
        *self.cached.lock().await = Some(session);
    }

    pub async fn current(&self) -> Option<Session> {
        self.cached.lock().await.clone()
    }

    pub async fn invalidate(&self) {
        let dropped = self.cached.lock().await.take().is_some();
        if dropped {
            info!(event = "portal_session_invalidated");
        }
    }

    pub async fn status(&self) -> SessionStatus {
        let now = (self.clock)();
        match self.cached.lock().await.as_ref() {
            Some(session) => SessionStatus {
                authenticated: !session.is_expired_at(now),
                expired: session.is_expired_at(now),
                expires_at: Some(session.expires_at),
                display_name: session.display_name.clone(),
            },
            None => SessionStatus {
                authenticated: false,
                expired: false,
                expires_at: None,
                display_name: None,
            },
        }
    }

    async fn login(&self, credentials: &Credentials) -> Result<Session, PortalError> {
        let grant = self
            .authenticator
            .authenticate(credentials)
            .await
            .map_err(|err| {
                warn!(event = "portal_login_failed", username = %credentials.username, error = %err);
                err
            })?;
        let session = self.policy.session_from_grant(grant, (self.clock)());
        info!(
            event = "portal_login",
            username = %credentials.username,
            token_len = session.token.len(),
            expires_at = %session.expires_at
        );
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    struct CountingAuthenticator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Authenticator for CountingAuthenticator {
        async fn authenticate(&self, credentials: &Credentials) -> Result<AuthGrant, PortalError> {
            if credentials.password != "secret" {
                return Err(PortalError::UpstreamAuth("wrong password".into()));
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(AuthGrant {
                token: format!("token-{n}"),
                display_name: Some("Advisor".into()),
                expires_at: None,
            })
        }
    }

    fn fixed_clock(at: Arc<std::sync::Mutex<DateTime<Utc>>>) -> Clock {
        Arc::new(move || *at.lock().expect("clock lock"))
    }

    #[test]
    fn default_policy_caches_ninety_minutes_of_two_hours() {
        let session = SessionPolicy::default().session_from_grant(
            AuthGrant {
                token: "t".into(),
                display_name: None,
                expires_at: None,
            },
            ts(),
        );
        assert_eq!(session.expires_at, ts() + Duration::hours(2));
        assert_eq!(session.usable_until, ts() + Duration::minutes(90));
        assert!(session.is_usable_at(ts() + Duration::minutes(89)));
        assert!(!session.is_usable_at(ts() + Duration::minutes(90)));
    }

    #[test]
    fn declared_expiry_is_honored_but_cached_shorter() {
        let session = SessionPolicy::default().session_from_grant(
            AuthGrant {
                token: "t".into(),
                display_name: None,
                expires_at: Some(ts() + Duration::hours(1)),
            },
            ts(),
        );
        assert_eq!(session.expires_at, ts() + Duration::hours(1));
        assert_eq!(session.usable_until, ts() + Duration::minutes(45));
    }

    #[test]
    fn debug_never_prints_token() {
        let session = SessionPolicy::default().session_from_grant(
            AuthGrant {
                token: "very-secret-token".into(),
                display_name: None,
                expires_at: None,
            },
            ts(),
        );
        assert!(!format!("{session:?}").contains("very-secret-token"));
    }

    #[tokio::test]
    async fn service_provider_reuses_then_refreshes_once() {
        let now = Arc::new(std::sync::Mutex::new(ts()));
        let authenticator = Arc::new(CountingAuthenticator {
            calls: AtomicUsize::new(0),
        });
        let provider = SessionProvider::service(
            authenticator.clone(),
            Credentials::new("advisor", "secret"),
        )
        .with_clock(fixed_clock(now.clone()));

        let first = provider.current_or_refresh().await.expect("first");
        let second = provider.current_or_refresh().await.expect("second");
        assert_eq!(first, second);
        assert_eq!(authenticator.calls.load(Ordering::SeqCst), 1);

        *now.lock().expect("clock lock") = ts() + Duration::hours(2);
        let third = provider.current_or_refresh().await.expect("third");
        let fourth = provider.current_or_refresh().await.expect("fourth");
        assert_eq!(third.token, "token-2");
        assert_eq!(third, fourth);
        assert_eq!(authenticator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_refresh_is_single_flight() {
        let authenticator = Arc::new(CountingAuthenticator {
            calls: AtomicUsize::new(0),
        });
        let provider = Arc::new(SessionProvider::service(
            authenticator.clone(),
            Credentials::new("advisor", "secret"),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let provider = provider.clone();
            handles.push(tokio::spawn(async move {
                provider.current_or_refresh().await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("session");
        }
        assert_eq!(authenticator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn interactive_provider_needs_a_login() {
        let now = Arc::new(std::sync::Mutex::new(ts()));
        let provider = SessionProvider::interactive(Arc::new(CountingAuthenticator {
            calls: AtomicUsize::new(0),
        }))
        .with_clock(fixed_clock(now.clone()));

        assert!(matches!(
            provider.current_or_refresh().await,
            Err(PortalError::NotAuthenticated)
        ));

        let bad = provider
            .authenticate(Some(&Credentials::new("advisor", "nope")))
            .await;
        assert!(matches!(bad, Err(PortalError::UpstreamAuth(_))));

        let session = provider
            .authenticate(Some(&Credentials::new("advisor", "secret")))
            .await
            .expect("login");
        assert_eq!(session.display_name.as_deref(), Some("Advisor"));
        assert!(provider.status().await.authenticated);

        *now.lock().expect("clock lock") = ts() + Duration::hours(3);
        assert!(matches!(
            provider.current_or_refresh().await,
            Err(PortalError::AuthExpired)
        ));

        let status = provider.status().await;
        assert!(!status.authenticated);
        assert!(status.expired);

        provider.invalidate().await;
        let status = provider.status().await;
        assert!(!status.authenticated);
        assert!(!status.expired);
    }

    #[tokio::test]
    async fn interactive_session_stays_valid_past_cache_cutoff() {
        let now = Arc::new(std::sync::Mutex::new(ts()));
        let authenticator = Arc::new(CountingAuthenticator {
            calls: AtomicUsize::new(0),
        });
        let provider = SessionProvider::interactive(authenticator.clone())
            .with_clock(fixed_clock(now.clone()));
        let session = provider
            .authenticate(Some(&Credentials::new("advisor", "secret")))
            .await
            .expect("login");

        *now.lock().expect("clock lock") = ts() + Duration::minutes(100);
        let status = provider.status().await;
        assert!(status.authenticated);
        assert!(!status.expired);
        assert_eq!(status.expires_at, Some(ts() + Duration::hours(2)));
        assert_eq!(
            provider.current_or_refresh().await.expect("still valid"),
            session
        );
        assert_eq!(authenticator.calls.load(Ordering::SeqCst), 1);

        *now.lock().expect("clock lock") = ts() + Duration::hours(2);
        assert!(provider.status().await.expired);
        assert!(matches!(
            provider.current_or_refresh().await,
            Err(PortalError::AuthExpired)
        ));
    }
}
