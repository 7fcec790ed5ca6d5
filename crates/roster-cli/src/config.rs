use clap::Args;
use roster_portal::{
    Credentials, PortalConfig, DEFAULT_PORTAL_BASE_URL, DEFAULT_PORTAL_CLIENT_ID,
    DEFAULT_REQUEST_TIMEOUT,
};
use roster_sync::{MapperConfig, DEFAULT_EMAIL_DOMAIN, DEFAULT_SYNC_DELAY};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_STATE_DIR: &str = ".roster";
const DEFAULT_DB_FILE: &str = "roster.db";

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// SQLite database file
    #[arg(long, global = true, default_value = "")]
    pub db: String,
    /// Directory holding the stored Portal session
    #[arg(long, global = true, default_value = "")]
    pub state_dir: String,
    #[arg(long, global = true, default_value = "")]
    pub portal_url: String,
    #[arg(long, global = true)]
    pub timeout_secs: Option<u64>,
    /// Pause between Portal detail calls during a class sync
    #[arg(long, global = true)]
    pub delay_ms: Option<u64>,
    #[arg(long, global = true, default_value_t = false)]
    pub debug: bool,
    #[arg(long, global = true, default_value = "")]
    pub log_dir: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub portal_url: String,
    pub api_key: Option<String>,
    pub client_id: String,
    pub service_credentials: Option<Credentials>,
    pub request_timeout: Duration,
    pub db_path: PathBuf,
    pub state_dir: PathBuf,
    pub sync_delay: Duration,
    pub email_domain: String,
    pub debug: bool,
    pub log_level: Option<String>,
    pub log_dir: String,
}

impl Config {
    pub fn load(args: &GlobalArgs) -> Self {
        Self::resolve(args, env_value)
    }

    /// Flag, then environment, then default.
    pub fn resolve(args: &GlobalArgs, env: impl Fn(&str) -> Option<String>) -> Self {
        let state_dir = PathBuf::from(resolve_string(
            &args.state_dir,
            env("ROSTER_STATE_DIR"),
            DEFAULT_STATE_DIR,
        ));
        let db_path = match flag_or_env(&args.db, env("ROSTER_DB")) {
            Some(path) => PathBuf::from(path),
            None => state_dir.join(DEFAULT_DB_FILE),
        };

        let service_credentials = match (env("PORTAL_USERNAME"), env("PORTAL_PASSWORD")) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)),
            _ => None,
        };

        Config {
            portal_url: resolve_string(
                &args.portal_url,
                env("PORTAL_BASE_URL"),
                DEFAULT_PORTAL_BASE_URL,
            ),
            api_key: env("PORTAL_API_KEY"),
            client_id: env("PORTAL_CLIENT_ID")
                .unwrap_or_else(|| DEFAULT_PORTAL_CLIENT_ID.to_string()),
            service_credentials,
            request_timeout: resolve_u64(args.timeout_secs, env("PORTAL_TIMEOUT_SECS"))
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            db_path,
            state_dir,
            sync_delay: resolve_u64(args.delay_ms, env("ROSTER_SYNC_DELAY_MS"))
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SYNC_DELAY),
            email_domain: env("ROSTER_EMAIL_DOMAIN")
                .unwrap_or_else(|| DEFAULT_EMAIL_DOMAIN.to_string()),
            debug: args.debug || env("ROSTER_DEBUG").is_some_and(|v| is_true(&v)),
            log_level: env("ROSTER_LOG_LEVEL"),
            log_dir: resolve_string(&args.log_dir, env("ROSTER_LOG_DIR"), ""),
        }
    }

    pub fn portal_config(&self) -> anyhow::Result<PortalConfig> {
        let api_key = self
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("PORTAL_API_KEY is not set"))?;
        Ok(PortalConfig::new(api_key)
            .with_base_url(self.portal_url.clone())
            .with_client_id(self.client_id.clone())
            .with_request_timeout(self.request_timeout))
    }

    pub fn mapper_config(&self) -> MapperConfig {
        MapperConfig::default().with_email_domain(self.email_domain.clone())
    }

    pub fn session_file(&self) -> PathBuf {
        self.state_dir.join("portal_session.json")
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn is_true(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn flag_or_env(flag: &str, env: Option<String>) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    env
}

fn resolve_string(flag: &str, env: Option<String>, default: &str) -> String {
    flag_or_env(flag, env).unwrap_or_else(|| default.to_string())
}

fn resolve_u64(flag: Option<u64>, env: Option<String>) -> Option<u64> {
    flag.or_else(|| env.and_then(|value| value.parse().ok()))
}
