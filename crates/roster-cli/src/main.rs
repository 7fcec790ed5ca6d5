mod config;
mod logging;
mod state;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use config::{Config, GlobalArgs};
use roster_core::{StaffFieldsUpdate, SyncLogQuery, SyncRunSummary, SyncTarget, SyncType};
use roster_portal::{Credentials, PortalClient, SessionProvider};
use roster_storage::RosterStore;
use roster_sync::{FixedDelay, SharedStore, StudentRecordMapper, SyncOrchestrator};
use serde::Serialize;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Exit status telling scripts to log in to the Portal again.
const EXIT_NOT_AUTHENTICATED: u8 = 3;

#[derive(Parser)]
#[command(name = "roster")]
#[command(about = "Student roster Portal synchronization", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the Portal connection
    Portal {
        #[command(subcommand)]
        action: PortalCommands,
    },
    /// Pull records from the Portal
    Sync {
        #[command(subcommand)]
        target: SyncCommands,
    },
    /// List sync history, newest first
    Logs {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = roster_core::DEFAULT_LOG_PAGE_LIMIT)]
        limit: u32,
        /// class or student
        #[arg(long = "type")]
        sync_type: Option<String>,
    },
    /// Inspect or annotate local students
    Student {
        #[command(subcommand)]
        action: StudentCommands,
    },
    /// Inspect local classes
    Class {
        #[command(subcommand)]
        action: ClassCommands,
    },
}

#[derive(Subcommand)]
enum PortalCommands {
    Login {
        #[arg(long)]
        username: String,
        /// Falls back to PORTAL_PASSWORD
        #[arg(long)]
        password: Option<String>,
    },
    Status,
    Logout,
}

#[derive(Subcommand)]
enum SyncCommands {
    Class {
        class_id: String,
        #[arg(long)]
        triggered_by: Option<String>,
    },
    Student {
        student_id: String,
        #[arg(long)]
        triggered_by: Option<String>,
    },
}

#[derive(Subcommand)]
enum StudentCommands {
    Show {
        student_id: String,
    },
    /// Edit staff-maintained fields. An empty value clears the field.
    Annotate {
        student_id: String,
        #[arg(long)]
        custom_phone: Option<String>,
        #[arg(long)]
        temporary_address: Option<String>,
        #[arg(long)]
        permanent_address: Option<String>,
        #[arg(long)]
        emergency_contact: Option<String>,
        #[arg(long)]
        emergency_phone: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
}

#[derive(Subcommand)]
enum ClassCommands {
    Show {
        class_id: String,
        #[arg(long, default_value_t = false)]
        students: bool,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PortalStatusView {
    mode: &'static str,
    #[serde(flatten)]
    status: roster_portal::SessionStatus,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = Config::load(&cli.global);
    logging::init_logging(&config);

    match run(cli.command, &config).await {
        Ok(code) => code,
        Err(err) => {
            let message = format!("{err:#}");
            error!(event = "roster_error", error = %message);
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: &Config) -> Result<ExitCode> {
    match command {
        Commands::Portal { action } => portal_command(action, config).await,
        Commands::Sync { target } => {
            let (target, triggered_by) = match target {
                SyncCommands::Class {
                    class_id,
                    triggered_by,
                } => (SyncTarget::class(&class_id)?, triggered_by),
                SyncCommands::Student {
                    student_id,
                    triggered_by,
                } => (SyncTarget::student(&student_id)?, triggered_by),
            };
            sync_command(&target, triggered_by.as_deref(), config).await
        }
        Commands::Logs {
            page,
            limit,
            sync_type,
        } => {
            let sync_type = sync_type
                .map(|value| value.parse::<SyncType>())
                .transpose()?;
            let store = open_store(config)?;
            let page = store.sync_logs(&SyncLogQuery {
                page,
                limit,
                sync_type,
            })?;
            print_json(&page)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Student { action } => student_command(action, config),
        Commands::Class { action } => class_command(action, config),
    }
}

async fn portal_command(action: PortalCommands, config: &Config) -> Result<ExitCode> {
    let session_file = config.session_file();
    match action {
        PortalCommands::Login { username, password } => {
            let password = password
                .or_else(|| std::env::var("PORTAL_PASSWORD").ok())
                .context("--password or PORTAL_PASSWORD is required")?;
            let client = Arc::new(PortalClient::new(config.portal_config()?));
            let provider = SessionProvider::interactive(client);

            let session = match provider
                .authenticate(Some(&Credentials::new(username, password)))
                .await
            {
                Ok(session) => session,
                Err(err) => {
                    eprintln!("error: {err}");
                    return Ok(ExitCode::from(EXIT_NOT_AUTHENTICATED));
                }
            };
            state::save_session(&session_file, &session)?;
            info!(event = "portal_session_saved", path = %session_file.display());
            print_json(&PortalStatusView {
                mode: "interactive",
                status: provider.status().await,
            })?;
            Ok(ExitCode::SUCCESS)
        }
        PortalCommands::Status => {
            let (mode, status) = match &config.service_credentials {
                Some(_) => ("service", roster_portal::SessionStatus {
                    authenticated: config.api_key.is_some(),
                    expired: false,
                    expires_at: None,
                    display_name: None,
                }),
                None => {
                    let client = Arc::new(PortalClient::new(config.portal_config()?));
                    let mut provider = SessionProvider::interactive(client);
                    if let Some(session) = state::load_session(&session_file)? {
                        provider = provider.with_session(session);
                    }
                    ("interactive", provider.status().await)
                }
            };
            print_json(&PortalStatusView { mode, status })?;
            Ok(ExitCode::SUCCESS)
        }
        PortalCommands::Logout => {
            let removed = state::clear_session(&session_file)?;
            info!(event = "portal_logout", removed);
            print_json(&serde_json::json!({ "loggedOut": removed }))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn sync_command(
    target: &SyncTarget,
    triggered_by: Option<&str>,
    config: &Config,
) -> Result<ExitCode> {
    let client = Arc::new(PortalClient::new(config.portal_config()?));
    let session_file = config.session_file();

    let sessions = match &config.service_credentials {
        Some(credentials) => SessionProvider::service(client.clone(), credentials.clone()),
        None => {
            let mut provider = SessionProvider::interactive(client.clone());
            if let Some(session) = state::load_session(&session_file)? {
                provider = provider.with_session(session);
            }
            provider
        }
    };

    let store = SharedStore::new(open_store(config)?);
    let orchestrator = SyncOrchestrator::new(Arc::new(sessions), client, Arc::new(store))
        .with_mapper(StudentRecordMapper::new(config.mapper_config()))
        .with_throttle(Arc::new(FixedDelay::new(config.sync_delay)));

    let (cancel_tx, cancel_rx) = watch::channel(false);
    if cancels_on_interrupt(target) {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(event = "sync_interrupt");
                let _ = cancel_tx.send(true);
            }
        });
    }

    let summary = orchestrator.sync(target, triggered_by, cancel_rx).await;
    print_json(&summary)?;
    Ok(finish_sync(&summary, orchestrator.sessions(), &session_file))
}

/// Only class runs check `cancel`; a student sync keeps the default SIGINT.
fn cancels_on_interrupt(target: &SyncTarget) -> bool {
    matches!(target, SyncTarget::Class(_))
}

fn finish_sync(
    summary: &SyncRunSummary,
    sessions: &SessionProvider,
    session_file: &std::path::Path,
) -> ExitCode {
    if summary.requires_reauthentication() {
        if !sessions.is_service_backed() {
            if let Err(err) = state::clear_session(session_file) {
                warn!(event = "portal_session_clear_failed", error = %err);
            }
        }
        eprintln!("Portal connection required: run `roster portal login` and retry.");
        return ExitCode::from(EXIT_NOT_AUTHENTICATED);
    }
    if summary.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn student_command(action: StudentCommands, config: &Config) -> Result<ExitCode> {
    let store = open_store(config)?;
    match action {
        StudentCommands::Show { student_id } => {
            let Some(student) = store.student(&student_id)? else {
                eprintln!("student {student_id} not found");
                return Ok(ExitCode::FAILURE);
            };
            let mut view = serde_json::to_value(&student).context("Failed to encode student")?;
            if let Some(object) = view.as_object_mut() {
                object.insert(
                    "effectivePhone".to_string(),
                    serde_json::json!(student.effective_phone()),
                );
            }
            print_json(&view)?;
            Ok(ExitCode::SUCCESS)
        }
        StudentCommands::Annotate {
            student_id,
            custom_phone,
            temporary_address,
            permanent_address,
            emergency_contact,
            emergency_phone,
            notes,
        } => {
            let update = StaffFieldsUpdate {
                custom_phone,
                temporary_address,
                permanent_address,
                emergency_contact,
                emergency_phone,
                notes,
            };
            let student = store
                .update_staff_fields(&student_id, &update, Utc::now())
                .with_context(|| format!("Failed to annotate student {student_id}"))?;
            print_json(&student)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn class_command(action: ClassCommands, config: &Config) -> Result<ExitCode> {
    let store = open_store(config)?;
    match action {
        ClassCommands::Show { class_id, students } => {
            let Some(class) = store.class_by_code(&class_id)? else {
                eprintln!("class {class_id} not found");
                return Ok(ExitCode::FAILURE);
            };
            let count = store.class_student_count(&class.id)?;
            let mut view = serde_json::to_value(&class).context("Failed to encode class")?;
            if let Some(object) = view.as_object_mut() {
                object.insert("studentCount".to_string(), serde_json::json!(count));
                if students {
                    let members = store.students_in_class(&class.id)?;
                    object.insert(
                        "students".to_string(),
                        serde_json::to_value(members).context("Failed to encode students")?,
                    );
                }
            }
            print_json(&view)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open_store(config: &Config) -> Result<RosterStore> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    RosterStore::open(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{rendered}");
    Ok(())
}
