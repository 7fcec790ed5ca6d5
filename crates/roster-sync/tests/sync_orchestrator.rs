use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use roster_core::{
    Clock, RawUpstreamStudent, RosterEntry, StaffFieldsUpdate, StudentContact, StudentDetail,
    SyncErrorKind, SyncLogQuery, SyncStatus, SyncTarget, SyncType,
};
use roster_portal::{
    AuthGrant, Authenticator, Credentials, PortalError, PortalGateway, Session, SessionPolicy,
    SessionProvider,
};
use roster_storage::RosterStore;
use roster_sync::{LocalStore, NoThrottle, SharedStore, SyncConfig, SyncOrchestrator, Throttle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

fn ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0)
        .single()
        .expect("valid timestamp")
}

/// Every read moves time forward by one second.
#[derive(Clone)]
struct TickingClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl TickingClock {
    fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(ts())),
        }
    }

    fn advance(&self, by: Duration) {
        *self.now.lock().expect("clock lock") += by;
    }

    fn clock(&self) -> Clock {
        let now = self.now.clone();
        Arc::new(move || {
            let mut now = now.lock().expect("clock lock");
            *now += Duration::seconds(1);
            *now
        })
    }
}

struct CountingAuthenticator {
    calls: AtomicUsize,
    reject: bool,
}

impl CountingAuthenticator {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authenticator for CountingAuthenticator {
    async fn authenticate(&self, _credentials: &Credentials) -> Result<AuthGrant, PortalError> {
        if self.reject {
            return Err(PortalError::UpstreamAuth("invalid service credentials".into()));
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(AuthGrant {
            token: format!("token-{n}"),
            display_name: None,
            expires_at: None,
        })
    }
}

#[derive(Clone)]
enum Reply {
    Detail(StudentDetail),
    NotFound,
    Unavailable,
    Revoked,
}

#[derive(Default)]
struct ScriptedGateway {
    rosters: Mutex<HashMap<String, Vec<String>>>,
    replies: Mutex<HashMap<String, Reply>>,
    detail_calls: Mutex<Vec<String>>,
}

impl ScriptedGateway {
    fn with_roster(self, class_id: &str, students: &[&str]) -> Self {
        self.rosters.lock().expect("rosters lock").insert(
            class_id.to_string(),
            students.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    fn reply(&self, student_id: &str, reply: Reply) {
        self.replies
            .lock()
            .expect("replies lock")
            .insert(student_id.to_string(), reply);
    }

    fn detail_calls(&self) -> Vec<String> {
        self.detail_calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl PortalGateway for ScriptedGateway {
    async fn fetch_class_roster(
        &self,
        class_id: &str,
        _session: &Session,
    ) -> Result<Vec<RosterEntry>, PortalError> {
        if class_id == "DOWN" {
            return Err(PortalError::UpstreamUnavailable {
                operation: "class roster",
                status: Some(503),
                detail: "maintenance".into(),
            });
        }
        let roster = self
            .rosters
            .lock()
            .expect("rosters lock")
            .get(class_id)
            .cloned()
            .unwrap_or_default();
        if roster.is_empty() {
            return Err(PortalError::EmptyResult(class_id.to_string()));
        }
        Ok(roster
            .into_iter()
            .map(|student_id| RosterEntry {
                student_id,
                student_name: None,
            })
            .collect())
    }

    async fn fetch_student_detail(
        &self,
        student_id: &str,
        _session: &Session,
    ) -> Result<StudentDetail, PortalError> {
        self.detail_calls
            .lock()
            .expect("calls lock")
            .push(student_id.to_string());
        let reply = self
            .replies
            .lock()
            .expect("replies lock")
            .get(student_id)
            .cloned()
            .unwrap_or_else(|| Reply::Detail(detail(student_id, "CQ23CT-PM", Some("0901"))));
        match reply {
            Reply::Detail(detail) => Ok(detail),
            Reply::NotFound => Err(PortalError::NotFound(student_id.to_string())),
            Reply::Unavailable => Err(PortalError::Timeout {
                operation: "student detail",
            }),
            Reply::Revoked => Err(PortalError::AuthExpired),
        }
    }
}

fn detail(student_id: &str, program: &str, mobile: Option<&str>) -> StudentDetail {
    StudentDetail {
        record: RawUpstreamStudent {
            student_id: student_id.to_string(),
            last_name: Some("Nguyen".to_string()),
            first_name: Some("An".to_string()),
            student_name: Some(format!("Nguyen An {student_id}")),
            birthday: Some("15/03/2003".to_string()),
            study_program_id: Some(program.to_string()),
            mobile_phone: mobile.map(str::to_string),
            class_student_name: Some("Cong nghe thong tin K47A".to_string()),
            department_id: Some("CNTT".to_string()),
            department_name: Some("Khoa Cong nghe thong tin".to_string()),
            ..RawUpstreamStudent::default()
        },
        contact: Some(StudentContact {
            student_id: student_id.to_string(),
            professor_id: Some("77".to_string()),
            professor_name: Some("Tran Thi B".to_string()),
            ..StudentContact::default()
        }),
    }
}

#[derive(Default)]
struct CountingThrottle {
    pauses: AtomicUsize,
}

#[async_trait]
impl Throttle for CountingThrottle {
    async fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }
}

/// Requests cancellation on its first pause.
struct CancellingThrottle {
    sender: watch::Sender<bool>,
}

#[async_trait]
impl Throttle for CancellingThrottle {
    async fn pause(&self) {
        let _ = self.sender.send(true);
    }
}

struct Harness {
    orchestrator: SyncOrchestrator,
    store: SharedStore,
    gateway: Arc<ScriptedGateway>,
    authenticator: Arc<CountingAuthenticator>,
    clock: TickingClock,
}

fn harness_with(gateway: ScriptedGateway, reject_login: bool) -> Harness {
    let clock = TickingClock::new();
    let authenticator = Arc::new(CountingAuthenticator {
        calls: AtomicUsize::new(0),
        reject: reject_login,
    });
    let sessions = Arc::new(
        SessionProvider::service(authenticator.clone(), Credentials::new("svc", "pw"))
            .with_clock(clock.clock()),
    );
    let store = SharedStore::new(RosterStore::open_in_memory().expect("open db"));
    let gateway = Arc::new(gateway);
    let orchestrator = SyncOrchestrator::new(sessions, gateway.clone(), Arc::new(store.clone()))
        .with_throttle(Arc::new(NoThrottle))
        .with_clock(clock.clock());

    Harness {
        orchestrator,
        store,
        gateway,
        authenticator,
        clock,
    }
}

fn harness(gateway: ScriptedGateway) -> Harness {
    harness_with(gateway, false)
}

async fn student(store: &SharedStore, id: &str) -> roster_core::LocalStudent {
    let id = id.to_string();
    store
        .call(move |db| db.student(&id))
        .await
        .expect("lookup")
        .expect("student exists")
}

#[tokio::test]
async fn staff_fields_survive_repeated_syncs() {
    let h = harness(ScriptedGateway::default().with_roster("CTK47A", &["s1", "s2"]));
    assert!(h.orchestrator.sync_class("CTK47A", None).await.success);

    h.store
        .call(|db| {
            db.update_staff_fields(
                "s1",
                &StaffFieldsUpdate {
                    custom_phone: Some("0999 888 777".to_string()),
                    temporary_address: Some("KTX khu A".to_string()),
                    permanent_address: Some("Da Lat".to_string()),
                    emergency_contact: Some("Me".to_string()),
                    emergency_phone: Some("0988".to_string()),
                    notes: Some("hoc bong".to_string()),
                },
                ts(),
            )
        })
        .await
        .expect("annotate");
    let before = student(&h.store, "s1").await.staff;

    // Portal drops the phone and changes the program; staff data must not move.
    h.gateway.reply("s1", Reply::Detail(detail("s1", "CQ23CT-MMT", None)));
    for _ in 0..3 {
        let summary = h.orchestrator.sync_class("CTK47A", None).await;
        assert_eq!(summary.records_processed, 2);
    }
    h.orchestrator.sync_student("s1", None).await;

    let after = student(&h.store, "s1").await;
    assert_eq!(after.staff, before);
    assert_eq!(after.portal.portal_phone, None);
    assert_eq!(after.portal.specialty_code.as_deref(), Some("MMT"));
    assert_eq!(after.effective_phone(), Some("0999 888 777"));
}

#[tokio::test]
async fn resync_keeps_portal_fields_and_advances_sync_time() {
    let h = harness(ScriptedGateway::default());

    let first = h.orchestrator.sync_student("2312663", Some("staff-1")).await;
    assert!(first.success);
    assert_eq!(first.records_processed, 1);
    let a = student(&h.store, "2312663").await;

    let second = h.orchestrator.sync_student("2312663", Some("staff-1")).await;
    assert!(second.success);
    let b = student(&h.store, "2312663").await;

    assert!(b.portal.last_synced_at > a.portal.last_synced_at);
    let mut b_portal = b.portal.clone();
    b_portal.last_synced_at = a.portal.last_synced_at;
    assert_eq!(b_portal, a.portal);
    assert_eq!(b.created_at, a.created_at);
}

#[tokio::test]
async fn one_bad_entry_does_not_stop_the_class() {
    let h = harness(ScriptedGateway::default().with_roster("CTK47A", &["s1", "s2", "s3", "s4"]));
    h.gateway.reply("s3", Reply::NotFound);

    let summary = h.orchestrator.sync_class("CTK47A", Some("staff-7")).await;

    assert!(!summary.success);
    assert_eq!(summary.status, SyncStatus::Partial);
    assert_eq!(summary.records_processed, 3);
    assert_eq!(summary.records_failed, 1);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].starts_with("s3: "));
    assert_eq!(summary.failure, None);
    assert_eq!(h.gateway.detail_calls(), vec!["s1", "s2", "s3", "s4"]);

    for id in ["s1", "s2", "s4"] {
        let local = student(&h.store, id).await;
        assert!(local.class_id.is_some());
    }
    let missing = h
        .store
        .call(|db| db.student("s3"))
        .await
        .expect("lookup");
    assert!(missing.is_none());

    let log_id = summary.sync_log_id.clone().expect("log id");
    let log = h
        .store
        .call(move |db| db.sync_log(&log_id))
        .await
        .expect("read log")
        .expect("log exists");
    assert_eq!(log.sync_type, SyncType::ClassSync);
    assert_eq!(log.status, SyncStatus::Partial);
    assert_eq!(log.records_processed, 3);
    assert_eq!(log.records_failed, 1);
    assert_eq!(log.target_class_id.as_deref(), Some("CTK47A"));
    assert_eq!(log.triggered_by.as_deref(), Some("staff-7"));
    assert_eq!(log.errors(), summary.errors);
}

#[tokio::test]
async fn synced_rows_carry_derived_fields() {
    let h = harness(ScriptedGateway::default());
    h.gateway.reply("2312663", Reply::Detail(detail("2312663", "CQ23CT-PM", Some("0901"))));
    h.orchestrator.sync_student("2312663", None).await;

    let local = student(&h.store, "2312663").await;
    assert_eq!(local.portal.school_email, "2312663@dlu.edu.vn");
    assert_eq!(local.portal.specialty_code.as_deref(), Some("PM"));
    assert_eq!(local.portal.specialty_name.as_deref(), Some("Kỹ thuật phần mềm"));
    assert_eq!(
        local.portal.birthday,
        chrono::NaiveDate::from_ymd_opt(2003, 3, 15)
    );
    assert_eq!(local.portal.sync_source, "portal");
    assert!(local.staff.is_empty());
}

#[tokio::test]
async fn empty_roster_fails_without_counts() {
    let h = harness(ScriptedGateway::default());

    let summary = h.orchestrator.sync_class("EMPTY01", None).await;

    assert!(!summary.success);
    assert_eq!(summary.status, SyncStatus::Failed);
    assert_eq!(summary.records_processed, 0);
    assert_eq!(summary.records_failed, 0);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].contains("EMPTY01"));
    assert_eq!(summary.failure, Some(SyncErrorKind::EmptyResult));

    let page = h
        .orchestrator
        .sync_logs(&SyncLogQuery::default())
        .await
        .expect("logs");
    assert_eq!(page.logs.len(), 1);
    assert_eq!(page.logs[0].status, SyncStatus::Failed);
    assert_eq!(page.logs[0].records_processed, 0);
    assert_eq!(page.logs[0].records_failed, 0);

    let class = h
        .store
        .call(|db| db.class_by_code("EMPTY01"))
        .await
        .expect("lookup");
    assert!(class.is_none());
}

#[tokio::test]
async fn unreachable_roster_is_a_run_failure() {
    let h = harness(ScriptedGateway::default());
    let summary = h.orchestrator.sync_class("DOWN", None).await;
    assert_eq!(summary.failure, Some(SyncErrorKind::UpstreamUnavailable));
    assert_eq!(summary.status, SyncStatus::Failed);
    assert!(summary.sync_log_id.is_some());
}

#[tokio::test]
async fn session_is_reused_inside_window_and_renewed_once_after() {
    let h = harness(ScriptedGateway::default());

    h.orchestrator.sync_student("a", None).await;
    h.orchestrator.sync_student("b", None).await;
    assert_eq!(h.authenticator.calls(), 1);

    h.clock.advance(Duration::hours(2));
    h.orchestrator.sync_student("a", None).await;
    h.orchestrator.sync_student("b", None).await;
    assert_eq!(h.authenticator.calls(), 2);
}

#[tokio::test]
async fn rejected_login_is_reported_as_not_authenticated() {
    let h = harness_with(ScriptedGateway::default().with_roster("CTK47A", &["s1"]), true);

    let student = h.orchestrator.sync_student("s1", None).await;
    assert!(student.requires_reauthentication());
    assert_eq!(student.records_failed, 0);

    let class = h.orchestrator.sync_class("CTK47A", None).await;
    assert!(class.requires_reauthentication());
    assert!(!class.success);
    assert!(h.gateway.detail_calls().is_empty());
}

#[tokio::test]
async fn interactive_provider_without_login_fails_fast() {
    let gateway = Arc::new(ScriptedGateway::default());
    let sessions = Arc::new(SessionProvider::interactive(Arc::new(CountingAuthenticator {
        calls: AtomicUsize::new(0),
        reject: false,
    })));
    let store = SharedStore::new(RosterStore::open_in_memory().expect("open db"));
    let orchestrator = SyncOrchestrator::new(sessions, gateway.clone(), Arc::new(store))
        .with_throttle(Arc::new(NoThrottle));

    let summary = orchestrator.sync_student("s1", None).await;
    assert_eq!(summary.failure, Some(SyncErrorKind::NotAuthenticated));
    assert!(gateway.detail_calls().is_empty());
}

#[tokio::test]
async fn revoked_token_mid_run_reauthenticates_for_the_rest() {
    let h = harness(ScriptedGateway::default().with_roster("CTK47A", &["s1", "s2", "s3"]));
    h.gateway.reply("s2", Reply::Revoked);

    let summary = h.orchestrator.sync_class("CTK47A", None).await;

    assert_eq!(summary.records_processed, 2);
    assert_eq!(summary.records_failed, 1);
    assert_eq!(summary.failure, None);
    assert!(!summary.requires_reauthentication());
    assert_eq!(summary.status, SyncStatus::Partial);
    assert!(summary.errors[0].starts_with("s2: "));
    assert_eq!(h.authenticator.calls(), 2);
    assert_eq!(h.gateway.detail_calls(), vec!["s1", "s2", "s3"]);
}

#[tokio::test]
async fn revoked_interactive_token_stops_the_run_and_asks_for_login() {
    let clock = TickingClock::new();
    let authenticator = Arc::new(CountingAuthenticator {
        calls: AtomicUsize::new(0),
        reject: false,
    });
    let session = SessionPolicy::default().session_from_grant(
        AuthGrant {
            token: "user-token".to_string(),
            display_name: Some("Advisor".to_string()),
            expires_at: None,
        },
        ts(),
    );
    let sessions = Arc::new(
        SessionProvider::interactive(authenticator.clone())
            .with_session(session)
            .with_clock(clock.clock()),
    );
    let gateway = Arc::new(
        ScriptedGateway::default().with_roster("CTK47A", &["s1", "s2", "s3"]),
    );
    gateway.reply("s2", Reply::Revoked);
    let store = SharedStore::new(RosterStore::open_in_memory().expect("open db"));
    let orchestrator = SyncOrchestrator::new(sessions.clone(), gateway.clone(), Arc::new(store))
        .with_throttle(Arc::new(NoThrottle))
        .with_clock(clock.clock());

    let summary = orchestrator.sync_class("CTK47A", None).await;

    assert_eq!(summary.records_processed, 1);
    assert_eq!(summary.records_failed, 1);
    assert_eq!(summary.failure, Some(SyncErrorKind::NotAuthenticated));
    assert!(summary.requires_reauthentication());
    assert!(!summary.success);
    assert_eq!(gateway.detail_calls(), vec!["s1", "s2"]);
    assert_eq!(authenticator.calls(), 0);
    assert!(sessions.current().await.is_none());
}

#[tokio::test]
async fn upstream_timeouts_are_per_record() {
    let h = harness(ScriptedGateway::default().with_roster("CTK47A", &["s1", "s2"]));
    h.gateway.reply("s1", Reply::Unavailable);
    h.gateway.reply("s2", Reply::Unavailable);

    let summary = h.orchestrator.sync_class("CTK47A", None).await;
    assert_eq!(summary.status, SyncStatus::Failed);
    assert_eq!(summary.records_failed, 2);
    assert_eq!(summary.failure, None);
    assert!(summary.errors[0].starts_with("s1: "));
    assert!(summary.errors[1].starts_with("s2: "));
}

#[tokio::test]
async fn throttle_runs_between_entries_only() {
    let h = harness(ScriptedGateway::default().with_roster("CTK47A", &["s1", "s2", "s3"]));
    let throttle = Arc::new(CountingThrottle::default());
    let orchestrator = h.orchestrator.with_throttle(throttle.clone());

    orchestrator.sync_class("CTK47A", None).await;
    assert_eq!(throttle.pauses.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cancellation_stops_between_entries_and_keeps_progress() {
    let h = harness(ScriptedGateway::default().with_roster("CTK47A", &["s1", "s2", "s3"]));
    let (sender, cancel) = watch::channel(false);
    let orchestrator = h
        .orchestrator
        .with_throttle(Arc::new(CancellingThrottle { sender }));

    let summary = orchestrator
        .sync(&SyncTarget::Class("CTK47A".into()), None, cancel)
        .await;

    assert_eq!(summary.records_processed, 1);
    assert_eq!(summary.failure, Some(SyncErrorKind::Cancelled));
    assert_eq!(summary.status, SyncStatus::Partial);
    assert_eq!(h.gateway.detail_calls(), vec!["s1"]);
    assert!(h
        .store
        .call(|db| db.student("s1"))
        .await
        .expect("lookup")
        .is_some());
}

#[tokio::test]
async fn class_metadata_is_filled_from_first_student() {
    let h = harness(ScriptedGateway::default().with_roster("CTK47A", &["s1", "s2"]));
    h.orchestrator.sync_class("CTK47A", None).await;

    let class = h
        .store
        .call(|db| db.class_by_code("CTK47A"))
        .await
        .expect("lookup")
        .expect("class created");
    assert_eq!(class.class_name, "Cong nghe thong tin K47A");
    assert_eq!(class.department_id.as_deref(), Some("CNTT"));
    assert_eq!(class.advisor_id.as_deref(), Some("77"));
    assert_eq!(class.advisor_name.as_deref(), Some("Tran Thi B"));

    let class_id = class.id.clone();
    let count = h
        .store
        .call(move |db| db.class_student_count(&class_id))
        .await
        .expect("count");
    assert_eq!(count, 2);
}

#[tokio::test]
async fn student_sync_without_class_keeps_existing_link() {
    let h = harness(ScriptedGateway::default().with_roster("CTK47A", &["s1"]));
    h.orchestrator.sync_class("CTK47A", None).await;
    let linked = student(&h.store, "s1").await.class_id;
    assert!(linked.is_some());

    h.orchestrator.sync_student("s1", None).await;
    assert_eq!(student(&h.store, "s1").await.class_id, linked);
}

#[tokio::test]
async fn student_syncs_are_logged_unless_disabled() {
    let h = harness(ScriptedGateway::default());
    let summary = h
        .orchestrator
        .sync(
            &SyncTarget::student("2312663").expect("target"),
            Some("staff-2"),
            watch::channel(false).1,
        )
        .await;

    let page = h
        .orchestrator
        .sync_logs(&SyncLogQuery {
            sync_type: Some(SyncType::StudentSync),
            ..SyncLogQuery::default()
        })
        .await
        .expect("logs");
    assert_eq!(page.logs.len(), 1);
    assert_eq!(Some(page.logs[0].id.clone()), summary.sync_log_id);
    assert_eq!(page.logs[0].target_student_id.as_deref(), Some("2312663"));

    let quiet = h
        .orchestrator
        .with_config(SyncConfig::default().with_log_student_syncs(false));
    let summary = quiet.sync_student("2312663", None).await;
    assert!(summary.success);
    assert_eq!(summary.sync_log_id, None);
    assert_eq!(
        h.store.call(|db| db.sync_log_count()).await.expect("count"),
        1
    );
}

#[tokio::test]
async fn concurrent_class_runs_share_one_login() {
    let h = harness(ScriptedGateway::default().with_roster("A", &["a1", "a2"]).with_roster("B", &["b1"]));
    let orchestrator = Arc::new(h.orchestrator);

    let (left, right) = tokio::join!(
        orchestrator.sync_class("A", None),
        orchestrator.sync_class("B", None)
    );
    assert!(left.success && right.success);
    assert_eq!(h.authenticator.calls(), 1);

    let page = orchestrator
        .sync_logs(&SyncLogQuery::default())
        .await
        .expect("logs");
    assert_eq!(page.pagination.total, 2);
}

#[tokio::test]
async fn log_listing_is_newest_first() {
    let h = harness(ScriptedGateway::default().with_roster("A", &["a1"]).with_roster("B", &["b1"]));
    h.orchestrator.sync_class("A", None).await;
    h.orchestrator.sync_class("B", None).await;

    let store: &dyn LocalStore = &h.store;
    let page = store
        .sync_logs(SyncLogQuery::default())
        .await
        .expect("logs");
    assert_eq!(page.logs[0].target_class_id.as_deref(), Some("B"));
    assert_eq!(page.logs[1].target_class_id.as_deref(), Some("A"));
    assert_eq!(page.pagination.total_pages, 1);
}
