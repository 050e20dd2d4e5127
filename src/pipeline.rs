//! Run orchestration: authenticate, fetch the listing, then parse, classify
//! and load every row, keeping score in a [`RunReport`].

use std::collections::HashSet;
use std::time::Duration;

use diesel::SqliteConnection;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::classifier::classify;
use crate::database::mutations::{load, LoadResult};
use crate::database::queries::{self, TableCounts};
use crate::error::{ConfigError, FetchError, PipelineError};
use crate::parser::parse;
use crate::portal::fetcher::{self, FetchOptions};
use crate::portal::session;
use crate::portal::{Authenticator, Credentials, DateRange, PageSource, RawRecord, SessionHandle, SessionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Authenticating,
    Fetching,
    Processing,
    Reporting,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Upper bound for a single portal call.
    pub call_timeout: Duration,
    /// Retries of a listing page after `PortalUnavailable` or a timeout.
    pub max_retries: u32,
    /// Multiplied by the attempt number before each retry.
    pub retry_backoff: Duration,
    /// Stop fetching at the newest stored transaction, unless the run asks
    /// for a range with a start date.
    pub incremental: bool,
    pub force_login: bool,
    pub max_pages: Option<u32>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff: Duration::from_millis(2000),
            incremental: true,
            force_login: false,
            max_pages: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Parse,
    Classify,
    Load,
}

/// One raw row that did not make it into the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub stage: FailureStage,
    pub transaction_id: Option<String>,
    pub raw: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub fetched: usize,
    pub duplicates_in_batch: usize,
    pub parsed_ok: usize,
    pub parse_failed: usize,
    pub classify_failed: usize,
    pub loaded: usize,
    pub skipped_existing: usize,
    pub load_failed: usize,
    pub failures: Vec<RecordFailure>,
    pub table_counts: TableCounts,
}

impl RunReport {
    fn fail(&mut self, stage: FailureStage, raw: &RawRecord, reason: String) {
        warn!(?stage, transaction_id = ?raw.transaction_id(), "record failed: {reason}");
        match stage {
            FailureStage::Parse => self.parse_failed += 1,
            FailureStage::Classify => self.classify_failed += 1,
            FailureStage::Load => self.load_failed += 1,
        }
        self.failures.push(RecordFailure {
            stage,
            transaction_id: raw.transaction_id(),
            raw: raw.audit_text(),
            reason,
        });
    }
}

/// Owns the portal session and the database connection for one run.
///
/// Credentials are only looked at when the cached session is missing, forced
/// out, or expired.
pub struct Pipeline<'c, P: ?Sized> {
    portal: &'c P,
    store: SessionStore,
    credentials: Result<Credentials, ConfigError>,
    conn: &'c mut SqliteConnection,
    options: PipelineOptions,
    stage: Stage,
}

impl<'c, P> Pipeline<'c, P>
where
    P: Authenticator + PageSource + ?Sized,
{
    pub fn new(
        portal: &'c P,
        store: SessionStore,
        credentials: Result<Credentials, ConfigError>,
        conn: &'c mut SqliteConnection,
        options: PipelineOptions,
    ) -> Self {
        Self {
            portal,
            store,
            credentials,
            conn,
            options,
            stage: Stage::Idle,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub async fn run(&mut self, range: DateRange) -> Result<RunReport, PipelineError> {
        match self.drive(range).await {
            Ok(report) => {
                self.enter(Stage::Done);
                info!(
                    fetched = report.fetched,
                    loaded = report.loaded,
                    skipped_existing = report.skipped_existing,
                    failed = report.failures.len(),
                    "run complete"
                );
                Ok(report)
            }
            Err(e) => {
                error!(stage = ?self.stage, "run failed: {e}");
                self.enter(Stage::Failed);
                Err(e)
            }
        }
    }

    fn enter(&mut self, stage: Stage) {
        debug!(from = ?self.stage, to = ?stage, "stage transition");
        self.stage = stage;
    }

    async fn drive(&mut self, range: DateRange) -> Result<RunReport, PipelineError> {
        self.enter(Stage::Authenticating);
        let mut session = self.open_session(!self.options.force_login).await?;
        debug!(origin = ?session.origin(), "portal session ready");

        self.enter(Stage::Fetching);
        // a start date asks for a backfill, which may reach below the newest stored row
        let options = FetchOptions {
            stop_at: if self.options.incremental && range.from.is_none() {
                queries::latest_transaction_id(self.conn)?.map(|id| id.to_string())
            } else {
                None
            },
            max_pages: self.options.max_pages,
        };
        let mut reauthenticated = false;
        let batch = loop {
            let fetched = self.fetch_all(&session, range, options.clone()).await;
            match fetched {
                Ok(batch) => break batch,
                Err(PipelineError::Fetch {
                    source: FetchError::SessionExpired,
                    ..
                }) if !reauthenticated => {
                    warn!("portal session expired, logging in again");
                    self.store.clear()?;
                    self.enter(Stage::Authenticating);
                    session = self.open_session(false).await?;
                    reauthenticated = true;
                    self.enter(Stage::Fetching);
                }
                Err(e) => return Err(e),
            }
        };
        info!(rows = batch.len(), "listing fetched");

        self.enter(Stage::Processing);
        let mut report = self.process(batch);

        self.enter(Stage::Reporting);
        report.table_counts = queries::table_counts(self.conn)?;
        Ok(report)
    }

    async fn open_session(&self, reuse_cached: bool) -> Result<SessionHandle, PipelineError> {
        if reuse_cached {
            if let Some(cached) = session::restore(&self.store) {
                return Ok(cached);
            }
        }
        let credentials = self.credentials.as_ref().map_err(|e| e.clone())?;
        Ok(session::login(self.portal, &self.store, credentials).await?)
    }

    // the whole listing is read before anything is loaded; a restart after
    // session expiry begins again at page one
    async fn fetch_all(
        &self,
        session: &SessionHandle,
        range: DateRange,
        options: FetchOptions,
    ) -> Result<Vec<RawRecord>, PipelineError> {
        let mut records = fetcher::fetch(self.portal, session, range, options);
        let mut batch = Vec::new();
        let mut attempt = 0;
        loop {
            let next = match tokio::time::timeout(self.options.call_timeout, records.next()).await {
                Ok(next) => next,
                Err(_) => Some(Err(FetchError::PortalUnavailable(format!(
                    "no response within {:?}",
                    self.options.call_timeout
                )))),
            };
            match next {
                None => break,
                Some(Ok(record)) => {
                    attempt = 0;
                    batch.push(record);
                }
                Some(Err(FetchError::PortalUnavailable(reason))) if attempt < self.options.max_retries => {
                    attempt += 1;
                    let page = records.pages_read() + 1;
                    warn!(attempt, page, "portal unavailable, retrying: {reason}");
                    tokio::time::sleep(self.options.retry_backoff * attempt).await;
                }
                Some(Err(source)) => {
                    return Err(PipelineError::Fetch {
                        attempts: attempt + 1,
                        source,
                    })
                }
            }
        }
        Ok(batch)
    }

    #[instrument(skip_all, fields(rows = batch.len()))]
    fn process(&mut self, batch: Vec<RawRecord>) -> RunReport {
        let mut report = RunReport {
            fetched: batch.len(),
            ..Default::default()
        };
        let mut seen = HashSet::new();

        for raw in &batch {
            if let Some(id) = raw.transaction_id() {
                if !seen.insert(id.clone()) {
                    warn!(transaction_id = %id, "transaction listed twice, ignoring repeat");
                    report.duplicates_in_batch += 1;
                    continue;
                }
            }

            let parsed = match parse(raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    report.fail(FailureStage::Parse, raw, e.reason.to_string());
                    continue;
                }
            };
            report.parsed_ok += 1;

            let classified = match classify(parsed) {
                Ok(classified) => classified,
                Err(e) => {
                    report.fail(FailureStage::Classify, raw, e.to_string());
                    continue;
                }
            };

            match load(self.conn, &classified.purchase, &classified.details) {
                LoadResult::Inserted => report.loaded += 1,
                LoadResult::Skipped => report.skipped_existing += 1,
                LoadResult::Failed(e) => report.fail(FailureStage::Load, raw, e.reason),
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::connect::test_connection;
    use crate::database::queries::load_purchase;
    use crate::error::AuthError;
    use crate::money::Money;
    use crate::portal::session::Cookie;
    use crate::portal::SessionState;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Accepts (or rejects) every login and serves scripted pages in order,
    /// then empty pages.
    struct FakePortal {
        accept_login: bool,
        logins: AtomicU32,
        pages: Mutex<VecDeque<Result<Vec<RawRecord>, FetchError>>>,
        delay: Option<Duration>,
    }

    impl FakePortal {
        fn new(pages: Vec<Result<Vec<RawRecord>, FetchError>>) -> Self {
            Self {
                accept_login: true,
                logins: AtomicU32::new(0),
                pages: Mutex::new(pages.into()),
                delay: None,
            }
        }

        fn logins(&self) -> u32 {
            self.logins.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Authenticator for FakePortal {
        async fn authenticate(&self, _credentials: &Credentials) -> Result<SessionHandle, AuthError> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            if !self.accept_login {
                return Err(AuthError::Rejected);
            }
            Ok(SessionHandle::logged_in(SessionState::new(vec![Cookie {
                name: "PHPSESSID".into(),
                value: "fake".into(),
            }])))
        }
    }

    #[async_trait]
    impl PageSource for FakePortal {
        async fn fetch_page(
            &self,
            _session: &SessionHandle,
            _range: &DateRange,
            _page: u32,
        ) -> Result<Vec<RawRecord>, FetchError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.pages.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()))
        }
    }

    fn vacuum_row() -> RawRecord {
        RawRecord::new("2024-03-01 14:32:10 | Jane Doe | card ...1234 | $12.50 | V3").with_transaction_id("1001")
    }

    fn multi_bay_row() -> RawRecord {
        RawRecord::new("2024-03-01 15:00:00 | John Roe | card ...0420 | $12.50 | W")
            .with_transaction_id("1002")
            .with_details(["W2 | $5.00", "W4 | $7.50"])
    }

    fn options() -> PipelineOptions {
        PipelineOptions {
            call_timeout: Duration::from_secs(5),
            max_retries: 2,
            retry_backoff: Duration::ZERO,
            ..Default::default()
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            username: "owner".into(),
            password: "secret".into(),
        }
    }

    struct Harness {
        conn: SqliteConnection,
        dir: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                conn: test_connection(),
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn store(&self) -> SessionStore {
            SessionStore::new(self.dir.path().join("session.json"))
        }

        async fn run(&mut self, portal: &FakePortal, options: PipelineOptions) -> (Result<RunReport, PipelineError>, Stage) {
            self.run_with(portal, options, Ok(credentials()), DateRange::all()).await
        }

        async fn run_with(
            &mut self,
            portal: &FakePortal,
            options: PipelineOptions,
            credentials: Result<Credentials, ConfigError>,
            range: DateRange,
        ) -> (Result<RunReport, PipelineError>, Stage) {
            let store = self.store();
            let mut pipeline = Pipeline::new(portal, store, credentials, &mut self.conn, options);
            let res = pipeline.run(range).await;
            (res, pipeline.stage())
        }
    }

    #[tokio::test]
    async fn test_run_loads_vacuum_and_multi_bay() {
        let mut h = Harness::new();
        let portal = FakePortal::new(vec![Ok(vec![vacuum_row(), multi_bay_row()])]);

        let (res, stage) = h.run(&portal, options()).await;
        let report = res.unwrap();
        assert_eq!(stage, Stage::Done);
        assert_eq!(report.fetched, 2);
        assert_eq!(report.parsed_ok, 2);
        assert_eq!(report.loaded, 2);
        assert!(report.failures.is_empty());
        assert_eq!(
            report.table_counts,
            TableCounts {
                purchases: 2,
                vacuum_purchases: 1,
                wash_bay_purchases: 2,
            }
        );

        let stored = load_purchase(&mut h.conn, 1002).unwrap().unwrap();
        assert_eq!(stored.purchase.total_amount, Money::parse("12.50").unwrap());
        assert_eq!(portal.logins(), 1);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let mut h = Harness::new();
        let first = FakePortal::new(vec![Ok(vec![vacuum_row(), multi_bay_row()])]);
        h.run(&first, options()).await.0.unwrap();

        let second = FakePortal::new(vec![Ok(vec![vacuum_row(), multi_bay_row()])]);
        let full = PipelineOptions {
            incremental: false,
            ..options()
        };
        let report = h.run(&second, full).await.0.unwrap();
        assert_eq!(report.loaded, 0);
        assert_eq!(report.skipped_existing, 2);
        assert_eq!(report.table_counts.purchases, 2);
        assert_eq!(report.table_counts.wash_bay_purchases, 2);
        // cached session reused
        assert_eq!(second.logins(), 0);
    }

    #[tokio::test]
    async fn test_incremental_run_stops_at_latest_stored() {
        let mut h = Harness::new();
        let first = FakePortal::new(vec![Ok(vec![vacuum_row()])]);
        h.run(&first, options()).await.0.unwrap();

        let newer = RawRecord::new("2024-03-02 09:00:00 | Ann Poe | card ...9999 | $3.00 | V1").with_transaction_id("1003");
        let second = FakePortal::new(vec![Ok(vec![newer, vacuum_row(), multi_bay_row()])]);
        let report = h.run(&second, options()).await.0.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(report.loaded, 1);
        assert_eq!(report.table_counts.purchases, 2);
    }

    #[tokio::test]
    async fn test_start_date_reaches_below_newest_stored() {
        let mut h = Harness::new();
        let day = |d: &str| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok();
        let newest = || {
            RawRecord::new("2024-03-10 09:00:00 | Ann Poe | card ...9999 | $3.00 | V1").with_transaction_id("1003")
        };

        let recent = FakePortal::new(vec![Ok(vec![newest()])]);
        let range = DateRange::between(day("2024-03-05"), None).unwrap();
        h.run_with(&recent, options(), Ok(credentials()), range).await.0.unwrap();

        let backfill = FakePortal::new(vec![Ok(vec![newest(), vacuum_row()])]);
        let range = DateRange::between(day("2024-03-01"), None).unwrap();
        let report = h.run_with(&backfill, options(), Ok(credentials()), range).await.0.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.loaded, 1);
        assert_eq!(report.skipped_existing, 1);
        assert!(load_purchase(&mut h.conn, 1001).unwrap().is_some());

        // without a start date the listing still stops at the newest stored row
        let plain = FakePortal::new(vec![Ok(vec![newest(), vacuum_row()])]);
        assert_eq!(h.run(&plain, options()).await.0.unwrap().fetched, 0);
    }

    #[tokio::test]
    async fn test_cached_session_needs_no_credentials() {
        let mut h = Harness::new();
        h.store()
            .save(&SessionState::new(vec![Cookie {
                name: "PHPSESSID".into(),
                value: "cached".into(),
            }]))
            .unwrap();
        let missing = ConfigError::MissingField {
            field: "PORTAL_USERNAME",
        };
        let portal = FakePortal::new(vec![Ok(vec![vacuum_row()])]);

        let (res, stage) = h.run_with(&portal, options(), Err(missing), DateRange::all()).await;
        assert_eq!(res.unwrap().loaded, 1);
        assert_eq!(stage, Stage::Done);
        assert_eq!(portal.logins(), 0);
    }

    #[tokio::test]
    async fn test_login_without_credentials_fails_run() {
        let mut h = Harness::new();
        let missing = ConfigError::MissingField {
            field: "PORTAL_PASSWORD",
        };
        let portal = FakePortal::new(vec![Ok(vec![vacuum_row()])]);

        let (res, stage) = h.run_with(&portal, options(), Err(missing.clone()), DateRange::all()).await;
        assert!(matches!(res, Err(PipelineError::Config(e)) if e == missing));
        assert_eq!(stage, Stage::Failed);
        assert_eq!(portal.logins(), 0);
    }

    #[tokio::test]
    async fn test_bad_records_do_not_abort_batch() {
        let mut h = Harness::new();
        let malformed = RawRecord::new("2024-03-01 14:33:10 | Bob | card ...2222 | $abc | V1").with_transaction_id("2001");
        let unbalanced = RawRecord::new("2024-03-01 14:34:10 | Cy | card ...3333 | $12.50 | W")
            .with_transaction_id("2002")
            .with_details(["W2 | $5.00", "W4 | $7.00"]);
        let portal = FakePortal::new(vec![Ok(vec![malformed, vacuum_row(), unbalanced, multi_bay_row()])]);

        let (res, stage) = h.run(&portal, options()).await;
        let report = res.unwrap();
        assert_eq!(stage, Stage::Done);
        assert_eq!(report.fetched, 4);
        assert_eq!(report.parsed_ok, 3);
        assert_eq!(report.parse_failed, 1);
        assert_eq!(report.classify_failed, 1);
        assert_eq!(report.loaded, 2);

        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].stage, FailureStage::Parse);
        assert_eq!(report.failures[0].transaction_id.as_deref(), Some("2001"));
        assert_eq!(report.failures[0].reason, "malformed amount");
        assert!(report.failures[0].raw.contains("$abc"));
        assert_eq!(report.failures[1].stage, FailureStage::Classify);
        assert_eq!(report.failures[1].transaction_id.as_deref(), Some("2002"));
    }

    #[tokio::test]
    async fn test_duplicate_ids_in_batch_are_reported() {
        let mut h = Harness::new();
        let portal = FakePortal::new(vec![Ok(vec![vacuum_row(), vacuum_row()])]);
        let report = h.run(&portal, options()).await.0.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.duplicates_in_batch, 1);
        assert_eq!(report.loaded, 1);
        assert_eq!(report.skipped_existing, 0);
    }

    #[tokio::test]
    async fn test_session_expiry_triggers_one_login() {
        let mut h = Harness::new();
        let portal = FakePortal::new(vec![Err(FetchError::SessionExpired), Ok(vec![vacuum_row()])]);
        let (res, stage) = h.run(&portal, options()).await;
        assert_eq!(res.unwrap().loaded, 1);
        assert_eq!(stage, Stage::Done);
        assert_eq!(portal.logins(), 2);
    }

    #[tokio::test]
    async fn test_session_expired_twice_fails() {
        let mut h = Harness::new();
        let portal = FakePortal::new(vec![Err(FetchError::SessionExpired), Err(FetchError::SessionExpired)]);
        let (res, stage) = h.run(&portal, options()).await;
        assert!(matches!(
            res,
            Err(PipelineError::Fetch {
                source: FetchError::SessionExpired,
                ..
            })
        ));
        assert_eq!(stage, Stage::Failed);
        assert_eq!(portal.logins(), 2);
    }

    #[tokio::test]
    async fn test_portal_unavailable_is_retried() {
        let mut h = Harness::new();
        let down = || Err(FetchError::PortalUnavailable("503".into()));
        let portal = FakePortal::new(vec![down(), down(), Ok(vec![vacuum_row()])]);
        let (res, stage) = h.run(&portal, options()).await;
        assert_eq!(res.unwrap().loaded, 1);
        assert_eq!(stage, Stage::Done);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_run() {
        let mut h = Harness::new();
        let down = || Err(FetchError::PortalUnavailable("503".into()));
        let portal = FakePortal::new(vec![down(), down(), down(), Ok(vec![vacuum_row()])]);
        let (res, stage) = h.run(&portal, options()).await;
        assert!(matches!(res, Err(PipelineError::Fetch { attempts: 3, .. })));
        assert_eq!(stage, Stage::Failed);
        assert_eq!(load_purchase(&mut h.conn, 1001).unwrap(), None);
    }

    #[tokio::test]
    async fn test_slow_portal_times_out() {
        let mut h = Harness::new();
        let mut portal = FakePortal::new(vec![Ok(vec![vacuum_row()])]);
        portal.delay = Some(Duration::from_secs(5));
        let opts = PipelineOptions {
            call_timeout: Duration::from_millis(20),
            max_retries: 0,
            ..options()
        };
        let (res, stage) = h.run(&portal, opts).await;
        assert!(matches!(
            res,
            Err(PipelineError::Fetch {
                attempts: 1,
                source: FetchError::PortalUnavailable(_),
            })
        ));
        assert_eq!(stage, Stage::Failed);
    }

    #[tokio::test]
    async fn test_rejected_login_fails_run() {
        let mut h = Harness::new();
        let mut portal = FakePortal::new(vec![Ok(vec![vacuum_row()])]);
        portal.accept_login = false;
        let (res, stage) = h.run(&portal, options()).await;
        assert!(matches!(res, Err(PipelineError::Auth(AuthError::Rejected))));
        assert_eq!(stage, Stage::Failed);
        assert_eq!(h.store().load(), None);
    }
}
