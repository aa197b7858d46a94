//! NCMEC reporter.
//!
//! Two independent scheduling units share this component. The build loop
//! fans one csam-tagged email out into one report row per uploader group.
//! The file loop performs the two-phase submission: open the report (which
//! persists the authority-assigned id) and then finish it. Persisting the id
//! between the calls is what makes a crash in the middle safe: the next tick
//! resumes with the existing id instead of opening a second report.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sea_orm::{DatabaseConnection, Set};
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::accounts::{UploadInfo, UploadInfoApi};
use crate::db::entities::{email, report};
use crate::db::{email_repo, report_repo, LockClient, LockError, RESOURCE_EMAILS, RESOURCE_REPORTS};
use crate::error::{compose_unlock, Result, ScannerError};
use crate::worker::{spawn_ticker, WorkerHandle};

use super::ncmec::{
    AuthorityApi, IncidentSummary, InternetDetails, IpCaptureEvent, NcmecCredentials,
    NcmecError, NcmecPerson, NcmecReporter, Report, ReportedPerson, WebPageIncident,
    NCMEC_INCIDENT_TYPE, NCMEC_STATUS_OK,
};

/// Frequency with which abuse emails are converted into report rows.
const REPORT_BUILD_FREQUENCY: Duration = Duration::from_secs(40);

/// Frequency with which unfiled reports are filed.
const REPORT_FILE_FREQUENCY: Duration = Duration::from_secs(45);

/// Group key for uploads we have no uploader information for.
const ANON_USER: &str = "anon";

/// Periodically scans for csam-tagged emails, converts them into NCMEC
/// reports and files those with NCMEC.
pub struct Reporter {
    db: DatabaseConnection,
    locks: LockClient,
    accounts: Arc<dyn UploadInfoApi>,
    authority: Arc<dyn AuthorityApi>,
    portal_url: String,
    identity: NcmecReporter,
    debug: bool,
}

impl Reporter {
    pub fn new(
        db: DatabaseConnection,
        locks: LockClient,
        accounts: Arc<dyn UploadInfoApi>,
        authority: Arc<dyn AuthorityApi>,
        credentials: &NcmecCredentials,
        portal_url: String,
        identity: NcmecReporter,
    ) -> Self {
        Self {
            db,
            locks,
            accounts,
            authority,
            portal_url,
            identity,
            debug: credentials.debug,
        }
    }

    /// Checks the authority is reachable, then starts the build and file
    /// units.
    pub async fn start(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<WorkerHandle>> {
        let status = self.authority.status().await?;
        if status.response_code != NCMEC_STATUS_OK {
            return Err(NcmecError::ResponseCode(status.response_code).into());
        }

        let builder = Arc::clone(&self);
        let build_handle = spawn_ticker(
            "reporter-build",
            REPORT_BUILD_FREQUENCY,
            shutdown.clone(),
            move || {
                let reporter = Arc::clone(&builder);
                async move { reporter.build_reports().await }
            },
        );

        let filer = Arc::clone(&self);
        let file_handle = spawn_ticker(
            "reporter-file",
            REPORT_FILE_FREQUENCY,
            shutdown,
            move || {
                let reporter = Arc::clone(&filer);
                async move { reporter.file_reports().await }
            },
        );

        Ok(vec![build_handle, file_handle])
    }

    /// Build loop tick: convert every unreported csam email into report
    /// rows.
    pub async fn build_reports(&self) {
        let to_report = match email_repo::find_unreported(&self.db).await {
            Ok(emails) => emails,
            Err(err) => {
                error!("Failed fetching unreported emails, error {}", err);
                return;
            }
        };

        if to_report.is_empty() {
            debug!("Found 0 unreported abuse emails");
            return;
        }
        info!("Found {} unreported abuse emails", to_report.len());

        for email in to_report {
            let uid = email.uid.clone();
            if let Err(err) = self.build_reports_for_email(email).await {
                error!("Failed building NCMEC reports for email {}, error {}", uid, err);
            }
        }
    }

    /// Builds and persists the report rows for one email under its lock.
    pub async fn build_reports_for_email(&self, email: email::Model) -> Result<()> {
        let lock = match self.locks.acquire(RESOURCE_EMAILS, &email.uid).await {
            Ok(lock) => lock,
            Err(LockError::Busy) => {
                debug!("email {} is locked, skipping", email.uid);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let res = self.build_reports_for_email_locked(&email).await;
        compose_unlock(res, lock.release().await)
    }

    async fn build_reports_for_email_locked(&self, email: &email::Model) -> Result<()> {
        // the uploader-info round-trips can take a while, re-check the flag
        // under the lock before doing the work
        let current = match email_repo::find_one(&self.db, &email.uid).await? {
            Some(current) => current,
            None => return Ok(()),
        };
        if current.reported {
            return Ok(());
        }

        let reports = self.reports_for_email(&current).await?;
        for report in reports {
            let xml = report.to_xml()?;
            let row = report::ActiveModel {
                id: Set(Uuid::new_v4().to_string()),
                email_uid: Set(current.uid.clone()),
                report: Set(xml),
                filed: Set(false),
                filed_at: Set(None),
                filed_err: Set(String::new()),
                report_id: Set(0),
                debug: Set(self.debug),
                inserted_at: Set(Utc::now()),
            };
            report_repo::insert(&self.db, row).await?;
        }

        email_repo::mark_reported(&self.db, current).await?;
        Ok(())
    }

    /// Groups the email's skylinks per uploader and builds one report per
    /// group. Skylinks without uploader information end up in a shared
    /// anonymous group.
    async fn reports_for_email(&self, email: &email::Model) -> Result<Vec<Report>> {
        let incident_date = email.inserted_at;
        let skylinks = email
            .parse_result
            .as_ref()
            .map(|pr| pr.skylinks.clone())
            .unwrap_or_default();

        let mut grouped: BTreeMap<String, Vec<UploadInfo>> = BTreeMap::new();
        for skylink in skylinks {
            let infos = self.accounts.upload_info(&skylink).await?;
            if infos.is_empty() {
                grouped.entry(ANON_USER.to_string()).or_default().push(UploadInfo {
                    skylink,
                    ..Default::default()
                });
                continue;
            }
            for info in infos {
                grouped
                    .entry(info.uploader_info.sub.clone())
                    .or_default()
                    .push(info);
            }
        }

        Ok(grouped
            .into_iter()
            .map(|(user, uploads)| self.report_for_uploads(incident_date, &user, &uploads))
            .collect())
    }

    /// Builds the report for one uploader group.
    fn report_for_uploads(
        &self,
        incident_date: DateTime<Utc>,
        user: &str,
        uploads: &[UploadInfo],
    ) -> Report {
        let urls = uploads
            .iter()
            .map(|upload| format!("{}/{}", self.portal_url, upload.skylink))
            .collect();

        let mut report = Report {
            incident_summary: IncidentSummary {
                incident_type: NCMEC_INCIDENT_TYPE.to_string(),
                incident_date_time: incident_date.to_rfc3339_opts(SecondsFormat::Secs, true),
            },
            internet_details: InternetDetails {
                web_page_incident: WebPageIncident {
                    third_party_hosted_content: true,
                    url: urls,
                },
            },
            reporter: self.identity.clone(),
            uploader: None,
            ..Default::default()
        }
        .with_schema_attributes();

        if user == ANON_USER {
            return report;
        }

        // one capture event per upload we have an address for
        let ip_captures = uploads
            .iter()
            .filter(|upload| !upload.ip.is_empty())
            .map(|upload| IpCaptureEvent {
                ip_address: upload.ip.clone(),
                event_name: "Upload".to_string(),
                date: upload
                    .created_at
                    .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
                    .unwrap_or_default(),
            })
            .collect();

        let additional_info = if uploads[0].uploader_info.stripe_id.is_empty() {
            String::new()
        } else {
            "Credit Card Info on file.".to_string()
        };

        report.uploader = Some(ReportedPerson {
            user_reported: NcmecPerson {
                email: uploads[0].uploader_info.email.clone(),
                ..Default::default()
            },
            ip_capture_event: ip_captures,
            additional_info,
        });
        report
    }

    /// File loop tick: probe the authority, then file every unfiled report.
    /// When the authority is down the whole tick is skipped; failed filings
    /// are never retried automatically, so they must not be attempted
    /// against a service that is known to be unreachable.
    pub async fn file_reports(&self) {
        match self.authority.status().await {
            Ok(res) if res.response_code == NCMEC_STATUS_OK => {}
            Ok(res) => {
                error!(
                    "unexpected status response from NCMEC API, status {}, skipping filing reports",
                    res.response_code
                );
                return;
            }
            Err(err) => {
                error!(
                    "unexpected response from NCMEC API, err {}, skipping filing reports",
                    err
                );
                return;
            }
        }

        let unfiled = match report_repo::find_unfiled(&self.db).await {
            Ok(reports) => reports,
            Err(err) => {
                error!("Failed fetching unfiled reports, error {}", err);
                return;
            }
        };

        if unfiled.is_empty() {
            debug!("Found 0 unfiled NCMEC reports");
            return;
        }
        info!("Found {} unfiled NCMEC reports", unfiled.len());

        for report in unfiled {
            let id = report.id.clone();
            if let Err(err) = self.file_report(report).await {
                info!("Failed filing report {}, err {}", id, err);
            }
        }
    }

    /// Files one report under its lock: opens it if it has no authority id
    /// yet, then finishes it.
    pub async fn file_report(&self, report: report::Model) -> Result<()> {
        let lock = match self.locks.acquire(RESOURCE_REPORTS, &report.id).await {
            Ok(lock) => lock,
            Err(LockError::Busy) => {
                debug!("report {} is locked, skipping", report.id);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let res = self.file_report_locked(&report).await;
        compose_unlock(res, lock.release().await)
    }

    async fn file_report_locked(&self, report: &report::Model) -> Result<()> {
        let current = match report_repo::find_one(&self.db, &report.id).await? {
            Some(current) => current,
            None => return Ok(()),
        };
        if current.filed {
            return Ok(());
        }

        // a non-zero report id means opening succeeded on an earlier attempt
        // and we crashed before finishing; resume with phase B only
        let current = if current.report_id == 0 {
            match self.open_report(current).await? {
                Some(opened) => opened,
                None => return Ok(()), // parked with filed_err
            }
        } else {
            current
        };

        self.finish_report(current).await
    }

    /// Phase A: submits the stored XML payload. On success the
    /// authority-assigned id is persisted and the opened row is returned; a
    /// rejection parks the report and returns None.
    async fn open_report(&self, report: report::Model) -> Result<Option<report::Model>> {
        let res = match self.authority.open_report(&report.report).await {
            Ok(res) if res.response_code == NCMEC_STATUS_OK => res,
            Ok(res) => {
                let err = NcmecError::ResponseCode(res.response_code);
                error!("failed to open report {}, error '{}'", report.id, err);
                report_repo::mark_errored(&self.db, report, err.to_string()).await?;
                return Ok(None);
            }
            Err(err) => {
                error!("failed to open report {}, error '{}'", report.id, err);
                report_repo::mark_errored(&self.db, report, err.to_string()).await?;
                return Ok(None);
            }
        };

        let id = report.id.clone();
        report_repo::mark_opened(&self.db, report, res.report_id as i64).await?;
        let opened = report_repo::find_one(&self.db, &id)
            .await?
            .ok_or_else(|| ScannerError::Db(sea_orm::DbErr::RecordNotFound(id)))?;
        Ok(Some(opened))
    }

    /// Phase B: finishes the report with the authority and records the
    /// outcome.
    async fn finish_report(&self, report: report::Model) -> Result<()> {
        let outcome = match self.authority.finish_report(report.report_id as u64).await {
            Ok(res) if res.response_code == NCMEC_STATUS_OK => None,
            Ok(res) => Some(NcmecError::ResponseCode(res.response_code).to_string()),
            Err(err) => Some(err.to_string()),
        };

        if let Some(err) = &outcome {
            error!("failed to finish report {}, err '{}'", report.report_id, err);
        }
        report_repo::mark_finished(&self.db, report, outcome).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{AccountsError, UploaderInfo};
    use crate::db::entities::email::{AbuseReporter, ParseResult};
    use crate::db::init_database;
    use crate::email::ncmec::{ReportDoneResponse, ReportResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SL1: &str = "AADhDhfUZizFdo6f6DG03JTiNQmgxTt96UnjJfcvnViJCC";
    const SL2: &str = "BBDhDhfUZizFdo6f6DG03JTiNQmgxTt96UnjJfcvnViJDD";
    const SL3: &str = "CCDhDhfUZizFdo6f6DG03JTiNQmgxTt96UnjJfcvnViJEE";
    const SL4: &str = "DDDhDhfUZizFdo6f6DG03JTiNQmgxTt96UnjJfcvnViJFF";

    struct MockAccounts;

    #[async_trait]
    impl UploadInfoApi for MockAccounts {
        async fn upload_info(
            &self,
            skylink: &str,
        ) -> std::result::Result<Vec<UploadInfo>, AccountsError> {
            let info = |ip: &str, sub: &str, email: &str, stripe: &str| UploadInfo {
                skylink: skylink.to_string(),
                ip: ip.to_string(),
                created_at: Some(Utc::now() - chrono::Duration::hours(1)),
                uploader_info: UploaderInfo {
                    sub: sub.to_string(),
                    email: email.to_string(),
                    stripe_id: stripe.to_string(),
                },
            };
            Ok(match skylink {
                SL1 => vec![info("81.196.117.164", "user_1_sub", "user.one@gmail.com", "")],
                SL2 => vec![info("", "user_1_sub", "user.one@gmail.com", "")],
                SL3 => vec![info(
                    "13.192.32.50",
                    "user_2_sub",
                    "user.two@gmail.com",
                    "stripe_id_user_2",
                )],
                _ => vec![],
            })
        }
    }

    /// Mock authority counting its calls; `fail_finish` makes phase B fail.
    pub(crate) struct MockAuthority {
        pub submits: AtomicUsize,
        pub finishes: AtomicUsize,
        pub fail_finish: std::sync::atomic::AtomicBool,
    }

    impl MockAuthority {
        pub fn new() -> Self {
            Self {
                submits: AtomicUsize::new(0),
                finishes: AtomicUsize::new(0),
                fail_finish: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl AuthorityApi for MockAuthority {
        async fn status(&self) -> std::result::Result<ReportResponse, NcmecError> {
            Ok(Default::default())
        }

        async fn open_report(
            &self,
            _xml: &str,
        ) -> std::result::Result<ReportResponse, NcmecError> {
            let n = self.submits.fetch_add(1, Ordering::SeqCst);
            Ok(ReportResponse {
                response_code: NCMEC_STATUS_OK,
                response_description: "Success".to_string(),
                report_id: 1000 + n as u64,
            })
        }

        async fn finish_report(
            &self,
            report_id: u64,
        ) -> std::result::Result<ReportDoneResponse, NcmecError> {
            self.finishes.fetch_add(1, Ordering::SeqCst);
            if self.fail_finish.load(Ordering::SeqCst) {
                return Ok(ReportDoneResponse {
                    response_code: 9999,
                    report_id,
                });
            }
            Ok(ReportDoneResponse {
                response_code: NCMEC_STATUS_OK,
                report_id,
            })
        }
    }

    fn test_identity() -> NcmecReporter {
        NcmecReporter {
            reporting_person: NcmecPerson {
                first_name: "SkynetLabs".to_string(),
                last_name: "Inc.".to_string(),
                email: "abuse@skynetlabs.com".to_string(),
            },
        }
    }

    async fn test_reporter(db: DatabaseConnection, authority: Arc<MockAuthority>) -> Reporter {
        Reporter::new(
            db.clone(),
            LockClient::new(db, "host-a".to_string()),
            Arc::new(MockAccounts),
            authority,
            &NcmecCredentials {
                username: "user".to_string(),
                password: secrecy::SecretString::new("pass".to_string()),
                debug: true,
            },
            "https://siasky.net".to_string(),
            test_identity(),
        )
    }

    fn csam_email(uid: &str, skylinks: Vec<&str>) -> email::Model {
        email::Model {
            uid: uid.to_string(),
            uid_raw: 1,
            body: b"body".to_vec(),
            subject: String::new(),
            message_id: String::new(),
            from_address: String::new(),
            reply_to: String::new(),
            to_address: String::new(),
            skip: false,
            inserted_by: "host-a".to_string(),
            inserted_at: Utc::now(),
            parsed: true,
            parsed_at: Some(Utc::now()),
            parsed_by: Some("host-a".to_string()),
            parse_result: Some(ParseResult {
                skylinks: skylinks.into_iter().map(String::from).collect(),
                reporter: AbuseReporter::default(),
                sponsor: String::new(),
                tags: vec!["csam".to_string()],
            }),
            blocked: true,
            blocked_at: Some(Utc::now()),
            blocked_by: Some("host-a".to_string()),
            block_result: None,
            finalized: false,
            finalized_at: None,
            finalized_by: None,
            reported: false,
            reported_at: None,
        }
    }

    async fn insert_email(db: &DatabaseConnection, email: email::Model) {
        use sea_orm::{ActiveModelTrait, IntoActiveModel};
        email.into_active_model().reset_all().insert(db).await.unwrap();
    }

    #[tokio::test]
    async fn test_build_groups_by_uploader() {
        let db = init_database("sqlite::memory:").await.unwrap();
        let authority = Arc::new(MockAuthority::new());
        let reporter = test_reporter(db.clone(), Arc::clone(&authority)).await;

        insert_email(&db, csam_email("INBOX-0", vec![SL1, SL2, SL3, SL4])).await;
        assert_eq!(email_repo::find_unreported(&db).await.unwrap().len(), 1);

        reporter.build_reports().await;

        // four skylinks over two users and one anonymous upload: 3 reports
        let rows = report_repo::find_for_email(&db, "INBOX-0").await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| !r.filed && r.report_id == 0 && r.filed_err.is_empty()));

        // the email is marked reported
        assert!(email_repo::find_unreported(&db).await.unwrap().is_empty());
        let email = email_repo::find_one(&db, "INBOX-0").await.unwrap().unwrap();
        assert!(email.reported);
        assert!(email.reported_at.is_some());

        // inspect the payloads
        let mut user1 = None;
        let mut user2 = None;
        let mut anon = None;
        for row in &rows {
            let report = Report::from_xml(&row.report).unwrap();
            match report.uploader.as_ref() {
                None => anon = Some(report),
                Some(uploader) if uploader.user_reported.email == "user.one@gmail.com" => {
                    user1 = Some(report)
                }
                Some(_) => user2 = Some(report),
            }
        }

        let user1 = user1.expect("missing report for user one");
        assert_eq!(
            user1.internet_details.web_page_incident.url,
            vec![
                format!("https://siasky.net/{}", SL1),
                format!("https://siasky.net/{}", SL2),
            ]
        );
        // only the upload with an IP produced a capture event
        let uploader = user1.uploader.unwrap();
        assert_eq!(uploader.ip_capture_event.len(), 1);
        assert_eq!(uploader.ip_capture_event[0].ip_address, "81.196.117.164");
        assert_eq!(uploader.ip_capture_event[0].event_name, "Upload");
        assert_eq!(uploader.additional_info, "");

        let user2 = user2.expect("missing report for user two");
        let uploader = user2.uploader.unwrap();
        assert_eq!(uploader.user_reported.email, "user.two@gmail.com");
        assert_eq!(uploader.additional_info, "Credit Card Info on file.");

        let anon = anon.expect("missing anonymous report");
        assert_eq!(
            anon.internet_details.web_page_incident.url,
            vec![format!("https://siasky.net/{}", SL4)]
        );
        assert!(anon.internet_details.web_page_incident.third_party_hosted_content);
        assert_eq!(anon.reporter, test_identity());
    }

    #[tokio::test]
    async fn test_build_is_idempotent_per_email() {
        let db = init_database("sqlite::memory:").await.unwrap();
        let authority = Arc::new(MockAuthority::new());
        let reporter = test_reporter(db.clone(), Arc::clone(&authority)).await;

        insert_email(&db, csam_email("INBOX-0", vec![SL1])).await;
        reporter.build_reports().await;
        reporter.build_reports().await;

        // the second tick observed the reported flag and did not add rows
        assert_eq!(report_repo::find_for_email(&db, "INBOX-0").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_performs_both_phases() {
        let db = init_database("sqlite::memory:").await.unwrap();
        let authority = Arc::new(MockAuthority::new());
        let reporter = test_reporter(db.clone(), Arc::clone(&authority)).await;

        insert_email(&db, csam_email("INBOX-0", vec![SL1, SL4])).await;
        reporter.build_reports().await;
        assert_eq!(report_repo::find_unfiled(&db).await.unwrap().len(), 2);

        reporter.file_reports().await;

        assert!(report_repo::find_unfiled(&db).await.unwrap().is_empty());
        let rows = report_repo::find_for_email(&db, "INBOX-0").await.unwrap();
        assert!(rows.iter().all(|r| r.filed && r.report_id >= 1000 && r.filed_err.is_empty()));

        // exactly one submit and one finish per report
        assert_eq!(authority.submits.load(Ordering::SeqCst), 2);
        assert_eq!(authority.finishes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_file_resumes_after_crash_between_phases() {
        let db = init_database("sqlite::memory:").await.unwrap();
        let authority = Arc::new(MockAuthority::new());
        let reporter = test_reporter(db.clone(), Arc::clone(&authority)).await;

        insert_email(&db, csam_email("INBOX-0", vec![SL1, SL3, SL4])).await;
        reporter.build_reports().await;
        let rows = report_repo::find_for_email(&db, "INBOX-0").await.unwrap();
        assert_eq!(rows.len(), 3);

        // phase A succeeded for every report, then the process died before
        // phase B: simulate by persisting authority ids out-of-band
        for (i, row) in rows.into_iter().enumerate() {
            report_repo::mark_opened(&db, row, 2000 + i as i64).await.unwrap();
        }

        // next tick: loop 2 observes filed=false, report_id>0 and performs
        // phase B only
        reporter.file_reports().await;

        let rows = report_repo::find_for_email(&db, "INBOX-0").await.unwrap();
        assert!(rows.iter().all(|r| r.filed));
        assert!(rows.iter().all(|r| r.report_id >= 2000));

        // the authority never received a second submit for these reports
        assert_eq!(authority.submits.load(Ordering::SeqCst), 0);
        assert_eq!(authority.finishes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_finish_parks_report() {
        let db = init_database("sqlite::memory:").await.unwrap();
        let authority = Arc::new(MockAuthority::new());
        authority.fail_finish.store(true, Ordering::SeqCst);
        let reporter = test_reporter(db.clone(), Arc::clone(&authority)).await;

        insert_email(&db, csam_email("INBOX-0", vec![SL1])).await;
        reporter.build_reports().await;
        reporter.file_reports().await;

        // parked: not filed, error persisted, report id kept
        let rows = report_repo::find_for_email(&db, "INBOX-0").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].filed);
        assert!(!rows[0].filed_err.is_empty());
        assert!(rows[0].report_id >= 1000);

        // parked reports are not retried
        assert!(report_repo::find_unfiled(&db).await.unwrap().is_empty());
        authority.fail_finish.store(false, Ordering::SeqCst);
        reporter.file_reports().await;
        assert_eq!(authority.finishes.load(Ordering::SeqCst), 1);
    }
}
