//! Skylink blocker.
//!
//! Submits every skylink from a parse result to the blocker API and records
//! a per-skylink outcome string. The blocker API is idempotent, so a crash
//! between "POSTed" and "persisted" at worst repeats a call on the next
//! tick.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::USER_AGENT;
use reqwest::StatusCode;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::db::entities::email::{self, AbuseReporter, ParseResult, STATUS_BLOCKED};
use crate::db::{email_repo, LockClient, LockError, RESOURCE_EMAILS};
use crate::error::{compose_unlock, Result, ScannerError};
use crate::worker::{spawn_ticker, WorkerHandle};

use super::error::EmailError;

/// Frequency with which the blocker scans for emails whose skylinks have not
/// been blocked yet.
const BLOCK_FREQUENCY: Duration = Duration::from_secs(20);

/// How much of an error response body ends up in the outcome string.
const MAX_RESPONSE_SNIPPET: usize = 1024;

/// Datastructure expected by the blocker API.
#[derive(Serialize)]
struct BlockRequest<'a> {
    skylink: &'a str,
    reporter: &'a AbuseReporter,
    tags: &'a [String],
}

/// Periodically scans for parsed emails whose skylinks have not been blocked
/// yet and feeds them to the blocker API.
pub struct Blocker {
    db: DatabaseConnection,
    locks: LockClient,
    api_url: String,
    server_domain: String,
    client: reqwest::Client,
}

impl Blocker {
    pub fn new(
        db: DatabaseConnection,
        locks: LockClient,
        api_url: String,
        server_domain: String,
        client: reqwest::Client,
    ) -> Self {
        Self {
            db,
            locks,
            api_url,
            server_domain,
            client,
        }
    }

    /// Starts the block unit.
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> WorkerHandle {
        spawn_ticker("blocker", BLOCK_FREQUENCY, shutdown, move || {
            let blocker = Arc::clone(&self);
            async move { blocker.block_messages().await }
        })
    }

    /// One tick: block the skylinks of every parsed-but-unblocked email.
    pub async fn block_messages(&self) {
        let to_block = match email_repo::find_unblocked(&self.db).await {
            Ok(emails) => emails,
            Err(err) => {
                error!("Failed fetching unblocked emails, error {}", err);
                return;
            }
        };

        if to_block.is_empty() {
            debug!("Found 0 unblocked messages");
            return;
        }
        info!("Found {} unblocked messages", to_block.len());

        for email in to_block {
            let uid = email.uid.clone();
            if let Err(err) = self.block_email(email).await {
                error!("Failed to block email {}, error {}", uid, err);
            }
        }
    }

    /// Blocks the skylinks of a single email under its lock.
    pub async fn block_email(&self, email: email::Model) -> Result<()> {
        let lock = match self.locks.acquire(RESOURCE_EMAILS, &email.uid).await {
            Ok(lock) => lock,
            Err(LockError::Busy) => {
                debug!("email {} is locked, skipping", email.uid);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let res = self.block_email_locked(email).await;
        compose_unlock(res, lock.release().await)
    }

    async fn block_email_locked(&self, email: email::Model) -> Result<()> {
        let current = match email_repo::find_one(&self.db, &email.uid).await? {
            Some(current) => current,
            None => return Ok(()),
        };
        if current.blocked {
            return Ok(());
        }

        let report = current.parse_result.clone().unwrap_or_default();
        let result = self.block_report(&report).await?;
        email_repo::mark_blocked(&self.db, current, result, &self.server_domain).await?;
        Ok(())
    }

    /// Submits every skylink of the given report and returns the ordered
    /// outcome sequence. The sequence must line up with the skylinks
    /// one-to-one; anything else means the record is corrupt and the block
    /// must not be recorded.
    pub async fn block_report(&self, report: &ParseResult) -> Result<Vec<String>> {
        let mut results = Vec::with_capacity(report.skylinks.len());
        for skylink in &report.skylinks {
            results.push(self.block_skylink(skylink, report).await);
        }

        if results.len() != report.skylinks.len() {
            return Err(ScannerError::Email(EmailError::BlockResultMismatch {
                expected: report.skylinks.len(),
                actual: results.len(),
            }));
        }
        Ok(results)
    }

    /// Blocks a single skylink, mapping every outcome onto a result string.
    async fn block_skylink(&self, skylink: &str, report: &ParseResult) -> String {
        debug!(
            "blocking {}...{}",
            &skylink[..4.min(skylink.len())],
            &skylink[skylink.len().saturating_sub(4)..]
        );

        let request = BlockRequest {
            skylink,
            reporter: &report.reporter,
            tags: &report.tags,
        };

        let response = self
            .client
            .post(format!("{}/block", self.api_url))
            .header(USER_AGENT, "Sia-Agent")
            .json(&request)
            .send()
            .await;

        match response {
            Ok(res) => match res.status() {
                StatusCode::OK | StatusCode::NO_CONTENT => STATUS_BLOCKED.to_string(),
                status => {
                    let mut body = res.text().await.unwrap_or_default();
                    body.truncate(MAX_RESPONSE_SNIPPET);
                    format!(
                        "failed to block skylink, status {} response: {}",
                        status, body
                    )
                }
            },
            Err(err) => format!("failed to execute request, err: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_request_serialization() {
        let reporter = AbuseReporter {
            name: "Jane Reporter".to_string(),
            email: "reporter@example.com".to_string(),
            other_contact: String::new(),
        };
        let tags = vec!["phishing".to_string()];
        let request = BlockRequest {
            skylink: "GAEE7l0IkIVcVEHDgRCcNkRYS8keZKr9v_ffxf9_614m6g",
            reporter: &reporter,
            tags: &tags,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "skylink": "GAEE7l0IkIVcVEHDgRCcNkRYS8keZKr9v_ffxf9_614m6g",
                "reporter": {
                    "name": "Jane Reporter",
                    "email": "reporter@example.com",
                    "other_contact": ""
                },
                "tags": ["phishing"]
            })
        );
    }
}
