//! Email finalizer.
//!
//! Closes out emails that went through parsing and blocking (and, for
//! csam-tagged mail with reporting enabled, through the reporter): appends a
//! summary reply into the mailbox and, when every skylink was blocked, sends
//! an automated reply to the original reporter.

use std::sync::Arc;
use std::time::Duration;

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use sea_orm::DatabaseConnection;
use secrecy::ExposeSecret;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::MailCredentials;
use crate::db::entities::email;
use crate::db::{email_repo, LockClient, LockError, RESOURCE_EMAILS};
use crate::error::{compose_unlock, Result};
use crate::worker::{spawn_ticker, WorkerHandle};

use super::client::ImapClient;
use super::error::EmailError;
use super::{SCANNER_EMAIL_ADDRESS, SMTP_SERVER};

/// Frequency with which the finalizer scans for emails ready for closure.
const FINALIZE_FREQUENCY: Duration = Duration::from_secs(35);

/// Periodically finalizes emails that are ready for closure.
pub struct Finalizer {
    db: DatabaseConnection,
    locks: LockClient,
    credentials: MailCredentials,
    /// Where the summary replies are addressed to.
    abuse_mailaddress: String,
    mailbox: String,
    server_domain: String,
    /// Gates the csam readiness condition: when reporting is disabled, csam
    /// emails finalize without waiting for the reported flag.
    reporting_enabled: bool,
    smtp: AsyncSmtpTransport<Tokio1Executor>,
}

impl Finalizer {
    pub fn new(
        db: DatabaseConnection,
        locks: LockClient,
        credentials: MailCredentials,
        abuse_mailaddress: String,
        mailbox: String,
        server_domain: String,
        reporting_enabled: bool,
    ) -> std::result::Result<Self, EmailError> {
        let smtp = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(SMTP_SERVER)?
            .credentials(SmtpCredentials::new(
                SCANNER_EMAIL_ADDRESS.to_string(),
                credentials.password.expose_secret().to_string(),
            ))
            .build();

        Ok(Self {
            db,
            locks,
            credentials,
            abuse_mailaddress,
            mailbox,
            server_domain,
            reporting_enabled,
            smtp,
        })
    }

    /// Starts the finalize unit.
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> WorkerHandle {
        spawn_ticker("finalizer", FINALIZE_FREQUENCY, shutdown, move || {
            let finalizer = Arc::clone(&self);
            async move { finalizer.finalize_messages().await }
        })
    }

    /// One tick: finalize every ready email.
    pub async fn finalize_messages(&self) {
        let candidates = match email_repo::find_unfinalized(&self.db, &self.mailbox).await {
            Ok(emails) => emails,
            Err(err) => {
                error!("Failed fetching unfinalized emails, error {}", err);
                return;
            }
        };

        // csam-tagged emails wait for their NCMEC reports before closure
        let to_finalize: Vec<email::Model> = candidates
            .into_iter()
            .filter(|e| !(self.reporting_enabled && e.is_csam() && !e.reported))
            .collect();

        if to_finalize.is_empty() {
            debug!("Found 0 unfinalized messages");
            return;
        }
        info!("Found {} unfinalized messages", to_finalize.len());

        let mut client = match ImapClient::connect(&self.credentials).await {
            Ok(client) => client,
            Err(EmailError::TooManyConnections) => {
                debug!("Skipped due to too many connections (expected)");
                return;
            }
            Err(err) => {
                error!("Failed to initialize email client, err {}", err);
                return;
            }
        };

        for email in to_finalize {
            let uid = email.uid.clone();
            if let Err(err) = self.finalize_email(&mut client, email).await {
                error!("Failed to finalize email {}, error {}", uid, err);
            }
        }

        if let Err(err) = client.logout().await {
            error!("Failed to close email client, err: {}", err);
        }
    }

    /// Finalizes a single email under its lock.
    pub async fn finalize_email(&self, client: &mut ImapClient, email: email::Model) -> Result<()> {
        verify_block_result(&email)?;

        let lock = match self.locks.acquire(RESOURCE_EMAILS, &email.uid).await {
            Ok(lock) => lock,
            Err(LockError::Busy) => {
                debug!("email {} is locked, skipping", email.uid);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let res = self.finalize_email_locked(client, &email).await;
        compose_unlock(res, lock.release().await)
    }

    async fn finalize_email_locked(
        &self,
        client: &mut ImapClient,
        email: &email::Model,
    ) -> Result<()> {
        // now that we hold the lock, check whether another host already
        // finalized the email
        let current = match email_repo::find_one(&self.db, &email.uid).await? {
            Some(current) => current,
            None => return Ok(()),
        };
        if current.finalized {
            return Ok(());
        }

        // append the summary reply into the mailbox
        let reply = self.build_summary_reply(&current)?;
        client.append(&self.mailbox, &reply.formatted()).await?;

        // reply to the original reporter, but only if the email was handled
        // without a hitch; a send failure logs and does not roll back
        if current.is_success() {
            if let Err(err) = self.send_automated_reply(&current).await {
                error!("failed to send automated reply, err {}", err);
            }
        }

        email_repo::mark_finalized(&self.db, current, &self.server_domain).await?;
        Ok(())
    }

    /// Builds the reply that carries the summary, threaded onto the original
    /// message.
    fn build_summary_reply(&self, email: &email::Model) -> std::result::Result<Message, EmailError> {
        let from: Mailbox = format!("SCANNED <{}>", SCANNER_EMAIL_ADDRESS).parse()?;
        let to: Mailbox = self.abuse_mailaddress.parse()?;

        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(format!("Re: {}", email.subject))
            .message_id(Some(format!("<{}@abusescanner>", Uuid::new_v4())))
            .in_reply_to(email.message_id.clone())
            .references(email.message_id.clone())
            .body(email.summary())?;
        Ok(message)
    }

    /// Sends the automated reply to the original reporter over SMTP.
    async fn send_automated_reply(&self, email: &email::Model) -> std::result::Result<(), EmailError> {
        let from: Mailbox = email.to_address.parse()?;
        let to: Mailbox = email.sender().parse()?;

        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(format!("Re: {}", email.subject))
            .message_id(Some(format!("<{}@abusescanner>", Uuid::new_v4())))
            .in_reply_to(email.message_id.clone())
            .references(email.message_id.clone())
            .body(email.summary())?;

        self.smtp.send(message).await?;
        Ok(())
    }
}

/// Sanity check that every skylink has a recorded block outcome. A mismatch
/// means upstream data is corrupt and the email must not be closed out.
fn verify_block_result(email: &email::Model) -> std::result::Result<(), EmailError> {
    let num_skylinks = email
        .parse_result
        .as_ref()
        .map(|pr| pr.skylinks.len())
        .unwrap_or_default();
    let num_outcomes = email
        .block_result
        .as_ref()
        .map(|br| br.0.len())
        .unwrap_or_default();
    if num_skylinks != num_outcomes {
        return Err(EmailError::BlockResultMismatch {
            expected: num_skylinks,
            actual: num_outcomes,
        });
    }
    Ok(())
}
