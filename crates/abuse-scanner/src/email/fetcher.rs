//! Mailbox fetcher.
//!
//! Periodically lists the abuse mailbox and admits messages that are not in
//! the store yet. Deduplication runs on the composite id
//! `<mailbox>-<uidvalidity>-<uid>`: a crash between fetch and persist simply
//! re-fetches on the next tick, and a uidvalidity bump re-admits everything
//! under fresh ids.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::{DatabaseConnection, Set};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::MailCredentials;
use crate::db::entities::email;
use crate::db::{email_repo, LockClient, LockError, RESOURCE_EMAILS};
use crate::error::{compose_unlock, Result, ScannerError};
use crate::worker::{spawn_ticker, WorkerHandle};

use super::client::{FetchedMessage, ImapClient, SelectedMailbox};
use super::error::EmailError;
use super::SCANNER_EMAIL_ADDRESS;

/// Frequency with which the fetcher scans the mailbox.
const FETCH_FREQUENCY: Duration = Duration::from_secs(30);

/// Maximum amount of bytes kept from a message body.
const MAIL_MAX_BODY_SIZE: usize = 1 << 23; // 8MiB

/// Periodically scans the inbox and persists missing messages.
pub struct Fetcher {
    db: DatabaseConnection,
    locks: LockClient,
    credentials: MailCredentials,
    mailbox: String,
    server_domain: String,
}

impl Fetcher {
    pub fn new(
        db: DatabaseConnection,
        locks: LockClient,
        credentials: MailCredentials,
        mailbox: String,
        server_domain: String,
    ) -> Self {
        Self {
            db,
            locks,
            credentials,
            mailbox,
            server_domain,
        }
    }

    /// Starts the fetch unit.
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> WorkerHandle {
        info!(
            "Fetching messages for '{}' from mailbox '{}'",
            self.credentials.username, self.mailbox
        );
        spawn_ticker("fetcher", FETCH_FREQUENCY, shutdown, move || {
            let fetcher = Arc::clone(&self);
            async move { fetcher.fetch_messages().await }
        })
    }

    /// One tick: connect, list, admit what is missing, log out.
    pub async fn fetch_messages(&self) {
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

        if let Err(err) = self.fetch_messages_inner(&mut client).await {
            error!("Failed fetching messages, err {}", err);
        }

        if let Err(err) = client.logout().await {
            error!("Failed to close email client, err {}", err);
        }
    }

    async fn fetch_messages_inner(&self, client: &mut ImapClient) -> Result<()> {
        // select on every tick, the validity token may have changed
        let mailbox = client.select(&self.mailbox).await.map_err(|e| {
            error!("Failed to select mailbox {}, err: {}", self.mailbox, e);
            e
        })?;

        if mailbox.exists == 0 {
            debug!("No messages in mailbox {}", self.mailbox);
            return Ok(());
        }

        let uids = client.list_uids().await?;
        let missing = self.missing_uids(&mailbox, &uids).await;

        if missing.is_empty() {
            debug!("Found 0 missing messages");
            return Ok(());
        }
        info!("Found {} missing messages", missing.len());

        let mut to_unsee = Vec::new();
        for uid in missing {
            match self.fetch_message(client, &mailbox, uid).await {
                Ok(admitted) => {
                    if admitted {
                        to_unsee.push(uid);
                    }
                }
                Err(err) => error!("Failed fetching message {}, err: {}", uid, err),
            }
        }

        if let Err(err) = client.unsee(&to_unsee).await {
            debug!("Failed to unsee messages, error: {}", err);
        }
        Ok(())
    }

    /// Filters the mailbox uids down to the ones we have not persisted yet.
    async fn missing_uids(&self, mailbox: &SelectedMailbox, uids: &[u32]) -> Vec<u32> {
        let mut missing = Vec::with_capacity(uids.len());
        for &uid in uids {
            let composite = composite_uid(&self.mailbox, mailbox.uid_validity, uid);
            match email_repo::exists(&self.db, &composite).await {
                Ok(false) => missing.push(uid),
                Ok(true) => {}
                Err(err) => error!("failed to find message '{}', error: {}", uid, err),
            }
        }
        missing
    }

    /// Fetches and persists one message. Returns true when the message was
    /// admitted as regular work (and should be marked unseen), false for
    /// skip records.
    async fn fetch_message(
        &self,
        client: &mut ImapClient,
        mailbox: &SelectedMailbox,
        uid: u32,
    ) -> Result<bool> {
        let msg = client.fetch_message(uid).await?;

        // our own replies get picked up by the scan as well, make sure they
        // never re-enter the pipeline
        if msg.is_self_originated(SCANNER_EMAIL_ADDRESS) {
            debug!("skip message from abuse scanner (expected)");
            self.persist_skip_message(mailbox, &msg).await?;
            return Ok(false);
        }

        if !msg.has_body() {
            debug!("skip message due to not having a body (expected)");
            self.persist_skip_message(mailbox, &msg).await?;
            return Ok(false);
        }

        self.persist_message(mailbox, msg).await?;
        Ok(true)
    }

    /// Persists a regular message with all stage flags unset.
    async fn persist_message(&self, mailbox: &SelectedMailbox, msg: FetchedMessage) -> Result<()> {
        let uid = composite_uid(&self.mailbox, mailbox.uid_validity, msg.uid);

        let mut body = msg.body.clone().unwrap_or_default();
        body.truncate(MAIL_MAX_BODY_SIZE);

        let record = email::ActiveModel {
            uid: Set(uid.clone()),
            uid_raw: Set(i64::from(msg.uid)),
            body: Set(body),
            subject: Set(msg.subject.clone()),
            message_id: Set(msg.message_id.clone()),
            from_address: Set(msg.from_address()),
            reply_to: Set(msg.reply_to_address()),
            to_address: Set(msg.to_address()),
            skip: Set(false),
            inserted_by: Set(self.server_domain.clone()),
            inserted_at: Set(Utc::now()),
            ..new_unprocessed()
        };

        self.insert_locked(&uid, record, false).await
    }

    /// Persists a skip record with every flag forced terminal, so the
    /// message is never considered missing again and no stage touches it.
    async fn persist_skip_message(
        &self,
        mailbox: &SelectedMailbox,
        msg: &FetchedMessage,
    ) -> Result<()> {
        let uid = composite_uid(&self.mailbox, mailbox.uid_validity, msg.uid);

        let record = email::ActiveModel {
            uid: Set(uid.clone()),
            uid_raw: Set(i64::from(msg.uid)),
            body: Set(Vec::new()),
            subject: Set(String::new()),
            message_id: Set(String::new()),
            from_address: Set(String::new()),
            reply_to: Set(String::new()),
            to_address: Set(String::new()),
            skip: Set(true),
            inserted_by: Set(self.server_domain.clone()),
            inserted_at: Set(Utc::now()),
            parsed: Set(true),
            blocked: Set(true),
            finalized: Set(true),
            ..new_unprocessed()
        };

        self.insert_locked(&uid, record, true).await
    }

    /// Inserts a record under the email lock, re-checking existence inside
    /// the lock so two hosts fetching the same tick insert exactly once.
    async fn insert_locked(
        &self,
        uid: &str,
        record: email::ActiveModel,
        tolerate_existing: bool,
    ) -> Result<()> {
        let lock = match self.locks.acquire(RESOURCE_EMAILS, uid).await {
            Ok(lock) => lock,
            Err(LockError::Busy) => {
                debug!("email {} is locked, skipping", uid);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let res = async {
            if email_repo::exists(&self.db, uid).await? {
                if !tolerate_existing {
                    debug!("email {} already exists, skipping insert", uid);
                }
                return Ok(());
            }
            email_repo::insert(&self.db, record).await?;
            Ok::<(), ScannerError>(())
        }
        .await;

        compose_unlock(res, lock.release().await)
    }
}

/// Default field set for a new, unprocessed email record.
fn new_unprocessed() -> email::ActiveModel {
    email::ActiveModel {
        parsed: Set(false),
        parsed_at: Set(None),
        parsed_by: Set(None),
        parse_result: Set(None),
        blocked: Set(false),
        blocked_at: Set(None),
        blocked_by: Set(None),
        block_result: Set(None),
        finalized: Set(false),
        finalized_at: Set(None),
        finalized_by: Set(None),
        reported: Set(false),
        reported_at: Set(None),
        ..Default::default()
    }
}

/// Builds the composite id for a message.
pub fn composite_uid(mailbox: &str, uid_validity: u32, uid: u32) -> String {
    format!("{}-{}-{}", mailbox, uid_validity, uid)
}
